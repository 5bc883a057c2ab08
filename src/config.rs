use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::platform::Platform;

pub const DEFAULT_API_BASE: &str = "https://www.mineglance.com";

/// Load the config file, writing the defaults first if it does not exist.
pub fn load_config(path: &Path) -> Result<SupervisorConfig> {
    if !path.exists() {
        let config = SupervisorConfig::default();
        save_config(path, &config)?;
        return Ok(config);
    }
    let content = fs::read_to_string(path).map_err(|e| AppError::config(e.to_string()))?;
    Ok(toml::from_str(&content)?)
}

pub fn save_config(path: &Path, config: &SupervisorConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| AppError::io(e.to_string()))?;
    }
    let content = toml::to_string_pretty(config)?;
    fs::write(path, content).map_err(|e| AppError::config(e.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Overrides the platform detected from the build target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_subscription_secs")]
    pub subscription_secs: u64,
    #[serde(default = "default_update_check_secs")]
    pub update_check_secs: u64,
    #[serde(default)]
    pub wallets: Vec<WalletConfig>,
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_download_timeout_secs() -> u64 {
    600
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_subscription_secs() -> u64 {
    15 * 60
}

fn default_update_check_secs() -> u64 {
    5 * 60
}

fn default_true() -> bool {
    true
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            platform: None,
            request_timeout_secs: default_request_timeout_secs(),
            download_timeout_secs: default_download_timeout_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            subscription_secs: default_subscription_secs(),
            update_check_secs: default_update_check_secs(),
            wallets: Vec::new(),
        }
    }
}

impl SupervisorConfig {
    pub fn platform(&self) -> Platform {
        self.platform.unwrap_or_else(Platform::current)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs.max(1))
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn subscription_period(&self) -> Duration {
        Duration::from_secs(self.subscription_secs.max(1))
    }

    pub fn update_check_period(&self) -> Duration {
        Duration::from_secs(self.update_check_secs.max(1))
    }
}

/// One monitored wallet (worker group) on a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletConfig {
    pub id: String,
    pub name: String,
    pub pool: String,
    pub coin: String,
    pub address: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Rig power draw in watts, used by the pool-stats endpoint for profit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
}

//! Persistent key-value settings (settings.json) and the schedule
//! parameters read from it.

use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{AppError, Result};

pub mod keys {
    pub const REFRESH_INTERVAL: &str = "refreshInterval";
    pub const SHOW_NOTIFICATIONS: &str = "showNotifications";
    pub const DISMISSED_UPDATE_VERSION: &str = "dismissedUpdateVersion";
    pub const INSTALL_ID: &str = "installId";
    pub const AUTH_TOKEN: &str = "authToken";
}

pub const DEFAULT_REFRESH_INTERVAL_MINUTES: u64 = 30;
pub const MAX_REFRESH_INTERVAL_MINUTES: u64 = 24 * 60;

/// Key-value store for user preferences.
///
/// `set` and `remove` only touch the in-memory view; a value is durable
/// once `save` has returned `Ok`.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value);
    fn remove(&self, key: &str);
    async fn save(&self) -> Result<()>;

    fn get_string(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s),
            _ => None,
        }
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key)?.as_bool()
    }

    fn get_u64(&self, key: &str) -> Option<u64> {
        let value = self.get(key)?;
        value
            .as_u64()
            .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
    }
}

/// Settings persisted as a flat JSON object.
pub struct JsonFileSettingsStore {
    path: PathBuf,
    values: RwLock<Map<String, Value>>,
}

impl JsonFileSettingsStore {
    /// Open the store at `path`. A missing file starts empty; an unreadable
    /// or corrupt file is logged and also starts empty.
    pub fn open(path: &Path) -> Self {
        let values = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Value>(&content) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    log::warn!("Settings file {:?} is not a JSON object, ignoring", path);
                    Map::new()
                }
                Err(e) => {
                    log::warn!("Failed to parse settings file {:?}: {}", path, e);
                    Map::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => {
                log::warn!("Failed to read settings file {:?}: {}", path, e);
                Map::new()
            }
        };

        Self {
            path: path.to_path_buf(),
            values: RwLock::new(values),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SettingsStore for JsonFileSettingsStore {
    fn get(&self, key: &str) -> Option<Value> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        values.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.remove(key);
    }

    async fn save(&self) -> Result<()> {
        let content = {
            let values = self.values.read().unwrap_or_else(|e| e.into_inner());
            serde_json::to_string_pretty(&*values)
                .map_err(|e| AppError::settings(e.to_string()))?
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::settings(e.to_string()))?;
        }

        // Write next to the target and rename so a crash mid-write keeps
        // the previous file intact.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| AppError::settings(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| AppError::settings(e.to_string()))
    }
}

/// In-memory store, used when embedding without a settings file and in tests.
#[derive(Default)]
pub struct MemorySettingsStore {
    values: RwLock<Map<String, Value>>,
    saves: std::sync::atomic::AtomicUsize,
    fail_saves: std::sync::atomic::AtomicBool,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values(values: impl IntoIterator<Item = (&'static str, Value)>) -> Self {
        let store = Self::new();
        for (key, value) in values {
            store.set(key, value);
        }
        store
    }

    /// Number of successful `save` calls.
    pub fn save_count(&self) -> usize {
        self.saves.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Make every subsequent `save` fail.
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    fn get(&self, key: &str) -> Option<Value> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        values.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.remove(key);
    }

    async fn save(&self) -> Result<()> {
        if self.fail_saves.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(AppError::settings("save rejected"));
        }
        self.saves.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

/// User-tunable timing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub refresh_interval_minutes: u64,
    pub notifications_enabled: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            refresh_interval_minutes: DEFAULT_REFRESH_INTERVAL_MINUTES,
            notifications_enabled: true,
        }
    }
}

impl ScheduleConfig {
    pub fn from_store(store: &dyn SettingsStore) -> Self {
        let refresh_interval_minutes = store
            .get_u64(keys::REFRESH_INTERVAL)
            .filter(|m| *m > 0)
            .map(|m| m.min(MAX_REFRESH_INTERVAL_MINUTES))
            .unwrap_or(DEFAULT_REFRESH_INTERVAL_MINUTES);
        let notifications_enabled = store.get_bool(keys::SHOW_NOTIFICATIONS).unwrap_or(true);

        Self {
            refresh_interval_minutes,
            notifications_enabled,
        }
    }

    pub fn refresh_period(&self) -> Duration {
        let minutes = self
            .refresh_interval_minutes
            .clamp(1, MAX_REFRESH_INTERVAL_MINUTES);
        Duration::from_secs(minutes * 60)
    }
}

/// Return the persisted install id, generating and saving one on first use.
pub async fn ensure_install_id(store: &dyn SettingsStore) -> Result<String> {
    if let Some(id) = store.get_string(keys::INSTALL_ID) {
        return Ok(id);
    }
    let id = uuid::Uuid::new_v4().to_string();
    store.set(keys::INSTALL_ID, Value::String(id.clone()));
    store.save().await?;
    log::info!("Generated install id {}", id);
    Ok(id)
}

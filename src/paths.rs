//! Centralized path utilities for the supervisor.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};
use crate::platform::Platform;

/// Get the root data directory (~/.mineglance).
#[allow(clippy::expect_used)]
pub fn get_data_dir() -> PathBuf {
    let home = dirs::home_dir().expect("Cannot find home directory");
    home.join(".mineglance")
}

/// Get the path to the config file.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}

/// Get the path to the key-value settings file.
pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("settings.json")
}

/// Get the directory holding staged update artifacts.
pub fn get_updates_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("updates")
}

/// Ensure all required data directories exist.
pub fn ensure_data_dirs(data_dir: &Path) -> Result<()> {
    fs::create_dir_all(data_dir).map_err(|e| AppError::io(e.to_string()))?;
    fs::create_dir_all(get_updates_dir(data_dir)).map_err(|e| AppError::io(e.to_string()))?;
    Ok(())
}

/// Get the staged installer path for a specific version
/// (e.g., updates/mineglance-1.4.0-setup.exe).
///
/// The name is derived only from the version and platform, so a second
/// download of the same version lands on the same path and a different
/// version never collides with it.
pub fn staged_artifact_path(updates_dir: &Path, version: &str, platform: Platform) -> PathBuf {
    updates_dir.join(format!(
        "mineglance-{}-setup.{}",
        sanitize_version(version),
        platform.installer_extension()
    ))
}

fn sanitize_version(version: &str) -> String {
    let cleaned: String = version
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    // Never let a version string walk out of the updates directory.
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

use std::env::consts::OS;

use serde::{Deserialize, Serialize};

/// Desktop platform as understood by the release endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "desktop_windows")]
    Windows,
    #[serde(rename = "desktop_macos")]
    MacOs,
    #[serde(rename = "desktop_linux")]
    Linux,
}

impl Platform {
    pub fn current() -> Self {
        match OS {
            "windows" => Self::Windows,
            "macos" => Self::MacOs,
            _ => Self::Linux,
        }
    }

    /// Identifier sent as the `platform` query parameter.
    pub fn id(&self) -> &'static str {
        match self {
            Self::Windows => "desktop_windows",
            Self::MacOs => "desktop_macos",
            Self::Linux => "desktop_linux",
        }
    }

    pub fn installer_extension(&self) -> &'static str {
        match self {
            Self::Windows => "exe",
            Self::MacOs => "dmg",
            Self::Linux => "AppImage",
        }
    }
}

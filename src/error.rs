//! Supervisor error types.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

/// Supervisor error that can be serialized for a UI layer.
#[derive(Debug, Clone)]
pub struct AppError {
    payload: HashMap<String, String>,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Request failed before a usable response arrived
    Network,
    /// Request exceeded its time budget
    Timeout,
    /// Response body had an unusable shape
    MalformedData,
    /// Writing a staged artifact failed
    Write,
    /// Notification permission was refused
    PermissionDenied,
    /// Configuration error
    Config,
    /// Settings store error
    Settings,
    /// File system error
    Io,
    /// Operation not allowed in the current pipeline phase
    InvalidState,
    /// Installer handoff failed
    Install,
    /// General error
    Other,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::Network => 1001,
            Self::Timeout => 1002,
            Self::MalformedData => 1003,
            Self::Write => 2001,
            Self::Io => 2002,
            Self::Config => 3001,
            Self::Settings => 3002,
            Self::PermissionDenied => 4001,
            Self::InvalidState => 5001,
            Self::Install => 5002,
            Self::Other => 9999,
        }
    }
}

impl AppError {
    pub fn new(kind: ErrorKind, payload: HashMap<String, String>) -> Self {
        Self { payload, kind }
    }

    /// Single `detail` entry; an empty detail gives an empty payload.
    fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let payload = if detail.is_empty() {
            HashMap::new()
        } else {
            HashMap::from([("detail".to_string(), detail)])
        };
        Self::new(kind, payload)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Network, message)
    }

    pub fn network_with_url(url: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Network,
            HashMap::from([
                ("url".to_string(), url.to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn timeout(operation: &str) -> Self {
        Self::new(
            ErrorKind::Timeout,
            HashMap::from([("operation".to_string(), operation.to_string())]),
        )
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::MalformedData, message)
    }

    pub fn write(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Write, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Config, message)
    }

    pub fn settings(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Settings, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Io, message)
    }

    pub fn invalid_state(phase: &str) -> Self {
        Self::new(
            ErrorKind::InvalidState,
            HashMap::from([("phase".to_string(), phase.to_string())]),
        )
    }

    pub fn install(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Install, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Other, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            let mut pairs: Vec<String> = self
                .payload
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            pairs.sort();
            write!(f, "{:?}: {}", self.kind, pairs.join(", "))
        }
    }
}

impl std::error::Error for AppError {}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct as _;
        let mut s = serializer.serialize_struct("AppError", 3)?;
        s.serialize_field("code", &self.kind.code())?;
        s.serialize_field("kind", &self.kind)?;
        s.serialize_field("payload", &self.payload)?;
        s.end()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => Self::write(err.to_string()),
            _ => Self::io(err.to_string()),
        }
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(format!("invalid config.toml: {}", err))
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        Self::config(format!("cannot encode config: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::timeout("http request");
        }
        if err.is_decode() {
            return Self::malformed(err.to_string());
        }
        Self::network(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::malformed(err.to_string())
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;

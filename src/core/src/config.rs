use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CryptError, Result};

/// Build label that separates base layers from layers that must be encrypted.
pub const DEFAULT_MARKER_LABEL: &str = "LABEL imgcrypt.enabled=true";

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV: &str = "IMGCRYPT_CONFIG";

/// imgcrypt configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptConfig {
    /// Root under which each operation creates its own staging directory
    pub staging_root: PathBuf,

    /// History instruction that marks the encryption boundary
    pub marker_label: String,

    /// Registry transfer settings
    pub transfer: TransferConfig,

    /// Log level used when RUST_LOG is not set
    pub log_level: LogLevel,
}

impl Default for CryptConfig {
    fn default() -> Self {
        Self {
            staging_root: std::env::temp_dir().join("imgcrypt"),
            marker_label: DEFAULT_MARKER_LABEL.to_string(),
            transfer: TransferConfig::default(),
            log_level: LogLevel::Warn,
        }
    }
}

impl CryptConfig {
    /// Default configuration file location (`~/.imgcrypt/config.yaml`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".imgcrypt").join("config.yaml"))
    }

    /// Load configuration.
    ///
    /// An explicit path (argument, then `IMGCRYPT_CONFIG`) must exist. The
    /// default location is optional; defaults apply when it is absent.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::from_file(Path::new(&path));
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Parse a YAML configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| CryptError::path(path, e))?;
        let config: CryptConfig = serde_yaml::from_str(&data).map_err(|e| {
            CryptError::ConfigError(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.marker_label.trim().is_empty() {
            return Err(CryptError::ConfigError(
                "marker_label must not be empty".to_string(),
            ));
        }
        if self.transfer.idle_timeout_ms == 0 || self.transfer.first_byte_timeout_ms == 0 {
            return Err(CryptError::ConfigError(
                "transfer timeouts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Registry transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Kill a blob download after this long without new data (ms)
    pub idle_timeout_ms: u64,

    /// Kill a blob download if no response arrives within this window (ms)
    pub first_byte_timeout_ms: u64,

    /// Overall timeout for manifest and upload requests (ms)
    pub request_timeout_ms: u64,

    /// Talk plain HTTP to the registry (local test registries)
    pub insecure: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 2_000,
            first_byte_timeout_ms: 10_000,
            request_timeout_ms: 300_000,
            insecure: false,
        }
    }
}

impl TransferConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn first_byte_timeout(&self) -> Duration {
        Duration::from_millis(self.first_byte_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

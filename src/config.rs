//! File configuration.
//!
//! Every section is optional in the TOML file and falls back to its
//! defaults.

use crate::capture::{CaptureConfig, ConfigError};
use crate::codec::DEFAULT_MIN_OVERLAY_BYTES;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Full configuration file format.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Inference backend location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// `host:port` or a full `http(s)://` base URL.
    pub base_address: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_address: "http://127.0.0.1:8080".to_string(),
        }
    }
}

impl BackendConfig {
    /// Base URL with scheme and without trailing slash.
    pub fn base_url(&self) -> String {
        let address = self.base_address.trim().trim_end_matches('/');
        if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{address}")
        }
    }

    /// Socket.io endpoint. The client upgrades to a websocket on its own.
    pub fn socket_url(&self) -> String {
        format!("{}/socket.io/", self.base_url())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = self.base_url();
        let host = base
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidBackendAddress(self.base_address.clone()));
        }
        Ok(())
    }
}

/// Verification session behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Delay between verification and navigating away.
    pub navigate_delay_ms: u64,
    /// Smallest decoded overlay accepted for display.
    pub min_overlay_bytes: usize,
    /// Emit `not verified` when the user cancels an active run.
    pub report_unverified_on_cancel: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            navigate_delay_ms: 1500,
            min_overlay_bytes: DEFAULT_MIN_OVERLAY_BYTES,
            report_unverified_on_cancel: false,
        }
    }
}

impl SessionConfig {
    pub fn navigate_delay(&self) -> Duration {
        Duration::from_millis(self.navigate_delay_ms)
    }
}

/// Local persistence location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("dose-verify-data"),
        }
    }
}

/// Metrics exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Metrics server port (0 to disable).
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { port: 9090 }
    }
}

impl FileConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileReadError(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Parses and validates TOML content.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: FileConfig =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.capture.validate()?;
        self.backend.validate()
    }
}

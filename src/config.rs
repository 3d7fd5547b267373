//! Persistent configuration for the seeder CLI
//!
//! Stored as TOML; every field has a default so partial files are fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use seedkey::SeedingTimeouts;
use seedkey_transport::DeviceKeyKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reading or writing the config file
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Bounds on device waits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// INIT handshake
    #[serde(default = "default_negotiate_ms")]
    pub negotiate_ms: u64,
    /// Command response, including the user's touch
    #[serde(default = "default_response_ms")]
    pub response_ms: u64,
}

fn default_negotiate_ms() -> u64 {
    seedkey::DEFAULT_NEGOTIATE_TIMEOUT.as_millis() as u64
}
fn default_response_ms() -> u64 {
    seedkey::DEFAULT_RESPONSE_TIMEOUT.as_millis() as u64
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            negotiate_ms: default_negotiate_ms(),
            response_ms: default_response_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn seeding_timeouts(&self) -> SeedingTimeouts {
        SeedingTimeouts {
            negotiate: Duration::from_millis(self.negotiate_ms),
            response: Duration::from_millis(self.response_ms),
        }
    }
}

/// Device monitor settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Hot-plug rescan interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Which device string tells two keys apart
    #[serde(default)]
    pub identity_key: DeviceKeyKind,
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            identity_key: DeviceKeyKind::default(),
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Output defaults (command-line flags override)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Hex dump frames in monitor mode
    #[serde(default)]
    pub hex: bool,
    /// Machine-readable output
    #[serde(default)]
    pub json: bool,
}

/// Complete seeder configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeederConfig {
    /// tracing filter used when RUST_LOG is unset
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for SeederConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            timeouts: TimeoutConfig::default(),
            monitor: MonitorConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl SeederConfig {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fido-seeder")
            .join("config.toml")
    }

    /// Load config from file, or defaults if the file doesn't exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_roundtrip() {
        let config = SeederConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("log_filter = \"info\""));
        assert!(toml_str.contains("identity_key = \"serial-number\""));

        let parsed: SeederConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SeederConfig = toml::from_str(
            r#"
            [timeouts]
            response_ms = 5000

            [monitor]
            identity_key = "product-name"
            "#,
        )
        .unwrap();

        assert_eq!(config.log_filter, "info");
        assert_eq!(config.timeouts.negotiate_ms, 3000);
        assert_eq!(
            config.timeouts.seeding_timeouts().response,
            Duration::from_secs(5)
        );
        assert_eq!(config.monitor.identity_key, DeviceKeyKind::ProductName);
        assert_eq!(config.monitor.poll_interval_ms, 500);
        assert!(!config.output.json);
    }

    #[test]
    fn test_invalid_config_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[monitor]\nidentity_key = \"usb-path\"\n").unwrap();

        assert!(matches!(
            SeederConfig::load(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SeederConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, SeederConfig::default());
    }

    #[test]
    fn test_save_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fido-seeder").join("config.toml");

        let mut config = SeederConfig::default();
        config.output.hex = true;
        config.save(&path).unwrap();

        assert_eq!(SeederConfig::load(&path).unwrap(), config);
    }
}

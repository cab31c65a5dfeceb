//! Application settings

use crate::core::protocol::{DEFAULT_LINE_BUFFER_CAP, DEFAULT_MAX_BUFFER};
use crate::core::reconnect::{ReconnectPolicy, DEFAULT_DELAYS_MS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not determine config directory")]
    NoConfigDir,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("could not serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid setting {field}: {message}")]
    Invalid { field: String, message: String },
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// GPS receiver channel
    pub gps: ChannelConfig,
    /// EML locator channel
    pub eml: ChannelConfig,
    /// JSON telemetry channel
    pub telemetry: ChannelConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            gps: ChannelConfig::default(),
            eml: ChannelConfig::default(),
            telemetry: ChannelConfig {
                baud_rate: 115_200,
                ..ChannelConfig::default()
            },
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Default config file location
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        super::config_dir()
            .map(|dir| dir.join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load config from the default location, or defaults if there is none
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Load and validate config from a file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a file, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Check every channel section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.gps.validate("gps")?;
        self.eml.validate("eml")?;
        self.telemetry.validate("telemetry")
    }
}

/// Per-channel settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Channel connects when a device is selected
    pub enabled: bool,
    /// Reconnect delay schedule, clamped to the last entry
    pub reconnect_delays_ms: Vec<u64>,
    /// Cap for an unterminated line
    pub line_buffer_cap: usize,
    /// Cap for the JSON accumulation buffer
    pub json_buffer_cap: usize,
    /// Forward GGA fixes that failed validation
    pub emit_invalid_fixes: bool,
    /// Capacity of the channel event broadcast
    pub event_capacity: usize,
    /// Serial baud rate
    pub baud_rate: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reconnect_delays_ms: DEFAULT_DELAYS_MS.to_vec(),
            line_buffer_cap: DEFAULT_LINE_BUFFER_CAP,
            json_buffer_cap: DEFAULT_MAX_BUFFER,
            emit_invalid_fixes: false,
            event_capacity: 256,
            baud_rate: 9600,
        }
    }
}

impl ChannelConfig {
    /// Reconnect schedule as a policy
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::from_millis(&self.reconnect_delays_ms)
    }

    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        let invalid = |field: &str, message: &str| ConfigError::Invalid {
            field: format!("{section}.{field}"),
            message: message.to_string(),
        };

        if self.reconnect_delays_ms.is_empty() {
            return Err(invalid("reconnect_delays_ms", "schedule must not be empty"));
        }
        if self.line_buffer_cap == 0 {
            return Err(invalid("line_buffer_cap", "must be greater than zero"));
        }
        if self.json_buffer_cap < 2 {
            return Err(invalid("json_buffer_cap", "must be at least 2"));
        }
        if self.event_capacity == 0 {
            return Err(invalid("event_capacity", "must be greater than zero"));
        }
        if self.baud_rate == 0 {
            return Err(invalid("baud_rate", "must be greater than zero"));
        }
        Ok(())
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of text
    pub json: bool,
    /// Also write logs to this directory (daily rotation)
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.gps.enabled);
        assert_eq!(config.telemetry.baud_rate, 115_200);
        assert_eq!(
            config.gps.reconnect_policy().delay_for_attempt(9),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.eml.enabled = false;
        config.gps.emit_invalid_fixes = true;
        config.telemetry.reconnect_delays_ms = vec![500, 5000];
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[gps]\nenabled = false\n").unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert!(!loaded.gps.enabled);
        assert_eq!(loaded.gps.line_buffer_cap, DEFAULT_LINE_BUFFER_CAP);
        assert_eq!(loaded.eml, ChannelConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[eml]\nreconnect_delays_ms = []\n").unwrap();

        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "eml.reconnect_delays_ms"));

        std::fs::write(&path, "gps = 3").unwrap();
        assert!(matches!(AppConfig::load_from(&path), Err(ConfigError::Parse(_))));
    }
}

//! Pump configuration
//!
//! Connection parameters, protocol timing and the syringe settings a
//! controller applies after connecting. Stored as JSON.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{
    DEFAULT_BAUD_RATE, DEFAULT_POLL_INTERVAL_MS, DEFAULT_RESPONSE_RETRIES, DEFAULT_TIMEOUT_MS,
};
use crate::pump::{DriverTiming, MAX_ADDRESS};

/// Errors loading or validating a configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// Syringe settings applied after connecting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpPrefs {
    /// Syringe diameter in mm
    pub diameter: f64,

    /// Normal flow rate in µL/min
    pub flowrate: f64,

    /// Slow flow rate in µL/min
    pub slow_flowrate: f64,
}

impl Default for PumpPrefs {
    fn default() -> Self {
        Self {
            diameter: 4.61,
            flowrate: 120.0,
            slow_flowrate: 3.0,
        }
    }
}

/// Connection and protocol settings for one pump
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    /// Serial port name; discovered by adapter manufacturer when unset
    pub port: Option<String>,

    /// Pump address on the chain (0-99)
    pub address: u8,

    /// Name used in log messages
    pub name: String,

    /// Baud rate
    pub baud_rate: u32,

    /// Per-read timeout in milliseconds
    pub read_timeout_ms: u64,

    /// Empty drains tolerated before a reply counts as missing
    pub response_retries: u32,

    /// Sleep between drains and `VOL` polls in milliseconds
    pub poll_interval_ms: u64,

    /// Syringe settings
    pub prefs: PumpPrefs,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            port: None,
            address: 0,
            name: "Microliter".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_TIMEOUT_MS,
            response_retries: DEFAULT_RESPONSE_RETRIES,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            prefs: PumpPrefs::default(),
        }
    }
}

impl PumpConfig {
    /// Default location: `<config dir>/mlpump/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("mlpump").join("config.json"))
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: PumpConfig = serde_json::from_str(&content)?;
        config.validate()?;
        tracing::debug!("Loaded pump config from {}", path.display());
        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write the config as pretty-printed JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reject settings the driver cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address > MAX_ADDRESS {
            return Err(ConfigError::Invalid(format!(
                "address {} is outside 0-{}",
                self.address, MAX_ADDRESS
            )));
        }
        if self.baud_rate == 0 {
            return Err(ConfigError::Invalid("baud_rate must be non-zero".to_string()));
        }
        if self.response_retries == 0 {
            return Err(ConfigError::Invalid(
                "response_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Per-read timeout
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Driver timing derived from this config
    pub fn timing(&self) -> DriverTiming {
        DriverTiming {
            response_retries: self.response_retries,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = PumpConfig::default();
        assert_eq!(config.timing(), DriverTiming::default());
        assert_eq!(config.read_timeout(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: PumpConfig =
            serde_json::from_str(r#"{ "port": "/dev/ttyUSB0", "prefs": { "diameter": 2.0 } }"#)
                .unwrap();
        assert_eq!(config.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.address, 0);
        assert_eq!(config.prefs.diameter, 2.0);
        assert_eq!(config.prefs.flowrate, 120.0);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = PumpConfig::default();
        config.address = 12;
        config.prefs.slow_flowrate = 5.5;
        config.save(&path).unwrap();

        assert_eq!(PumpConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = PumpConfig::load_or_default(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, PumpConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_address() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "address": 150 }"#).unwrap();
        assert!(matches!(PumpConfig::load(&path), Err(ConfigError::Invalid(_))));
    }
}

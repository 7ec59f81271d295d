//! File-backed configuration
//!
//! All durations are stored as integer milliseconds so the file stays
//! readable. Every field has a default; a missing file means all defaults.
//!
//! ```json
//! {
//!   "reconnect": { "base_delay_ms": 500, "multiplier": 1.5, "max_attempts": 5 },
//!   "watchdog": { "hard_timeout_ms": 10000 }
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use device_lifecycle::{PollingConfig, ReconnectConfig, WatchdogConfig};
use device_store::{DeviceState, StoreConfig};

/// Configuration loading or validation error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub broadcast_debounce_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            broadcast_debounce_ms: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            multiplier: 1.5,
            max_delay_ms: 15_000,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    pub sweep_interval_ms: u64,
    pub stall_threshold_ms: u64,
    pub hard_timeout_ms: u64,
    pub max_stall_attempts: u32,
    pub stall_retry_spacing_ms: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 1_000,
            stall_threshold_ms: 3_000,
            hard_timeout_ms: 10_000,
            max_stall_attempts: 2,
            stall_retry_spacing_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    pub battery_interval_ms: u64,
    pub signal_interval_ms: u64,
    pub firmware_interval_ms: u64,
    pub pollable_states: Vec<DeviceState>,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            battery_interval_ms: 60_000,
            signal_interval_ms: 10_000,
            firmware_interval_ms: 300_000,
            pollable_states: vec![DeviceState::Connected, DeviceState::Synced],
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KneelinkConfig {
    pub store: StoreSettings,
    pub reconnect: ReconnectSettings,
    pub watchdog: WatchdogSettings,
    pub polling: PollingSettings,
}

impl KneelinkConfig {
    /// `<config dir>/kneelink/config.json`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("kneelink").join("config.json"))
    }

    /// Load and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;

        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Load from the default location, or fall back to defaults when there
    /// is no file there.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => {
                tracing::debug!("no configuration file, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("store.broadcast_debounce_ms", self.store.broadcast_debounce_ms),
            ("reconnect.base_delay_ms", self.reconnect.base_delay_ms),
            ("reconnect.max_delay_ms", self.reconnect.max_delay_ms),
            ("watchdog.sweep_interval_ms", self.watchdog.sweep_interval_ms),
            ("watchdog.stall_threshold_ms", self.watchdog.stall_threshold_ms),
            ("watchdog.hard_timeout_ms", self.watchdog.hard_timeout_ms),
            ("polling.battery_interval_ms", self.polling.battery_interval_ms),
            ("polling.signal_interval_ms", self.polling.signal_interval_ms),
            ("polling.firmware_interval_ms", self.polling.firmware_interval_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }

        if !self.reconnect.multiplier.is_finite() || self.reconnect.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "reconnect.multiplier must be at least 1.0, got {}",
                self.reconnect.multiplier
            )));
        }

        if self.watchdog.stall_threshold_ms >= self.watchdog.hard_timeout_ms {
            return Err(ConfigError::Invalid(
                "watchdog.stall_threshold_ms must be below watchdog.hard_timeout_ms".to_string(),
            ));
        }

        Ok(())
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            broadcast_debounce: Duration::from_millis(self.store.broadcast_debounce_ms),
        }
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
            multiplier: self.reconnect.multiplier,
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            max_attempts: self.reconnect.max_attempts,
        }
    }

    pub fn watchdog_config(&self) -> WatchdogConfig {
        let w = &self.watchdog;
        WatchdogConfig {
            sweep_interval: Duration::from_millis(w.sweep_interval_ms),
            stall_threshold: Duration::from_millis(w.stall_threshold_ms),
            hard_timeout: Duration::from_millis(w.hard_timeout_ms),
            max_stall_attempts: w.max_stall_attempts,
            stall_retry_spacing: Duration::from_millis(w.stall_retry_spacing_ms),
        }
    }

    pub fn polling_config(&self) -> PollingConfig {
        let p = &self.polling;
        PollingConfig {
            battery_interval: Duration::from_millis(p.battery_interval_ms),
            signal_interval: Duration::from_millis(p.signal_interval_ms),
            firmware_interval: Duration::from_millis(p.firmware_interval_ms),
            pollable_states: p.pollable_states.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_component_defaults() {
        let config = KneelinkConfig::default();
        assert!(config.validate().is_ok());

        let reconnect = config.reconnect_config();
        let expected = ReconnectConfig::default();
        assert_eq!(reconnect.base_delay, expected.base_delay);
        assert_eq!(reconnect.max_delay, expected.max_delay);
        assert_eq!(reconnect.max_attempts, expected.max_attempts);

        let watchdog = config.watchdog_config();
        assert_eq!(watchdog.hard_timeout, WatchdogConfig::default().hard_timeout);
        assert_eq!(
            config.store_config().broadcast_debounce,
            StoreConfig::default().broadcast_debounce
        );
        assert_eq!(
            config.polling_config().pollable_states,
            PollingConfig::default().pollable_states
        );
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "reconnect": {{ "max_attempts": 8 }}, "polling": {{ "pollable_states": ["connected"] }} }}"#
        )
        .unwrap();

        let config = KneelinkConfig::load(file.path()).unwrap();
        assert_eq!(config.reconnect.max_attempts, 8);
        assert_eq!(config.reconnect.base_delay_ms, 500);
        assert_eq!(config.polling.pollable_states, vec![DeviceState::Connected]);
        assert_eq!(config.watchdog, WatchdogSettings::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = KneelinkConfig::default();
        config.polling.signal_interval_ms = 0;
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("polling.signal_interval_ms"));

        let mut config = KneelinkConfig::default();
        config.reconnect.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = KneelinkConfig::default();
        config.watchdog.stall_threshold_ms = 10_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_errors() {
        let missing = KneelinkConfig::load("/nonexistent/kneelink.json");
        assert!(matches!(missing, Err(ConfigError::Io { .. })));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            KneelinkConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}

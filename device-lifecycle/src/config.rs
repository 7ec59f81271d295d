//! Tunables for the lifecycle managers.

use std::time::Duration;

use device_store::DeviceState;

/// Reconnection backoff policy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first attempt
    pub base_delay: Duration,
    /// Growth factor applied per attempt already made
    pub multiplier: f64,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Attempts allowed before the device is put in `error`
    pub max_attempts: u32,
}

impl ReconnectConfig {
    /// Delay before the next attempt, given how many were already made.
    ///
    /// `min(base * multiplier^attempts, max_delay)`
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        let millis = self.base_delay.as_secs_f64() * 1000.0 * self.multiplier.powi(exponent);
        let cap = self.max_delay.as_secs_f64() * 1000.0;

        if !millis.is_finite() || millis >= cap {
            self.max_delay
        } else {
            Duration::from_secs_f64(millis / 1000.0)
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            multiplier: 1.5,
            max_delay: Duration::from_secs(15),
            max_attempts: 5,
        }
    }
}

/// Liveness monitoring policy.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Period of the health sweep
    pub sweep_interval: Duration,
    /// Silence after which a streaming device is considered stalled
    pub stall_threshold: Duration,
    /// Silence after which any monitored device is considered lost
    pub hard_timeout: Duration,
    /// Stall recoveries allowed before leaving it to the hard timeout
    pub max_stall_attempts: u32,
    /// Minimum spacing between two stall recoveries of one device
    pub stall_retry_spacing: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            stall_threshold: Duration::from_secs(3),
            hard_timeout: Duration::from_secs(10),
            max_stall_attempts: 2,
            stall_retry_spacing: Duration::from_secs(2),
        }
    }
}

/// Telemetry polling policy.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub battery_interval: Duration,
    pub signal_interval: Duration,
    pub firmware_interval: Duration,
    /// Device states in which a poll may be issued
    pub pollable_states: Vec<DeviceState>,
}

impl PollingConfig {
    pub fn is_pollable(&self, state: DeviceState) -> bool {
        self.pollable_states.contains(&state)
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            battery_interval: Duration::from_secs(60),
            signal_interval: Duration::from_secs(10),
            firmware_interval: Duration::from_secs(300),
            pollable_states: vec![DeviceState::Connected, DeviceState::Synced],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backoff_curve() {
        let config = ReconnectConfig::default();
        let delays: Vec<Duration> = (0..5).map(|n| config.delay_for_attempt(n)).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(750),
                Duration::from_micros(1_125_000),
                Duration::from_micros(1_687_500),
                Duration::from_micros(2_531_250),
            ]
        );
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = ReconnectConfig::default();
        assert_eq!(config.delay_for_attempt(20), Duration::from_secs(15));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(15));
    }

    #[test]
    fn test_pollable_states() {
        let config = PollingConfig::default();
        assert!(config.is_pollable(DeviceState::Connected));
        assert!(config.is_pollable(DeviceState::Synced));
        assert!(!config.is_pollable(DeviceState::Streaming));
        assert!(!config.is_pollable(DeviceState::Syncing));
    }
}

//! Radio-side collaborators
//!
//! The lifecycle managers never talk to the radio stack directly. Everything
//! that touches a physical device is injected through these traits, so the
//! managers can be driven by real BLE bindings or by test doubles.
//!
//! All methods may be slow and may fail. Results are re-checked for relevance
//! by the caller once they resolve, since the device may have changed state or
//! been unregistered while the call was in flight.

use async_trait::async_trait;

use device_store::DeviceId;

use crate::error::LinkError;

/// Establishes links to devices.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Connect to the device at `address`. `Ok(false)` means the radio
    /// declined without an error.
    async fn connect(&self, address: &str) -> Result<bool, LinkError>;
}

/// Asks the radio whether a link is still up.
///
/// Used to tell a benign data gap from a dead link.
#[async_trait]
pub trait LinkProbe: Send + Sync {
    async fn is_connected(&self, address: &str) -> bool;
}

/// Starts or restarts motion streaming on a connected device.
#[async_trait]
pub trait StreamControl: Send + Sync {
    /// Full streaming start on a freshly established link.
    async fn start_streaming(&self, device: DeviceId) -> Result<bool, LinkError>;

    /// Lightweight in-place restart on a link that is still up.
    async fn resume_streaming(&self, device: DeviceId, address: &str) -> Result<bool, LinkError>;
}

/// Reads one telemetry value from a device.
///
/// `Ok(None)` means the device had nothing to report this round.
#[async_trait]
pub trait TelemetryPoller: Send + Sync {
    async fn poll(&self, device: DeviceId) -> Result<Option<i64>, LinkError>;
}

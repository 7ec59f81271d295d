//! Streaming hooks
//!
//! The signal-processing pipeline registers one [`MotionHook`] per device. The
//! store routes raw motion payloads to it by radio address.

use crate::device::DeviceId;

/// Failure reported by a streaming hook.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// The payload could not be consumed
    #[error("Rejected payload: {0}")]
    Rejected(String),

    /// The downstream pipeline is not accepting data
    #[error("Pipeline unavailable: {0}")]
    Unavailable(String),

    /// The hook panicked while consuming a payload
    #[error("Hook panicked: {0}")]
    Panicked(String),
}

/// Consumer of one device's motion stream.
///
/// `on_motion_data` runs on the dispatch path and must be quick. A failure,
/// including a panic, is routed back to `on_error`; it never aborts dispatch.
pub trait MotionHook: Send + Sync {
    fn on_motion_data(&self, device: DeviceId, payload: &[u8]) -> Result<(), HookError>;

    /// The device was declared gone (watchdog timeout or radio disconnect).
    fn on_disconnect(&self, _device: DeviceId) {}

    fn on_error(&self, _device: DeviceId, _error: &HookError) {}
}

//! Error types for the device store.

use crate::device::DeviceId;
use crate::state::DeviceState;

/// Errors raised by store mutators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The transition table does not allow `from -> to`
    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: DeviceId,
        from: DeviceState,
        to: DeviceState,
    },

    /// No record is registered under this id
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),
}

/// Convenience type alias for Results using StoreError.
pub type Result<T> = std::result::Result<T, StoreError>;

//! Error types for the device-lifecycle crate.

use device_store::{DeviceId, DeviceState, StoreError};

/// Errors returned by lifecycle manager operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LifecycleError {
    /// The store rejected an operation
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A manual retry was requested for a device that is not in `error`
    #[error("Device {id} is not in error state (currently {state})")]
    NotInErrorState {
        /// The device
        id: DeviceId,
        /// Its current state
        state: DeviceState,
    },
}

/// Failure reported by an injected link collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// The radio operation failed
    #[error("Link operation failed: {0}")]
    Failed(String),

    /// The radio operation did not complete in time
    #[error("Link operation timed out")]
    Timeout,

    /// The radio stack is not available
    #[error("Link unavailable: {0}")]
    Unavailable(String),
}

/// Convenience type alias for Results using LifecycleError.
pub type Result<T> = std::result::Result<T, LifecycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = LifecycleError::NotInErrorState {
            id: DeviceId::LeftShin,
            state: DeviceState::Streaming,
        };
        assert_eq!(
            error.to_string(),
            "Device left_shin is not in error state (currently streaming)"
        );

        let error: LifecycleError = StoreError::DeviceNotFound(DeviceId::RightShin).into();
        assert_eq!(error.to_string(), "Store error: Device not found: right_shin");
    }
}

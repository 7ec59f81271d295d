//! Change events emitted by the store
//!
//! Every mutation that alters a device's lifecycle or the global mode emits a
//! [`StateChange`]. Listeners registered through `DeviceStore::subscribe` see
//! events synchronously, in the order the mutations happened. Async consumers
//! can use `DeviceStore::changes()` instead.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::device::DeviceId;
use crate::record::{DeviceErrorKind, DisconnectReason};
use crate::state::{DeviceState, GlobalState};

/// Optional context attached to a transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionMetadata {
    pub reason: Option<DisconnectReason>,
    pub note: Option<String>,
    /// Reconnect attempt recorded together with the transition
    pub reconnect_attempt: Option<u32>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl TransitionMetadata {
    pub fn reason(reason: DisconnectReason) -> Self {
        Self {
            reason: Some(reason),
            ..Self::default()
        }
    }

    pub fn note(note: impl Into<String>) -> Self {
        Self {
            note: Some(note.into()),
            ..Self::default()
        }
    }

    /// Carry the scheduled attempt so the transition publishes it in the
    /// same snapshot.
    pub fn with_reconnect(mut self, attempt: u32, next_attempt_at: DateTime<Utc>) -> Self {
        self.reconnect_attempt = Some(attempt);
        self.next_attempt_at = Some(next_attempt_at);
        self
    }
}

/// What changed.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeKind {
    DeviceRegistered {
        address: String,
    },
    DeviceUnregistered,
    /// The logical id was re-bound from `old_address` to a new radio address
    DeviceEvicted {
        old_address: String,
    },
    DeviceStateChanged {
        from: DeviceState,
        to: DeviceState,
        metadata: Option<TransitionMetadata>,
    },
    DeviceFailed {
        from: DeviceState,
        kind: DeviceErrorKind,
    },
    GlobalStateChanged {
        from: GlobalState,
        to: GlobalState,
    },
}

/// A change event.
#[derive(Debug, Clone)]
pub struct StateChange {
    /// Device concerned, `None` for global changes
    pub device: Option<DeviceId>,
    pub kind: ChangeKind,
    /// When the mutation was applied
    pub timestamp: Instant,
}

impl StateChange {
    pub fn device(id: DeviceId, kind: ChangeKind) -> Self {
        Self {
            device: Some(id),
            kind,
            timestamp: Instant::now(),
        }
    }

    pub fn global(from: GlobalState, to: GlobalState) -> Self {
        Self {
            device: None,
            kind: ChangeKind::GlobalStateChanged { from, to },
            timestamp: Instant::now(),
        }
    }

    /// The new device state, for events that move a device.
    pub fn new_device_state(&self) -> Option<DeviceState> {
        match &self.kind {
            ChangeKind::DeviceStateChanged { to, .. } => Some(*to),
            ChangeKind::DeviceFailed { .. } => Some(DeviceState::Error),
            _ => None,
        }
    }

    /// The new global mode, for global events.
    pub fn new_global_state(&self) -> Option<GlobalState> {
        match &self.kind {
            ChangeKind::GlobalStateChanged { to, .. } => Some(*to),
            _ => None,
        }
    }
}

impl PartialEq for StateChange {
    fn eq(&self, other: &Self) -> bool {
        // Timestamp not included in equality
        self.device == other.device && self.kind == other.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_event_equality_ignores_timestamp() {
        let kind = ChangeKind::DeviceStateChanged {
            from: DeviceState::Connected,
            to: DeviceState::Streaming,
            metadata: None,
        };
        let event1 = StateChange::device(DeviceId::LeftShin, kind.clone());
        let event2 = StateChange::device(DeviceId::LeftShin, kind.clone());
        let event3 = StateChange::device(DeviceId::RightShin, kind);

        assert_eq!(event1, event2);
        assert_ne!(event1, event3);
    }

    #[test]
    fn test_accessors() {
        let failed = StateChange::device(
            DeviceId::LeftThigh,
            ChangeKind::DeviceFailed {
                from: DeviceState::Reconnecting,
                kind: DeviceErrorKind::MaxReconnectExceeded,
            },
        );
        assert_eq!(failed.new_device_state(), Some(DeviceState::Error));
        assert_eq!(failed.new_global_state(), None);

        let global = StateChange::global(GlobalState::Idle, GlobalState::Streaming);
        assert_eq!(global.device, None);
        assert_eq!(global.new_global_state(), Some(GlobalState::Streaming));
    }
}

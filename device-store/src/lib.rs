//! KneeLink Device Store
//!
//! The single source of truth for the four knee sensors and the system-wide
//! mode. Every state change goes through [`DeviceStore`], which validates it
//! against the device state machine, notifies listeners and publishes the
//! whole state to consumers as a debounced snapshot.
//!
//! # Features
//!
//! - **Fixed identities**: four logical ids derived from advertised names
//! - **Validated state machine**: invalid transitions are rejected, not applied
//! - **Change notification**: synchronous listeners plus an async channel
//! - **Debounced broadcast**: bursts of mutations coalesce into one message
//! - **Streaming dispatch**: motion payloads routed to per-device hooks
//!
//! # Quick Start
//!
//! ```rust
//! use device_store::{DeviceId, DeviceState, DeviceStore};
//!
//! let store = DeviceStore::default();
//!
//! let id = store.register_device("C4:7F:51:00:00:01", "KneeLink-RT").unwrap();
//! assert_eq!(id, DeviceId::RightThigh);
//!
//! store.transition(id, DeviceState::Connecting, None).unwrap();
//! store.transition(id, DeviceState::Connected, None).unwrap();
//!
//! // invalid transitions are rejected and leave the record untouched
//! assert!(store.transition(id, DeviceState::Discovered, None).is_err());
//! assert_eq!(store.device_state(id), Some(DeviceState::Connected));
//! ```
//!
//! # Architecture
//!
//! ```text
//! DeviceStore
//!     │
//!     ├── DeviceRecord x4 ── DeviceState (transition table)
//!     ├── GlobalRecord   ── GlobalState
//!     │
//!     ├── subscribe() ─── Fn(&StateChange)       (sync, ordered)
//!     ├── changes()   ─── broadcast::Receiver     (async)
//!     │
//!     └── queue_broadcast() ── 50ms debounce ── WireMessage ── BroadcastTransport
//! ```

// Modules
pub mod broadcast;
pub mod device;
pub mod error;
pub mod event;
pub mod hook;
pub mod record;
pub mod state;
pub mod store;

// Re-exports - Public API
pub use broadcast::{
    BroadcastTransport, DeviceProjection, SignalQuality, TransportError, WireMessage,
};
pub use device::{identify_device, DeviceId, Joint, Position};
pub use error::{Result, StoreError};
pub use event::{ChangeKind, StateChange, TransitionMetadata};
pub use hook::{HookError, MotionHook};
pub use record::{
    DeviceError, DeviceErrorKind, DeviceRecord, DisconnectReason, GlobalRecord, SyncState,
};
pub use state::{DeviceState, GlobalState};
pub use store::{DeviceStore, ListenerId, StoreConfig};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::device::DeviceId;
    pub use crate::event::{ChangeKind, StateChange, TransitionMetadata};
    pub use crate::record::{DeviceErrorKind, DisconnectReason};
    pub use crate::state::{DeviceState, GlobalState};
    pub use crate::store::DeviceStore;
}

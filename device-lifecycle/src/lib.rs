//! KneeLink device lifecycle managers
//!
//! Keeps the four sensors alive once they are linked:
//!
//! - [`ReconnectionManager`]: exponential-backoff reconnection after a link loss
//! - [`Watchdog`]: periodic liveness sweep with stall recovery and hard timeout
//! - [`PollingManager`]: periodic battery / signal / firmware polling, blocked
//!   during radio-critical global modes
//!
//! All three act on a shared [`device_store::DeviceStore`] and reach the
//! radio only through the collaborator traits in [`link`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use device_lifecycle::{ReconnectionManager, ReconnectConfig, Watchdog, WatchdogConfig};
//! use device_store::DeviceStore;
//!
//! let store = DeviceStore::default();
//! let reconnect = ReconnectionManager::new(store.clone(), Arc::new(radio), ReconnectConfig::default());
//! let watchdog = Watchdog::new(store.clone(), reconnect.clone(), WatchdogConfig::default());
//! watchdog.start();
//! ```

pub mod config;
pub mod error;
pub mod link;
pub mod polling;
pub mod reconnect;
pub mod watchdog;

pub use config::{PollingConfig, ReconnectConfig, WatchdogConfig};
pub use error::{LifecycleError, LinkError, Result};
pub use link::{DeviceLink, LinkProbe, StreamControl, TelemetryPoller};
pub use polling::{BlockSource, CycleReport, PollCategory, PollingManager};
pub use reconnect::ReconnectionManager;
pub use watchdog::{Watchdog, WatchdogStats};

//! KneeLink device lifecycle subsystem
//!
//! Connection management for the four KneeLink sensors (left/right knee,
//! thigh/shin units): identification, a validated per-device state machine,
//! automatic reconnection, liveness monitoring, telemetry polling and a
//! debounced full-state broadcast to UI or network consumers.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kneelink::{DeviceSystem, KneelinkConfig, logging};
//!
//! logging::init_logging_from_env()?;
//!
//! let system = DeviceSystem::builder()
//!     .with_config(KneelinkConfig::load_default()?)
//!     .with_link(radio.clone())
//!     .with_probe(radio.clone())
//!     .with_stream_control(radio)
//!     .with_transport(Arc::new(|json: &str| ui.send(json)))
//!     .build()?;
//!
//! system.start();
//! ```
//!
//! # Crates
//!
//! - [`device_store`]: ids, state machine, records, store, wire message
//! - [`device_lifecycle`]: reconnection, watchdog, polling
//! - this crate: configuration, logging and the [`DeviceSystem`] facade

pub mod config;
pub mod error;
pub mod logging;
pub mod system;

pub use config::{ConfigError, KneelinkConfig};
pub use error::SystemError;
pub use system::{DeviceSystem, DeviceSystemBuilder};

// Re-export the component crates
pub use device_lifecycle;
pub use device_store;

pub use device_lifecycle::{
    DeviceLink, LinkError, LinkProbe, PollCategory, StreamControl, TelemetryPoller,
};
pub use device_store::{
    BroadcastTransport, DeviceId, DeviceState, GlobalState, MotionHook, WireMessage,
};

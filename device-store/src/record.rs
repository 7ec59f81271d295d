//! Device and global records held by the store
//!
//! Records are plain data. All mutation goes through `DeviceStore`, which
//! hands out clones so callers never hold a reference into store internals.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::device::DeviceId;
use crate::state::{DeviceState, GlobalState};

/// Category of a device-level failure carried in the error field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceErrorKind {
    ConnectionFailed,
    SyncFailed,
    StreamingFailed,
    MaxReconnectExceeded,
    Unknown,
}

impl DeviceErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            DeviceErrorKind::ConnectionFailed => "CONNECTION_FAILED",
            DeviceErrorKind::SyncFailed => "SYNC_FAILED",
            DeviceErrorKind::StreamingFailed => "STREAMING_FAILED",
            DeviceErrorKind::MaxReconnectExceeded => "MAX_RECONNECT_EXCEEDED",
            DeviceErrorKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last error recorded for a device. Present only while the device is in `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Why a device most recently lost its link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisconnectReason {
    /// The operator asked for the disconnect; never auto-reconnected
    UserRequested,
    ConnectionLost,
    WatchdogTimeout,
    LinkFailure,
    Unknown,
}

impl DisconnectReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::UserRequested => "USER_REQUESTED",
            DisconnectReason::ConnectionLost => "CONNECTION_LOST",
            DisconnectReason::WatchdogTimeout => "WATCHDOG_TIMEOUT",
            DisconnectReason::LinkFailure => "LINK_FAILURE",
            DisconnectReason::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Clock synchronisation status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Unsynced,
    Syncing,
    Synced,
    Failed,
}

/// Snapshot of one device.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    // identity
    pub id: DeviceId,
    pub address: String,
    pub name: String,

    // state machine
    pub state: DeviceState,
    pub previous_state: Option<DeviceState>,
    pub state_changed_at: DateTime<Utc>,

    // health telemetry
    pub battery_level: Option<u8>,
    /// RSSI in dBm
    pub signal_strength: Option<i16>,
    pub firmware_status: Option<u16>,
    /// Last time any traffic or proof of life was observed
    pub last_seen: Option<Instant>,

    // time sync
    pub clock_offset_ms: Option<f64>,
    pub sync_state: SyncState,
    pub last_sync_at: Option<DateTime<Utc>>,

    // reconnection
    pub reconnect_attempts: u32,
    pub next_reconnect_at: Option<DateTime<Utc>>,
    pub disconnect_reason: Option<DisconnectReason>,

    pub last_error: Option<DeviceError>,

    // UI-facing
    pub sync_progress: Option<u8>,
    pub vibrating: bool,
}

impl DeviceRecord {
    /// Fresh record for a newly identified device.
    pub fn new(id: DeviceId, address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            name: name.into(),
            state: DeviceState::Disconnected,
            previous_state: None,
            state_changed_at: Utc::now(),
            battery_level: None,
            signal_strength: None,
            firmware_status: None,
            last_seen: Some(Instant::now()),
            clock_offset_ms: None,
            sync_state: SyncState::Unsynced,
            last_sync_at: None,
            reconnect_attempts: 0,
            next_reconnect_at: None,
            disconnect_reason: None,
            last_error: None,
            sync_progress: None,
            vibrating: false,
        }
    }

    /// Time since the device was last seen, if it ever was.
    pub fn silent_for(&self, now: Instant) -> Option<std::time::Duration> {
        self.last_seen.map(|seen| now.saturating_duration_since(seen))
    }

    pub(crate) fn touch(&mut self) {
        self.last_seen = Some(Instant::now());
    }

    pub(crate) fn reset_reconnect(&mut self) {
        self.reconnect_attempts = 0;
        self.next_reconnect_at = None;
    }
}

/// System-wide record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalRecord {
    pub state: GlobalState,
    pub scanning_since: Option<DateTime<Utc>>,
    pub syncing_since: Option<DateTime<Utc>>,
    pub streaming_since: Option<DateTime<Utc>>,
}

impl GlobalRecord {
    /// Apply a new global mode, maintaining the phase timestamps.
    ///
    /// Entering scanning, syncing or streaming stamps the matching field;
    /// returning to idle clears all of them. Re-entering the current mode
    /// keeps the original stamp.
    pub(crate) fn apply(&mut self, next: GlobalState, now: DateTime<Utc>) {
        let changed = self.state != next;
        match next {
            GlobalState::Idle => {
                self.scanning_since = None;
                self.syncing_since = None;
                self.streaming_since = None;
            }
            GlobalState::Scanning if changed => self.scanning_since = Some(now),
            GlobalState::Syncing if changed => self.syncing_since = Some(now),
            GlobalState::Streaming if changed => self.streaming_since = Some(now),
            _ => {}
        }
        self.state = next;
    }
}

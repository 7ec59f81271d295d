//! Outbound wire message and broadcast transport
//!
//! The store publishes the whole system state as a single [`WireMessage`].
//! Consumers treat every message as a full replacement snapshot, never as a
//! delta, so a dropped message is healed by the next one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::{DeviceId, Joint, Position};
use crate::record::{DeviceError, DeviceRecord, DisconnectReason, GlobalRecord, SyncState};
use crate::state::{DeviceState, GlobalState};

/// Failure reported by a broadcast transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Channel closed")]
    Closed,

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Sink for serialized state messages (UI bridge, network channel, ...).
pub trait BroadcastTransport: Send + Sync {
    fn send(&self, payload: &str) -> Result<(), TransportError>;
}

impl<F> BroadcastTransport for F
where
    F: Fn(&str) -> Result<(), TransportError> + Send + Sync,
{
    fn send(&self, payload: &str) -> Result<(), TransportError> {
        self(payload)
    }
}

/// Coarse link quality derived from RSSI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl SignalQuality {
    pub fn from_rssi(rssi: i16) -> Self {
        match rssi {
            r if r >= -60 => SignalQuality::Excellent,
            r if r >= -70 => SignalQuality::Good,
            r if r >= -80 => SignalQuality::Fair,
            _ => SignalQuality::Poor,
        }
    }
}

/// Tagged message sent to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    DeviceStatus {
        timestamp: DateTime<Utc>,
        global_state: GlobalState,
        scanning_since: Option<DateTime<Utc>>,
        syncing_since: Option<DateTime<Utc>>,
        streaming_since: Option<DateTime<Utc>>,
        devices: Vec<DeviceProjection>,
    },
}

impl WireMessage {
    /// Build the snapshot message from records.
    pub fn snapshot<'a>(
        global: &GlobalRecord,
        devices: impl IntoIterator<Item = &'a DeviceRecord>,
    ) -> Self {
        let mut devices: Vec<DeviceProjection> =
            devices.into_iter().map(DeviceProjection::from).collect();
        devices.sort_by_key(|d| d.id);

        WireMessage::DeviceStatus {
            timestamp: Utc::now(),
            global_state: global.state,
            scanning_since: global.scanning_since,
            syncing_since: global.syncing_since,
            streaming_since: global.streaming_since,
            devices,
        }
    }

    pub fn devices(&self) -> &[DeviceProjection] {
        match self {
            WireMessage::DeviceStatus { devices, .. } => devices,
        }
    }

    pub fn global_state(&self) -> GlobalState {
        match self {
            WireMessage::DeviceStatus { global_state, .. } => *global_state,
        }
    }

    pub fn device(&self, id: DeviceId) -> Option<&DeviceProjection> {
        self.devices().iter().find(|d| d.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncProjection {
    pub state: SyncState,
    pub clock_offset_ms: Option<f64>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectProjection {
    pub attempt: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub reason: Option<DisconnectReason>,
}

/// Per-device view exposed to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProjection {
    pub id: DeviceId,
    pub address: String,
    pub name: String,
    pub display_name: String,
    pub short_label: String,
    pub placement: String,
    pub joint: Joint,
    pub position: Position,
    pub state: DeviceState,
    pub previous_state: Option<DeviceState>,
    pub battery_level: Option<u8>,
    pub signal_strength: Option<i16>,
    pub signal_quality: Option<SignalQuality>,
    pub firmware_status: Option<u16>,
    pub sync: SyncProjection,
    pub reconnect: Option<ReconnectProjection>,
    pub error: Option<DeviceError>,
    pub sync_progress: Option<u8>,
    pub vibrating: bool,
}

impl From<&DeviceRecord> for DeviceProjection {
    fn from(record: &DeviceRecord) -> Self {
        let reconnect = (record.state == DeviceState::Reconnecting
            || record.reconnect_attempts > 0)
            .then(|| ReconnectProjection {
                attempt: record.reconnect_attempts,
                next_attempt_at: record.next_reconnect_at,
                reason: record.disconnect_reason,
            });

        Self {
            id: record.id,
            address: record.address.clone(),
            name: record.name.clone(),
            display_name: record.id.display_name().to_string(),
            short_label: record.id.short_label().to_string(),
            placement: record.id.placement(),
            joint: record.id.joint(),
            position: record.id.position(),
            state: record.state,
            previous_state: record.previous_state,
            battery_level: record.battery_level,
            signal_strength: record.signal_strength,
            signal_quality: record.signal_strength.map(SignalQuality::from_rssi),
            firmware_status: record.firmware_status,
            sync: SyncProjection {
                state: record.sync_state,
                clock_offset_ms: record.clock_offset_ms,
                last_sync_at: record.last_sync_at,
            },
            reconnect,
            error: record.last_error.clone(),
            sync_progress: record.sync_progress,
            vibrating: record.vibrating,
        }
    }
}

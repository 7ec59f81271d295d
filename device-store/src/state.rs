//! Per-device state machine and system-wide global mode

use std::fmt;

use serde::{Deserialize, Serialize};

/// Connection lifecycle state of a single device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Disconnected,
    Discovered,
    Connecting,
    Connected,
    Syncing,
    Synced,
    Streaming,
    Reconnecting,
    Error,
}

impl DeviceState {
    pub const ALL: [DeviceState; 9] = [
        DeviceState::Disconnected,
        DeviceState::Discovered,
        DeviceState::Connecting,
        DeviceState::Connected,
        DeviceState::Syncing,
        DeviceState::Synced,
        DeviceState::Streaming,
        DeviceState::Reconnecting,
        DeviceState::Error,
    ];

    /// Targets reachable from this state through a regular transition.
    ///
    /// `Error` is additionally reachable from anywhere through the forced
    /// path (`DeviceStore::transition_to_error`), which does not consult
    /// this table.
    pub const fn allowed_targets(self) -> &'static [DeviceState] {
        use DeviceState::{
            Connected, Connecting, Disconnected, Discovered, Error, Reconnecting, Streaming,
            Synced, Syncing,
        };
        match self {
            Disconnected => &[Discovered, Connecting, Error],
            Discovered => &[Connecting, Disconnected, Error],
            Connecting => &[Connected, Reconnecting, Error, Disconnected],
            Connected => &[Syncing, Streaming, Reconnecting, Disconnected],
            Syncing => &[Synced, Connected, Error, Reconnecting, Disconnected],
            Synced => &[Streaming, Syncing, Connected, Reconnecting, Disconnected],
            Streaming => &[Synced, Syncing, Connected, Reconnecting, Error, Disconnected],
            Reconnecting => &[Connecting, Disconnected, Error],
            Error => &[Discovered, Disconnected, Connecting],
        }
    }

    pub fn can_transition_to(self, target: DeviceState) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// States in which the device is expected to be producing traffic.
    pub const fn is_link_up(self) -> bool {
        matches!(
            self,
            DeviceState::Connected
                | DeviceState::Syncing
                | DeviceState::Synced
                | DeviceState::Streaming
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            DeviceState::Disconnected => "disconnected",
            DeviceState::Discovered => "discovered",
            DeviceState::Connecting => "connecting",
            DeviceState::Connected => "connected",
            DeviceState::Syncing => "syncing",
            DeviceState::Synced => "synced",
            DeviceState::Streaming => "streaming",
            DeviceState::Reconnecting => "reconnecting",
            DeviceState::Error => "error",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// System-wide operational phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    Syncing,
    Locating,
    Streaming,
}

impl GlobalState {
    pub const ALL: [GlobalState; 6] = [
        GlobalState::Idle,
        GlobalState::Scanning,
        GlobalState::Connecting,
        GlobalState::Syncing,
        GlobalState::Locating,
        GlobalState::Streaming,
    ];

    /// Phases that need the radio to themselves.
    pub const fn is_radio_critical(self) -> bool {
        matches!(
            self,
            GlobalState::Connecting
                | GlobalState::Syncing
                | GlobalState::Locating
                | GlobalState::Streaming
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            GlobalState::Idle => "idle",
            GlobalState::Scanning => "scanning",
            GlobalState::Connecting => "connecting",
            GlobalState::Syncing => "syncing",
            GlobalState::Locating => "locating",
            GlobalState::Streaming => "streaming",
        }
    }
}

impl fmt::Display for GlobalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

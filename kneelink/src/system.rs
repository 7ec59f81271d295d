//! DeviceSystem - Main entry point
//!
//! Wires the store and the three lifecycle managers together and exposes the
//! operations a host application needs: feeding in radio events, user
//! actions, and starting or stopping background work.

use std::sync::Arc;

use device_lifecycle::{
    DeviceLink, LinkProbe, PollCategory, PollingManager, ReconnectionManager, StreamControl,
    TelemetryPoller, Watchdog, WatchdogStats,
};
use device_store::{
    BroadcastTransport, DeviceId, DeviceState, DeviceStore, DisconnectReason, GlobalState,
    MotionHook, TransitionMetadata,
};

use crate::config::KneelinkConfig;
use crate::error::SystemError;

/// Builder for [`DeviceSystem`].
///
/// Only the device link is required. Without stream control there is no stall
/// recovery and no streaming resume after reconnect; without a link probe
/// every hard timeout is treated as a lost link.
#[derive(Default)]
pub struct DeviceSystemBuilder {
    config: KneelinkConfig,
    link: Option<Arc<dyn DeviceLink>>,
    probe: Option<Arc<dyn LinkProbe>>,
    streaming: Option<Arc<dyn StreamControl>>,
    pollers: Vec<(PollCategory, Arc<dyn TelemetryPoller>)>,
    transport: Option<Arc<dyn BroadcastTransport>>,
}

impl DeviceSystemBuilder {
    pub fn with_config(mut self, config: KneelinkConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_link(mut self, link: Arc<dyn DeviceLink>) -> Self {
        self.link = Some(link);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn LinkProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_stream_control(mut self, streaming: Arc<dyn StreamControl>) -> Self {
        self.streaming = Some(streaming);
        self
    }

    pub fn with_poller(mut self, category: PollCategory, poller: Arc<dyn TelemetryPoller>) -> Self {
        self.pollers.push((category, poller));
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn BroadcastTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<DeviceSystem, SystemError> {
        self.config.validate()?;
        let link = self
            .link
            .ok_or(SystemError::MissingCollaborator("device link"))?;

        let store = DeviceStore::new(self.config.store_config());
        if let Some(transport) = self.transport {
            store.set_transport(transport);
        }

        let mut reconnect =
            ReconnectionManager::new(store.clone(), link, self.config.reconnect_config());
        if let Some(streaming) = &self.streaming {
            reconnect = reconnect.with_stream_control(Arc::clone(streaming));
        }

        let watchdog = Watchdog::with_collaborators(
            store.clone(),
            reconnect.clone(),
            self.streaming,
            self.probe,
            self.config.watchdog_config(),
        );

        let polling = PollingManager::new(store.clone(), self.config.polling_config());
        for (category, poller) in self.pollers {
            polling.register_poller(category, poller);
        }
        polling.follow_global_state();

        tracing::debug!("device system built");
        Ok(DeviceSystem {
            store,
            reconnect,
            watchdog,
            polling,
        })
    }
}

/// The assembled device lifecycle subsystem.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use kneelink::{DeviceSystem, KneelinkConfig};
///
/// let system = DeviceSystem::builder()
///     .with_config(KneelinkConfig::load_default()?)
///     .with_link(Arc::new(radio.clone()))
///     .with_probe(Arc::new(radio))
///     .with_transport(Arc::new(ui_bridge))
///     .build()?;
///
/// system.start();
///
/// // radio layer callbacks
/// let id = system.register_device(&address, &advertised_name);
/// system.on_device_lost(&address)?;
///
/// system.shutdown();
/// ```
pub struct DeviceSystem {
    store: DeviceStore,
    reconnect: ReconnectionManager,
    watchdog: Watchdog,
    polling: PollingManager,
}

impl DeviceSystem {
    pub fn builder() -> DeviceSystemBuilder {
        DeviceSystemBuilder::default()
    }

    pub fn store(&self) -> &DeviceStore {
        &self.store
    }

    pub fn reconnection(&self) -> &ReconnectionManager {
        &self.reconnect
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn polling(&self) -> &PollingManager {
        &self.polling
    }

    /// Start the watchdog and polling, and publish the initial state.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start(&self) {
        self.watchdog.start();
        // catch up on a mode change missed while shut down
        self.polling.follow_global_state();
        self.polling.on_global_state_change(self.store.global_state());
        self.polling.start();
        self.store.force_broadcast();
        tracing::info!(devices = self.store.device_count(), "device system started");
    }

    /// Stop all background work and publish the final state.
    pub fn shutdown(&self) {
        self.watchdog.stop();
        self.polling.unfollow_global_state();
        self.polling.stop();
        self.reconnect.cleanup_all();
        self.store.force_broadcast();
        tracing::info!("device system stopped");
    }

    /// Record an advertised device seen by the radio layer.
    pub fn register_device(&self, address: &str, advertised_name: &str) -> Option<DeviceId> {
        self.store.register_device(address, advertised_name)
    }

    pub fn unregister_device(&self, id: DeviceId) -> Result<(), SystemError> {
        self.reconnect.cleanup(id);
        self.store.unregister_device(id)?;
        Ok(())
    }

    pub fn register_hook(&self, id: DeviceId, hook: Arc<dyn MotionHook>) -> Result<(), SystemError> {
        self.store.register_hook(id, hook)?;
        Ok(())
    }

    /// Route a motion payload from the radio layer.
    pub fn on_motion_data(&self, address: &str, payload: &[u8]) -> bool {
        self.store.dispatch_motion_data(address, payload)
    }

    /// The radio layer reports that a link dropped.
    ///
    /// Only devices with a live link are handed to reconnection; a device the
    /// user disconnected, or one already recovering, is left alone. Returns
    /// the affected device, if the address is known.
    pub fn on_device_lost(&self, address: &str) -> Result<Option<DeviceId>, SystemError> {
        let Some(id) = self.store.device_id_for_address(address) else {
            tracing::debug!(%address, "link loss for unknown address");
            return Ok(None);
        };
        let Some(state) = self.store.device_state(id) else {
            return Ok(None);
        };
        if !state.is_link_up() {
            tracing::debug!(device = %id, %state, "link loss ignored");
            return Ok(Some(id));
        }

        tracing::info!(device = %id, %state, "link lost");
        self.store.notify_disconnect(id)?;
        self.reconnect
            .schedule_reconnect(id, DisconnectReason::ConnectionLost)?;
        Ok(Some(id))
    }

    /// User-requested disconnect: stops any reconnection and parks the device
    /// in `disconnected`.
    pub fn disconnect_device(&self, id: DeviceId) -> Result<(), SystemError> {
        self.reconnect.cancel_reconnect(id);
        let state = self
            .store
            .device_state(id)
            .ok_or(device_store::StoreError::DeviceNotFound(id))?;

        if state != DeviceState::Disconnected {
            self.store.transition(
                id,
                DeviceState::Disconnected,
                Some(TransitionMetadata::reason(DisconnectReason::UserRequested)),
            )?;
            self.store.notify_disconnect(id)?;
        }
        tracing::info!(device = %id, "device disconnected by user");
        Ok(())
    }

    /// Manual recovery for a device in `error`.
    pub fn retry_connection(&self, id: DeviceId) -> Result<(), SystemError> {
        self.reconnect.retry_connection(id)?;
        Ok(())
    }

    pub fn set_global_state(&self, state: GlobalState) {
        self.store.set_global_state(state);
    }

    pub fn global_state(&self) -> GlobalState {
        self.store.global_state()
    }

    pub fn watchdog_stats(&self) -> WatchdogStats {
        self.watchdog.stats()
    }
}

impl Drop for DeviceSystem {
    fn drop(&mut self) {
        self.watchdog.stop();
        self.polling.unfollow_global_state();
        self.polling.stop();
        self.reconnect.cleanup_all();
    }
}

impl std::fmt::Debug for DeviceSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSystem")
            .field("store", &self.store)
            .field("watchdog", &self.watchdog)
            .field("polling", &self.polling)
            .finish()
    }
}

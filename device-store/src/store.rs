//! Authoritative device state store
//!
//! `DeviceStore` holds one [`DeviceRecord`] per registered logical id plus the
//! global record. It is the only place where state changes are applied and the
//! only component that publishes to consumers.
//!
//! # Architecture
//!
//! ```text
//! DeviceStore (cheap to clone, shared)
//!     │
//!     ├── registry: RwLock<Registry>
//!     │       ├── devices:   HashMap<DeviceId, DeviceRecord>
//!     │       ├── addresses: HashMap<address, DeviceId>   (bijection)
//!     │       ├── hooks:     HashMap<DeviceId, Arc<dyn MotionHook>>
//!     │       └── global:    GlobalRecord
//!     │
//!     ├── listeners: synchronous callbacks, in registration order
//!     ├── change_tx: broadcast::Sender<StateChange>   (async consumers)
//!     │
//!     └── broadcaster: dirty set + one debounce timer
//!             └── flush -> WireMessage -> JSON -> BroadcastTransport
//! ```
//!
//! Mutators are synchronous. Each one takes the registry lock, applies its
//! change, releases the lock, and only then notifies listeners and schedules
//! the broadcast. Listeners may therefore call back into the store.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::broadcast::{BroadcastTransport, WireMessage};
use crate::device::{identify_device, DeviceId};
use crate::error::{Result, StoreError};
use crate::event::{ChangeKind, StateChange, TransitionMetadata};
use crate::hook::{HookError, MotionHook};
use crate::record::{
    DeviceError, DeviceErrorKind, DeviceRecord, DisconnectReason, GlobalRecord, SyncState,
};
use crate::state::{DeviceState, GlobalState};

/// Capacity of the async change channel.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Quiet period before queued changes are flushed to the transport
    pub broadcast_debounce: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            broadcast_debounce: Duration::from_millis(50),
        }
    }
}

/// Handle returned by [`DeviceStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&StateChange) + Send + Sync>;

#[derive(Default)]
struct Registry {
    devices: HashMap<DeviceId, DeviceRecord>,
    addresses: HashMap<String, DeviceId>,
    hooks: HashMap<DeviceId, Arc<dyn MotionHook>>,
    global: GlobalRecord,
}

struct PendingFlush {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Broadcaster {
    dirty: HashSet<DeviceId>,
    pending: Option<PendingFlush>,
    generation: u64,
    sent: u64,
}

struct StoreInner {
    config: StoreConfig,
    registry: RwLock<Registry>,
    broadcaster: Mutex<Broadcaster>,
    transport: RwLock<Option<Arc<dyn BroadcastTransport>>>,
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    change_tx: broadcast::Sender<StateChange>,
}

/// The single source of truth for device and global state.
///
/// Cloning is cheap; all clones share the same state.
///
/// # Example
///
/// ```rust,ignore
/// use device_store::{DeviceStore, DeviceState};
///
/// let store = DeviceStore::default();
/// let id = store.register_device("C4:7F:51:00:00:01", "KneeLink-LS").unwrap();
///
/// store.transition(id, DeviceState::Connecting, None)?;
/// store.transition(id, DeviceState::Connected, None)?;
///
/// assert_eq!(store.device_state(id), Some(DeviceState::Connected));
/// ```
#[derive(Clone)]
pub struct DeviceStore {
    inner: Arc<StoreInner>,
}

impl DeviceStore {
    pub fn new(config: StoreConfig) -> Self {
        let (change_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(StoreInner {
                config,
                registry: RwLock::new(Registry::default()),
                broadcaster: Mutex::new(Broadcaster::default()),
                transport: RwLock::new(None),
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                change_tx,
            }),
        }
    }

    /// Attach the outbound transport used by broadcasts.
    pub fn with_transport(self, transport: Arc<dyn BroadcastTransport>) -> Self {
        self.set_transport(transport);
        self
    }

    pub fn set_transport(&self, transport: Arc<dyn BroadcastTransport>) {
        *self.inner.transport.write() = Some(transport);
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Register an observed radio address under its logical id.
    ///
    /// - A known address only refreshes last-seen and returns its id.
    /// - A name matching no naming convention returns `None` and changes nothing.
    /// - If the resolved id is bound to another address, that binding is
    ///   evicted and replaced (device reset or re-pairing).
    pub fn register_device(&self, address: &str, advertised_name: &str) -> Option<DeviceId> {
        let address = normalize_address(address);
        let mut events = Vec::new();

        let id = {
            let mut registry = self.inner.registry.write();

            if let Some(&id) = registry.addresses.get(&address) {
                if let Some(record) = registry.devices.get_mut(&id) {
                    record.touch();
                }
                tracing::trace!(device = %id, %address, "address already registered");
                return Some(id);
            }

            let id = identify_device(advertised_name)?;

            if let Some(previous) = registry.devices.remove(&id) {
                registry.addresses.remove(&previous.address);
                registry.hooks.remove(&id);
                tracing::warn!(
                    device = %id,
                    old_address = %previous.address,
                    new_address = %address,
                    "re-binding device to a new radio address"
                );
                events.push(StateChange::device(
                    id,
                    ChangeKind::DeviceEvicted {
                        old_address: previous.address,
                    },
                ));
            }

            registry.devices.insert(
                id,
                DeviceRecord::new(id, address.clone(), advertised_name.trim()),
            );
            registry.addresses.insert(address.clone(), id);
            events.push(StateChange::device(
                id,
                ChangeKind::DeviceRegistered {
                    address: address.clone(),
                },
            ));
            id
        };

        tracing::info!(device = %id, %address, name = advertised_name, "device registered");
        for event in events {
            self.emit(event);
        }
        self.queue_broadcast(Some(id));
        Some(id)
    }

    /// Remove a device, its address binding, its hook and any queued broadcast
    /// entry, then publish the new full state.
    pub fn unregister_device(&self, id: DeviceId) -> Result<()> {
        {
            let mut registry = self.inner.registry.write();
            let record = registry
                .devices
                .remove(&id)
                .ok_or(StoreError::DeviceNotFound(id))?;
            registry.addresses.remove(&record.address);
            registry.hooks.remove(&id);
        }
        self.inner.broadcaster.lock().dirty.remove(&id);

        tracing::info!(device = %id, "device unregistered");
        self.emit(StateChange::device(id, ChangeKind::DeviceUnregistered));
        self.force_broadcast();
        Ok(())
    }

    pub fn device(&self, id: DeviceId) -> Option<DeviceRecord> {
        self.inner.registry.read().devices.get(&id).cloned()
    }

    /// All registered devices, ordered by id.
    pub fn devices(&self) -> Vec<DeviceRecord> {
        let registry = self.inner.registry.read();
        let mut devices: Vec<DeviceRecord> = registry.devices.values().cloned().collect();
        devices.sort_by_key(|d| d.id);
        devices
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.inner.registry.read().devices.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn device_state(&self, id: DeviceId) -> Option<DeviceState> {
        self.inner.registry.read().devices.get(&id).map(|d| d.state)
    }

    pub fn device_id_for_address(&self, address: &str) -> Option<DeviceId> {
        self.inner
            .registry
            .read()
            .addresses
            .get(&normalize_address(address))
            .copied()
    }

    pub fn device_count(&self) -> usize {
        self.inner.registry.read().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.device_count() == 0
    }

    // ========================================================================
    // State machine
    // ========================================================================

    /// Move a device to `to`, validated against the transition table.
    ///
    /// Leaving `error` clears the error field. Any transition other than
    /// `reconnecting -> connecting` resets the reconnection counters, unless
    /// the metadata carries a scheduled attempt. Entering
    /// `reconnecting` flushes the broadcast immediately; everything else is
    /// debounced.
    pub fn transition(
        &self,
        id: DeviceId,
        to: DeviceState,
        metadata: Option<TransitionMetadata>,
    ) -> Result<()> {
        let from = {
            let mut registry = self.inner.registry.write();
            let record = registry
                .devices
                .get_mut(&id)
                .ok_or(StoreError::DeviceNotFound(id))?;
            let from = record.state;

            if !from.can_transition_to(to) {
                tracing::warn!(device = %id, %from, %to, "rejected invalid transition");
                return Err(StoreError::InvalidTransition { id, from, to });
            }

            record.previous_state = Some(from);
            record.state = to;
            record.state_changed_at = Utc::now();
            if from == DeviceState::Error {
                record.last_error = None;
            }
            if !(from == DeviceState::Reconnecting && to == DeviceState::Connecting) {
                record.reset_reconnect();
            }
            if to == DeviceState::Connected {
                record.touch();
            }
            if let Some(metadata) = &metadata {
                if let Some(reason) = metadata.reason {
                    record.disconnect_reason = Some(reason);
                }
                if let Some(attempt) = metadata.reconnect_attempt {
                    record.reconnect_attempts = attempt;
                    record.next_reconnect_at = metadata.next_attempt_at;
                }
            }
            from
        };

        tracing::debug!(device = %id, %from, %to, "state transition");
        self.emit(StateChange::device(
            id,
            ChangeKind::DeviceStateChanged { from, to, metadata },
        ));

        if to == DeviceState::Reconnecting {
            self.inner.broadcaster.lock().dirty.insert(id);
            self.force_broadcast();
        } else {
            self.queue_broadcast(Some(id));
        }
        Ok(())
    }

    /// Force a device into `error`, bypassing the transition table.
    ///
    /// Error reporting must never fail, so a source state that the table does
    /// not connect to `error` only produces a warning.
    pub fn transition_to_error(
        &self,
        id: DeviceId,
        kind: DeviceErrorKind,
        message: impl Into<String>,
    ) -> Result<()> {
        let message = message.into();
        let from = {
            let mut registry = self.inner.registry.write();
            let record = registry
                .devices
                .get_mut(&id)
                .ok_or(StoreError::DeviceNotFound(id))?;
            let from = record.state;

            if !from.can_transition_to(DeviceState::Error) {
                tracing::warn!(device = %id, %from, "forcing error state outside the transition table");
            }

            record.previous_state = Some(from);
            record.state = DeviceState::Error;
            record.state_changed_at = Utc::now();
            record.last_error = Some(DeviceError {
                kind,
                message: message.clone(),
                at: Utc::now(),
            });
            record.reset_reconnect();
            from
        };

        tracing::warn!(device = %id, %from, %kind, %message, "device entered error state");
        self.emit(StateChange::device(id, ChangeKind::DeviceFailed { from, kind }));
        self.queue_broadcast(Some(id));
        Ok(())
    }

    // ========================================================================
    // Field mutators
    // ========================================================================

    pub fn set_reconnect_state(
        &self,
        id: DeviceId,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        reason: DisconnectReason,
    ) -> Result<()> {
        self.update(id, |record| {
            record.reconnect_attempts = attempts;
            record.next_reconnect_at = Some(next_attempt_at);
            record.disconnect_reason = Some(reason);
        })?;
        self.queue_broadcast(Some(id));
        Ok(())
    }

    pub fn clear_reconnect_state(&self, id: DeviceId) -> Result<()> {
        self.update(id, |record| {
            record.reset_reconnect();
            record.disconnect_reason = None;
        })?;
        self.queue_broadcast(Some(id));
        Ok(())
    }

    /// Record clock-sync progress. Reaching `Synced` stamps the sync time.
    pub fn set_sync_state(
        &self,
        id: DeviceId,
        sync_state: SyncState,
        clock_offset_ms: Option<f64>,
    ) -> Result<()> {
        self.update(id, |record| {
            record.sync_state = sync_state;
            if clock_offset_ms.is_some() {
                record.clock_offset_ms = clock_offset_ms;
            }
            if sync_state == SyncState::Synced {
                record.last_sync_at = Some(Utc::now());
            }
        })?;
        self.queue_broadcast(Some(id));
        Ok(())
    }

    /// Set the sync progress percentage (clamped to 100), `None` to clear it.
    pub fn set_sync_progress(&self, id: DeviceId, percent: Option<u8>) -> Result<()> {
        self.update(id, |record| {
            record.sync_progress = percent.map(|p| p.min(100));
        })?;
        self.queue_broadcast(Some(id));
        Ok(())
    }

    /// Toggle the locate-vibration flag. Published immediately.
    pub fn set_vibrating(&self, id: DeviceId, vibrating: bool) -> Result<()> {
        self.update(id, |record| record.vibrating = vibrating)?;
        self.inner.broadcaster.lock().dirty.insert(id);
        self.force_broadcast();
        Ok(())
    }

    pub fn set_battery_level(&self, id: DeviceId, percent: u8) -> Result<()> {
        self.update(id, |record| {
            record.battery_level = Some(percent.min(100));
            record.touch();
        })?;
        self.queue_broadcast(Some(id));
        Ok(())
    }

    pub fn set_signal_strength(&self, id: DeviceId, rssi: i16) -> Result<()> {
        self.update(id, |record| {
            record.signal_strength = Some(rssi);
            record.touch();
        })?;
        self.queue_broadcast(Some(id));
        Ok(())
    }

    pub fn set_firmware_status(&self, id: DeviceId, code: u16) -> Result<()> {
        self.update(id, |record| {
            record.firmware_status = Some(code);
            record.touch();
        })?;
        self.queue_broadcast(Some(id));
        Ok(())
    }

    /// Refresh last-seen without publishing.
    pub fn touch(&self, id: DeviceId) -> Result<()> {
        self.update(id, DeviceRecord::touch)
    }

    fn update(&self, id: DeviceId, apply: impl FnOnce(&mut DeviceRecord)) -> Result<()> {
        let mut registry = self.inner.registry.write();
        let record = registry
            .devices
            .get_mut(&id)
            .ok_or(StoreError::DeviceNotFound(id))?;
        apply(record);
        Ok(())
    }

    // ========================================================================
    // Streaming dispatch
    // ========================================================================

    pub fn register_hook(&self, id: DeviceId, hook: Arc<dyn MotionHook>) -> Result<()> {
        let mut registry = self.inner.registry.write();
        if !registry.devices.contains_key(&id) {
            return Err(StoreError::DeviceNotFound(id));
        }
        registry.hooks.insert(id, hook);
        Ok(())
    }

    pub fn remove_hook(&self, id: DeviceId) -> Option<Arc<dyn MotionHook>> {
        self.inner.registry.write().hooks.remove(&id)
    }

    /// Route a motion payload to the hook of the device at `address`.
    ///
    /// Refreshes last-seen. Returns whether a hook received the payload. Hook
    /// failures are handed to the hook's own `on_error` and go no further.
    pub fn dispatch_motion_data(&self, address: &str, payload: &[u8]) -> bool {
        let address = normalize_address(address);
        let (id, hook) = {
            let mut registry = self.inner.registry.write();
            let Some(&id) = registry.addresses.get(&address) else {
                tracing::trace!(%address, "motion data from unknown address");
                return false;
            };
            if let Some(record) = registry.devices.get_mut(&id) {
                record.touch();
            }
            (id, registry.hooks.get(&id).cloned())
        };

        let Some(hook) = hook else {
            tracing::trace!(device = %id, "no streaming hook registered");
            return false;
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| hook.on_motion_data(id, payload)))
            .unwrap_or_else(|payload| Err(HookError::Panicked(panic_message(payload.as_ref()))));
        if let Err(error) = outcome {
            tracing::debug!(device = %id, %error, "streaming hook failed");
            hook.on_error(id, &error);
        }
        true
    }

    /// Tell the device's streaming hook that the device is gone.
    pub fn notify_disconnect(&self, id: DeviceId) -> Result<()> {
        let hook = {
            let registry = self.inner.registry.read();
            if !registry.devices.contains_key(&id) {
                return Err(StoreError::DeviceNotFound(id));
            }
            registry.hooks.get(&id).cloned()
        };
        if let Some(hook) = hook {
            hook.on_disconnect(id);
        }
        Ok(())
    }

    // ========================================================================
    // Global state
    // ========================================================================

    pub fn global_state(&self) -> GlobalState {
        self.inner.registry.read().global.state
    }

    pub fn global_record(&self) -> GlobalRecord {
        self.inner.registry.read().global.clone()
    }

    /// Set the global mode. Not validated; phase timestamps follow
    /// `GlobalRecord::apply`.
    pub fn set_global_state(&self, state: GlobalState) {
        let from = {
            let mut registry = self.inner.registry.write();
            let from = registry.global.state;
            registry.global.apply(state, Utc::now());
            from
        };

        if from != state {
            tracing::info!(%from, to = %state, "global state changed");
            self.emit(StateChange::global(from, state));
        }
        self.queue_broadcast(None);
    }

    // ========================================================================
    // Change notification
    // ========================================================================

    /// Register a synchronous listener, called for every change in order.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.write().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Async view of the same change events. Slow receivers may lag.
    pub fn changes(&self) -> broadcast::Receiver<StateChange> {
        self.inner.change_tx.subscribe()
    }

    fn emit(&self, event: StateChange) {
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(&event);
        }
        // No receivers is fine
        let _ = self.inner.change_tx.send(event);
    }

    // ========================================================================
    // Broadcast
    // ========================================================================

    /// Mark a device dirty and arm the debounce timer if it is not armed.
    ///
    /// Outside a Tokio runtime there is no timer to arm, so the state is
    /// flushed right away.
    pub fn queue_broadcast(&self, id: Option<DeviceId>) {
        let mut broadcaster = self.inner.broadcaster.lock();
        if let Some(id) = id {
            broadcaster.dirty.insert(id);
        }
        if broadcaster.pending.is_some() {
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            drop(broadcaster);
            tracing::trace!("no runtime for debounce, flushing immediately");
            self.flush();
            return;
        };

        broadcaster.generation += 1;
        let generation = broadcaster.generation;
        let delay = self.inner.config.broadcast_debounce;
        let weak: Weak<StoreInner> = Arc::downgrade(&self.inner);

        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                DeviceStore { inner }.flush_if_current(generation);
            }
        });
        broadcaster.pending = Some(PendingFlush { generation, handle });
    }

    /// Cancel any pending debounce and publish now.
    pub fn force_broadcast(&self) {
        if let Some(pending) = self.inner.broadcaster.lock().pending.take() {
            pending.handle.abort();
        }
        self.flush();
    }

    /// The message a flush would publish right now.
    pub fn snapshot_message(&self) -> WireMessage {
        let registry = self.inner.registry.read();
        WireMessage::snapshot(&registry.global, registry.devices.values())
    }

    /// Number of messages flushed so far.
    pub fn broadcasts_sent(&self) -> u64 {
        self.inner.broadcaster.lock().sent
    }

    fn flush_if_current(&self, generation: u64) {
        {
            let mut broadcaster = self.inner.broadcaster.lock();
            match &broadcaster.pending {
                Some(pending) if pending.generation == generation => broadcaster.pending = None,
                _ => return,
            }
        }
        self.flush();
    }

    fn flush(&self) {
        let message = self.snapshot_message();
        let dirty = {
            let mut broadcaster = self.inner.broadcaster.lock();
            broadcaster.sent += 1;
            std::mem::take(&mut broadcaster.dirty).len()
        };

        let transport = self.inner.transport.read().clone();
        let Some(transport) = transport else {
            tracing::trace!(dirty, "no broadcast transport attached");
            return;
        };

        let payload = match serde_json::to_string(&message) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, "failed to serialize state message");
                return;
            }
        };

        tracing::trace!(dirty, bytes = payload.len(), "broadcasting state");
        if let Err(error) = transport.send(&payload) {
            tracing::warn!(%error, "broadcast transport failed");
        }
    }
}

impl Default for DeviceStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl std::fmt::Debug for DeviceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceStore")
            .field("device_count", &self.device_count())
            .field("global_state", &self.global_state())
            .finish()
    }
}

fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_uppercase()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

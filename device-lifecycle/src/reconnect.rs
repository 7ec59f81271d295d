//! Automatic reconnection with exponential backoff.
//!
//! The ReconnectionManager owns one one-shot timer per device that lost its
//! link. Each timer fire makes a single connection attempt; a failed attempt
//! schedules the next one with a longer delay until the attempt budget is
//! spent, at which point the device is put in `error` and left for the user.
//!
//! # Attempt flow
//!
//! ```text
//! schedule_reconnect(id, reason)
//!     │
//!     ├── attempts >= max ──> error (MAX_RECONNECT_EXCEEDED)
//!     │
//!     └── reconnecting ── sleep(backoff) ── connecting ── connect(address)
//!                                                            │
//!                         ┌──── false / Err ─────────────────┤
//!                         │                                  │
//!                schedule_reconnect                      connected
//!                                                            │
//!                                          global streaming? start_streaming
//!                                                            │
//!                                                        streaming
//! ```
//!
//! Attempt counts live here and are mirrored into the store, because the store
//! resets its reconnection fields on every transition other than the
//! `reconnecting -> connecting` hop. The manager follows store changes: an
//! episode ends, and its count is dropped, as soon as the device leaves that
//! pair of states by any path.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use device_store::{
    ChangeKind, DeviceErrorKind, DeviceId, DeviceState, DeviceStore, DisconnectReason,
    GlobalState, ListenerId, StateChange, StoreError, TransitionMetadata,
};

use crate::config::ReconnectConfig;
use crate::error::{LifecycleError, Result};
use crate::link::{DeviceLink, StreamControl};

/// Per-device reconnection bookkeeping.
struct ReconnectEntry {
    /// Attempts scheduled so far in the current episode
    attempts: u32,
    reason: DisconnectReason,
    timer: Option<JoinHandle<()>>,
}

struct ReconnectInner {
    store: DeviceStore,
    link: Arc<dyn DeviceLink>,
    streaming: Option<Arc<dyn StreamControl>>,
    config: ReconnectConfig,
    entries: Mutex<HashMap<DeviceId, ReconnectEntry>>,
    listener: Mutex<Option<ListenerId>>,
}

impl Drop for ReconnectInner {
    fn drop(&mut self) {
        for entry in self.entries.get_mut().values_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }
        if let Some(listener) = self.listener.get_mut().take() {
            self.store.unsubscribe(listener);
        }
    }
}

/// Whether a store change takes the device out of a reconnection episode.
fn ends_episode(change: &StateChange) -> bool {
    match &change.kind {
        ChangeKind::DeviceStateChanged { to, .. } => {
            !matches!(to, DeviceState::Reconnecting | DeviceState::Connecting)
        }
        ChangeKind::DeviceFailed { .. } | ChangeKind::DeviceUnregistered => true,
        _ => false,
    }
}

/// Manager for automatic device reconnection.
///
/// Cloning is cheap; clones share timers and bookkeeping. Scheduling spawns
/// Tokio tasks and must happen inside a Tokio runtime.
#[derive(Clone)]
pub struct ReconnectionManager {
    inner: Arc<ReconnectInner>,
}

impl ReconnectionManager {
    pub fn new(store: DeviceStore, link: Arc<dyn DeviceLink>, config: ReconnectConfig) -> Self {
        Self {
            inner: Arc::new(ReconnectInner {
                store,
                link,
                streaming: None,
                config,
                entries: Mutex::new(HashMap::new()),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Attach the streaming control used to resume streaming after a
    /// reconnect that happens while the system is streaming.
    ///
    /// Must be called before the manager is cloned.
    pub fn with_stream_control(mut self, streaming: Arc<dyn StreamControl>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.streaming = Some(streaming),
            None => tracing::warn!("stream control attached to a shared reconnection manager; ignored"),
        }
        self
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.inner.config
    }

    /// Schedule the next reconnection attempt for a device.
    ///
    /// A user-requested disconnect is never reconnected. Any pending timer for
    /// the device is cancelled first. Once `max_attempts` attempts have been
    /// made the device is forced into `error`.
    pub fn schedule_reconnect(&self, id: DeviceId, reason: DisconnectReason) -> Result<()> {
        if reason == DisconnectReason::UserRequested {
            tracing::debug!(device = %id, "user-requested disconnect, not reconnecting");
            return Ok(());
        }

        let store = &self.inner.store;
        let record = store.device(id).ok_or(StoreError::DeviceNotFound(id))?;
        self.follow_store();

        let attempts = {
            let mut entries = self.inner.entries.lock();
            let entry = entries.entry(id).or_insert_with(|| ReconnectEntry {
                attempts: 0,
                reason,
                timer: None,
            });
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            entry.reason = reason;
            entry.attempts
        };

        let max_attempts = self.inner.config.max_attempts;
        if attempts >= max_attempts {
            self.inner.entries.lock().remove(&id);
            tracing::warn!(device = %id, attempts, %reason, "reconnection attempts exhausted");
            store.transition_to_error(
                id,
                DeviceErrorKind::MaxReconnectExceeded,
                format!("Gave up after {attempts} reconnection attempts"),
            )?;
            store.clear_reconnect_state(id)?;
            return Ok(());
        }

        let delay = self.inner.config.delay_for_attempt(attempts);
        let attempt = attempts + 1;
        let next_attempt_at =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        if record.state == DeviceState::Reconnecting {
            store.set_reconnect_state(id, attempt, next_attempt_at, reason)?;
            store.force_broadcast();
        } else {
            if !record.state.can_transition_to(DeviceState::Reconnecting) {
                // error, disconnected and discovered only reach reconnecting via connecting
                store.transition(
                    id,
                    DeviceState::Connecting,
                    Some(TransitionMetadata::note("reconnect")),
                )?;
            }
            // entering reconnecting flushes, counters included
            store.transition(
                id,
                DeviceState::Reconnecting,
                Some(TransitionMetadata::reason(reason).with_reconnect(attempt, next_attempt_at)),
            )?;
        }

        let weak: Weak<ReconnectInner> = Arc::downgrade(&self.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                ReconnectionManager { inner }.attempt(id).await;
            }
        });

        {
            let mut entries = self.inner.entries.lock();
            match entries.get_mut(&id) {
                Some(entry) => {
                    entry.attempts = attempt;
                    entry.timer = Some(timer);
                }
                // cancelled while we were scheduling
                None => timer.abort(),
            }
        }

        tracing::info!(
            device = %id,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            %reason,
            "reconnect scheduled"
        );
        Ok(())
    }

    /// Manual recovery from `error`: the backoff restarts at attempt 1.
    pub fn retry_connection(&self, id: DeviceId) -> Result<()> {
        let state = self
            .inner
            .store
            .device_state(id)
            .ok_or(StoreError::DeviceNotFound(id))?;
        if state != DeviceState::Error {
            return Err(LifecycleError::NotInErrorState { id, state });
        }

        tracing::info!(device = %id, "manual reconnection requested");
        self.cancel_reconnect(id);
        self.schedule_reconnect(id, DisconnectReason::ConnectionLost)
    }

    /// Cancel a device's pending attempt and clear its bookkeeping, here and
    /// in the store. Returns whether a timer was pending.
    pub fn cancel_reconnect(&self, id: DeviceId) -> bool {
        let was_pending = self.cleanup(id);
        match self.inner.store.clear_reconnect_state(id) {
            Ok(()) | Err(StoreError::DeviceNotFound(_)) => {}
            Err(error) => tracing::warn!(device = %id, %error, "failed to clear reconnect state"),
        }
        if was_pending {
            tracing::debug!(device = %id, "reconnect cancelled");
        }
        was_pending
    }

    /// Drop local bookkeeping for a device, e.g. after it was unregistered.
    pub fn cleanup(&self, id: DeviceId) -> bool {
        let entry = self.inner.entries.lock().remove(&id);
        match entry.and_then(|e| e.timer) {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending attempt.
    pub fn cleanup_all(&self) {
        let entries: Vec<(DeviceId, ReconnectEntry)> =
            self.inner.entries.lock().drain().collect();
        for (id, entry) in entries {
            if let Some(timer) = entry.timer {
                timer.abort();
                tracing::debug!(device = %id, "reconnect cancelled");
            }
        }
    }

    /// Whether an attempt is currently scheduled for the device.
    pub fn is_pending(&self, id: DeviceId) -> bool {
        self.inner
            .entries
            .lock()
            .get(&id)
            .is_some_and(|e| e.timer.is_some())
    }

    /// Attempts made in the current episode.
    pub fn attempts(&self, id: DeviceId) -> u32 {
        self.inner.entries.lock().get(&id).map_or(0, |e| e.attempts)
    }

    /// Subscribe to store changes once, so episodes that end outside this
    /// manager also drop their attempt count.
    fn follow_store(&self) {
        let mut listener = self.inner.listener.lock();
        if listener.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        *listener = Some(self.inner.store.subscribe(move |change| {
            let Some(id) = change.device else {
                return;
            };
            if !ends_episode(change) {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                let entry = inner.entries.lock().remove(&id);
                if let Some(timer) = entry.and_then(|e| e.timer) {
                    timer.abort();
                    tracing::debug!(device = %id, "reconnect dropped, device left reconnection");
                }
            }
        }));
    }

    /// Drop the entry of an attempt whose result no longer applies, unless a
    /// new attempt has been scheduled meanwhile.
    fn forget_attempt(&self, id: DeviceId) {
        let mut entries = self.inner.entries.lock();
        if entries.get(&id).is_some_and(|e| e.timer.is_none()) {
            entries.remove(&id);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .entries
            .lock()
            .values()
            .filter(|e| e.timer.is_some())
            .count()
    }

    /// One connection attempt, run when the backoff timer fires.
    async fn attempt(&self, id: DeviceId) {
        let reason = {
            let mut entries = self.inner.entries.lock();
            let Some(entry) = entries.get_mut(&id) else {
                return;
            };
            // detach our own handle so rescheduling does not abort this task
            entry.timer = None;
            entry.reason
        };

        let store = &self.inner.store;
        let address = match store.device(id) {
            Some(record) if record.state == DeviceState::Reconnecting => record.address,
            Some(record) => {
                tracing::debug!(device = %id, state = %record.state, "no longer reconnecting, attempt skipped");
                self.cleanup(id);
                return;
            }
            None => {
                self.cleanup(id);
                return;
            }
        };

        if let Err(error) = store.transition(id, DeviceState::Connecting, None) {
            tracing::warn!(device = %id, %error, "could not start reconnection attempt");
            self.forget_attempt(id);
            return;
        }
        store.force_broadcast();

        let attempt = self.attempts(id);
        tracing::debug!(device = %id, attempt, %address, "attempting reconnection");
        let outcome = self.inner.link.connect(&address).await;

        match store.device(id) {
            Some(record) if record.state == DeviceState::Connecting && record.address == address => {}
            _ => {
                tracing::debug!(device = %id, "device changed during reconnection, result dropped");
                self.forget_attempt(id);
                return;
            }
        }

        match outcome {
            Ok(true) => self.on_reconnected(id).await,
            Ok(false) => {
                tracing::debug!(device = %id, attempt, "reconnection refused");
                self.reschedule(id, reason);
            }
            Err(error) => {
                tracing::warn!(device = %id, attempt, %error, "reconnection attempt failed");
                self.reschedule(id, reason);
            }
        }
    }

    async fn on_reconnected(&self, id: DeviceId) {
        let store = &self.inner.store;
        self.inner.entries.lock().remove(&id);

        if let Err(error) = store
            .clear_reconnect_state(id)
            .and_then(|()| store.transition(id, DeviceState::Connected, None))
        {
            tracing::warn!(device = %id, %error, "could not record reconnection");
            return;
        }
        store.force_broadcast();
        tracing::info!(device = %id, "device reconnected");

        if store.global_state() != GlobalState::Streaming {
            return;
        }
        let Some(streaming) = &self.inner.streaming else {
            return;
        };

        match streaming.start_streaming(id).await {
            Ok(true) => {
                if store.device_state(id) != Some(DeviceState::Connected) {
                    tracing::debug!(device = %id, "device changed before streaming resumed");
                    return;
                }
                match store.transition(id, DeviceState::Streaming, None) {
                    Ok(()) => tracing::info!(device = %id, "streaming resumed after reconnect"),
                    Err(error) => tracing::warn!(device = %id, %error, "could not mark device streaming"),
                }
            }
            Ok(false) => tracing::warn!(device = %id, "device declined to resume streaming"),
            Err(error) => tracing::warn!(device = %id, %error, "failed to resume streaming"),
        }
    }

    fn reschedule(&self, id: DeviceId, reason: DisconnectReason) {
        if let Err(error) = self.schedule_reconnect(id, reason) {
            tracing::warn!(device = %id, %error, "could not reschedule reconnection");
        }
    }
}

impl std::fmt::Debug for ReconnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectionManager")
            .field("config", &self.inner.config)
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use device_store::{TransportError, WireMessage};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    /// Link that replays scripted outcomes, then falls back to `default`.
    struct ScriptedLink {
        script: Mutex<VecDeque<std::result::Result<bool, LinkError>>>,
        default: std::result::Result<bool, LinkError>,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedLink {
        fn always(outcome: std::result::Result<bool, LinkError>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                default: outcome,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl DeviceLink for ScriptedLink {
        async fn connect(&self, _address: &str) -> std::result::Result<bool, LinkError> {
            self.calls.lock().push(Instant::now());
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| self.default.clone())
        }
    }

    #[derive(Default)]
    struct CountingStream {
        starts: AtomicUsize,
    }

    #[async_trait]
    impl StreamControl for CountingStream {
        async fn start_streaming(&self, _device: DeviceId) -> std::result::Result<bool, LinkError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }

        async fn resume_streaming(
            &self,
            _device: DeviceId,
            _address: &str,
        ) -> std::result::Result<bool, LinkError> {
            Ok(true)
        }
    }

    fn connected_store() -> (DeviceStore, DeviceId) {
        let store = DeviceStore::default();
        let id = store.register_device("AA:00", "KneeLink-LS").unwrap();
        store.transition(id, DeviceState::Connecting, None).unwrap();
        store.transition(id, DeviceState::Connected, None).unwrap();
        (store, id)
    }

    fn assert_close(actual: Duration, expected: Duration) {
        let diff = if actual > expected {
            actual - expected
        } else {
            expected - actual
        };
        assert!(
            diff <= Duration::from_millis(2),
            "expected {expected:?}, got {actual:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sequence_then_error() {
        let (store, id) = connected_store();
        let link = ScriptedLink::always(Err(LinkError::Timeout));
        let manager = ReconnectionManager::new(store.clone(), link.clone(), ReconnectConfig::default());

        let started = Instant::now();
        manager
            .schedule_reconnect(id, DisconnectReason::ConnectionLost)
            .unwrap();
        assert_eq!(store.device_state(id), Some(DeviceState::Reconnecting));
        assert_eq!(store.device(id).unwrap().reconnect_attempts, 1);

        tokio::time::sleep(Duration::from_secs(10)).await;

        let calls = link.calls.lock().clone();
        assert_eq!(calls.len(), 5);
        let expected_ms = [500.0, 750.0, 1125.0, 1687.5, 2531.25];
        let mut previous = started;
        for (call, ms) in calls.iter().zip(expected_ms) {
            assert_close(*call - previous, Duration::from_secs_f64(ms / 1000.0));
            previous = *call;
        }

        let record = store.device(id).unwrap();
        assert_eq!(record.state, DeviceState::Error);
        assert_eq!(
            record.last_error.unwrap().kind,
            DeviceErrorKind::MaxReconnectExceeded
        );
        assert_eq!(record.reconnect_attempts, 0);
        assert!(!manager.is_pending(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_while_streaming_ends_streaming() {
        let (store, id) = connected_store();
        store.transition(id, DeviceState::Streaming, None).unwrap();
        store.set_global_state(GlobalState::Streaming);

        let link = ScriptedLink::always(Ok(true));
        let stream = Arc::new(CountingStream::default());
        let manager = ReconnectionManager::new(store.clone(), link.clone(), ReconnectConfig::default())
            .with_stream_control(stream.clone());

        manager
            .schedule_reconnect(id, DisconnectReason::WatchdogTimeout)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(link.call_count(), 1);
        assert_eq!(stream.starts.load(Ordering::SeqCst), 1);
        let record = store.device(id).unwrap();
        assert_eq!(record.state, DeviceState::Streaming);
        assert_eq!(record.reconnect_attempts, 0);
        assert_eq!(manager.attempts(id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_while_idle_stays_connected() {
        let (store, id) = connected_store();
        let link = ScriptedLink::always(Ok(false));
        link.script.lock().push_back(Ok(false));
        link.script.lock().push_back(Ok(true));
        let manager = ReconnectionManager::new(store.clone(), link.clone(), ReconnectConfig::default());

        manager
            .schedule_reconnect(id, DisconnectReason::ConnectionLost)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(link.call_count(), 2);
        assert_eq!(store.device_state(id), Some(DeviceState::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_requested_is_ignored() {
        let (store, id) = connected_store();
        let link = ScriptedLink::always(Ok(true));
        let manager = ReconnectionManager::new(store.clone(), link.clone(), ReconnectConfig::default());

        manager
            .schedule_reconnect(id, DisconnectReason::UserRequested)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(link.call_count(), 0);
        assert_eq!(store.device_state(id), Some(DeviceState::Connected));
        assert!(!manager.is_pending(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescheduling_replaces_timer() {
        let (store, id) = connected_store();
        let link = ScriptedLink::always(Ok(true));
        let manager = ReconnectionManager::new(store.clone(), link.clone(), ReconnectConfig::default());

        manager
            .schedule_reconnect(id, DisconnectReason::ConnectionLost)
            .unwrap();
        manager
            .schedule_reconnect(id, DisconnectReason::LinkFailure)
            .unwrap();
        assert_eq!(manager.pending_count(), 1);
        assert_eq!(manager.attempts(id), 2);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(link.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_attempt() {
        let (store, id) = connected_store();
        let link = ScriptedLink::always(Ok(true));
        let manager = ReconnectionManager::new(store.clone(), link.clone(), ReconnectConfig::default());

        manager
            .schedule_reconnect(id, DisconnectReason::ConnectionLost)
            .unwrap();
        assert!(manager.cancel_reconnect(id));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(link.call_count(), 0);
        let record = store.device(id).unwrap();
        assert_eq!(record.reconnect_attempts, 0);
        assert_eq!(record.disconnect_reason, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_only_from_error() {
        let (store, id) = connected_store();
        let link = ScriptedLink::always(Ok(true));
        let manager = ReconnectionManager::new(store.clone(), link.clone(), ReconnectConfig::default());

        assert_eq!(
            manager.retry_connection(id),
            Err(LifecycleError::NotInErrorState {
                id,
                state: DeviceState::Connected,
            })
        );

        store
            .transition_to_error(id, DeviceErrorKind::MaxReconnectExceeded, "gave up")
            .unwrap();
        manager.retry_connection(id).unwrap();

        let record = store.device(id).unwrap();
        assert_eq!(record.state, DeviceState::Reconnecting);
        assert_eq!(record.reconnect_attempts, 1);
        assert!(record.last_error.is_none());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.device_state(id), Some(DeviceState::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_device_attempt_is_dropped() {
        let (store, id) = connected_store();
        let link = ScriptedLink::always(Ok(true));
        let manager = ReconnectionManager::new(store.clone(), link.clone(), ReconnectConfig::default());

        manager
            .schedule_reconnect(id, DisconnectReason::ConnectionLost)
            .unwrap();
        store.unregister_device(id).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(link.call_count(), 0);
        assert_eq!(manager.pending_count(), 0);
    }

    /// Link whose first attempt races with another path that brings the
    /// device up, then reports failure.
    struct RacingLink {
        store: DeviceStore,
        device: DeviceId,
        raced: AtomicBool,
        calls: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl DeviceLink for RacingLink {
        async fn connect(&self, _address: &str) -> std::result::Result<bool, LinkError> {
            self.calls.lock().push(Instant::now());
            if self.raced.swap(true, Ordering::SeqCst) {
                return Ok(true);
            }
            self.store
                .transition(self.device, DeviceState::Connected, None)
                .unwrap();
            Ok(false)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_attempt_does_not_carry_count_into_next_episode() {
        let (store, id) = connected_store();
        let link = Arc::new(RacingLink {
            store: store.clone(),
            device: id,
            raced: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        });
        let manager = ReconnectionManager::new(store.clone(), link.clone(), ReconnectConfig::default());

        manager
            .schedule_reconnect(id, DisconnectReason::ConnectionLost)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(store.device_state(id), Some(DeviceState::Connected));
        assert_eq!(manager.attempts(id), 0);
        assert!(!manager.is_pending(id));

        let started = Instant::now();
        manager
            .schedule_reconnect(id, DisconnectReason::ConnectionLost)
            .unwrap();
        assert_eq!(store.device(id).unwrap().reconnect_attempts, 1);
        assert_eq!(manager.attempts(id), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let calls = link.calls.lock().clone();
        assert_eq!(calls.len(), 2);
        assert_close(calls[1] - started, Duration::from_millis(500));
        assert_eq!(store.device_state(id), Some(DeviceState::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_error_ends_episode() {
        let (store, id) = connected_store();
        let link = ScriptedLink::always(Ok(false));
        let manager = ReconnectionManager::new(store.clone(), link.clone(), ReconnectConfig::default());

        manager
            .schedule_reconnect(id, DisconnectReason::ConnectionLost)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(manager.attempts(id), 2);

        store
            .transition_to_error(id, DeviceErrorKind::ConnectionFailed, "radio reset")
            .unwrap();
        assert!(!manager.is_pending(id));
        assert_eq!(manager.attempts(id), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(link.call_count(), 1);
        assert_eq!(store.device_state(id), Some(DeviceState::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduling_publishes_one_complete_snapshot() {
        let sent: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sent);
        let (store, id) = connected_store();
        store.set_transport(Arc::new(move |json: &str| -> std::result::Result<(), TransportError> {
            sink.lock().push(json.to_string());
            Ok(())
        }));
        tokio::time::sleep(Duration::from_millis(200)).await;
        let before = sent.lock().len();

        let manager = ReconnectionManager::new(
            store.clone(),
            ScriptedLink::always(Ok(false)),
            ReconnectConfig::default(),
        );
        manager
            .schedule_reconnect(id, DisconnectReason::ConnectionLost)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let sent = sent.lock();
        assert_eq!(sent.len(), before + 1);
        let message: WireMessage = serde_json::from_str(sent.last().unwrap()).unwrap();
        let device = message.device(id).unwrap();
        assert_eq!(device.state, DeviceState::Reconnecting);
        let reconnect = device.reconnect.as_ref().unwrap();
        assert_eq!(reconnect.attempt, 1);
        assert!(reconnect.next_attempt_at.is_some());
        assert_eq!(reconnect.reason, Some(DisconnectReason::ConnectionLost));
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let store = DeviceStore::default();
        let manager = ReconnectionManager::new(
            store,
            ScriptedLink::always(Ok(true)),
            ReconnectConfig::default(),
        );
        assert_eq!(
            manager.schedule_reconnect(DeviceId::RightThigh, DisconnectReason::ConnectionLost),
            Err(LifecycleError::Store(StoreError::DeviceNotFound(DeviceId::RightThigh)))
        );
    }
}

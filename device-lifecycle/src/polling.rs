//! Periodic telemetry polling
//!
//! One recurring timer per telemetry category, each with its own injected
//! poller. Polling competes with time-critical radio traffic, so it is blocked
//! while the system is connecting, syncing, locating or streaming, and can
//! also be blocked by hand.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use device_store::{DeviceId, DeviceStore, GlobalState, ListenerId, StoreError};

use crate::config::PollingConfig;
use crate::link::TelemetryPoller;

/// RSSI values outside this range are treated as garbage.
const RSSI_RANGE: std::ops::RangeInclusive<i64> = -127..=20;

/// Telemetry category polled on its own timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollCategory {
    Battery,
    Signal,
    Firmware,
}

impl PollCategory {
    pub const ALL: [PollCategory; 3] = [
        PollCategory::Battery,
        PollCategory::Signal,
        PollCategory::Firmware,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            PollCategory::Battery => "battery",
            PollCategory::Signal => "signal",
            PollCategory::Firmware => "firmware",
        }
    }
}

impl fmt::Display for PollCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who blocked polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSource {
    /// An explicit `block()` call; only `unblock()` lifts it
    Manual,
    /// Entering a radio-critical global mode; lifted when the mode ends
    GlobalState(GlobalState),
}

#[derive(Debug, Clone)]
struct Block {
    source: BlockSource,
    reason: String,
}

/// Outcome counts of one polling cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Devices a poll was issued to
    pub polled: usize,
    /// Values written to the store
    pub updated: usize,
    /// Polls that returned nothing
    pub empty: usize,
    /// Polls that failed
    pub failed: usize,
    /// Values outside the field's range
    pub rejected: usize,
}

struct PollingInner {
    store: DeviceStore,
    config: PollingConfig,
    pollers: RwLock<HashMap<PollCategory, Arc<dyn TelemetryPoller>>>,
    timers: Mutex<HashMap<PollCategory, JoinHandle<()>>>,
    block: Mutex<Option<Block>>,
    /// Set by `start`, cleared by `stop`; a lifted block re-arms only if set
    wanted: AtomicBool,
    in_flight: Mutex<HashSet<DeviceId>>,
    listener: Mutex<Option<ListenerId>>,
}

/// Releases a device's in-flight slot when the poll finishes or is dropped.
struct InFlight {
    inner: Arc<PollingInner>,
    id: DeviceId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.inner.in_flight.lock().remove(&self.id);
    }
}

/// Telemetry polling manager.
#[derive(Clone)]
pub struct PollingManager {
    inner: Arc<PollingInner>,
}

impl PollingManager {
    pub fn new(store: DeviceStore, config: PollingConfig) -> Self {
        Self {
            inner: Arc::new(PollingInner {
                store,
                config,
                pollers: RwLock::new(HashMap::new()),
                timers: Mutex::new(HashMap::new()),
                block: Mutex::new(None),
                wanted: AtomicBool::new(false),
                in_flight: Mutex::new(HashSet::new()),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn with_poller(self, category: PollCategory, poller: Arc<dyn TelemetryPoller>) -> Self {
        self.register_poller(category, poller);
        self
    }

    /// Register the poller for a category, replacing any previous one. Takes
    /// effect for a running manager on the next `start()`.
    pub fn register_poller(&self, category: PollCategory, poller: Arc<dyn TelemetryPoller>) {
        self.inner.pollers.write().insert(category, poller);
    }

    pub fn interval_for(&self, category: PollCategory) -> std::time::Duration {
        let config = &self.inner.config;
        match category {
            PollCategory::Battery => config.battery_interval,
            PollCategory::Signal => config.signal_interval,
            PollCategory::Firmware => config.firmware_interval,
        }
    }

    /// Arm one timer per registered category. Each fires immediately, then
    /// at its interval. While blocked, polling starts once the block lifts.
    pub fn start(&self) {
        self.inner.wanted.store(true, Ordering::SeqCst);
        if let Some(block) = self.inner.block.lock().as_ref() {
            tracing::debug!(reason = %block.reason, "polling blocked, not starting");
            return;
        }
        self.arm();
    }

    fn arm(&self) {
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!("no Tokio runtime, polling not started");
            return;
        };

        let categories: Vec<PollCategory> = self.inner.pollers.read().keys().copied().collect();
        let mut timers = self.inner.timers.lock();
        for category in categories {
            if let Some(previous) = timers.remove(&category) {
                previous.abort();
            }

            let period = self.interval_for(category);
            let weak: Weak<PollingInner> = Arc::downgrade(&self.inner);
            let handle = runtime.spawn(async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    // detached so stopping the timer never cancels polls in flight
                    tokio::spawn(async move {
                        PollingManager { inner }.poll_now(category).await;
                    });
                }
            });
            timers.insert(category, handle);
            tracing::debug!(%category, interval_ms = period.as_millis() as u64, "polling timer armed");
        }
    }

    /// Cancel every polling timer. Lifting a block no longer restarts
    /// polling until the next `start()`.
    pub fn stop(&self) {
        self.inner.wanted.store(false, Ordering::SeqCst);
        self.disarm();
    }

    fn disarm(&self) {
        let timers: Vec<(PollCategory, JoinHandle<()>)> =
            self.inner.timers.lock().drain().collect();
        for (category, timer) in timers {
            timer.abort();
            tracing::debug!(%category, "polling timer cancelled");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.inner.timers.lock().is_empty()
    }

    /// Stop polling until `unblock()`. Overrides an automatic block.
    pub fn block(&self, reason: impl Into<String>) {
        self.apply_block(BlockSource::Manual, reason.into());
    }

    /// Lift any block, and resume polling if it was started.
    pub fn unblock(&self) {
        let lifted = self.inner.block.lock().take();
        if let Some(block) = lifted {
            tracing::info!(reason = %block.reason, "polling unblocked");
        }
        if self.inner.wanted.load(Ordering::SeqCst) {
            self.arm();
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.inner.block.lock().is_some()
    }

    pub fn block_source(&self) -> Option<BlockSource> {
        self.inner.block.lock().as_ref().map(|b| b.source)
    }

    pub fn block_reason(&self) -> Option<String> {
        self.inner.block.lock().as_ref().map(|b| b.reason.clone())
    }

    /// Block for radio-critical global modes, and lift a block that an
    /// earlier global mode put in place once the mode is no longer critical.
    /// Manual blocks are left alone.
    pub fn on_global_state_change(&self, state: GlobalState) {
        if state.is_radio_critical() {
            if !self.is_blocked() {
                self.apply_block(BlockSource::GlobalState(state), format!("global state {state}"));
            }
        } else if matches!(self.block_source(), Some(BlockSource::GlobalState(_))) {
            self.unblock();
        }
    }

    /// React to the store's global mode changes from now on.
    pub fn follow_global_state(&self) {
        let mut listener = self.inner.listener.lock();
        if listener.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        *listener = Some(self.inner.store.subscribe(move |event| {
            let Some(state) = event.new_global_state() else {
                return;
            };
            if let Some(inner) = weak.upgrade() {
                PollingManager { inner }.on_global_state_change(state);
            }
        }));
    }

    /// Stop reacting to global mode changes.
    pub fn unfollow_global_state(&self) {
        if let Some(listener) = self.inner.listener.lock().take() {
            self.inner.store.unsubscribe(listener);
        }
    }

    /// Run one polling cycle for `category` now.
    ///
    /// Devices in a pollable state are polled concurrently; a device that
    /// already has a poll in flight is skipped. Each result settles on its
    /// own and only successful values are written back.
    pub async fn poll_now(&self, category: PollCategory) -> CycleReport {
        let mut report = CycleReport::default();
        let Some(poller) = self.inner.pollers.read().get(&category).cloned() else {
            return report;
        };

        let targets: Vec<InFlight> = {
            let candidates: Vec<DeviceId> = self
                .inner
                .store
                .devices()
                .into_iter()
                .filter(|d| self.inner.config.is_pollable(d.state))
                .map(|d| d.id)
                .collect();

            let mut in_flight = self.inner.in_flight.lock();
            candidates
                .into_iter()
                .filter(|id| in_flight.insert(*id))
                .map(|id| InFlight {
                    inner: Arc::clone(&self.inner),
                    id,
                })
                .collect()
        };

        report.polled = targets.len();
        if targets.is_empty() {
            tracing::trace!(%category, "no pollable devices");
            return report;
        }

        let polls = targets.into_iter().map(|slot| {
            let poller = Arc::clone(&poller);
            async move {
                let result = poller.poll(slot.id).await;
                (slot, result)
            }
        });

        for (slot, result) in join_all(polls).await {
            let id = slot.id;
            drop(slot);
            match result {
                Ok(Some(value)) => match self.write_back(category, id, value) {
                    WriteBack::Updated => report.updated += 1,
                    WriteBack::Rejected => report.rejected += 1,
                    WriteBack::Gone => {}
                },
                Ok(None) => report.empty += 1,
                Err(error) => {
                    report.failed += 1;
                    tracing::debug!(device = %id, %category, %error, "poll failed");
                }
            }
        }

        tracing::trace!(%category, ?report, "polling cycle complete");
        report
    }

    fn write_back(&self, category: PollCategory, id: DeviceId, value: i64) -> WriteBack {
        let store = &self.inner.store;
        let result = match category {
            PollCategory::Battery => match u8::try_from(value) {
                Ok(percent) if percent <= 100 => store.set_battery_level(id, percent),
                _ => return self.reject(category, id, value),
            },
            PollCategory::Signal => match i16::try_from(value) {
                Ok(rssi) if RSSI_RANGE.contains(&value) => store.set_signal_strength(id, rssi),
                _ => return self.reject(category, id, value),
            },
            PollCategory::Firmware => match u16::try_from(value) {
                Ok(code) => store.set_firmware_status(id, code),
                Err(_) => return self.reject(category, id, value),
            },
        };

        match result {
            Ok(()) => WriteBack::Updated,
            Err(StoreError::DeviceNotFound(_)) => {
                tracing::debug!(device = %id, %category, "device gone before poll result arrived");
                WriteBack::Gone
            }
            Err(error) => {
                tracing::warn!(device = %id, %category, %error, "could not store poll result");
                WriteBack::Gone
            }
        }
    }

    fn reject(&self, category: PollCategory, id: DeviceId, value: i64) -> WriteBack {
        tracing::warn!(device = %id, %category, value, "poll result out of range");
        WriteBack::Rejected
    }

    fn apply_block(&self, source: BlockSource, reason: String) {
        tracing::info!(%reason, "polling blocked");
        *self.inner.block.lock() = Some(Block { source, reason });
        self.disarm();
    }
}

enum WriteBack {
    Updated,
    Rejected,
    Gone,
}

impl Drop for PollingInner {
    fn drop(&mut self) {
        for (_, timer) in self.timers.get_mut().drain() {
            timer.abort();
        }
        if let Some(listener) = self.listener.get_mut().take() {
            self.store.unsubscribe(listener);
        }
    }
}

impl fmt::Debug for PollingManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingManager")
            .field("running", &self.is_running())
            .field("block", &self.block_source())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkError;
    use async_trait::async_trait;
    use device_store::DeviceState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FixedPoller {
        value: Result<Option<i64>, LinkError>,
        calls: AtomicUsize,
    }

    impl FixedPoller {
        fn returning(value: Result<Option<i64>, LinkError>) -> Arc<Self> {
            Arc::new(Self {
                value,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TelemetryPoller for FixedPoller {
        async fn poll(&self, _device: DeviceId) -> Result<Option<i64>, LinkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.value.clone()
        }
    }

    fn store_with_states(states: &[DeviceState]) -> DeviceStore {
        let store = DeviceStore::default();
        for (index, state) in states.iter().enumerate() {
            let id = DeviceId::ALL[index];
            store
                .register_device(&format!("AA:0{index}"), &format!("KneeLink-{}", id.short_label()))
                .unwrap();
            let path: &[DeviceState] = match state {
                DeviceState::Disconnected => &[],
                DeviceState::Connected => &[DeviceState::Connecting, DeviceState::Connected],
                DeviceState::Synced => &[
                    DeviceState::Connecting,
                    DeviceState::Connected,
                    DeviceState::Syncing,
                    DeviceState::Synced,
                ],
                DeviceState::Streaming => &[
                    DeviceState::Connecting,
                    DeviceState::Connected,
                    DeviceState::Streaming,
                ],
                other => panic!("unsupported fixture state {other}"),
            };
            for next in path {
                store.transition(id, *next, None).unwrap();
            }
        }
        store
    }

    #[tokio::test]
    async fn test_cycle_polls_only_pollable_devices() {
        let store = store_with_states(&[
            DeviceState::Connected,
            DeviceState::Synced,
            DeviceState::Streaming,
            DeviceState::Disconnected,
        ]);
        let poller = FixedPoller::returning(Ok(Some(72)));
        let manager = PollingManager::new(store.clone(), PollingConfig::default())
            .with_poller(PollCategory::Battery, poller.clone());

        let report = manager.poll_now(PollCategory::Battery).await;
        assert_eq!(report.polled, 2);
        assert_eq!(report.updated, 2);
        assert_eq!(poller.calls(), 2);

        assert_eq!(store.device(DeviceId::LeftShin).unwrap().battery_level, Some(72));
        assert_eq!(store.device(DeviceId::RightShin).unwrap().battery_level, Some(72));
        assert_eq!(store.device(DeviceId::LeftThigh).unwrap().battery_level, None);
    }

    #[tokio::test]
    async fn test_failures_and_empty_results_write_nothing() {
        let store = store_with_states(&[DeviceState::Connected]);
        let failing = FixedPoller::returning(Err(LinkError::Timeout));
        let empty = FixedPoller::returning(Ok(None));
        let manager = PollingManager::new(store.clone(), PollingConfig::default())
            .with_poller(PollCategory::Signal, failing)
            .with_poller(PollCategory::Firmware, empty);

        assert_eq!(manager.poll_now(PollCategory::Signal).await.failed, 1);
        assert_eq!(manager.poll_now(PollCategory::Firmware).await.empty, 1);
        let record = store.device(DeviceId::LeftShin).unwrap();
        assert_eq!(record.signal_strength, None);
        assert_eq!(record.firmware_status, None);
    }

    #[tokio::test]
    async fn test_out_of_range_values_are_rejected() {
        let store = store_with_states(&[DeviceState::Connected]);
        let manager = PollingManager::new(store.clone(), PollingConfig::default())
            .with_poller(PollCategory::Battery, FixedPoller::returning(Ok(Some(140))))
            .with_poller(PollCategory::Signal, FixedPoller::returning(Ok(Some(-64))));

        assert_eq!(manager.poll_now(PollCategory::Battery).await.rejected, 1);
        assert_eq!(manager.poll_now(PollCategory::Signal).await.updated, 1);

        let record = store.device(DeviceId::LeftShin).unwrap();
        assert_eq!(record.battery_level, None);
        assert_eq!(record.signal_strength, Some(-64));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_polls_immediately_then_at_interval() {
        let store = store_with_states(&[DeviceState::Connected]);
        let poller = FixedPoller::returning(Ok(Some(-70)));
        let manager = PollingManager::new(store, PollingConfig::default())
            .with_poller(PollCategory::Signal, poller.clone());

        manager.start();
        assert!(manager.is_running());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(poller.calls(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(poller.calls(), 2);

        manager.stop();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(poller.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_state_blocks_and_unblocks() {
        let store = store_with_states(&[DeviceState::Connected]);
        let manager = PollingManager::new(store.clone(), PollingConfig::default())
            .with_poller(PollCategory::Battery, FixedPoller::returning(Ok(Some(50))));
        manager.follow_global_state();
        manager.start();

        store.set_global_state(GlobalState::Streaming);
        assert!(manager.is_blocked());
        assert!(!manager.is_running());
        assert_eq!(
            manager.block_source(),
            Some(BlockSource::GlobalState(GlobalState::Streaming))
        );

        store.set_global_state(GlobalState::Idle);
        assert!(!manager.is_blocked());
        assert!(manager.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_block_survives_global_idle() {
        let store = store_with_states(&[DeviceState::Connected]);
        let manager = PollingManager::new(store.clone(), PollingConfig::default())
            .with_poller(PollCategory::Battery, FixedPoller::returning(Ok(Some(50))));
        manager.follow_global_state();
        manager.start();

        manager.block("firmware update");
        manager.block("firmware update");
        store.set_global_state(GlobalState::Streaming);
        store.set_global_state(GlobalState::Idle);

        assert!(manager.is_blocked());
        assert_eq!(manager.block_source(), Some(BlockSource::Manual));
        assert_eq!(manager.block_reason().as_deref(), Some("firmware update"));

        manager.unblock();
        assert!(!manager.is_blocked());
        assert!(manager.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_idle_does_not_restart_stopped_polling() {
        let store = store_with_states(&[DeviceState::Connected]);
        let poller = FixedPoller::returning(Ok(Some(50)));
        let manager = PollingManager::new(store.clone(), PollingConfig::default())
            .with_poller(PollCategory::Battery, poller.clone());
        manager.follow_global_state();

        // never started
        store.set_global_state(GlobalState::Streaming);
        store.set_global_state(GlobalState::Idle);
        assert!(!manager.is_running());

        manager.start();
        manager.stop();
        store.set_global_state(GlobalState::Syncing);
        store.set_global_state(GlobalState::Idle);
        assert!(!manager.is_running());

        let before = poller.calls();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(poller.calls(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_blocked_resumes_on_unblock() {
        let store = store_with_states(&[DeviceState::Connected]);
        let manager = PollingManager::new(store.clone(), PollingConfig::default())
            .with_poller(PollCategory::Battery, FixedPoller::returning(Ok(Some(50))));
        manager.follow_global_state();

        store.set_global_state(GlobalState::Locating);
        manager.start();
        assert!(!manager.is_running());

        store.set_global_state(GlobalState::Idle);
        assert!(manager.is_running());

        manager.unfollow_global_state();
        store.set_global_state(GlobalState::Streaming);
        assert!(!manager.is_blocked());
        assert!(manager.is_running());
    }

    #[tokio::test]
    async fn test_unregistered_category_is_a_noop() {
        let store = store_with_states(&[DeviceState::Connected]);
        let manager = PollingManager::new(store, PollingConfig::default());
        assert_eq!(manager.poll_now(PollCategory::Firmware).await, CycleReport::default());
    }
}

//! Liveness monitoring for linked devices.
//!
//! The Watchdog sweeps the store at a fixed period and looks at how long each
//! linked device has been silent. Two independent checks run per device:
//!
//! - **Stall**: a `streaming` device silent past the stall threshold gets a
//!   lightweight in-place streaming restart, rate limited and capped.
//! - **Hard timeout**: any linked device silent past the hard timeout is
//!   checked against the radio. A link that is still up is a benign gap and
//!   only refreshes last-seen; otherwise the device is handed to the
//!   ReconnectionManager.
//!
//! Recovery counters are reset whenever the device changes state.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use device_store::{DeviceId, DeviceRecord, DeviceState, DeviceStore, DisconnectReason, ListenerId};

use crate::config::WatchdogConfig;
use crate::link::{LinkProbe, StreamControl};
use crate::reconnect::ReconnectionManager;

/// Stall recovery bookkeeping for one device.
#[derive(Debug, Clone, Default)]
struct StallRecovery {
    attempts: u32,
    last_attempt: Option<Instant>,
    /// Last successful in-place restart; silence is measured from here too
    resumed_at: Option<Instant>,
}

/// Counters describing what the watchdog has done since it was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchdogStats {
    pub sweeps: u64,
    pub stall_recoveries: u64,
    pub stall_recovery_failures: u64,
    pub benign_gaps: u64,
    pub timeouts: u64,
}

impl fmt::Display for WatchdogStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Watchdog Stats:")?;
        writeln!(f, "  Sweeps: {}", self.sweeps)?;
        writeln!(
            f,
            "  Stall recoveries: {} ({} failed)",
            self.stall_recoveries, self.stall_recovery_failures
        )?;
        writeln!(f, "  Benign gaps: {}", self.benign_gaps)?;
        write!(f, "  Timeouts: {}", self.timeouts)
    }
}

struct WatchdogInner {
    store: DeviceStore,
    reconnect: ReconnectionManager,
    streaming: Option<Arc<dyn StreamControl>>,
    probe: Option<Arc<dyn LinkProbe>>,
    config: WatchdogConfig,
    recovery: Mutex<HashMap<DeviceId, StallRecovery>>,
    task: Mutex<Option<JoinHandle<()>>>,
    listener: Mutex<Option<ListenerId>>,
    stats: Mutex<WatchdogStats>,
}

/// Periodic health monitor for linked devices.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<WatchdogInner>,
}

impl Watchdog {
    pub fn new(store: DeviceStore, reconnect: ReconnectionManager, config: WatchdogConfig) -> Self {
        Self::with_collaborators(store, reconnect, None, None, config)
    }

    /// Create a watchdog with optional streaming control (for stall
    /// recovery) and link probe (for the benign-gap check).
    pub fn with_collaborators(
        store: DeviceStore,
        reconnect: ReconnectionManager,
        streaming: Option<Arc<dyn StreamControl>>,
        probe: Option<Arc<dyn LinkProbe>>,
        config: WatchdogConfig,
    ) -> Self {
        Self {
            inner: Arc::new(WatchdogInner {
                store,
                reconnect,
                streaming,
                probe,
                config,
                recovery: Mutex::new(HashMap::new()),
                task: Mutex::new(None),
                listener: Mutex::new(None),
                stats: Mutex::new(WatchdogStats::default()),
            }),
        }
    }

    /// Start sweeping. The first sweep runs one interval from now. Calling
    /// `start` on a running watchdog does nothing.
    pub fn start(&self) {
        let mut task = self.inner.task.lock();
        if task.is_some() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let listener = self.inner.store.subscribe(move |event| {
            let (Some(id), Some(_)) = (event.device, event.new_device_state()) else {
                return;
            };
            if let Some(inner) = weak.upgrade() {
                inner.recovery.lock().remove(&id);
            }
        });
        *self.inner.listener.lock() = Some(listener);

        let period = self.inner.config.sweep_interval;
        let weak: Weak<WatchdogInner> = Arc::downgrade(&self.inner);
        *task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Watchdog { inner }.sweep().await;
            }
        }));

        tracing::info!(interval_ms = period.as_millis() as u64, "watchdog started");
    }

    /// Stop sweeping and forget all recovery bookkeeping.
    pub fn stop(&self) {
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
            tracing::info!("watchdog stopped");
        }
        if let Some(listener) = self.inner.listener.lock().take() {
            self.inner.store.unsubscribe(listener);
        }
        self.inner.recovery.lock().clear();
    }

    pub fn is_running(&self) -> bool {
        self.inner.task.lock().is_some()
    }

    pub fn stats(&self) -> WatchdogStats {
        *self.inner.stats.lock()
    }

    /// Stall recoveries attempted for a device since its last state change.
    pub fn stall_attempts(&self, id: DeviceId) -> u32 {
        self.inner.recovery.lock().get(&id).map_or(0, |r| r.attempts)
    }

    /// Run one health sweep now.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let devices: Vec<DeviceRecord> = self
            .inner
            .store
            .devices()
            .into_iter()
            .filter(|d| d.state.is_link_up())
            .collect();

        let monitored: HashSet<DeviceId> = devices.iter().map(|d| d.id).collect();
        self.inner
            .recovery
            .lock()
            .retain(|id, _| monitored.contains(id));

        join_all(devices.into_iter().map(|record| self.check_device(record, now))).await;
        self.inner.stats.lock().sweeps += 1;
    }

    async fn check_device(&self, record: DeviceRecord, now: Instant) {
        let Some(silence) = record.silent_for(now) else {
            return;
        };

        if record.state == DeviceState::Streaming {
            self.check_stall(&record, now).await;
        }
        if silence > self.inner.config.hard_timeout {
            self.handle_timeout(&record, silence).await;
        }
    }

    async fn check_stall(&self, record: &DeviceRecord, now: Instant) {
        let Some(streaming) = &self.inner.streaming else {
            return;
        };
        let config = &self.inner.config;
        let id = record.id;

        let attempt = {
            let mut recovery = self.inner.recovery.lock();
            let entry = recovery.entry(id).or_default();

            let quiet_since = match (record.last_seen, entry.resumed_at) {
                (Some(seen), Some(resumed)) => seen.max(resumed),
                (seen, resumed) => match seen.or(resumed) {
                    Some(since) => since,
                    None => return,
                },
            };
            let stalled = now.saturating_duration_since(quiet_since) > config.stall_threshold;
            let spaced = entry
                .last_attempt
                .map_or(true, |last| now.saturating_duration_since(last) >= config.stall_retry_spacing);

            if !stalled || !spaced || entry.attempts >= config.max_stall_attempts {
                return;
            }
            entry.attempts += 1;
            entry.last_attempt = Some(now);
            entry.attempts
        };

        self.inner.stats.lock().stall_recoveries += 1;
        tracing::info!(device = %id, attempt, "streaming stalled, restarting in place");

        let outcome = streaming.resume_streaming(id, &record.address).await;
        match outcome {
            Ok(true) => {
                if let Some(entry) = self.inner.recovery.lock().get_mut(&id) {
                    entry.attempts = 0;
                    entry.resumed_at = Some(Instant::now());
                }
                tracing::debug!(device = %id, "streaming restarted");
            }
            Ok(false) => {
                self.inner.stats.lock().stall_recovery_failures += 1;
                tracing::debug!(device = %id, attempt, "device declined streaming restart");
            }
            Err(error) => {
                self.inner.stats.lock().stall_recovery_failures += 1;
                tracing::warn!(device = %id, attempt, %error, "streaming restart failed");
            }
        }
    }

    async fn handle_timeout(&self, record: &DeviceRecord, silence: std::time::Duration) {
        let id = record.id;
        let store = &self.inner.store;

        let still_connected = match &self.inner.probe {
            Some(probe) => probe.is_connected(&record.address).await,
            None => false,
        };

        // the device may have moved on while the probe was in flight
        match store.device(id) {
            Some(current) if current.address == record.address && current.state.is_link_up() => {}
            _ => return,
        }

        if still_connected {
            self.inner.stats.lock().benign_gaps += 1;
            tracing::debug!(device = %id, silent_ms = silence.as_millis() as u64, "link still up, data gap only");
            if let Err(error) = store.touch(id) {
                tracing::debug!(device = %id, %error, "could not refresh last-seen");
            }
            return;
        }

        self.inner.stats.lock().timeouts += 1;
        tracing::warn!(device = %id, silent_ms = silence.as_millis() as u64, "device timed out");
        self.inner.recovery.lock().remove(&id);

        if let Err(error) = store.notify_disconnect(id) {
            tracing::debug!(device = %id, %error, "could not notify streaming hook");
        }
        if let Err(error) = self
            .inner
            .reconnect
            .schedule_reconnect(id, DisconnectReason::WatchdogTimeout)
        {
            tracing::warn!(device = %id, %error, "could not schedule reconnection");
        }
    }
}

impl Drop for WatchdogInner {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
        if let Some(listener) = self.listener.get_mut().take() {
            self.store.unsubscribe(listener);
        }
    }
}

impl fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watchdog")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .finish()
    }
}

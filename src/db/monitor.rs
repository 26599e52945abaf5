//! Periodic leak detection.
//!
//! The monitor logs the tracker counters on every tick. When more connections
//! are live than the configured threshold it assumes they leaked and
//! force-detaches all of them. [`LeakMonitor::shutdown`] stops the ticker and
//! sweeps whatever is still live; it only does so once.
//!
//! The ticker task holds a `Weak` reference, so dropping the last `Arc` of the
//! monitor ends the task as well.

use crate::config::MonitorSettings;
use crate::db::handle::ConnectionHandle;
use crate::db::tracker::ResourceTracker;
use chrono::Utc;
use futures_util::FutureExt;
use futures_util::future::join_all;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// Background leak monitor bound to one tracker.
pub struct LeakMonitor {
    tracker: Arc<ResourceTracker>,
    settings: MonitorSettings,
    /// Synchronous storage so `Drop` can abort the task.
    task: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl LeakMonitor {
    /// Create a monitor without starting the ticker.
    pub fn new(tracker: Arc<ResourceTracker>, settings: MonitorSettings) -> Arc<Self> {
        Arc::new(Self {
            tracker,
            settings,
            task: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Create a monitor and start ticking every `settings.interval`.
    pub fn start(tracker: Arc<ResourceTracker>, settings: MonitorSettings) -> Arc<Self> {
        let monitor = Self::new(tracker, settings);
        monitor.spawn_ticker();
        monitor
    }

    fn spawn_ticker(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.settings.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else {
                    break;
                };
                monitor.tick().await;
            }
            debug!("Leak monitor task stopped");
        });

        info!(
            interval_secs = period.as_secs(),
            leak_threshold = self.settings.leak_threshold,
            "Started leak monitor"
        );
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Log the counters and sweep when above the leak threshold.
    ///
    /// Returns the number of connections force-detached.
    pub async fn tick(&self) -> usize {
        let snapshot = self.tracker.snapshot();
        info!(
            active = snapshot.active,
            total = snapshot.total,
            peak = snapshot.peak,
            errors = snapshot.errors,
            "Connection stats"
        );

        if snapshot.active <= self.settings.leak_threshold {
            return 0;
        }

        warn!(
            active = snapshot.active,
            leak_threshold = self.settings.leak_threshold,
            "Possible connection leak, force-detaching live connections"
        );
        self.sweep().await
    }

    /// Force-detach every live connection. Returns how many were swept.
    ///
    /// A connection in the middle of a statement is detached once that
    /// statement returns.
    pub async fn sweep(&self) -> usize {
        let handles = self.tracker.handles();
        if handles.is_empty() {
            return 0;
        }

        let count = handles.len();
        join_all(handles.into_iter().map(|handle| self.force_detach(handle))).await;
        info!(count, "Force-detached live connections");
        count
    }

    async fn force_detach(&self, handle: ConnectionHandle) {
        let age_secs = (Utc::now() - handle.opened_at()).num_seconds();
        match AssertUnwindSafe(handle.detach()).catch_unwind().await {
            Ok(Ok(())) => {
                debug!(connection_id = %handle.id(), age_secs, "Force-detached connection");
            }
            Ok(Err(e)) => {
                warn!(connection_id = %handle.id(), error = %e, "Force-detach failed");
                self.tracker.record_error();
            }
            Err(_) => {
                warn!(connection_id = %handle.id(), "Force-detach panicked");
                self.tracker.record_error();
                self.tracker.deregister(handle.id());
            }
        }
    }

    /// Stop the ticker and sweep all live connections.
    ///
    /// Only the first call does anything; later calls return `None`.
    pub async fn shutdown(&self) -> Option<usize> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return None;
        }

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }

        let swept = self.sweep().await;
        info!(swept, stats = %self.tracker.snapshot(), "Leak monitor shut down");
        Some(swept)
    }
}

impl Drop for LeakMonitor {
    fn drop(&mut self) {
        let task = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

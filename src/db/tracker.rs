//! Live connection registry and lifetime counters.
//!
//! The tracker is shared by every executor in the process. Connections are
//! registered when opened and deregistered by their own detach listener, so an
//! entry disappears no matter who detaches the connection (the releaser, the
//! leak monitor, or a driver-level close).
//!
//! Counters are atomics. `active` is only written while the registry lock is
//! held, so it always equals the registry size at some instant, and
//! [`ResourceTracker::snapshot`] never takes the lock.

use crate::db::handle::{ConnectionHandle, ConnectionId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Point-in-time view of the tracker counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TrackerSnapshot {
    /// Connections currently registered.
    pub active: usize,
    /// Connections ever registered.
    pub total: u64,
    /// Highest `active` value observed.
    pub peak: usize,
    /// Release and sweep failures.
    pub errors: u64,
}

impl std::fmt::Display for TrackerSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "active={} total={} peak={} errors={}",
            self.active, self.total, self.peak, self.errors
        )
    }
}

/// Registry of live connections.
#[derive(Default)]
pub struct ResourceTracker {
    live: Mutex<HashMap<ConnectionId, ConnectionHandle>>,
    active: AtomicUsize,
    total: AtomicU64,
    peak: AtomicUsize,
    errors: AtomicU64,
}

impl ResourceTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark a connection as live.
    ///
    /// Registering the same connection twice is ignored. The entry is removed
    /// when the connection detaches.
    pub fn register(self: &Arc<Self>, handle: &ConnectionHandle) {
        {
            let mut live = self.live();
            if live.contains_key(handle.id()) {
                return;
            }
            live.insert(handle.id().clone(), handle.clone());
            let active = live.len();
            self.active.store(active, Ordering::SeqCst);
            self.total.fetch_add(1, Ordering::SeqCst);
            self.peak.fetch_max(active, Ordering::SeqCst);
        }
        debug!(connection_id = %handle.id(), "Registered connection");

        // Registered outside the lock: fires immediately for a detached handle
        let tracker = Arc::downgrade(self);
        handle.on_detach(move |id| {
            if let Some(tracker) = tracker.upgrade() {
                tracker.deregister(id);
            }
        });
    }

    /// Remove a connection from the registry. Returns whether it was present.
    pub fn deregister(&self, id: &ConnectionId) -> bool {
        let mut live = self.live();
        let removed = live.remove(id).is_some();
        if removed {
            self.active.store(live.len(), Ordering::SeqCst);
            debug!(connection_id = %id, "Deregistered connection");
        }
        removed
    }

    /// Count one failed release or sweep step.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            active: self.active.load(Ordering::SeqCst),
            total: self.total.load(Ordering::SeqCst),
            peak: self.peak.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
        }
    }

    /// Handles of every live connection.
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.live().values().cloned().collect()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.live().contains_key(id)
    }

    fn live(&self) -> MutexGuard<'_, HashMap<ConnectionId, ConnectionHandle>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

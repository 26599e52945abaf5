//! Best-effort cleanup of one operation's resources.
//!
//! Rollback runs before detach, each step independently: a failure or panic
//! in one step is logged and counted, and the next step still runs. Release
//! never fails its caller.

use crate::db::handle::{ConnectionHandle, TransactionHandle};
use crate::db::tracker::ResourceTracker;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

/// Releases connections and transactions, recording failures on the tracker.
#[derive(Clone)]
pub struct ResourceReleaser {
    tracker: Arc<ResourceTracker>,
}

impl ResourceReleaser {
    pub fn new(tracker: Arc<ResourceTracker>) -> Self {
        Self { tracker }
    }

    /// Roll back `transaction`, then detach `connection`.
    ///
    /// Either may be absent. Rolling back a committed transaction and
    /// detaching a detached connection are no-ops.
    pub async fn release(
        &self,
        connection: Option<ConnectionHandle>,
        transaction: Option<TransactionHandle>,
    ) {
        if let Some(mut transaction) = transaction {
            let connection_id = transaction.connection_id().clone();
            match AssertUnwindSafe(transaction.rollback()).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        connection_id = %connection_id,
                        error = %e,
                        "Transaction rollback failed"
                    );
                    self.tracker.record_error();
                }
                Err(_) => {
                    warn!(connection_id = %connection_id, "Transaction rollback panicked");
                    self.tracker.record_error();
                }
            }
        }

        if let Some(connection) = connection {
            match AssertUnwindSafe(connection.detach()).catch_unwind().await {
                Ok(Ok(())) => {
                    debug!(connection_id = %connection.id(), "Released connection");
                }
                Ok(Err(e)) => {
                    warn!(connection_id = %connection.id(), error = %e, "Connection detach failed");
                    self.tracker.record_error();
                }
                Err(_) => {
                    warn!(connection_id = %connection.id(), "Connection detach panicked");
                    self.tracker.record_error();
                    // Listeners never ran
                    self.tracker.deregister(connection.id());
                }
            }
        }
    }
}

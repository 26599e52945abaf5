//! Driver abstraction.
//!
//! The executor never talks to a database client directly. It opens sessions
//! through a [`Driver`] and drives each session through [`DriverConnection`],
//! which keeps the lifecycle logic independent of the wire protocol in use.

use crate::error::DriverError;
use crate::models::{IsolationLevel, QueryParam, Row};
use async_trait::async_trait;

/// Opens new database sessions.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Open and authenticate one new session. No reuse between calls.
    async fn connect(&self) -> Result<Box<dyn DriverConnection>, DriverError>;

    /// Name of the backend for logging.
    fn name(&self) -> &'static str;
}

/// One open database session.
///
/// At most one transaction is open on a session at a time.
#[async_trait]
pub trait DriverConnection: Send {
    /// Start a transaction at the given isolation level.
    async fn begin(&mut self, isolation: IsolationLevel) -> Result<(), DriverError>;

    /// Run one statement with positional parameters inside the open transaction.
    async fn query(&mut self, statement: &str, params: &[QueryParam])
    -> Result<Vec<Row>, DriverError>;

    /// Commit the open transaction.
    async fn commit(&mut self) -> Result<(), DriverError>;

    /// Roll back the open transaction.
    async fn rollback(&mut self) -> Result<(), DriverError>;

    /// Terminate the session.
    async fn close(self: Box<Self>) -> Result<(), DriverError>;
}

//! Database resource management.
//!
//! This module provides the connection lifecycle machinery:
//! - Driver abstraction and the sqlx-backed driver
//! - Connection and transaction handles
//! - Live connection tracking and lifetime counters
//! - Best-effort resource release
//! - Query execution with scoped connections and bounded retry
//! - Periodic leak detection
//! - Parameter binding and row decoding

pub mod driver;
pub mod executor;
pub mod handle;
pub mod monitor;
pub mod params;
pub mod releaser;
pub mod sqlx_driver;
pub mod tracker;
pub mod types;

pub use driver::{Driver, DriverConnection};
pub use executor::QueryExecutor;
pub use handle::{ConnectionHandle, ConnectionId, TransactionHandle, TransactionState};
pub use monitor::LeakMonitor;
pub use releaser::ResourceReleaser;
pub use sqlx_driver::{SqlxConnection, SqlxDriver};
pub use tracker::{ResourceTracker, TrackerSnapshot};

//! txscope library
//!
//! Runs one SQL statement per call, each inside its own connection and
//! READ COMMITTED transaction, and guarantees that every connection it opens
//! is rolled back and closed afterwards. A process-wide tracker counts live
//! connections, and a background monitor force-closes them when too many
//! stay open.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::Config;
pub use db::{LeakMonitor, QueryExecutor, ResourceTracker};
pub use error::{DbError, DbResult};

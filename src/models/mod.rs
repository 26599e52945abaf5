//! Data models for txscope.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{DatabaseType, IsolationLevel};
pub use query::{QueryParam, Row, StatementContext};

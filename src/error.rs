//! Error types for txscope.
//!
//! Two layers of errors exist:
//! - [`DriverError`]: a raw failure reported by the database driver, carrying the
//!   driver's error code when one is available.
//! - [`DbError`]: the taxonomy callers see. The query executor is the only place
//!   that turns a `DriverError` into a `DbError`, attaching the statement and
//!   parameters that were being run.

use crate::models::StatementContext;
use thiserror::Error;

/// A failure reported by the database driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DriverError {
    /// Driver-specific error code (SQLSTATE, vendor code), if any.
    pub code: Option<String>,
    pub message: String,
}

impl DriverError {
    /// Create a driver error without an error code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Create a driver error with an error code.
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Error used when an operation reaches a connection that has been detached.
    pub fn detached() -> Self {
        Self::new("Connection has already been detached")
    }

    /// Check whether this error carries the given code.
    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }
}

/// Convert sqlx errors to DriverError.
impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => {
                DriverError::new(format!("Invalid connection configuration: {}", msg))
            }
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DriverError {
                    code,
                    message: db_err.message().to_string(),
                }
            }
            sqlx::Error::RowNotFound => DriverError::new("No rows returned"),
            sqlx::Error::PoolTimedOut => DriverError::new("Timed out acquiring a connection"),
            sqlx::Error::PoolClosed => DriverError::new("Connection source is closed"),
            sqlx::Error::Io(io_err) => DriverError::new(format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => DriverError::new(format!("TLS error: {}", tls_err)),
            sqlx::Error::Protocol(msg) => DriverError::new(format!("Protocol error: {}", msg)),
            sqlx::Error::TypeNotFound { type_name } => {
                DriverError::new(format!("Type not found: {}", type_name))
            }
            sqlx::Error::ColumnNotFound(col) => {
                DriverError::new(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DriverError::new(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DriverError::new(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DriverError::new(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DriverError::new("Database worker crashed"),
            _ => DriverError::new(format!("Unknown database error: {}", err)),
        }
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Connection failed: {message} ({context})")]
    Connection {
        message: String,
        code: Option<String>,
        context: StatementContext,
    },

    #[error("Authentication failed after {attempts} attempt(s): {message} ({context})")]
    AuthTransient {
        message: String,
        code: String,
        attempts: u32,
        context: StatementContext,
    },

    #[error("Transaction error: {message} ({context})")]
    Transaction {
        message: String,
        code: Option<String>,
        context: StatementContext,
    },

    #[error("Statement failed: {message} ({context})")]
    Statement {
        message: String,
        /// e.g., "23505" for a unique violation on PostgreSQL
        sql_state: Option<String>,
        context: StatementContext,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s ({context})")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
        context: StatementContext,
    },
}

impl DbError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a connection error from a driver failure.
    pub fn connection(err: DriverError, context: StatementContext) -> Self {
        Self::Connection {
            message: err.message,
            code: err.code,
            context,
        }
    }

    /// Create an exhausted auth-transient error.
    pub fn auth_transient(
        message: impl Into<String>,
        code: impl Into<String>,
        attempts: u32,
        context: StatementContext,
    ) -> Self {
        Self::AuthTransient {
            message: message.into(),
            code: code.into(),
            attempts,
            context,
        }
    }

    /// Create a transaction error from a driver failure.
    pub fn transaction(err: DriverError, context: StatementContext) -> Self {
        Self::Transaction {
            message: err.message,
            code: err.code,
            context,
        }
    }

    /// Create a statement error from a driver failure.
    pub fn statement(err: DriverError, context: StatementContext) -> Self {
        Self::Statement {
            message: err.message,
            sql_state: err.code,
            context,
        }
    }

    /// Create a timeout error.
    pub fn timeout(
        operation: impl Into<String>,
        elapsed_secs: u64,
        context: StatementContext,
    ) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
            context,
        }
    }

    /// The statement and parameters the failing operation was running.
    pub fn context(&self) -> Option<&StatementContext> {
        match self {
            Self::Configuration { .. } => None,
            Self::Connection { context, .. }
            | Self::AuthTransient { context, .. }
            | Self::Transaction { context, .. }
            | Self::Statement { context, .. }
            | Self::Timeout { context, .. } => Some(context),
        }
    }

    /// The driver error code, if one was reported.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Connection { code, .. } | Self::Transaction { code, .. } => code.as_deref(),
            Self::Statement { sql_state, .. } => sql_state.as_deref(),
            Self::AuthTransient { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Get a hint for resolving this error.
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => {
                "Set the missing DATABASE_* environment variables or command line flags"
            }
            Self::Connection { .. } => "Check network connectivity and database server status",
            Self::AuthTransient { .. } => "Verify the database credentials and server auth state",
            Self::Transaction { .. } => "Check the transaction state and server logs",
            Self::Statement { .. } => "Check the SQL syntax, referenced objects and constraints",
            Self::Timeout { .. } => "Consider increasing the timeout or optimizing the statement",
        }
    }

    /// Check if this error class is eligible for automatic retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AuthTransient { .. })
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

//! Configuration handling for txscope.
//!
//! This module provides configuration management via CLI arguments and environment variables.
//! [`Config`] is the raw parsed input; [`Config::settings`] validates it once at startup and
//! resolves it into the fixed settings the executor and the leak monitor run with.

use crate::error::{DbError, DbResult, DriverError};
use crate::models::{DatabaseType, IsolationLevel, QueryParam};
use clap::Parser;
use std::time::Duration;

pub const DEFAULT_PAGE_SIZE: u32 = 4096;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2000;
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_LEAK_THRESHOLD: usize = 5;
pub const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 30;

/// Configuration for txscope.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "txscope",
    about = "Runs statements with a connection and transaction scoped to each operation",
    version,
    author
)]
pub struct Config {
    /// Database backend (postgres, mysql or sqlite)
    #[arg(long, value_enum, default_value = "postgres", env = "DATABASE_BACKEND")]
    pub backend: DatabaseType,

    /// Database server host (not used by sqlite)
    #[arg(long, env = "DATABASE_HOST")]
    pub host: Option<String>,

    /// Database server port (default: backend's standard port)
    #[arg(long, env = "DATABASE_PORT")]
    pub port: Option<u16>,

    /// Database name, or file path for sqlite
    #[arg(long = "database", env = "DATABASE_NAME")]
    pub database: Option<String>,

    /// Database user (not used by sqlite)
    #[arg(long, env = "DATABASE_USER")]
    pub user: Option<String>,

    /// Database password (not used by sqlite)
    #[arg(long, env = "DATABASE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Page size for newly created sqlite database files
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE, env = "DATABASE_PAGE_SIZE")]
    pub page_size: u32,

    /// Maximum retries after a transient authentication failure
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES, env = "DATABASE_MAX_RETRIES")]
    pub max_retries: u32,

    /// Delay between retries in milliseconds
    #[arg(long, default_value_t = DEFAULT_RETRY_DELAY_MS, env = "DATABASE_RETRY_DELAY_MS")]
    pub retry_delay_ms: u64,

    /// Driver error code treated as a transient authentication failure
    /// (default: backend-specific login failure code)
    #[arg(long, env = "DATABASE_AUTH_RETRY_CODE")]
    pub auth_retry_code: Option<String>,

    /// Deadline for one attempt (connect through commit) in seconds
    #[arg(long, default_value_t = DEFAULT_QUERY_TIMEOUT_SECS, env = "DATABASE_QUERY_TIMEOUT")]
    pub query_timeout: u64,

    /// Live connection count above which the monitor force-detaches connections
    #[arg(long, default_value_t = DEFAULT_LEAK_THRESHOLD, env = "DATABASE_LEAK_THRESHOLD")]
    pub leak_threshold: usize,

    /// Leak monitor interval in seconds
    #[arg(long, default_value_t = DEFAULT_MONITOR_INTERVAL_SECS, env = "DATABASE_MONITOR_INTERVAL")]
    pub monitor_interval: u64,

    /// Run one statement, print the rows as JSON and exit
    #[arg(short = 'e', long = "execute", value_name = "SQL")]
    pub execute: Option<String>,

    /// Positional parameter for --execute, as a JSON value. Repeat for each parameter.
    #[arg(short = 'p', long = "param", value_name = "JSON", requires = "execute")]
    pub params: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "TXSCOPE_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "TXSCOPE_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Create a configuration with defaults and no connection settings (useful for testing).
    pub fn default_config() -> Self {
        Self {
            backend: DatabaseType::PostgreSQL,
            host: None,
            port: None,
            database: None,
            user: None,
            password: None,
            page_size: DEFAULT_PAGE_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            auth_retry_code: None,
            query_timeout: DEFAULT_QUERY_TIMEOUT_SECS,
            leak_threshold: DEFAULT_LEAK_THRESHOLD,
            monitor_interval: DEFAULT_MONITOR_INTERVAL_SECS,
            execute: None,
            params: Vec::new(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }

    /// Validate and resolve all settings.
    ///
    /// Every missing required value is reported in a single error.
    pub fn settings(&self) -> DbResult<Settings> {
        Ok(Settings {
            database: self.database_settings()?,
            executor: self.executor_settings()?,
            monitor: self.monitor_settings()?,
        })
    }

    fn database_settings(&self) -> DbResult<DatabaseSettings> {
        let networked = self.backend.is_networked();
        let required: [(&str, &Option<String>, bool); 4] = [
            ("DATABASE_HOST", &self.host, networked),
            ("DATABASE_NAME", &self.database, true),
            ("DATABASE_USER", &self.user, networked),
            ("DATABASE_PASSWORD", &self.password, networked),
        ];

        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value, needed)| {
                *needed && value.as_deref().is_none_or(|v| v.trim().is_empty())
            })
            .map(|(var, _, _)| *var)
            .collect();

        if !missing.is_empty() {
            return Err(DbError::configuration(format!(
                "missing required settings: {}",
                missing.join(", ")
            )));
        }

        if self.backend == DatabaseType::SQLite
            && (!(512..=65536).contains(&self.page_size) || !self.page_size.is_power_of_two())
        {
            return Err(DbError::configuration(format!(
                "page size must be a power of two between 512 and 65536, got {}",
                self.page_size
            )));
        }

        Ok(DatabaseSettings {
            backend: self.backend,
            host: self.host.clone().unwrap_or_default(),
            port: self
                .port
                .or_else(|| self.backend.default_port())
                .unwrap_or_default(),
            database: self.database.clone().unwrap_or_default(),
            user: self.user.clone().unwrap_or_default(),
            password: self.password.clone().unwrap_or_default(),
            page_size: self.page_size,
        })
    }

    fn executor_settings(&self) -> DbResult<ExecutorSettings> {
        if self.query_timeout == 0 {
            return Err(DbError::configuration("query timeout must be greater than 0"));
        }

        let auth_error_code = self
            .auth_retry_code
            .clone()
            .unwrap_or_else(|| self.backend.default_auth_retry_code().to_string());

        Ok(ExecutorSettings {
            isolation: IsolationLevel::ReadCommitted,
            query_timeout: Duration::from_secs(self.query_timeout),
            retry: RetryPolicy {
                auth_error_code,
                max_retries: self.max_retries,
                retry_delay: Duration::from_millis(self.retry_delay_ms),
            },
        })
    }

    fn monitor_settings(&self) -> DbResult<MonitorSettings> {
        if self.monitor_interval == 0 {
            return Err(DbError::configuration(
                "monitor interval must be greater than 0",
            ));
        }
        Ok(MonitorSettings {
            interval: Duration::from_secs(self.monitor_interval),
            leak_threshold: self.leak_threshold,
        })
    }

    /// Parse the `--param` values as JSON scalars.
    pub fn statement_params(&self) -> DbResult<Vec<QueryParam>> {
        self.params
            .iter()
            .map(|raw| {
                serde_json::from_str::<QueryParam>(raw).map_err(|e| {
                    DbError::configuration(format!("invalid parameter {:?}: {}", raw, e))
                })
            })
            .collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

/// Fully resolved settings, fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub executor: ExecutorSettings,
    pub monitor: MonitorSettings,
}

/// Where and how to open database sessions.
#[derive(Clone)]
pub struct DatabaseSettings {
    pub backend: DatabaseType,
    pub host: String,
    pub port: u16,
    /// Database name, or file path for sqlite.
    pub database: String,
    pub user: String,
    /// Sensitive - never log
    pub password: String,
    pub page_size: u32,
}

impl DatabaseSettings {
    /// Settings for a sqlite database file.
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            backend: DatabaseType::SQLite,
            host: String::new(),
            port: 0,
            database: path.into(),
            user: String::new(),
            password: String::new(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl std::fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("backend", &self.backend)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"****")
            .field("page_size", &self.page_size)
            .finish()
    }
}

/// Which failures are retried, how often, and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Driver error code that marks a transient authentication failure.
    pub auth_error_code: String,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self {
            auth_error_code: String::new(),
            max_retries: 0,
            retry_delay: Duration::ZERO,
        }
    }

    /// Check whether a driver failure is the transient authentication failure.
    pub fn is_transient(&self, err: &DriverError) -> bool {
        !self.auth_error_code.is_empty() && err.has_code(&self.auth_error_code)
    }

    /// Decide whether attempt number `attempt` (0-based) may be followed by another.
    pub fn should_retry(&self, attempt: u32, err: &DriverError) -> bool {
        self.is_transient(err) && attempt < self.max_retries
    }
}

/// Settings for the query executor.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub isolation: IsolationLevel,
    /// Deadline for one attempt, from connect through commit.
    pub query_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::ReadCommitted,
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
            retry: RetryPolicy::disabled(),
        }
    }
}

/// Settings for the leak monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    pub interval: Duration,
    /// Sweep when the live connection count exceeds this value.
    pub leak_threshold: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_MONITOR_INTERVAL_SECS),
            leak_threshold: DEFAULT_LEAK_THRESHOLD,
        }
    }
}

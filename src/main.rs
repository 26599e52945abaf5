//! txscope - Main entry point.
//!
//! Validates the configuration, checks that the database is reachable, then
//! either runs one statement given with `--execute` or keeps the leak monitor
//! running until Ctrl-C. Both paths end with the monitor's shutdown sweep.

use clap::Parser;
use std::sync::Arc;
use txscope::config::Config;
use txscope::db::{LeakMonitor, QueryExecutor, ResourceTracker, SqlxDriver};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    let settings = match config.settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            eprintln!("Error: {}", e);
            eprintln!("Hint: {}", e.suggestion());
            std::process::exit(1);
        }
    };
    let params = config.statement_params()?;

    info!(
        backend = %settings.database.backend,
        host = %settings.database.host,
        database = %settings.database.database,
        "Starting txscope v{}",
        env!("CARGO_PKG_VERSION")
    );

    let tracker = ResourceTracker::new();
    let driver = Arc::new(SqlxDriver::new(settings.database.clone()));
    let executor = QueryExecutor::new(driver, tracker.clone(), settings.executor.clone());
    let monitor = LeakMonitor::start(tracker.clone(), settings.monitor.clone());

    if let Err(e) = executor.probe().await {
        error!(error = %e, suggestion = e.suggestion(), "Database connection check failed");
        monitor.shutdown().await;
        std::process::exit(1);
    }
    info!("Database connection check passed");

    let result: Result<(), Box<dyn std::error::Error>> = match config.execute.as_deref() {
        Some(statement) => match executor.execute(statement, &params).await {
            Ok(rows) => serde_json::to_string_pretty(&rows)
                .map(|json| println!("{}", json))
                .map_err(Into::into),
            Err(e) => {
                error!(error = %e, suggestion = e.suggestion(), "Statement failed");
                Err(e.into())
            }
        },
        None => {
            info!("Waiting for Ctrl-C");
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl-C, shutting down");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        }
    };

    // Runs on every exit path
    monitor.shutdown().await;
    info!(stats = %tracker.snapshot(), "Shutdown complete");

    result
}

//! Query execution engine.
//!
//! Every call to [`QueryExecutor::execute`] gets its own session and its own
//! transaction:
//!
//! 1. connect and register the connection with the tracker
//! 2. begin at the configured isolation level (READ COMMITTED by default)
//! 3. run the statement
//! 4. commit
//!
//! Whatever happens in between, the attempt ends with exactly one release
//! (rollback, then detach). A failure carrying the configured authentication
//! error code is retried after a fixed delay, up to `max_retries` extra times.
//! Anything else is reported at once, tagged with the step that failed and the
//! statement and parameters being run.
//!
//! Dropping the `execute` future part way through (a caller-side timeout or a
//! lost `select!` branch) still releases what the attempt had opened: the
//! release moves to a background task.

use crate::config::ExecutorSettings;
use crate::db::driver::Driver;
use crate::db::handle::{ConnectionHandle, TransactionHandle};
use crate::db::releaser::ResourceReleaser;
use crate::db::tracker::ResourceTracker;
use crate::error::{DbError, DbResult, DriverError};
use crate::models::{QueryParam, Row, StatementContext};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Step of an attempt that produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Connect,
    Begin,
    Execute,
    Commit,
}

impl Step {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Begin => "begin",
            Self::Execute => "execute",
            Self::Commit => "commit",
        }
    }
}

/// Why one attempt did not produce rows.
#[derive(Debug)]
enum AttemptFailure {
    Step { step: Step, error: DriverError },
    TimedOut,
}

impl AttemptFailure {
    fn at(step: Step) -> impl FnOnce(DriverError) -> Self {
        move |error| Self::Step { step, error }
    }
}

/// Runs single statements with scoped connection and transaction lifetimes.
pub struct QueryExecutor {
    driver: Arc<dyn Driver>,
    tracker: Arc<ResourceTracker>,
    releaser: ResourceReleaser,
    settings: ExecutorSettings,
}

impl QueryExecutor {
    pub fn new(
        driver: Arc<dyn Driver>,
        tracker: Arc<ResourceTracker>,
        settings: ExecutorSettings,
    ) -> Self {
        let releaser = ResourceReleaser::new(tracker.clone());
        Self {
            driver,
            tracker,
            releaser,
            settings,
        }
    }

    pub fn tracker(&self) -> &Arc<ResourceTracker> {
        &self.tracker
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Execute one statement with positional parameters and return its rows.
    ///
    /// Statements that produce no rows return an empty vector.
    pub async fn execute(&self, statement: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        let retry = &self.settings.retry;
        let start = Instant::now();
        let mut attempt: u32 = 0;

        debug!(
            backend = self.driver.name(),
            sql = %statement,
            params = params.len(),
            "Executing statement"
        );

        loop {
            let failure = match self.attempt(statement, params).await {
                Ok(rows) => {
                    debug!(
                        rows = rows.len(),
                        attempts = attempt + 1,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Statement completed"
                    );
                    return Ok(rows);
                }
                Err(failure) => failure,
            };

            match failure {
                AttemptFailure::Step { step, error } if retry.should_retry(attempt, &error) => {
                    attempt += 1;
                    warn!(
                        step = step.as_str(),
                        code = %retry.auth_error_code,
                        attempt,
                        max_retries = retry.max_retries,
                        delay_ms = retry.retry_delay.as_millis() as u64,
                        error = %error,
                        "Transient authentication failure, retrying"
                    );
                    sleep(retry.retry_delay).await;
                }
                failure => return Err(self.classify(failure, attempt + 1, statement, params)),
            }
        }
    }

    /// Check that the database is reachable by running `SELECT 1`.
    pub async fn probe(&self) -> DbResult<()> {
        self.execute("SELECT 1", &[]).await.map(|_| ())
    }

    /// One connect-to-commit attempt, always followed by a release.
    async fn attempt(
        &self,
        statement: &str,
        params: &[QueryParam],
    ) -> Result<Vec<Row>, AttemptFailure> {
        let mut guard = ReleaseGuard::new(self.releaser.clone());

        let outcome = timeout(
            self.settings.query_timeout,
            self.run_steps(statement, params, &mut guard),
        )
        .await;

        guard.release().await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(AttemptFailure::TimedOut),
        }
    }

    async fn run_steps(
        &self,
        statement: &str,
        params: &[QueryParam],
        guard: &mut ReleaseGuard,
    ) -> Result<Vec<Row>, AttemptFailure> {
        let session = self
            .driver
            .connect()
            .await
            .map_err(AttemptFailure::at(Step::Connect))?;
        let connection = guard.connection.insert(ConnectionHandle::new(session));
        self.tracker.register(connection);

        let transaction = guard.transaction.insert(
            connection
                .begin(self.settings.isolation)
                .await
                .map_err(AttemptFailure::at(Step::Begin))?,
        );

        let rows = transaction
            .query(statement, params)
            .await
            .map_err(AttemptFailure::at(Step::Execute))?;

        transaction
            .commit()
            .await
            .map_err(AttemptFailure::at(Step::Commit))?;

        Ok(rows)
    }

    fn classify(
        &self,
        failure: AttemptFailure,
        attempts: u32,
        statement: &str,
        params: &[QueryParam],
    ) -> DbError {
        let context = StatementContext::new(statement, params);
        let (step, error) = match failure {
            AttemptFailure::TimedOut => {
                let secs = self.settings.query_timeout.as_secs();
                warn!(
                    timeout_secs = secs,
                    sql = %statement,
                    params = ?params,
                    "Statement timed out"
                );
                return DbError::timeout("statement execution", secs, context);
            }
            AttemptFailure::Step { step, error } => (step, error),
        };

        warn!(
            step = step.as_str(),
            code = ?error.code,
            error = %error,
            sql = %statement,
            params = ?params,
            attempts,
            "Statement failed"
        );

        if self.settings.retry.is_transient(&error) {
            let code = error.code.unwrap_or_default();
            return DbError::auth_transient(error.message, code, attempts, context);
        }

        match step {
            Step::Connect => DbError::connection(error, context),
            Step::Begin | Step::Commit => DbError::transaction(error, context),
            Step::Execute => DbError::statement(error, context),
        }
    }
}

/// Handles opened by one attempt that still need releasing.
///
/// The release always runs on its own task, so it finishes even when the
/// attempt future is dropped while waiting for it. If the attempt is dropped
/// before [`ReleaseGuard::release`] was reached, `Drop` starts the release.
struct ReleaseGuard {
    releaser: ResourceReleaser,
    connection: Option<ConnectionHandle>,
    transaction: Option<TransactionHandle>,
}

impl ReleaseGuard {
    fn new(releaser: ResourceReleaser) -> Self {
        Self {
            releaser,
            connection: None,
            transaction: None,
        }
    }

    async fn release(&mut self) {
        if let Some(task) = self.spawn_release(&Handle::current()) {
            // Release never panics; an error here means the runtime is stopping
            let _ = task.await;
        }
    }

    fn spawn_release(&mut self, runtime: &Handle) -> Option<JoinHandle<()>> {
        if self.connection.is_none() && self.transaction.is_none() {
            return None;
        }
        let connection = self.connection.take();
        let transaction = self.transaction.take();
        let releaser = self.releaser.clone();
        Some(runtime.spawn(async move {
            releaser.release(connection, transaction).await;
        }))
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if self.connection.is_none() && self.transaction.is_none() {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!("Statement cancelled outside a runtime, connection left to the leak monitor");
            return;
        };
        warn!(
            connection_id = ?self.connection.as_ref().map(|c| c.id().to_string()),
            "Statement cancelled, releasing in the background"
        );
        self.spawn_release(&runtime);
    }
}

//! Scripted in-memory driver for lifecycle tests.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use txscope::config::{ExecutorSettings, RetryPolicy};
use txscope::db::{Driver, DriverConnection, QueryExecutor, ResourceTracker};
use txscope::error::DriverError;
use txscope::models::{IsolationLevel, QueryParam, Row};

pub const AUTH_CODE: &str = "28P01";

/// How often each driver call ran.
#[derive(Debug, Default)]
pub struct Counters {
    pub connects: AtomicUsize,
    pub begins: AtomicUsize,
    pub queries: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub closes: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Failures to inject into one session, consumed in connect order.
#[derive(Debug, Clone, Default)]
pub struct SessionPlan {
    pub connect: Option<DriverError>,
    pub begin: Option<DriverError>,
    pub query: Option<DriverError>,
    pub commit: Option<DriverError>,
    pub rollback: Option<DriverError>,
    pub close: Option<DriverError>,
    pub panic_on_rollback: bool,
    pub query_delay: Option<Duration>,
    pub close_delay: Option<Duration>,
}

impl SessionPlan {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn auth_failure_on_connect() -> Self {
        Self {
            connect: Some(auth_error()),
            ..Self::default()
        }
    }
}

pub fn auth_error() -> DriverError {
    DriverError::with_code(AUTH_CODE, "password authentication failed for user \"app\"")
}

pub struct MockDriver {
    pub counters: Arc<Counters>,
    plans: Mutex<VecDeque<SessionPlan>>,
    /// Applied once `plans` runs out.
    fallback: SessionPlan,
}

impl MockDriver {
    /// Driver whose sessions never fail.
    pub fn new() -> Arc<Self> {
        Self::with_plans(Vec::new())
    }

    /// Driver that applies `plans` to the first sessions it opens.
    pub fn with_plans(plans: Vec<SessionPlan>) -> Arc<Self> {
        Arc::new(Self {
            counters: Arc::new(Counters::default()),
            plans: Mutex::new(plans.into()),
            fallback: SessionPlan::ok(),
        })
    }

    /// Driver that applies `plan` to every session it opens.
    pub fn with_every_session(plan: SessionPlan) -> Arc<Self> {
        Arc::new(Self {
            counters: Arc::new(Counters::default()),
            plans: Mutex::new(VecDeque::new()),
            fallback: plan,
        })
    }

    pub fn connects(&self) -> usize {
        Counters::get(&self.counters.connects)
    }

    pub fn rollbacks(&self) -> usize {
        Counters::get(&self.counters.rollbacks)
    }

    pub fn closes(&self) -> usize {
        Counters::get(&self.counters.closes)
    }

    pub fn commits(&self) -> usize {
        Counters::get(&self.counters.commits)
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn connect(&self) -> Result<Box<dyn DriverConnection>, DriverError> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        let plan = self
            .plans
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        if let Some(err) = plan.connect.clone() {
            return Err(err);
        }
        Ok(Box::new(MockSession {
            counters: self.counters.clone(),
            plan,
        }))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

struct MockSession {
    counters: Arc<Counters>,
    plan: SessionPlan,
}

#[async_trait]
impl DriverConnection for MockSession {
    async fn begin(&mut self, _isolation: IsolationLevel) -> Result<(), DriverError> {
        self.counters.begins.fetch_add(1, Ordering::SeqCst);
        self.plan.begin.clone().map_or(Ok(()), Err)
    }

    async fn query(
        &mut self,
        _statement: &str,
        _params: &[QueryParam],
    ) -> Result<Vec<Row>, DriverError> {
        self.counters.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.plan.query_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.plan.query.clone() {
            return Err(err);
        }
        let mut row = Row::new();
        row.insert("TEST".to_string(), json!(1));
        Ok(vec![row])
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.counters.commits.fetch_add(1, Ordering::SeqCst);
        self.plan.commit.clone().map_or(Ok(()), Err)
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        if self.plan.panic_on_rollback {
            panic!("driver crashed during rollback");
        }
        self.plan.rollback.clone().map_or(Ok(()), Err)
    }

    async fn close(self: Box<Self>) -> Result<(), DriverError> {
        if let Some(delay) = self.plan.close_delay {
            tokio::time::sleep(delay).await;
        }
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        self.plan.close.clone().map_or(Ok(()), Err)
    }
}

/// Poll `condition` every few milliseconds for up to two seconds.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

pub fn retry_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        auth_error_code: AUTH_CODE.to_string(),
        max_retries,
        retry_delay: Duration::from_millis(10),
    }
}

pub fn executor_settings(max_retries: u32) -> ExecutorSettings {
    ExecutorSettings {
        isolation: IsolationLevel::ReadCommitted,
        query_timeout: Duration::from_secs(5),
        retry: retry_policy(max_retries),
    }
}

/// Executor over `driver` with a fresh tracker.
pub fn executor(driver: Arc<MockDriver>, max_retries: u32) -> QueryExecutor {
    QueryExecutor::new(driver, ResourceTracker::new(), executor_settings(max_retries))
}

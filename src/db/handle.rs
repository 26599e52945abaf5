//! Connection and transaction handles.
//!
//! A [`ConnectionHandle`] owns one open driver session. Clones share the same
//! session, so the executor, the tracker registry and the leak monitor can all
//! reach it. Detaching closes the session, fires the detach listeners exactly
//! once, and turns every later operation on the handle into an error (or a
//! no-op for rollback and detach).
//!
//! The close itself runs on its own task. Dropping a `detach` future halfway
//! never leaves a handle that is closed but still registered.

use crate::db::driver::DriverConnection;
use crate::error::DriverError;
use crate::models::{IsolationLevel, QueryParam, Row};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::watch;
use uuid::Uuid;

/// Unique identifier of an open connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

type DetachListener = Box<dyn FnOnce(&ConnectionId) + Send>;

#[derive(Default)]
struct DetachState {
    detached: bool,
    listeners: Vec<DetachListener>,
}

struct HandleInner {
    id: ConnectionId,
    opened_at: DateTime<Utc>,
    /// `None` once the session has been handed to `close`.
    session: TokioMutex<Option<Box<dyn DriverConnection>>>,
    detach: Mutex<DetachState>,
    /// Flips to `true` after the close finished and the listeners ran.
    closed: watch::Sender<bool>,
}

/// Shared handle to one open database session.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    /// Wrap a freshly opened session.
    pub fn new(session: Box<dyn DriverConnection>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: ConnectionId::new(),
                opened_at: Utc::now(),
                session: TokioMutex::new(Some(session)),
                detach: Mutex::new(DetachState::default()),
                closed: watch::channel(false).0,
            }),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.inner.opened_at
    }

    pub fn is_detached(&self) -> bool {
        self.detach_state().detached
    }

    /// Start a transaction on this session.
    pub async fn begin(&self, isolation: IsolationLevel) -> Result<TransactionHandle, DriverError> {
        let mut session = self.inner.session.lock().await;
        session
            .as_mut()
            .ok_or_else(DriverError::detached)?
            .begin(isolation)
            .await?;
        Ok(TransactionHandle {
            connection: self.clone(),
            state: TransactionState::Active,
        })
    }

    /// Register a callback to run once when the handle is detached.
    ///
    /// Runs immediately if the handle is already detached.
    pub fn on_detach<F>(&self, listener: F)
    where
        F: FnOnce(&ConnectionId) + Send + 'static,
    {
        let mut state = self.detach_state();
        if state.detached {
            drop(state);
            listener(&self.inner.id);
        } else {
            state.listeners.push(Box::new(listener));
        }
    }

    /// Close the session.
    ///
    /// Detaching an already detached handle is a no-op. A caller arriving
    /// while another close is still running waits for that close. Listeners
    /// fire even when the driver reports an error while closing, and even when
    /// the caller stops polling before the close is done.
    pub async fn detach(&self) -> Result<(), DriverError> {
        let session = self.inner.session.lock().await.take();
        let Some(session) = session else {
            let mut closed = self.inner.closed.subscribe();
            // The sender lives in `inner`, so this cannot fail
            let _ = closed.wait_for(|closed| *closed).await;
            return Ok(());
        };

        let marker = DetachOnDrop(self.clone());
        let close = tokio::spawn(async move {
            let _marker = marker;
            session.close().await
        });

        match close.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(DriverError::new("Close was cancelled by runtime shutdown")),
        }
    }

    fn mark_detached(&self) {
        let listeners = {
            let mut state = self.detach_state();
            state.detached = true;
            std::mem::take(&mut state.listeners)
        };
        for listener in listeners {
            listener(&self.inner.id);
        }
        self.inner.closed.send_replace(true);
    }

    fn detach_state(&self) -> MutexGuard<'_, DetachState> {
        self.inner
            .detach
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks the handle detached when the close task ends, panics included.
struct DetachOnDrop(ConnectionHandle);

impl Drop for DetachOnDrop {
    fn drop(&mut self) {
        self.0.mark_detached();
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("opened_at", &self.inner.opened_at)
            .field("detached", &self.is_detached())
            .finish()
    }
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

/// One transaction on a [`ConnectionHandle`].
#[derive(Debug)]
pub struct TransactionHandle {
    connection: ConnectionHandle,
    state: TransactionState,
}

impl TransactionHandle {
    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn connection_id(&self) -> &ConnectionId {
        self.connection.id()
    }

    /// Run one statement inside the transaction.
    pub async fn query(
        &self,
        statement: &str,
        params: &[QueryParam],
    ) -> Result<Vec<Row>, DriverError> {
        if self.state != TransactionState::Active {
            return Err(DriverError::new("Transaction is no longer active"));
        }
        let mut session = self.connection.inner.session.lock().await;
        session
            .as_mut()
            .ok_or_else(DriverError::detached)?
            .query(statement, params)
            .await
    }

    /// Commit the transaction. The state only changes when the commit succeeds.
    pub async fn commit(&mut self) -> Result<(), DriverError> {
        if self.state != TransactionState::Active {
            return Err(DriverError::new("Transaction is no longer active"));
        }
        let mut session = self.connection.inner.session.lock().await;
        session
            .as_mut()
            .ok_or_else(DriverError::detached)?
            .commit()
            .await?;
        self.state = TransactionState::Committed;
        Ok(())
    }

    /// Roll back the transaction.
    ///
    /// No-op once the transaction is committed or rolled back, and when the
    /// session is already detached (the server discards the work).
    pub async fn rollback(&mut self) -> Result<(), DriverError> {
        if self.state != TransactionState::Active {
            return Ok(());
        }
        let mut session = self.connection.inner.session.lock().await;
        self.state = TransactionState::RolledBack;
        match session.as_mut() {
            Some(session) => session.rollback().await,
            None => Ok(()),
        }
    }
}

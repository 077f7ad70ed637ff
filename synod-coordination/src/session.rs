//! Session lifecycle management.
//!
//! A [`SessionManager`] owns the single store session of a coordination
//! service. It establishes the session with bounded retries, retries
//! transient connection loss on individual operations for up to one session
//! timeout, and publishes the session state through a watch channel so that
//! blocked calls and primitives can react to expiry and shutdown.

use crate::error::{CoordinationError, CoordinationResult};
use crate::paths::join_path;
use crate::store::{
    ConnectSettings, ConnectionState, CoordinationStore, CreateMode, Stat, StoreConnector,
    StoreError, StoreEvent, StoreResult,
};
use parking_lot::Mutex;
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(20);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Observable session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connection lost, recovery in progress.
    Connecting,
    /// Session established.
    Connected,
    /// Session expired; every ephemeral node it owned is gone.
    Expired,
    /// Session closed by the application.
    Closed,
}

impl SessionState {
    /// Expired and closed sessions never recover.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired | Self::Closed)
    }

    pub(crate) fn check(&self) -> CoordinationResult<()> {
        if self.is_terminal() {
            Err(self.lost_error())
        } else {
            Ok(())
        }
    }

    /// Error reported to calls interrupted by this state.
    pub(crate) fn lost_error(&self) -> CoordinationError {
        match self {
            Self::Expired => CoordinationError::SessionExpired,
            _ => CoordinationError::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Expired => "expired",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Exponential backoff with jitter.
fn backoff(attempt: u32) -> Duration {
    let base = INITIAL_BACKOFF
        .saturating_mul(1 << attempt.min(8))
        .min(MAX_BACKOFF);
    let jitter = rand::rng().random_range(0..=base.as_millis() as u64 / 2);
    base + Duration::from_millis(jitter)
}

/// Owner of the store session.
pub struct SessionManager {
    store: Arc<dyn CoordinationStore>,
    settings: ConnectSettings,
    state: watch::Sender<SessionState>,
    cleanup: Mutex<Vec<String>>,
    disconnect_epoch: AtomicU64,
}

impl SessionManager {
    /// Establish a session, retrying transient failures for up to one session
    /// timeout. Returns the manager and the stream of store notifications.
    pub async fn connect(
        connector: &dyn StoreConnector,
        settings: ConnectSettings,
    ) -> CoordinationResult<(Arc<Self>, mpsc::UnboundedReceiver<StoreEvent>)> {
        let deadline = Instant::now() + settings.session_timeout;
        let mut attempt = 0u32;

        loop {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            match connector.connect(&settings, events_tx).await {
                Ok(store) => {
                    info!(
                        session_id = store.session_id(),
                        servers = %settings.connection_string,
                        "coordination session established"
                    );
                    let (state, _) = watch::channel(SessionState::Connected);
                    let manager = Arc::new(Self {
                        store,
                        settings,
                        state,
                        cleanup: Mutex::new(Vec::new()),
                        disconnect_epoch: AtomicU64::new(0),
                    });
                    return Ok((manager, events_rx));
                }
                Err(err) if err.is_retryable() && Instant::now() < deadline => {
                    attempt += 1;
                    let delay = backoff(attempt).min(deadline.saturating_duration_since(Instant::now()));
                    warn!(attempt, error = %err, "connection attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(
                        servers = %settings.connection_string,
                        attempts = attempt + 1,
                        error = %err,
                        "unable to establish coordination session"
                    );
                    return Err(CoordinationError::Connection(format!(
                        "unable to connect to '{}' within {:?}: {}",
                        settings.connection_string, settings.session_timeout, err
                    )));
                }
            }
        }
    }

    pub fn session_id(&self) -> u64 {
        self.store.session_id()
    }

    pub fn session_timeout(&self) -> Duration {
        self.settings.session_timeout
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Apply a connection state change reported by the store.
    pub(crate) fn on_connection_event(self: &Arc<Self>, event: ConnectionState) {
        match event {
            ConnectionState::Connected => {
                self.disconnect_epoch.fetch_add(1, Ordering::SeqCst);
                let recovered = self.transition(SessionState::Connecting, SessionState::Connected);
                if recovered {
                    info!(session_id = self.session_id(), "coordination session recovered");
                }
            }
            ConnectionState::Disconnected => {
                if !self.transition(SessionState::Connected, SessionState::Connecting) {
                    return;
                }
                warn!(
                    session_id = self.session_id(),
                    session_timeout_ms = self.settings.session_timeout.as_millis() as u64,
                    "connection to coordination store lost"
                );

                let epoch = self.disconnect_epoch.fetch_add(1, Ordering::SeqCst) + 1;
                let manager = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(manager.settings.session_timeout).await;
                    if manager.disconnect_epoch.load(Ordering::SeqCst) == epoch
                        && manager.state() == SessionState::Connecting
                    {
                        warn!(
                            session_id = manager.session_id(),
                            "session not recovered within its timeout"
                        );
                        manager.mark_expired();
                    }
                });
            }
            ConnectionState::Expired => self.mark_expired(),
            ConnectionState::Closed => {
                self.state.send_if_modified(|state| {
                    if state.is_terminal() {
                        return false;
                    }
                    *state = SessionState::Closed;
                    true
                });
            }
        }
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state != from {
                return false;
            }
            *state = to;
            true
        })
    }

    /// Enter the terminal expired state. Idempotent.
    pub(crate) fn mark_expired(&self) {
        let expired = self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = SessionState::Expired;
            true
        });

        if expired {
            error!(session_id = self.session_id(), "coordination session expired");
            let store = Arc::clone(&self.store);
            tokio::spawn(async move {
                let _ = store.close().await;
            });
        }
    }

    fn translate(&self, err: StoreError) -> CoordinationError {
        if err == StoreError::SessionExpired {
            self.mark_expired();
        }
        err.into()
    }

    async fn retrying<T, F, Fut>(&self, operation: &str, mut call: F) -> CoordinationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let deadline = Instant::now() + self.settings.session_timeout;
        let mut attempt = 0u32;

        loop {
            self.state().check()?;
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && Instant::now() < deadline => {
                    attempt += 1;
                    debug!(operation, attempt, "transient store failure, retrying");
                    tokio::time::sleep(backoff(attempt)).await;
                }
                Err(err) => return Err(self.translate(err)),
            }
        }
    }

    /// Create a node. Creates are not retried: a sequential create that
    /// failed with connection loss may still have happened.
    pub async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordinationResult<String> {
        self.state().check()?;
        let created = self
            .store
            .create(path, data, mode)
            .await
            .map_err(|err| self.translate(err))?;
        debug!(path = %created, ?mode, "created node");
        Ok(created)
    }

    pub async fn create_ephemeral(&self, path: &str, data: &[u8]) -> CoordinationResult<String> {
        self.create(path, data, CreateMode::Ephemeral).await
    }

    pub async fn create_ephemeral_sequential(&self, prefix: &str, data: &[u8]) -> CoordinationResult<String> {
        self.create(prefix, data, CreateMode::EphemeralSequential).await
    }

    pub async fn create_persistent_sequential(&self, prefix: &str, data: &[u8]) -> CoordinationResult<String> {
        self.create(prefix, data, CreateMode::PersistentSequential).await
    }

    /// Create a persistent node and every missing ancestor.
    pub async fn ensure_path(&self, path: &str) -> CoordinationResult<()> {
        if self.exists(path).await?.is_some() {
            return Ok(());
        }

        let mut current = "/".to_string();
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            current = join_path(&current, segment);
            let created = self
                .retrying("ensure_path", || {
                    self.store.create(&current, &[], CreateMode::Persistent)
                })
                .await;
            match created {
                Ok(_) => debug!(path = %current, "created path"),
                Err(CoordinationError::Store(StoreError::NodeExists(_))) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Register a persistent node to be removed when the session closes.
    pub fn remove_on_close(&self, path: impl Into<String>) {
        self.cleanup.lock().push(path.into());
    }

    /// Undo [`remove_on_close`](Self::remove_on_close) for a node its owner
    /// already removed.
    pub fn forget_on_close(&self, path: &str) {
        self.cleanup.lock().retain(|registered| registered != path);
    }

    #[cfg(test)]
    pub(crate) fn pending_cleanup(&self) -> usize {
        self.cleanup.lock().len()
    }

    pub async fn exists(&self, path: &str) -> CoordinationResult<Option<Stat>> {
        self.retrying("exists", || self.store.exists(path, false)).await
    }

    /// Like [`exists`](Self::exists), leaving a watch that fires on creation,
    /// deletion or data change.
    pub async fn watch_node(&self, path: &str) -> CoordinationResult<Option<Stat>> {
        self.retrying("exists", || self.store.exists(path, true)).await
    }

    pub async fn children(&self, path: &str) -> CoordinationResult<Vec<String>> {
        self.retrying("get_children", || self.store.get_children(path, false))
            .await
    }

    pub async fn watch_children(&self, path: &str) -> CoordinationResult<Vec<String>> {
        self.retrying("get_children", || self.store.get_children(path, true))
            .await
    }

    pub async fn get_data(&self, path: &str) -> CoordinationResult<(Vec<u8>, Stat)> {
        self.retrying("get_data", || self.store.get_data(path, false)).await
    }

    pub async fn watch_data(&self, path: &str) -> CoordinationResult<(Vec<u8>, Stat)> {
        self.retrying("get_data", || self.store.get_data(path, true)).await
    }

    pub async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> CoordinationResult<Stat> {
        self.retrying("set_data", || self.store.set_data(path, data, version))
            .await
    }

    /// Delete a node. Returns `false` if it was already gone.
    pub async fn delete(&self, path: &str, version: Option<i32>) -> CoordinationResult<bool> {
        match self
            .retrying("delete", || self.store.delete(path, version))
            .await
        {
            Ok(()) => Ok(true),
            Err(err) if err.is_no_node() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Close the session. Idempotent.
    ///
    /// The state becomes [`SessionState::Closed`] first, which unblocks every
    /// waiting call, then registered nodes are removed and the store session
    /// ends, taking its ephemeral nodes with it.
    pub async fn close(&self) {
        let mut previous = SessionState::Closed;
        let closed = self.state.send_if_modified(|state| {
            if *state == SessionState::Closed {
                return false;
            }
            previous = *state;
            *state = SessionState::Closed;
            true
        });
        if !closed {
            return;
        }

        if previous != SessionState::Expired {
            let paths = std::mem::take(&mut *self.cleanup.lock());
            for path in paths.iter().rev() {
                self.remove_best_effort(path).await;
            }
            if let Err(err) = self.store.close().await {
                warn!(error = %err, "error closing store session");
            }
        }

        info!(session_id = self.session_id(), "coordination session closed");
    }

    async fn remove_best_effort(&self, path: &str) {
        match self.store.delete(path, None).await {
            Ok(()) | Err(StoreError::NoNode(_)) => {}
            Err(StoreError::NotEmpty(_)) => {
                if let Ok(children) = self.store.get_children(path, false).await {
                    for child in children {
                        let _ = self.store.delete(&join_path(path, &child), None).await;
                    }
                }
                let _ = self.store.delete(path, None).await;
            }
            Err(err) => debug!(path, error = %err, "could not remove node on close"),
        }
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("session_id", &self.session_id())
            .field("state", &self.state())
            .field("servers", &self.settings.connection_string)
            .finish()
    }
}

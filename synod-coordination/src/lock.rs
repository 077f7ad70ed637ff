//! Distributed locks.
//!
//! Each contender creates an ephemeral-sequential node under the lock
//! directory. The lowest node holds the lock; everyone else watches only the
//! node directly ahead of it. A holder whose session dies loses its node and
//! the next contender takes over.

use crate::dispatcher::WatchDispatcher;
use crate::error::{CoordinationError, CoordinationResult};
use crate::paths::{LOCK_PREFIX, join_path, node_name};
use crate::sequence::{Turn, wait_for_turn};
use crate::session::SessionManager;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
enum LockState {
    Idle,
    Acquiring,
    Held(String),
}

/// A named mutual-exclusion lock.
///
/// One instance represents one holder: calling [`acquire`](Lock::acquire)
/// again while the lock is held (or being acquired) by the same instance is
/// an error. Dropping a held lock releases it in the background.
pub struct Lock {
    name: String,
    path: String,
    timeout: Option<Duration>,
    session: Arc<SessionManager>,
    dispatcher: Arc<WatchDispatcher>,
    state: Mutex<LockState>,
}

/// Resets an unfinished acquisition, including one whose future was dropped.
struct Attempt<'a> {
    lock: &'a Lock,
    node: Option<String>,
    finished: bool,
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        *self.lock.state.lock() = LockState::Idle;
        if let Some(node) = self.node.take() {
            remove_in_background(&self.lock.session, node);
        }
    }
}

fn remove_in_background(session: &Arc<SessionManager>, node: String) {
    if session.state().is_terminal() {
        return;
    }
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        let session = Arc::clone(session);
        runtime.spawn(async move {
            if let Err(err) = session.delete(&node, None).await {
                debug!(%node, error = %err, "background lock node removal failed");
            }
        });
    }
}

impl Lock {
    pub(crate) fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        timeout: Option<Duration>,
        session: Arc<SessionManager>,
        dispatcher: Arc<WatchDispatcher>,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            timeout,
            session,
            dispatcher,
            state: Mutex::new(LockState::Idle),
        }
    }

    /// Lock name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store directory holding the lock's request nodes.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Default wait budget of [`acquire`](Self::acquire); `None` waits forever.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Block until the lock is held, up to the lock's timeout.
    ///
    /// On timeout the request node is removed before the error is returned.
    pub async fn acquire(&self) -> CoordinationResult<()> {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        if self.acquire_until(deadline).await? {
            Ok(())
        } else {
            Err(CoordinationError::timeout(format!("acquire lock '{}'", self.name)))
        }
    }

    /// Block until the lock is held, up to `timeout`.
    pub async fn acquire_timeout(&self, timeout: Duration) -> CoordinationResult<()> {
        if self.acquire_until(Some(Instant::now() + timeout)).await? {
            Ok(())
        } else {
            Err(CoordinationError::timeout(format!("acquire lock '{}'", self.name)))
        }
    }

    /// Take the lock only if nobody else holds or awaits it.
    pub async fn try_acquire(&self) -> CoordinationResult<bool> {
        self.acquire_until(Some(Instant::now())).await
    }

    async fn acquire_until(&self, deadline: Option<Instant>) -> CoordinationResult<bool> {
        {
            let mut state = self.state.lock();
            if *state != LockState::Idle {
                return Err(CoordinationError::IllegalState(format!(
                    "lock '{}' is already held or being acquired by this instance",
                    self.name
                )));
            }
            *state = LockState::Acquiring;
        }

        let mut attempt = Attempt {
            lock: self,
            node: None,
            finished: false,
        };

        self.session.ensure_path(&self.path).await?;
        let node = self
            .session
            .create_ephemeral_sequential(&join_path(&self.path, LOCK_PREFIX), &[])
            .await?;
        attempt.node = Some(node.clone());
        debug!(lock = %self.name, %node, "lock requested");

        let turn = wait_for_turn(
            &self.session,
            &self.dispatcher,
            &self.path,
            LOCK_PREFIX,
            node_name(&node),
            deadline,
        )
        .await?;

        match turn {
            Turn::First => {
                attempt.finished = true;
                *self.state.lock() = LockState::Held(node.clone());
                info!(lock = %self.name, %node, "lock acquired");
                Ok(true)
            }
            Turn::TimedOut => {
                attempt.node = None;
                if let Err(err) = self.session.delete(&node, None).await {
                    warn!(lock = %self.name, %node, error = %err, "failed to withdraw lock request");
                }
                debug!(lock = %self.name, "lock not acquired in time");
                Ok(false)
            }
        }
    }

    /// Release the lock.
    ///
    /// Returns `false` if this instance did not hold it, including when the
    /// session that held it has expired.
    pub async fn release(&self) -> CoordinationResult<bool> {
        let node = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, LockState::Idle) {
                LockState::Held(node) => node,
                other => {
                    *state = other;
                    return Ok(false);
                }
            }
        };

        match self.session.delete(&node, None).await {
            Ok(true) => {
                info!(lock = %self.name, "lock released");
                Ok(true)
            }
            Ok(false) => {
                warn!(lock = %self.name, %node, "lock node was already gone");
                Ok(false)
            }
            Err(err) if err.is_session_lost() => {
                warn!(lock = %self.name, error = %err, "lock lost with its session");
                Ok(false)
            }
            Err(err) => {
                *self.state.lock() = LockState::Held(node);
                Err(err)
            }
        }
    }

    /// Whether this instance holds the lock on a live session.
    pub fn is_held(&self) -> bool {
        matches!(*self.state.lock(), LockState::Held(_)) && !self.session.state().is_terminal()
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if let LockState::Held(node) = std::mem::replace(self.state.get_mut(), LockState::Idle) {
            debug!(lock = %self.name, "releasing dropped lock");
            remove_in_background(&self.session, node);
        }
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("timeout", &self.timeout)
            .field("held", &self.is_held())
            .finish()
    }
}

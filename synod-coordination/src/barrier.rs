//! Distributed barriers.
//!
//! Parties register as ephemeral-sequential nodes under the barrier
//! directory and wait until at least `parties` of them are present. The first
//! party to observe a full barrier records the sequence number of the newest
//! party in a `ready` node, so a party that entered before that point is
//! released even if others already left by the time it re-reads the
//! directory. Parties entering later wait for a new quorum.

use crate::dispatcher::{Wake, WatchDispatcher};
use crate::error::{CoordinationError, CoordinationResult};
use crate::paths::{PARTY_PREFIX, READY_NODE, join_path};
use crate::sequence::{Sequenced, SequencedNode, parse_sequence, sort_sequenced};
use crate::session::SessionManager;
use crate::store::{CreateMode, StoreError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A barrier for a fixed number of parties.
pub struct Barrier {
    name: String,
    path: String,
    parties: usize,
    timeout: Option<Duration>,
    session: Arc<SessionManager>,
    dispatcher: Arc<WatchDispatcher>,
    node: Mutex<Option<String>>,
}

impl Barrier {
    pub(crate) fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        parties: usize,
        timeout: Option<Duration>,
        session: Arc<SessionManager>,
        dispatcher: Arc<WatchDispatcher>,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            parties,
            timeout,
            session,
            dispatcher,
            node: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of parties required to release the barrier.
    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Whether this instance is currently registered. False once the session
    /// has ended, since its party node went with it.
    pub fn has_entered(&self) -> bool {
        self.node.lock().is_some() && !self.session.state().is_terminal()
    }

    /// Number of parties currently registered.
    pub async fn party_count(&self) -> CoordinationResult<usize> {
        match self.session.children(&self.path).await {
            Ok(children) => Ok(sort_sequenced(children, PARTY_PREFIX).len()),
            Err(err) if err.is_no_node() => Ok(0),
            Err(err) => Err(err),
        }
    }

    /// Register and block until at least `parties` parties are present.
    ///
    /// On timeout the registration is withdrawn before the error is returned.
    pub async fn enter(&self) -> CoordinationResult<()> {
        if self.node.lock().is_some() {
            return Err(CoordinationError::IllegalState(format!(
                "already entered barrier '{}'",
                self.name
            )));
        }

        self.session.ensure_path(&self.path).await?;
        let node = self
            .session
            .create_ephemeral_sequential(&join_path(&self.path, PARTY_PREFIX), &[])
            .await?;
        *self.node.lock() = Some(node.clone());

        let sequence = parse_sequence(&node).ok_or_else(|| {
            CoordinationError::IllegalState(format!("party node without sequence: {node}"))
        })?;
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);

        debug!(barrier = %self.name, %node, parties = self.parties, "entered barrier");

        match self.await_release(sequence, deadline).await {
            Ok(true) => {
                info!(barrier = %self.name, "barrier released");
                Ok(())
            }
            Ok(false) => {
                self.withdraw(&node).await;
                Err(CoordinationError::timeout(format!("enter barrier '{}'", self.name)))
            }
            Err(err) => {
                if !err.is_session_lost() {
                    self.withdraw(&node).await;
                }
                *self.node.lock() = None;
                Err(err)
            }
        }
    }

    async fn await_release(&self, sequence: u64, deadline: Option<Instant>) -> CoordinationResult<bool> {
        let ready = join_path(&self.path, READY_NODE);

        loop {
            let waiter = self.dispatcher.waiter(&self.path);
            let parties = sort_sequenced(self.session.watch_children(&self.path).await?, PARTY_PREFIX);

            if parties.len() >= self.parties {
                let newest = parties.last().map(SequencedNode::sequence).unwrap_or(sequence);
                self.record_release(&ready, newest).await?;
                return Ok(true);
            }

            if let Some(released) = self.released_through(&ready).await?
                && sequence <= released
            {
                return Ok(true);
            }

            if waiter.wait(deadline).await? == Wake::TimedOut {
                return Ok(false);
            }
        }
    }

    async fn released_through(&self, ready: &str) -> CoordinationResult<Option<u64>> {
        match self.session.get_data(ready).await {
            Ok((data, _)) => Ok(std::str::from_utf8(&data)
                .ok()
                .and_then(|text| text.parse().ok())),
            Err(err) if err.is_no_node() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Raise the released-through mark to at least `sequence`.
    async fn record_release(&self, ready: &str, sequence: u64) -> CoordinationResult<()> {
        let mark = sequence.to_string();
        loop {
            match self.session.get_data(ready).await {
                Ok((data, stat)) => {
                    let current = std::str::from_utf8(&data)
                        .ok()
                        .and_then(|text| text.parse::<u64>().ok());
                    if current.is_some_and(|current| current >= sequence) {
                        return Ok(());
                    }
                    match self
                        .session
                        .set_data(ready, mark.as_bytes(), Some(stat.version))
                        .await
                    {
                        Ok(_) => return Ok(()),
                        Err(CoordinationError::Store(StoreError::BadVersion(_))) => continue,
                        Err(err) if err.is_no_node() => continue,
                        Err(err) => return Err(err),
                    }
                }
                Err(err) if err.is_no_node() => {
                    match self
                        .session
                        .create(ready, mark.as_bytes(), CreateMode::Persistent)
                        .await
                    {
                        Ok(_) => return Ok(()),
                        Err(CoordinationError::Store(StoreError::NodeExists(_))) => continue,
                        Err(err) => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Withdraw from the barrier. Returns `false` if not entered.
    pub async fn leave(&self) -> CoordinationResult<bool> {
        let node = self.node.lock().take();
        match node {
            Some(node) => {
                self.session.delete(&node, None).await?;
                debug!(barrier = %self.name, "left barrier");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn withdraw(&self, node: &str) {
        *self.node.lock() = None;
        if let Err(err) = self.session.delete(node, None).await {
            warn!(barrier = %self.name, %node, error = %err, "failed to withdraw from barrier");
        }
    }
}

//! Distributed priority queue.
//!
//! Entries are persistent-sequential nodes named
//! `entry-{priority:010}-{sequence:010}`, so the lowest name is the entry to
//! serve next: lower priority values first, FIFO within a priority. A consumer
//! claims an entry by deleting it with the version it read; losing that race
//! moves it on to the next entry.

use crate::dispatcher::{Wake, WatchDispatcher};
use crate::error::{CoordinationError, CoordinationResult};
use crate::paths::{ENTRY_PREFIX, join_path, node_name};
use crate::sequence::{Identifiable, Sequenced, parse_sequence};
use crate::session::SessionManager;
use crate::store::StoreError;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Priority of entries enqueued without one; served after every explicit
/// priority.
pub const DEFAULT_PRIORITY: u32 = u32::MAX;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueEntry {
    priority: u32,
    sequence: u64,
    name: String,
}

impl QueueEntry {
    fn parse(name: &str) -> Option<Self> {
        let rest = name.strip_prefix(ENTRY_PREFIX)?;
        let (priority, _) = rest.split_once('-')?;
        Some(Self {
            priority: priority.parse().ok()?,
            sequence: parse_sequence(name)?,
            name: name.to_string(),
        })
    }
}

impl Identifiable for QueueEntry {
    fn id(&self) -> &str {
        &self.name
    }
}

impl Sequenced for QueueEntry {
    fn sequence(&self) -> u64 {
        self.sequence
    }
}

fn ordered(children: Vec<String>) -> Vec<QueueEntry> {
    let mut entries: Vec<QueueEntry> = children
        .iter()
        .filter_map(|name| QueueEntry::parse(name))
        .collect();
    entries.sort();
    entries
}

/// A named queue shared by every process connected to the same store.
pub struct Queue {
    name: String,
    path: String,
    timeout: Option<Duration>,
    session: Arc<SessionManager>,
    dispatcher: Arc<WatchDispatcher>,
}

impl Queue {
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
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append an entry with [`DEFAULT_PRIORITY`]. Returns the entry's name.
    pub async fn enqueue(&self, data: &[u8]) -> CoordinationResult<String> {
        self.enqueue_with_priority(data, DEFAULT_PRIORITY).await
    }

    /// Append an entry. Lower priority values are served first.
    pub async fn enqueue_with_priority(&self, data: &[u8], priority: u32) -> CoordinationResult<String> {
        let prefix = join_path(&self.path, &format!("{ENTRY_PREFIX}{priority:010}-"));
        let path = match self.session.create_persistent_sequential(&prefix, data).await {
            Err(err) if err.is_no_node() => {
                self.session.ensure_path(&self.path).await?;
                self.session.create_persistent_sequential(&prefix, data).await?
            }
            other => other?,
        };
        trace!(queue = %self.name, %path, priority, "enqueued");
        Ok(node_name(&path).to_string())
    }

    /// Remove and return the head entry, or `None` if the queue is empty.
    pub async fn dequeue(&self) -> CoordinationResult<Option<Vec<u8>>> {
        loop {
            let children = match self.session.children(&self.path).await {
                Ok(children) => children,
                Err(err) if err.is_no_node() => return Ok(None),
                Err(err) => return Err(err),
            };
            let entries = ordered(children);
            if entries.is_empty() {
                return Ok(None);
            }
            if let Some(data) = self.claim_first(entries).await? {
                return Ok(Some(data));
            }
        }
    }

    /// Remove and return the head entry, waiting up to the queue's timeout
    /// for one to arrive. Returns `None` only if the wait timed out.
    pub async fn blocking_dequeue(&self) -> CoordinationResult<Option<Vec<u8>>> {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        self.dequeue_until(deadline).await
    }

    /// Like [`blocking_dequeue`](Self::blocking_dequeue), waiting up to `timeout`.
    pub async fn blocking_dequeue_timeout(&self, timeout: Duration) -> CoordinationResult<Option<Vec<u8>>> {
        self.dequeue_until(Some(Instant::now() + timeout)).await
    }

    async fn dequeue_until(&self, deadline: Option<Instant>) -> CoordinationResult<Option<Vec<u8>>> {
        loop {
            let waiter = self.dispatcher.waiter(&self.path);
            let children = match self.session.watch_children(&self.path).await {
                Ok(children) => children,
                Err(err) if err.is_no_node() => {
                    self.session.ensure_path(&self.path).await?;
                    continue;
                }
                Err(err) => return Err(err),
            };

            if let Some(data) = self.claim_first(ordered(children)).await? {
                return Ok(Some(data));
            }

            if waiter.wait(deadline).await? == Wake::TimedOut {
                debug!(queue = %self.name, "blocking dequeue timed out");
                return Ok(None);
            }
        }
    }

    /// Claim the first entry still present, in order.
    async fn claim_first(&self, entries: Vec<QueueEntry>) -> CoordinationResult<Option<Vec<u8>>> {
        for entry in entries {
            let path = join_path(&self.path, entry.id());
            loop {
                let (data, stat) = match self.session.get_data(&path).await {
                    Ok(found) => found,
                    Err(err) if err.is_no_node() => break,
                    Err(err) => return Err(err),
                };

                match self.session.delete(&path, Some(stat.version)).await {
                    Ok(true) => {
                        debug!(queue = %self.name, entry = entry.id(), "dequeued");
                        return Ok(Some(data));
                    }
                    Ok(false) => break,
                    Err(CoordinationError::Store(StoreError::BadVersion(_))) => continue,
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(None)
    }

    /// Head entry without removing it.
    pub async fn peek(&self) -> CoordinationResult<Option<Vec<u8>>> {
        let children = match self.session.children(&self.path).await {
            Ok(children) => children,
            Err(err) if err.is_no_node() => return Ok(None),
            Err(err) => return Err(err),
        };

        for entry in ordered(children) {
            match self.session.get_data(&join_path(&self.path, entry.id())).await {
                Ok((data, _)) => return Ok(Some(data)),
                Err(err) if err.is_no_node() => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// Number of entries.
    pub async fn len(&self) -> CoordinationResult<usize> {
        match self.session.children(&self.path).await {
            Ok(children) => Ok(ordered(children).len()),
            Err(err) if err.is_no_node() => Ok(0),
            Err(err) => Err(err),
        }
    }

    pub async fn is_empty(&self) -> CoordinationResult<bool> {
        Ok(self.len().await? == 0)
    }
}

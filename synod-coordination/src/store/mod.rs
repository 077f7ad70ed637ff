//! Coordination store seam.
//!
//! Every primitive talks to the backing store through [`CoordinationStore`],
//! a handle bound to one client session. A [`StoreConnector`] opens such a
//! session and routes the session's watch notifications and connection state
//! changes into an [`EventSink`], which the watch dispatcher drains.

pub mod memory;
#[cfg(feature = "zookeeper")]
pub mod zookeeper;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::InMemoryStore;
#[cfg(feature = "zookeeper")]
pub use zookeeper::ZooKeeperConnector;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Store-level errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Version mismatch on {0}")]
    BadVersion(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Ephemeral node cannot have children: {0}")]
    NoChildrenForEphemerals(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Connection lost")]
    ConnectionLoss,

    #[error("Session expired")]
    SessionExpired,

    #[error("Session closed")]
    Closed,

    #[error("Store error: {0}")]
    Other(String),
}

impl StoreError {
    /// Check if this error is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionLoss)
    }
}

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Self::Ephemeral | Self::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(self, Self::PersistentSequential | Self::EphemeralSequential)
    }
}

/// Node metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    /// Data version, incremented on every write.
    pub version: i32,
    /// Number of children.
    pub num_children: usize,
    /// Whether the node is ephemeral.
    pub ephemeral: bool,
}

/// Kind of change reported by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

/// A fired watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub kind: EventKind,
    pub path: String,
}

impl WatchedEvent {
    pub fn new(kind: EventKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

/// Connection state changes reported by the store client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connected or reconnected with the session intact.
    Connected,
    /// Connection lost; the session may still be recovered.
    Disconnected,
    /// The store expired the session.
    Expired,
    /// The session was closed.
    Closed,
}

/// Notification pushed by the store client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Watch(WatchedEvent),
    Connection(ConnectionState),
}

/// Channel receiving a session's notifications.
///
/// The in-memory store delivers in program order. Backends that forward
/// watches concurrently only guarantee order per path.
pub type EventSink = mpsc::UnboundedSender<StoreEvent>;

/// Parameters for opening a session.
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    /// Comma-separated `host[:port]` list.
    pub connection_string: String,
    /// Requested session timeout.
    pub session_timeout: Duration,
}

/// A client session on the coordination store.
///
/// Watches requested with `watch = true` are one-shot and are delivered to
/// the session's [`EventSink`].
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Store-assigned session identifier.
    fn session_id(&self) -> u64;

    /// Create a node and return its actual path (with the sequence suffix for
    /// sequential modes).
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> StoreResult<String>;

    /// Delete a node, optionally only if its version matches.
    async fn delete(&self, path: &str, version: Option<i32>) -> StoreResult<()>;

    /// Node metadata, `None` if absent. A watch set here also fires on creation.
    async fn exists(&self, path: &str, watch: bool) -> StoreResult<Option<Stat>>;

    /// Node payload and metadata.
    async fn get_data(&self, path: &str, watch: bool) -> StoreResult<(Vec<u8>, Stat)>;

    /// Replace a node's payload, optionally only if its version matches.
    async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> StoreResult<Stat>;

    /// Names (not paths) of a node's children, in no particular order.
    async fn get_children(&self, path: &str, watch: bool) -> StoreResult<Vec<String>>;

    /// End the session, removing its ephemeral nodes.
    async fn close(&self) -> StoreResult<()>;
}

/// Opens sessions on a coordination store.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(
        &self,
        settings: &ConnectSettings,
        events: EventSink,
    ) -> StoreResult<Arc<dyn CoordinationStore>>;
}

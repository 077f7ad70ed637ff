//! In-process coordination store.
//!
//! Keeps a node tree behind a single mutex and mimics the store semantics the
//! primitives rely on: ephemeral nodes owned by a session, per-parent sequence
//! counters, one-shot data and child watches, versioned writes and session
//! expiry. Used as the default backend for tests and single-process setups,
//! with hooks to inject connection loss and session expiry.

use super::{
    ConnectSettings, ConnectionState, CoordinationStore, CreateMode, EventKind, EventSink, Stat,
    StoreConnector, StoreError, StoreEvent, StoreResult, WatchedEvent,
};
use crate::paths::{node_name, parent_path};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct Node {
    data: Vec<u8>,
    version: i32,
    ephemeral_owner: Option<u64>,
    children: BTreeSet<String>,
    next_sequence: u64,
}

impl Node {
    fn stat(&self) -> Stat {
        Stat {
            version: self.version,
            num_children: self.children.len(),
            ephemeral: self.ephemeral_owner.is_some(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotStatus {
    Connected,
    Disconnected,
    Expired,
    Closed,
}

struct SessionSlot {
    sink: EventSink,
    status: SlotStatus,
    injected_failures: u32,
    ephemerals: BTreeSet<String>,
}

struct Tree {
    nodes: HashMap<String, Node>,
    sessions: HashMap<u64, SessionSlot>,
    next_session: u64,
    refused_connects: u32,
    data_watches: HashMap<String, HashSet<u64>>,
    child_watches: HashMap<String, HashSet<u64>>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), Node::default());
        Self {
            nodes,
            sessions: HashMap::new(),
            next_session: 1,
            refused_connects: 0,
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
        }
    }

    fn check_session(&mut self, session: u64) -> StoreResult<()> {
        let slot = self.sessions.get_mut(&session).ok_or(StoreError::Closed)?;
        match slot.status {
            SlotStatus::Connected => {}
            SlotStatus::Disconnected => return Err(StoreError::ConnectionLoss),
            SlotStatus::Expired => return Err(StoreError::SessionExpired),
            SlotStatus::Closed => return Err(StoreError::Closed),
        }
        if slot.injected_failures > 0 {
            slot.injected_failures -= 1;
            return Err(StoreError::ConnectionLoss);
        }
        Ok(())
    }

    fn notify(&self, session: u64, event: StoreEvent) {
        if let Some(slot) = self.sessions.get(&session) {
            let _ = slot.sink.send(event);
        }
    }

    fn fire(&mut self, watches: WatchSet, path: &str, kind: EventKind) {
        let watchers = match watches {
            WatchSet::Data => self.data_watches.remove(path),
            WatchSet::Children => self.child_watches.remove(path),
        };
        for session in watchers.into_iter().flatten() {
            self.notify(session, StoreEvent::Watch(WatchedEvent::new(kind, path)));
        }
    }

    fn create(
        &mut self,
        session: u64,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> StoreResult<String> {
        validate_path(path)?;
        if path == "/" {
            return Err(StoreError::NodeExists(path.to_string()));
        }

        let parent = parent_path(path).to_string();
        let parent_node = self
            .nodes
            .get_mut(&parent)
            .ok_or_else(|| StoreError::NoNode(parent.clone()))?;
        if parent_node.ephemeral_owner.is_some() {
            return Err(StoreError::NoChildrenForEphemerals(parent));
        }

        let actual = if mode.is_sequential() {
            let sequence = parent_node.next_sequence;
            parent_node.next_sequence += 1;
            format!("{path}{sequence:010}")
        } else {
            path.to_string()
        };

        if self.nodes.contains_key(&actual) {
            return Err(StoreError::NodeExists(actual));
        }

        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.insert(node_name(&actual).to_string());
        }

        let owner = mode.is_ephemeral().then_some(session);
        self.nodes.insert(
            actual.clone(),
            Node {
                data: data.to_vec(),
                ephemeral_owner: owner,
                ..Default::default()
            },
        );
        if let Some(slot) = owner.and_then(|id| self.sessions.get_mut(&id)) {
            slot.ephemerals.insert(actual.clone());
        }

        self.fire(WatchSet::Data, &actual, EventKind::NodeCreated);
        self.fire(WatchSet::Children, &parent, EventKind::NodeChildrenChanged);
        Ok(actual)
    }

    fn delete(&mut self, path: &str, version: Option<i32>) -> StoreResult<()> {
        validate_path(path)?;
        if path == "/" {
            return Err(StoreError::InvalidPath(path.to_string()));
        }

        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        if let Some(expected) = version
            && expected != node.version
        {
            return Err(StoreError::BadVersion(path.to_string()));
        }
        if !node.children.is_empty() {
            return Err(StoreError::NotEmpty(path.to_string()));
        }

        self.remove_node(path);
        Ok(())
    }

    fn remove_node(&mut self, path: &str) {
        let Some(node) = self.nodes.remove(path) else {
            return;
        };

        if let Some(slot) = node.ephemeral_owner.and_then(|id| self.sessions.get_mut(&id)) {
            slot.ephemerals.remove(path);
        }

        let parent = parent_path(path).to_string();
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.remove(node_name(path));
        }

        self.fire(WatchSet::Data, path, EventKind::NodeDeleted);
        self.fire(WatchSet::Children, path, EventKind::NodeDeleted);
        self.fire(WatchSet::Children, &parent, EventKind::NodeChildrenChanged);
    }

    fn exists(&mut self, session: u64, path: &str, watch: bool) -> StoreResult<Option<Stat>> {
        validate_path(path)?;
        if watch {
            self.data_watches
                .entry(path.to_string())
                .or_default()
                .insert(session);
        }
        Ok(self.nodes.get(path).map(Node::stat))
    }

    fn get_data(&mut self, session: u64, path: &str, watch: bool) -> StoreResult<(Vec<u8>, Stat)> {
        validate_path(path)?;
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        let result = (node.data.clone(), node.stat());
        if watch {
            self.data_watches
                .entry(path.to_string())
                .or_default()
                .insert(session);
        }
        Ok(result)
    }

    fn set_data(&mut self, path: &str, data: &[u8], version: Option<i32>) -> StoreResult<Stat> {
        validate_path(path)?;
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        if let Some(expected) = version
            && expected != node.version
        {
            return Err(StoreError::BadVersion(path.to_string()));
        }

        node.data = data.to_vec();
        node.version += 1;
        let stat = node.stat();

        self.fire(WatchSet::Data, path, EventKind::NodeDataChanged);
        Ok(stat)
    }

    fn get_children(&mut self, session: u64, path: &str, watch: bool) -> StoreResult<Vec<String>> {
        validate_path(path)?;
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        let children = node.children.iter().cloned().collect();
        if watch {
            self.child_watches
                .entry(path.to_string())
                .or_default()
                .insert(session);
        }
        Ok(children)
    }

    /// Terminate a live session: drop its watches, then its ephemeral nodes.
    fn end_session(&mut self, session: u64, status: SlotStatus) -> bool {
        let ephemerals = match self.sessions.get_mut(&session) {
            Some(slot) if matches!(slot.status, SlotStatus::Connected | SlotStatus::Disconnected) => {
                slot.status = status;
                std::mem::take(&mut slot.ephemerals)
            }
            _ => return false,
        };

        for watchers in self.data_watches.values_mut() {
            watchers.remove(&session);
        }
        for watchers in self.child_watches.values_mut() {
            watchers.remove(&session);
        }

        for path in ephemerals.iter().rev() {
            self.remove_node(path);
        }
        true
    }

    fn set_status(&mut self, session: u64, from: SlotStatus, to: SlotStatus) -> bool {
        match self.sessions.get_mut(&session) {
            Some(slot) if slot.status == from => {
                slot.status = to;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum WatchSet {
    Data,
    Children,
}

fn validate_path(path: &str) -> StoreResult<()> {
    let valid = path == "/"
        || (path.starts_with('/') && !path.ends_with('/') && !path.contains("//"));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidPath(path.to_string()))
    }
}

/// In-process store shared by every session connected through it.
///
/// Cloning yields another handle on the same tree.
#[derive(Clone)]
pub struct InMemoryStore {
    tree: Arc<Mutex<Tree>>,
}

impl InMemoryStore {
    /// Create an empty store containing only the root node.
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree::new())),
        }
    }

    /// Identifiers of sessions that are neither expired nor closed.
    pub fn live_sessions(&self) -> Vec<u64> {
        let tree = self.tree.lock();
        let mut ids: Vec<u64> = tree
            .sessions
            .iter()
            .filter(|(_, slot)| {
                matches!(slot.status, SlotStatus::Connected | SlotStatus::Disconnected)
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Expire a session as the store would after its timeout: its ephemeral
    /// nodes are removed and the client is told the session expired.
    pub fn expire_session(&self, session_id: u64) -> bool {
        let mut tree = self.tree.lock();
        if !tree.end_session(session_id, SlotStatus::Expired) {
            return false;
        }
        info!(session_id, "expired in-memory session");
        tree.notify(session_id, StoreEvent::Connection(ConnectionState::Expired));
        true
    }

    /// Simulate a lost connection. The session survives; operations fail with
    /// connection loss until [`reconnect_session`](Self::reconnect_session).
    pub fn disconnect_session(&self, session_id: u64) -> bool {
        let mut tree = self.tree.lock();
        if !tree.set_status(session_id, SlotStatus::Connected, SlotStatus::Disconnected) {
            return false;
        }
        warn!(session_id, "disconnected in-memory session");
        tree.notify(
            session_id,
            StoreEvent::Connection(ConnectionState::Disconnected),
        );
        true
    }

    /// Restore a disconnected session with its watches and ephemerals intact.
    pub fn reconnect_session(&self, session_id: u64) -> bool {
        let mut tree = self.tree.lock();
        if !tree.set_status(session_id, SlotStatus::Disconnected, SlotStatus::Connected) {
            return false;
        }
        info!(session_id, "reconnected in-memory session");
        tree.notify(session_id, StoreEvent::Connection(ConnectionState::Connected));
        true
    }

    /// Fail the next `failures` operations of a session with connection loss.
    pub fn inject_connection_loss(&self, session_id: u64, failures: u32) {
        if let Some(slot) = self.tree.lock().sessions.get_mut(&session_id) {
            slot.injected_failures += failures;
        }
    }

    /// Refuse the next `attempts` connection attempts with connection loss.
    pub fn refuse_connections(&self, attempts: u32) {
        self.tree.lock().refused_connects += attempts;
    }

    /// Whether a node exists.
    pub fn contains(&self, path: &str) -> bool {
        self.tree.lock().nodes.contains_key(path)
    }

    /// Sorted child names of a node, empty if the node is absent.
    pub fn children_of(&self, path: &str) -> Vec<String> {
        self.tree
            .lock()
            .nodes
            .get(path)
            .map(|node| node.children.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total number of nodes, including the root.
    pub fn node_count(&self) -> usize {
        self.tree.lock().nodes.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreConnector for InMemoryStore {
    async fn connect(
        &self,
        settings: &ConnectSettings,
        events: EventSink,
    ) -> StoreResult<Arc<dyn CoordinationStore>> {
        let mut tree = self.tree.lock();
        if tree.refused_connects > 0 {
            tree.refused_connects -= 1;
            return Err(StoreError::ConnectionLoss);
        }

        let id = tree.next_session;
        tree.next_session += 1;
        tree.sessions.insert(
            id,
            SessionSlot {
                sink: events,
                status: SlotStatus::Connected,
                injected_failures: 0,
                ephemerals: BTreeSet::new(),
            },
        );

        debug!(
            session_id = id,
            session_timeout_ms = settings.session_timeout.as_millis() as u64,
            "opened in-memory session"
        );

        Ok(Arc::new(MemorySession {
            tree: self.tree.clone(),
            id,
        }))
    }
}

/// A session handle on an [`InMemoryStore`].
struct MemorySession {
    tree: Arc<Mutex<Tree>>,
    id: u64,
}

#[async_trait]
impl CoordinationStore for MemorySession {
    fn session_id(&self) -> u64 {
        self.id
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> StoreResult<String> {
        let mut tree = self.tree.lock();
        tree.check_session(self.id)?;
        tree.create(self.id, path, data, mode)
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> StoreResult<()> {
        let mut tree = self.tree.lock();
        tree.check_session(self.id)?;
        tree.delete(path, version)
    }

    async fn exists(&self, path: &str, watch: bool) -> StoreResult<Option<Stat>> {
        let mut tree = self.tree.lock();
        tree.check_session(self.id)?;
        tree.exists(self.id, path, watch)
    }

    async fn get_data(&self, path: &str, watch: bool) -> StoreResult<(Vec<u8>, Stat)> {
        let mut tree = self.tree.lock();
        tree.check_session(self.id)?;
        tree.get_data(self.id, path, watch)
    }

    async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> StoreResult<Stat> {
        let mut tree = self.tree.lock();
        tree.check_session(self.id)?;
        tree.set_data(path, data, version)
    }

    async fn get_children(&self, path: &str, watch: bool) -> StoreResult<Vec<String>> {
        let mut tree = self.tree.lock();
        tree.check_session(self.id)?;
        tree.get_children(self.id, path, watch)
    }

    async fn close(&self) -> StoreResult<()> {
        let mut tree = self.tree.lock();
        if tree.end_session(self.id, SlotStatus::Closed) {
            debug!(session_id = self.id, "closed in-memory session");
        }
        Ok(())
    }
}

//! ZooKeeper store backend.
//!
//! Adapts an async [`zookeeper_client::Client`] to [`CoordinationStore`].
//! Every one-shot watcher returned by the client is forwarded to the event
//! sink by a small task, and session state changes are forwarded by a
//! long-running state watcher task.
//!
//! Watch events for different paths may therefore reach the sink in a
//! different order than the server sent them. Nothing depends on that order:
//! the dispatcher re-reads a node with a fresh watch on every fire, and each
//! path has at most one pending watch per session, so the last delivery for
//! a path always observes its latest state.

use super::{
    ConnectSettings, ConnectionState, CoordinationStore, CreateMode, EventKind, EventSink, Stat,
    StoreConnector, StoreError, StoreEvent, StoreResult, WatchedEvent,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};
use zookeeper_client as zk;

/// Opens sessions on a ZooKeeper ensemble.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZooKeeperConnector;

#[async_trait]
impl StoreConnector for ZooKeeperConnector {
    async fn connect(
        &self,
        settings: &ConnectSettings,
        events: EventSink,
    ) -> StoreResult<Arc<dyn CoordinationStore>> {
        let client = zk::Client::connector()
            .session_timeout(settings.session_timeout)
            .connect(&settings.connection_string)
            .await
            .map_err(|err| {
                debug!(servers = %settings.connection_string, error = %err, "zookeeper connect failed");
                StoreError::ConnectionLoss
            })?;

        let session_id = client.session_id().0 as u64;
        info!(servers = %settings.connection_string, session_id, "zookeeper session established");

        spawn_state_forwarder(client.state_watcher(), events.clone());

        Ok(Arc::new(ZooKeeperSession {
            client: RwLock::new(Some(client)),
            session_id,
            events,
        }))
    }
}

struct ZooKeeperSession {
    client: RwLock<Option<zk::Client>>,
    session_id: u64,
    events: EventSink,
}

impl ZooKeeperSession {
    fn client(&self) -> StoreResult<zk::Client> {
        self.client.read().clone().ok_or(StoreError::Closed)
    }

    /// Forward one watcher. Order across paths is not preserved.
    fn forward(&self, watcher: zk::OneshotWatcher) {
        let events = self.events.clone();
        tokio::spawn(async move {
            let event = watcher.changed().await;
            let kind = match event.event_type {
                zk::EventType::NodeCreated => EventKind::NodeCreated,
                zk::EventType::NodeDeleted => EventKind::NodeDeleted,
                zk::EventType::NodeDataChanged => EventKind::NodeDataChanged,
                zk::EventType::NodeChildrenChanged => EventKind::NodeChildrenChanged,
                // Session events are reported by the state watcher.
                _ => return,
            };
            let _ = events.send(StoreEvent::Watch(WatchedEvent::new(kind, event.path)));
        });
    }
}

fn spawn_state_forwarder(mut watcher: zk::StateWatcher, events: EventSink) {
    tokio::spawn(async move {
        loop {
            let state = match watcher.changed().await {
                zk::SessionState::SyncConnected | zk::SessionState::ConnectedReadOnly => {
                    ConnectionState::Connected
                }
                zk::SessionState::Disconnected => ConnectionState::Disconnected,
                zk::SessionState::Expired => ConnectionState::Expired,
                _ => ConnectionState::Closed,
            };
            if events.send(StoreEvent::Connection(state)).is_err() {
                break;
            }
            if matches!(state, ConnectionState::Expired | ConnectionState::Closed) {
                break;
            }
        }
    });
}

fn map_error(err: zk::Error, path: &str) -> StoreError {
    match err {
        zk::Error::NoNode => StoreError::NoNode(path.to_string()),
        zk::Error::NodeExists => StoreError::NodeExists(path.to_string()),
        zk::Error::BadVersion => StoreError::BadVersion(path.to_string()),
        zk::Error::NotEmpty => StoreError::NotEmpty(path.to_string()),
        zk::Error::NoChildrenForEphemerals => StoreError::NoChildrenForEphemerals(path.to_string()),
        zk::Error::BadArguments(reason) => StoreError::InvalidPath(format!("{path}: {reason}")),
        zk::Error::ConnectionLoss => StoreError::ConnectionLoss,
        zk::Error::SessionExpired => StoreError::SessionExpired,
        zk::Error::ClientClosed => StoreError::Closed,
        other => StoreError::Other(other.to_string()),
    }
}

fn map_stat(stat: &zk::Stat) -> Stat {
    Stat {
        version: stat.version,
        num_children: stat.num_children.max(0) as usize,
        ephemeral: stat.ephemeral_owner != 0,
    }
}

fn map_mode(mode: CreateMode) -> zk::CreateMode {
    match mode {
        CreateMode::Persistent => zk::CreateMode::Persistent,
        CreateMode::PersistentSequential => zk::CreateMode::PersistentSequential,
        CreateMode::Ephemeral => zk::CreateMode::Ephemeral,
        CreateMode::EphemeralSequential => zk::CreateMode::EphemeralSequential,
    }
}

#[async_trait]
impl CoordinationStore for ZooKeeperSession {
    fn session_id(&self) -> u64 {
        self.session_id
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> StoreResult<String> {
        let options = map_mode(mode).with_acls(zk::Acls::anyone_all());
        let (_, sequence) = self
            .client()?
            .create(path, data, &options)
            .await
            .map_err(|err| map_error(err, path))?;

        if mode.is_sequential() {
            Ok(format!("{path}{sequence}"))
        } else {
            Ok(path.to_string())
        }
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> StoreResult<()> {
        self.client()?
            .delete(path, version)
            .await
            .map_err(|err| map_error(err, path))
    }

    async fn exists(&self, path: &str, watch: bool) -> StoreResult<Option<Stat>> {
        let client = self.client()?;
        if !watch {
            let stat = client
                .check_stat(path)
                .await
                .map_err(|err| map_error(err, path))?;
            return Ok(stat.as_ref().map(map_stat));
        }

        let (stat, watcher) = client
            .check_and_watch_stat(path)
            .await
            .map_err(|err| map_error(err, path))?;
        self.forward(watcher);
        Ok(stat.as_ref().map(map_stat))
    }

    async fn get_data(&self, path: &str, watch: bool) -> StoreResult<(Vec<u8>, Stat)> {
        let client = self.client()?;
        if !watch {
            let (data, stat) = client
                .get_data(path)
                .await
                .map_err(|err| map_error(err, path))?;
            return Ok((data, map_stat(&stat)));
        }

        let (data, stat, watcher) = client
            .get_and_watch_data(path)
            .await
            .map_err(|err| map_error(err, path))?;
        self.forward(watcher);
        Ok((data, map_stat(&stat)))
    }

    async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> StoreResult<Stat> {
        let stat = self
            .client()?
            .set_data(path, data, version)
            .await
            .map_err(|err| map_error(err, path))?;
        Ok(map_stat(&stat))
    }

    async fn get_children(&self, path: &str, watch: bool) -> StoreResult<Vec<String>> {
        let client = self.client()?;
        if !watch {
            return client
                .list_children(path)
                .await
                .map_err(|err| map_error(err, path));
        }

        let (children, watcher) = client
            .list_and_watch_children(path)
            .await
            .map_err(|err| map_error(err, path))?;
        self.forward(watcher);
        Ok(children)
    }

    async fn close(&self) -> StoreResult<()> {
        // Dropping the last client handle ends the session.
        if self.client.write().take().is_some() {
            debug!(session_id = self.session_id, "zookeeper session closed");
        }
        Ok(())
    }
}

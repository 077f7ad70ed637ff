//! Coordination service facade.
//!
//! [`CoordinationService`] owns the store session and its watch dispatcher
//! and hands out the coordination primitives. Every primitive created by a
//! service shares its session: when the service closes or the session
//! expires, all of them stop.

use crate::barrier::Barrier;
use crate::dispatcher::WatchDispatcher;
use crate::error::{CoordinationError, CoordinationResult};
use crate::group::{Group, GroupEventListener};
use crate::lock::Lock;
use crate::paths::PathRegistry;
use crate::queue::Queue;
use crate::session::{SessionManager, SessionState};
use crate::store::{ConnectSettings, StoreConnector};
use std::sync::Arc;
use std::time::Duration;
use synod_config::CoordinationConfiguration;
use tokio::sync::watch;
use tracing::info;

/// Entry point to the coordination primitives.
///
/// # Examples
///
/// ```rust,ignore
/// use synod_coordination::prelude::*;
///
/// let config = CoordinationConfiguration::load("coordination.xml")?;
/// let service = CoordinationService::connect_zookeeper(config).await?;
///
/// let lock = service.create_lock("reindex", Some(Duration::from_secs(10))).await?;
/// lock.acquire().await?;
/// // critical section
/// lock.release().await?;
///
/// service.close().await;
/// ```
pub struct CoordinationService {
    config: CoordinationConfiguration,
    paths: PathRegistry,
    session: Arc<SessionManager>,
    dispatcher: Arc<WatchDispatcher>,
}

impl CoordinationService {
    /// Open a session through `connector` and start dispatching watches.
    ///
    /// Fails with [`CoordinationError::ServiceDisabled`] if the configuration
    /// disables the service, and with [`CoordinationError::Connection`] if no
    /// session could be established within the session timeout.
    pub async fn connect(
        config: CoordinationConfiguration,
        connector: &dyn StoreConnector,
    ) -> CoordinationResult<Self> {
        if !config.is_enabled() {
            return Err(CoordinationError::ServiceDisabled);
        }

        let settings = ConnectSettings {
            connection_string: config.connection_string(),
            session_timeout: config.session_timeout,
        };
        let (session, events) = SessionManager::connect(connector, settings).await?;
        let dispatcher = WatchDispatcher::start(Arc::clone(&session), events);
        let paths = PathRegistry::new(config.root_path.clone());

        info!(
            session_id = session.session_id(),
            root = %paths.root(),
            "coordination service started"
        );

        Ok(Self {
            config,
            paths,
            session,
            dispatcher,
        })
    }

    /// Connect to the ZooKeeper ensemble named in the configuration.
    #[cfg(feature = "zookeeper")]
    pub async fn connect_zookeeper(config: CoordinationConfiguration) -> CoordinationResult<Self> {
        Self::connect(config, &crate::store::ZooKeeperConnector).await
    }

    pub fn configuration(&self) -> &CoordinationConfiguration {
        &self.config
    }

    /// Store-assigned id of this service's session.
    pub fn session_id(&self) -> u64 {
        self.session.session_id()
    }

    /// Whether the session is currently connected.
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    /// Stream of session state changes.
    pub fn session_events(&self) -> watch::Receiver<SessionState> {
        self.session.subscribe()
    }

    /// Join a group.
    pub async fn create_group(&self, name: &str) -> CoordinationResult<Group> {
        self.create_group_with_payload(name, &[]).await
    }

    /// Join a group, storing `payload` on this member's node.
    pub async fn create_group_with_payload(&self, name: &str, payload: &[u8]) -> CoordinationResult<Group> {
        self.join_group(name, payload, None).await
    }

    /// Join a group with `listener` registered before the membership goes
    /// live, so no event or peer request of the join is missed.
    pub async fn create_group_with_listener(
        &self,
        name: &str,
        payload: &[u8],
        listener: Arc<dyn GroupEventListener>,
    ) -> CoordinationResult<Group> {
        self.join_group(name, payload, Some(listener)).await
    }

    async fn join_group(
        &self,
        name: &str,
        payload: &[u8],
        listener: Option<Arc<dyn GroupEventListener>>,
    ) -> CoordinationResult<Group> {
        self.session.state().check()?;
        Group::join(
            name,
            self.paths.group(name)?,
            payload,
            listener,
            self.config.message_timeout,
            Arc::clone(&self.session),
            Arc::clone(&self.dispatcher),
        )
        .await
    }

    /// A lock named `name`. `None` waits indefinitely on `acquire`.
    pub async fn create_lock(&self, name: &str, timeout: Option<Duration>) -> CoordinationResult<Lock> {
        self.session.state().check()?;
        let path = self.paths.lock(name)?;
        self.session.ensure_path(&path).await?;
        Ok(Lock::new(
            name,
            path,
            timeout,
            Arc::clone(&self.session),
            Arc::clone(&self.dispatcher),
        ))
    }

    /// A barrier that releases once `parties` participants have entered.
    pub async fn create_barrier(
        &self,
        name: &str,
        parties: usize,
        timeout: Option<Duration>,
    ) -> CoordinationResult<Barrier> {
        self.session.state().check()?;
        if parties == 0 {
            return Err(CoordinationError::IllegalState(format!(
                "barrier '{name}' needs at least one party"
            )));
        }
        let path = self.paths.barrier(name)?;
        self.session.ensure_path(&path).await?;
        Ok(Barrier::new(
            name,
            path,
            parties,
            timeout,
            Arc::clone(&self.session),
            Arc::clone(&self.dispatcher),
        ))
    }

    /// A queue; `timeout` bounds [`Queue::blocking_dequeue`].
    pub async fn create_queue(&self, name: &str, timeout: Option<Duration>) -> CoordinationResult<Queue> {
        self.session.state().check()?;
        let path = self.paths.queue(name)?;
        self.session.ensure_path(&path).await?;
        Ok(Queue::new(
            name,
            path,
            timeout,
            Arc::clone(&self.session),
            Arc::clone(&self.dispatcher),
        ))
    }

    /// Close the session and stop the dispatcher. Blocked calls fail with
    /// [`CoordinationError::Closed`]. Idempotent.
    pub async fn close(&self) {
        self.session.close().await;
        self.dispatcher.shutdown().await;
    }
}

impl std::fmt::Debug for CoordinationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationService")
            .field("root", &self.paths.root())
            .field("session", &self.session)
            .finish()
    }
}

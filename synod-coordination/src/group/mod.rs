//! Group membership and leader election.
//!
//! Every member owns one ephemeral-sequential node under the group's
//! `members` directory; its node name is its member id. Leadership is not
//! stored anywhere: the leader is the member with the smallest sequence
//! number, recomputed from the ordered member list whenever the membership
//! watch fires.
//!
//! # Examples
//!
//! ```rust,ignore
//! use synod_coordination::prelude::*;
//!
//! let group = service.create_group("workers").await?;
//! group.set_group_event_listener(Arc::new(MyListener));
//!
//! if group.is_leader() {
//!     group.broadcast(b"rebalance").await?;
//! }
//! ```

mod listener;
mod messaging;

pub use listener::{GroupEventListener, PeerReply};
pub use messaging::MAX_NODE_PAYLOAD;

use crate::dispatcher::{Interest, SubscriptionId, WatchDispatcher, WatchHandler};
use crate::error::{CoordinationError, CoordinationResult};
use crate::lock::Lock;
use crate::paths::{GroupPaths, MEMBER_PREFIX, MESSAGE_PREFIX, join_path, node_name, validate_name};
use crate::sequence::{Sequenced, Turn, sort_sequenced, wait_for_turn};
use crate::session::{SessionManager, SessionState};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct MembershipView {
    members: Vec<String>,
    leader: Option<String>,
    initialized: bool,
}

/// Membership delta computed from two views.
struct MembershipChange {
    arrived: Vec<String>,
    departed: Vec<String>,
    leader: Option<String>,
}

pub(crate) struct GroupInner {
    this: Weak<GroupInner>,
    name: String,
    paths: GroupPaths,
    member_id: String,
    member_path: String,
    request_channel: String,
    message_timeout: Duration,
    session: Arc<SessionManager>,
    dispatcher: Arc<WatchDispatcher>,
    view: Mutex<MembershipView>,
    members_tx: watch::Sender<Vec<String>>,
    listener: RwLock<Option<Arc<dyn GroupEventListener>>>,
    active: AtomicBool,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    broadcast_cursor: Mutex<Option<u64>>,
}

/// A process's membership in a named group.
///
/// Cloning yields another handle on the same membership. Dropping the last
/// handle leaves the group in the background.
#[derive(Clone)]
pub struct Group {
    inner: Arc<GroupInner>,
}

impl Group {
    /// Join a group: create its directories if needed, register this
    /// process's member node and start watching membership and messages.
    pub(crate) async fn join(
        name: &str,
        paths: GroupPaths,
        payload: &[u8],
        listener: Option<Arc<dyn GroupEventListener>>,
        message_timeout: Duration,
        session: Arc<SessionManager>,
        dispatcher: Arc<WatchDispatcher>,
    ) -> CoordinationResult<Self> {
        for path in [&paths.members, &paths.broadcast, &paths.requests, &paths.responses] {
            session.ensure_path(path).await?;
        }

        let member_path = session
            .create_ephemeral_sequential(&join_path(&paths.members, MEMBER_PREFIX), payload)
            .await?;
        let member_id = node_name(&member_path).to_string();
        let request_channel = paths.request_channel(&member_id);

        let inner = Arc::new_cyclic(|this| GroupInner {
            this: this.clone(),
            name: name.to_string(),
            paths,
            member_id,
            member_path,
            request_channel,
            message_timeout,
            session,
            dispatcher,
            view: Mutex::new(MembershipView::default()),
            members_tx: watch::channel(Vec::new()).0,
            listener: RwLock::new(listener),
            active: AtomicBool::new(true),
            subscriptions: Mutex::new(Vec::new()),
            broadcast_cursor: Mutex::new(None),
        });

        if let Err(err) = inner.activate().await {
            inner.deactivate().await;
            return Err(err);
        }

        info!(group = %inner.name, member_id = %inner.member_id, "joined group");
        Ok(Self { inner })
    }

    /// Group name.
    pub fn group_name(&self) -> &str {
        &self.inner.name
    }

    /// This process's member id.
    pub fn member_id(&self) -> &str {
        &self.inner.member_id
    }

    /// Whether this membership is still live.
    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    /// Ids of the current members, ordered by join sequence, read from the
    /// store.
    pub async fn member_ids(&self) -> CoordinationResult<Vec<String>> {
        self.inner.ensure_active()?;
        let children = self.inner.session.children(&self.inner.paths.members).await?;
        Ok(sort_sequenced(children, MEMBER_PREFIX)
            .into_iter()
            .map(|member| member.name().to_string())
            .collect())
    }

    /// Current leader according to this member's view.
    pub fn leader_id(&self) -> Option<String> {
        if !self.inner.is_active() {
            return None;
        }
        self.inner.view.lock().leader.clone()
    }

    /// Whether this member is the leader.
    pub fn is_leader(&self) -> bool {
        self.leader_id().as_deref() == Some(self.inner.member_id.as_str())
    }

    /// Payload a member stored when it joined.
    pub async fn member_payload(&self, member_id: &str) -> CoordinationResult<Vec<u8>> {
        self.inner.ensure_active()?;
        let path = self.inner.paths.member(validate_name(member_id)?);
        match self.inner.session.get_data(&path).await {
            Ok((data, _)) => Ok(data),
            Err(err) if err.is_no_node() => Err(CoordinationError::IllegalState(format!(
                "{member_id} is not a member of group '{}'",
                self.inner.name
            ))),
            Err(err) => Err(err),
        }
    }

    /// Register the callbacks for this membership, replacing any previous
    /// listener.
    ///
    /// Peer requests handled before a listener is registered fail. Use
    /// [`CoordinationService::create_group_with_listener`](crate::CoordinationService::create_group_with_listener)
    /// to serve requests from the moment of joining.
    pub fn set_group_event_listener(&self, listener: Arc<dyn GroupEventListener>) {
        *self.inner.listener.write() = Some(listener);
    }

    /// Wait until at least `count` members are present.
    pub async fn wait_for_member_count(&self, count: usize, timeout: Option<Duration>) -> CoordinationResult<()> {
        self.inner.ensure_active()?;

        let mut members = self.inner.members_tx.subscribe();
        let mut states = self.inner.session.subscribe();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let expiry = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            state = states.wait_for(SessionState::is_terminal) => {
                Err(state.map(|state| state.lost_error()).unwrap_or(CoordinationError::Closed))
            }
            reached = members.wait_for(|members| members.len() >= count) => {
                reached.map(|_| ()).map_err(|_| CoordinationError::Closed)
            }
            () = expiry => Err(CoordinationError::timeout(format!(
                "wait for {count} members of group '{}'",
                self.inner.name
            ))),
        }
    }

    /// Wait until this member leads the group, watching only the member
    /// directly ahead of it.
    pub async fn wait_for_leadership(&self, timeout: Option<Duration>) -> CoordinationResult<()> {
        self.inner.ensure_active()?;
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        let turn = wait_for_turn(
            &self.inner.session,
            &self.inner.dispatcher,
            &self.inner.paths.members,
            MEMBER_PREFIX,
            &self.inner.member_id,
            deadline,
        )
        .await?;

        match turn {
            Turn::First => Ok(()),
            Turn::TimedOut => Err(CoordinationError::timeout(format!(
                "wait for leadership of group '{}'",
                self.inner.name
            ))),
        }
    }

    /// Send a message to every member, this one included.
    pub async fn broadcast(&self, data: &[u8]) -> CoordinationResult<()> {
        self.inner.broadcast(data).await
    }

    /// Send a request to one member and wait up to the message timeout for
    /// its reply.
    pub async fn send_receive(&self, target: &str, data: &[u8]) -> CoordinationResult<Vec<u8>> {
        self.inner
            .send_receive(target, data, self.inner.message_timeout)
            .await
    }

    /// Like [`send_receive`](Self::send_receive) with an explicit timeout.
    pub async fn send_receive_timeout(
        &self,
        target: &str,
        data: &[u8],
        timeout: Duration,
    ) -> CoordinationResult<Vec<u8>> {
        self.inner.send_receive(target, data, timeout).await
    }

    /// Remove every pending broadcast message of the group.
    pub async fn clear_group_messages(&self) -> CoordinationResult<()> {
        self.inner.clear_group_messages().await
    }

    /// A lock scoped to this group.
    pub fn create_lock(&self, name: &str, timeout: Option<Duration>) -> CoordinationResult<Lock> {
        Ok(Lock::new(
            name,
            self.inner.paths.lock(name)?,
            timeout,
            Arc::clone(&self.inner.session),
            Arc::clone(&self.inner.dispatcher),
        ))
    }

    /// Leave the group. Other members observe a departure. Idempotent.
    pub async fn leave(&self) -> CoordinationResult<()> {
        if !self.inner.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.deactivate().await;
        info!(group = %self.inner.name, member_id = %self.inner.member_id, "left group");
        Ok(())
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.inner.name)
            .field("member_id", &self.inner.member_id)
            .field("active", &self.inner.is_active())
            .field("leader", &self.inner.view.lock().leader)
            .finish()
    }
}

impl GroupInner {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn ensure_active(&self) -> CoordinationResult<()> {
        self.session.state().check()?;
        if self.is_active() {
            Ok(())
        } else {
            Err(CoordinationError::IllegalState(format!(
                "membership in group '{}' has ended",
                self.name
            )))
        }
    }

    fn listener(&self) -> Option<Arc<dyn GroupEventListener>> {
        self.listener.read().clone()
    }

    /// Subscribe to the group's watches, then arm them and load the initial
    /// view.
    async fn activate(self: &Arc<Self>) -> CoordinationResult<()> {
        self.session.ensure_path(&self.request_channel).await?;
        self.session.remove_on_close(self.request_channel.clone());

        let handler: Weak<dyn WatchHandler> = Arc::downgrade(self) as Weak<dyn WatchHandler>;
        let ids = vec![
            self.dispatcher
                .subscribe(&self.paths.members, Interest::Children, handler.clone()),
            self.dispatcher
                .subscribe(&self.paths.broadcast, Interest::Data, handler.clone()),
            self.dispatcher
                .subscribe(&self.request_channel, Interest::Data, handler.clone()),
            self.dispatcher.subscribe_session(handler),
        ];
        *self.subscriptions.lock() = ids;

        let members = self.session.watch_children(&self.paths.members).await?;
        self.apply_membership(members, false).await;

        let messages = self.session.children(&self.paths.broadcast).await?;
        let newest = sort_sequenced(messages, MESSAGE_PREFIX)
            .last()
            .map(Sequenced::sequence);
        *self.broadcast_cursor.lock() = newest;

        self.session.watch_data(&self.paths.broadcast).await?;
        self.session.watch_data(&self.request_channel).await?;

        // Requests written before the watch was armed raised no event.
        self.spawn_request_handling();
        Ok(())
    }

    /// Stop watching and remove this member's nodes, best effort.
    async fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        for id in self.subscriptions.lock().drain(..) {
            self.dispatcher.unsubscribe(id);
        }

        if !self.session.state().is_terminal() {
            if let Err(err) = self.session.delete(&self.member_path, None).await {
                warn!(group = %self.name, error = %err, "failed to remove member node");
            }
            self.remove_request_channel().await;
        }
        self.session.forget_on_close(&self.request_channel);

        self.clear_view();
    }

    fn clear_view(&self) {
        {
            let mut view = self.view.lock();
            view.members.clear();
            view.leader = None;
        }
        self.members_tx.send_replace(Vec::new());
    }

    /// Replace the membership view. The initial load is silent and is skipped
    /// if a watch-driven update already happened.
    async fn apply_membership(&self, children: Vec<String>, notify: bool) {
        let ordered: Vec<String> = sort_sequenced(children, MEMBER_PREFIX)
            .into_iter()
            .map(|member| member.name().to_string())
            .collect();

        let change = {
            let mut view = self.view.lock();
            if !notify && view.initialized {
                return;
            }

            let previous: HashSet<&str> = view.members.iter().map(String::as_str).collect();
            let current: HashSet<&str> = ordered.iter().map(String::as_str).collect();
            let arrived = ordered
                .iter()
                .filter(|id| !previous.contains(id.as_str()))
                .cloned()
                .collect();
            let departed = view
                .members
                .iter()
                .filter(|id| !current.contains(id.as_str()))
                .cloned()
                .collect();

            let leader = ordered.first().cloned();
            let leader_changed = leader != view.leader;

            view.members = ordered.clone();
            view.leader = leader.clone();
            view.initialized = true;

            MembershipChange {
                arrived,
                departed,
                leader: leader.filter(|_| leader_changed),
            }
        };

        self.members_tx.send_replace(ordered);

        if !notify {
            return;
        }

        for member_id in &change.departed {
            debug!(group = %self.name, %member_id, "member departed");
        }
        for member_id in &change.arrived {
            debug!(group = %self.name, %member_id, "member arrived");
        }
        if let Some(leader) = &change.leader {
            info!(group = %self.name, %leader, is_self = *leader == self.member_id, "group leader changed");
        }

        let Some(listener) = self.listener() else {
            return;
        };
        for member_id in &change.departed {
            listener.on_member_departure(member_id).await;
        }
        for member_id in &change.arrived {
            listener.on_member_arrival(member_id).await;
        }
        if let Some(leader) = &change.leader {
            listener.on_leader_change(leader).await;
        }
    }
}

impl Drop for GroupInner {
    fn drop(&mut self) {
        for id in self.subscriptions.get_mut().drain(..) {
            self.dispatcher.unsubscribe(id);
        }
        if !*self.active.get_mut() || self.session.state().is_terminal() {
            return;
        }
        *self.active.get_mut() = false;

        // Without a runtime the member node lasts until the session ends and
        // close removes the channel.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        debug!(group = %self.name, member_id = %self.member_id, "leaving group of dropped handle");
        self.session.forget_on_close(&self.request_channel);

        let session = Arc::clone(&self.session);
        let member_path = std::mem::take(&mut self.member_path);
        let channel = std::mem::take(&mut self.request_channel);
        runtime.spawn(async move {
            if let Err(err) = session.delete(&member_path, None).await {
                debug!(%member_path, error = %err, "background member node removal failed");
            }
            messaging::remove_channel(&session, &channel).await;
        });
    }
}

#[async_trait]
impl WatchHandler for GroupInner {
    async fn on_children(&self, path: &str, children: Option<Vec<String>>) {
        if path == self.paths.members && self.is_active() {
            self.apply_membership(children.unwrap_or_default(), true).await;
        }
    }

    async fn on_data(&self, path: &str, _data: Option<Vec<u8>>) {
        if !self.is_active() {
            return;
        }
        if path == self.paths.broadcast {
            self.deliver_broadcasts().await;
        } else if path == self.request_channel {
            self.spawn_request_handling();
        }
    }

    async fn on_session(&self, state: SessionState) {
        if !state.is_terminal() || !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.clear_view();
        if state != SessionState::Expired {
            return;
        }

        warn!(
            group = %self.name,
            member_id = %self.member_id,
            "session expired, group membership lost"
        );
        if let Some(listener) = self.listener() {
            listener.on_session_expired().await;
        }
    }
}

//! Watch dispatch.
//!
//! Store notifications are drained by a single task, so every callback is
//! delivered in the order the store produced the underlying changes. Two
//! consumers are served:
//!
//! - one-shot [`Waiter`]s, registered by a blocking call before it arms the
//!   store watch it depends on, so a change racing the arming cannot be lost;
//! - persistent [`WatchHandler`] subscriptions, which the dispatcher re-arms
//!   after every notification by re-reading the watched node.
//!
//! Callbacks run on the dispatch task. A handler that blocks on another
//! primitive stalls every other notification of the session.

use crate::error::{CoordinationError, CoordinationResult};
use crate::session::{SessionManager, SessionState};
use crate::store::{EventKind, StoreEvent, WatchedEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub(crate) type SubscriptionId = u64;

/// Receives re-armed watch results and session transitions.
#[async_trait]
pub(crate) trait WatchHandler: Send + Sync {
    /// Children of a watched node changed. `None` if the node is gone.
    async fn on_children(&self, _path: &str, _children: Option<Vec<String>>) {}

    /// Data of a watched node changed. `None` if the node is gone.
    async fn on_data(&self, _path: &str, _data: Option<Vec<u8>>) {}

    /// Session state changed.
    async fn on_session(&self, _state: SessionState) {}
}

/// What a subscription watches on its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
    Children,
    Data,
}

impl Interest {
    fn matches(&self, kind: EventKind) -> bool {
        match self {
            Self::Children => matches!(
                kind,
                EventKind::NodeChildrenChanged | EventKind::NodeCreated | EventKind::NodeDeleted
            ),
            Self::Data => matches!(
                kind,
                EventKind::NodeDataChanged | EventKind::NodeCreated | EventKind::NodeDeleted
            ),
        }
    }
}

/// Outcome of waiting on a [`Waiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    /// The watched path changed; re-read it.
    Notified,
    /// The deadline passed first.
    TimedOut,
}

/// One-shot wake-up for a path.
///
/// Dropping a waiter, woken or not, removes its slot from the registry.
pub(crate) struct Waiter {
    rx: oneshot::Receiver<WatchedEvent>,
    states: watch::Receiver<SessionState>,
    registry: Weak<Mutex<Registry>>,
    path: String,
}

impl Waiter {
    /// Wait for the path to change, the deadline to pass or the session to
    /// end, whichever comes first.
    pub(crate) async fn wait(mut self, deadline: Option<Instant>) -> CoordinationResult<Wake> {
        let expiry = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            state = self.states.wait_for(SessionState::is_terminal) => {
                let state = state.map(|state| *state).unwrap_or(SessionState::Closed);
                Err(state.lost_error())
            }
            // A dropped sender also means "re-read"; the caller's next store
            // call reports a lost session.
            _ = &mut self.rx => Ok(Wake::Notified),
            () = expiry => Ok(Wake::TimedOut),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.rx.close();
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = registry.lock();
        if let Some(waiters) = registry.waiters.get_mut(&self.path) {
            waiters.retain(|waiter| !waiter.is_closed());
            if waiters.is_empty() {
                registry.waiters.remove(&self.path);
            }
        }
    }
}

struct Subscription {
    path: String,
    interest: Interest,
    handler: Weak<dyn WatchHandler>,
}

#[derive(Default)]
struct Registry {
    waiters: HashMap<String, Vec<oneshot::Sender<WatchedEvent>>>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    session_listeners: HashMap<SubscriptionId, Weak<dyn WatchHandler>>,
    next_id: SubscriptionId,
}

impl Registry {
    fn next_id(&mut self) -> SubscriptionId {
        self.next_id += 1;
        self.next_id
    }
}

/// Routes store notifications to waiters and handlers.
pub struct WatchDispatcher {
    registry: Arc<Mutex<Registry>>,
    session: Arc<SessionManager>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WatchDispatcher {
    /// Spawn the dispatch task for a session.
    pub(crate) fn start(
        session: Arc<SessionManager>,
        events: mpsc::UnboundedReceiver<StoreEvent>,
    ) -> Arc<Self> {
        let registry = Arc::new(Mutex::new(Registry::default()));
        let task = tokio::spawn(run(Arc::clone(&registry), Arc::clone(&session), events));
        Arc::new(Self {
            registry,
            session,
            task: Mutex::new(Some(task)),
        })
    }

    /// Register a one-shot wake-up for `path`. Call before arming the watch.
    pub(crate) fn waiter(&self, path: &str) -> Waiter {
        let (tx, rx) = oneshot::channel();
        self.registry
            .lock()
            .waiters
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Waiter {
            rx,
            states: self.session.subscribe(),
            registry: Arc::downgrade(&self.registry),
            path: path.to_string(),
        }
    }

    /// Subscribe a handler to a path. The caller arms the first watch.
    pub(crate) fn subscribe(
        &self,
        path: &str,
        interest: Interest,
        handler: Weak<dyn WatchHandler>,
    ) -> SubscriptionId {
        let mut registry = self.registry.lock();
        let id = registry.next_id();
        registry.subscriptions.insert(
            id,
            Subscription {
                path: path.to_string(),
                interest,
                handler,
            },
        );
        id
    }

    /// Subscribe a handler to session state changes.
    pub(crate) fn subscribe_session(&self, handler: Weak<dyn WatchHandler>) -> SubscriptionId {
        let mut registry = self.registry.lock();
        let id = registry.next_id();
        registry.session_listeners.insert(id, handler);
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) {
        let mut registry = self.registry.lock();
        registry.subscriptions.remove(&id);
        registry.session_listeners.remove(&id);
    }

    /// Wait for the dispatch task to finish after the session closed.
    pub(crate) async fn shutdown(&self) {
        let task = self.task.lock().take();
        if let Some(mut task) = task
            && tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err()
        {
            warn!("watch dispatcher did not stop in time, aborting");
            task.abort();
        }
    }
}

impl Drop for WatchDispatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

async fn run(
    registry: Arc<Mutex<Registry>>,
    session: Arc<SessionManager>,
    mut events: mpsc::UnboundedReceiver<StoreEvent>,
) {
    let mut states = session.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(StoreEvent::Watch(event)) => dispatch(&registry, &session, event).await,
                Some(StoreEvent::Connection(state)) => session.on_connection_event(state),
                None => {
                    debug!("store event stream ended");
                    break;
                }
            },
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                debug!(%state, "session state changed");

                if state.is_terminal() {
                    registry.lock().waiters.clear();
                }
                notify_session(&registry, state).await;
                if state == SessionState::Closed {
                    break;
                }
            }
        }
    }

    debug!("watch dispatcher stopped");
}

async fn dispatch(registry: &Mutex<Registry>, session: &SessionManager, event: WatchedEvent) {
    trace!(path = %event.path, kind = ?event.kind, "watch fired");

    let (waiters, targets) = {
        let mut registry = registry.lock();
        let waiters = registry.waiters.remove(&event.path).unwrap_or_default();
        registry
            .subscriptions
            .retain(|_, subscription| subscription.handler.strong_count() > 0);
        let targets: Vec<(Interest, Arc<dyn WatchHandler>)> = registry
            .subscriptions
            .values()
            .filter(|subscription| {
                subscription.path == event.path && subscription.interest.matches(event.kind)
            })
            .filter_map(|subscription| {
                subscription
                    .handler
                    .upgrade()
                    .map(|handler| (subscription.interest, handler))
            })
            .collect();
        (waiters, targets)
    };

    for waiter in waiters {
        let _ = waiter.send(event.clone());
    }

    for (interest, handler) in targets {
        deliver(session, &event.path, interest, handler.as_ref()).await;
    }
}

/// Re-read a subscribed path with a fresh watch and hand the result over.
async fn deliver(session: &SessionManager, path: &str, interest: Interest, handler: &dyn WatchHandler) {
    match interest {
        Interest::Children => match session.watch_children(path).await {
            Ok(children) => handler.on_children(path, Some(children)).await,
            Err(err) if err.is_no_node() => {
                rearm_existence(session, path).await;
                handler.on_children(path, None).await;
            }
            Err(err) => report_rearm_failure(path, &err),
        },
        Interest::Data => match session.watch_data(path).await {
            Ok((data, _)) => handler.on_data(path, Some(data)).await,
            Err(err) if err.is_no_node() => {
                rearm_existence(session, path).await;
                handler.on_data(path, None).await;
            }
            Err(err) => report_rearm_failure(path, &err),
        },
    }
}

async fn rearm_existence(session: &SessionManager, path: &str) {
    if let Err(err) = session.watch_node(path).await {
        report_rearm_failure(path, &err);
    }
}

fn report_rearm_failure(path: &str, err: &CoordinationError) {
    if err.is_session_lost() {
        debug!(path, error = %err, "watch not re-armed, session gone");
    } else {
        warn!(path, error = %err, "failed to re-arm watch");
    }
}

async fn notify_session(registry: &Mutex<Registry>, state: SessionState) {
    let listeners: Vec<Arc<dyn WatchHandler>> = {
        let mut registry = registry.lock();
        registry
            .session_listeners
            .retain(|_, listener| listener.strong_count() > 0);
        registry
            .session_listeners
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    };

    for listener in listeners {
        listener.on_session(state).await;
    }
}

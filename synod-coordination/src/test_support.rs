//! Shared fixtures for unit tests.

use crate::dispatcher::WatchDispatcher;
use crate::session::SessionManager;
use crate::store::{ConnectSettings, InMemoryStore};
use std::sync::Arc;
use std::time::Duration;

pub(crate) async fn connect(store: &InMemoryStore) -> (Arc<SessionManager>, Arc<WatchDispatcher>) {
    let settings = ConnectSettings {
        connection_string: "memory".to_string(),
        session_timeout: Duration::from_secs(2),
    };
    let (session, events) = SessionManager::connect(store, settings).await.unwrap();
    let dispatcher = WatchDispatcher::start(Arc::clone(&session), events);
    (session, dispatcher)
}

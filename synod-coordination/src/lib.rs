//! Distributed coordination primitives for Synod
//!
//! This crate implements group membership, leader election, group messaging,
//! locks, barriers and queues on top of a ZooKeeper-class coordination store.
//!
//! ## Features
//!
//! - **Groups** - Membership with arrival/departure callbacks
//! - **Leader Election** - Oldest member leads, predecessor-only watches
//! - **Messaging** - Broadcasts and request/response between members
//! - **Locks** - Fair, queue-ordered mutual exclusion
//! - **Barriers** - Rendezvous of a fixed number of parties
//! - **Queues** - Priority queues with FIFO order within a priority
//! - **Sessions** - Ephemeral state tied to one session; expiry is surfaced
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use synod_coordination::prelude::*;
//! use std::sync::Arc;
//!
//! struct Worker;
//!
//! #[async_trait::async_trait]
//! impl GroupEventListener for Worker {
//!     async fn on_leader_change(&self, leader_id: &str) {
//!         println!("new leader: {leader_id}");
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CoordinationConfiguration::load("coordination.xml")?;
//!     let service = CoordinationService::connect_zookeeper(config).await?;
//!
//!     let group = service.create_group("workers").await?;
//!     group.set_group_event_listener(Arc::new(Worker));
//!
//!     let queue = service.create_queue("jobs", None).await?;
//!     queue.enqueue_with_priority(b"urgent", 1).await?;
//!
//!     service.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Testing
//!
//! [`store::InMemoryStore`] implements the store contract in process and can
//! expire, disconnect or fail sessions on demand.

mod dispatcher;
mod session;
#[cfg(test)]
mod test_support;

pub mod barrier;
pub mod error;
pub mod group;
pub mod lock;
pub mod paths;
pub mod queue;
pub mod sequence;
pub mod service;
pub mod store;

pub use barrier::Barrier;
pub use error::{CoordinationError, CoordinationResult};
pub use group::{Group, GroupEventListener, MAX_NODE_PAYLOAD, PeerReply};
pub use lock::Lock;
pub use paths::PathRegistry;
pub use queue::{DEFAULT_PRIORITY, Queue};
pub use sequence::{Identifiable, Sequenced, SequencedNode};
pub use service::CoordinationService;
pub use session::{SessionManager, SessionState};
pub use store::{CoordinationStore, InMemoryStore, StoreConnector, StoreError};

#[cfg(feature = "zookeeper")]
pub use store::ZooKeeperConnector;

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        Barrier, CoordinationError, CoordinationResult, CoordinationService, Group,
        GroupEventListener, Lock, PeerReply, Queue, SessionState,
    };
    pub use std::time::Duration;
    pub use synod_config::CoordinationConfiguration;
}

//! Group event callbacks.

use async_trait::async_trait;

/// Reply to a peer request: the response payload, or an error whose message
/// is sent back to the caller.
pub type PeerReply = Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>>;

/// Callbacks for group events.
///
/// Membership and broadcast callbacks run on the service's watch dispatcher,
/// one at a time and in the order the store reported the underlying changes.
/// They must not await blocking primitives of the same service, which need
/// the dispatcher to make progress. `on_peer_message` runs on its own task
/// and may.
#[async_trait]
pub trait GroupEventListener: Send + Sync {
    /// A member joined.
    async fn on_member_arrival(&self, _member_id: &str) {}

    /// A member left or lost its session.
    async fn on_member_departure(&self, _member_id: &str) {}

    /// The leader changed.
    async fn on_leader_change(&self, _leader_id: &str) {}

    /// A broadcast message arrived.
    async fn on_group_message(&self, _data: &[u8]) {}

    /// A peer request arrived; the reply is returned to the caller.
    async fn on_peer_message(&self, _data: &[u8]) -> PeerReply {
        Err("peer messages are not handled by this member".into())
    }

    /// The session expired; this member's membership and leadership are gone.
    async fn on_session_expired(&self) {}
}

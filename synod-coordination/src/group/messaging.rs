//! Broadcast and point-to-point messaging between group members.
//!
//! Broadcasts are ephemeral-sequential `msg-` nodes under the group's
//! broadcast channel. The sender touches the channel node afterwards so that
//! every member's data watch fires; members deliver the messages newer than
//! their cursor.
//!
//! A peer request is a JSON envelope written as an ephemeral-sequential
//! `req-` node into the target's request channel. The target claims it by
//! deleting it, runs its listener and answers with a response envelope at
//! `responses/{correlation_id}`, preceded by the reply payload split into
//! chunk nodes.

use super::GroupInner;
use crate::dispatcher::Wake;
use crate::error::{CoordinationError, CoordinationResult};
use crate::paths::{MESSAGE_PREFIX, REQUEST_PREFIX, join_path, validate_name};
use crate::sequence::{Sequenced, sort_sequenced};
use crate::session::SessionManager;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Largest payload stored in a single node: the store's 1 MiB node limit
/// minus headroom for node metadata.
pub const MAX_NODE_PAYLOAD: usize = 1024 * 1024 - 16 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct PeerRequest {
    correlation_id: String,
    sender: String,
    sent_at: DateTime<Utc>,
    #[serde(with = "base64_bytes")]
    payload: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PeerResponse {
    correlation_id: String,
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default)]
    chunks: Vec<String>,
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Delete `path` once `ttl` has passed, unless the session ended first.
fn expire_later(session: &Arc<SessionManager>, path: String, ttl: Duration) {
    let session = Arc::clone(session);
    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        if session.state().is_terminal() {
            return;
        }
        if let Err(err) = session.delete(&path, None).await {
            debug!(%path, error = %err, "could not expire message node");
        }
    });
}

impl GroupInner {
    pub(super) async fn broadcast(&self, data: &[u8]) -> CoordinationResult<()> {
        self.ensure_active()?;

        let path = self
            .session
            .create_ephemeral_sequential(&join_path(&self.paths.broadcast, MESSAGE_PREFIX), data)
            .await?;
        expire_later(&self.session, path.clone(), self.message_timeout);

        self.session.set_data(&self.paths.broadcast, &[], None).await?;
        trace!(group = %self.name, %path, bytes = data.len(), "broadcast sent");
        Ok(())
    }

    /// Hand every message newer than the cursor to the listener.
    pub(super) async fn deliver_broadcasts(&self) {
        let children = match self.session.children(&self.paths.broadcast).await {
            Ok(children) => children,
            Err(err) => {
                debug!(group = %self.name, error = %err, "could not list broadcast messages");
                return;
            }
        };

        let cursor = *self.broadcast_cursor.lock();
        let pending = sort_sequenced(children, MESSAGE_PREFIX)
            .into_iter()
            .filter(|message| cursor.is_none_or(|cursor| message.sequence() > cursor));

        for message in pending {
            let path = join_path(&self.paths.broadcast, message.name());
            let data = match self.session.get_data(&path).await {
                Ok((data, _)) => Some(data),
                Err(err) if err.is_no_node() => None,
                Err(err) => {
                    warn!(group = %self.name, %path, error = %err, "could not read broadcast message");
                    return;
                }
            };
            *self.broadcast_cursor.lock() = Some(message.sequence());

            let Some(data) = data else {
                continue;
            };
            if let Some(listener) = self.listener() {
                listener.on_group_message(&data).await;
            }
        }
    }

    pub(super) async fn send_receive(
        &self,
        target: &str,
        data: &[u8],
        timeout: Duration,
    ) -> CoordinationResult<Vec<u8>> {
        self.ensure_active()?;
        let target_path = self.paths.member(validate_name(target)?);
        if self.session.exists(&target_path).await?.is_none() {
            return Err(CoordinationError::MessageFailed(format!(
                "{target} is not a member of group '{}'",
                self.name
            )));
        }

        let deadline = Instant::now() + timeout;
        let request = PeerRequest {
            correlation_id: Uuid::new_v4().to_string(),
            sender: self.member_id.clone(),
            sent_at: Utc::now(),
            payload: data.to_vec(),
        };
        let envelope = serde_json::to_vec(&request)?;
        let channel = self.paths.request_channel(target);

        // A member node appears before its request channel does.
        let request_path = loop {
            match self
                .session
                .create_ephemeral_sequential(&join_path(&channel, REQUEST_PREFIX), &envelope)
                .await
            {
                Ok(path) => break path,
                Err(err) if err.is_no_node() => {
                    self.await_request_channel(target, &target_path, &channel, deadline)
                        .await?
                }
                Err(err) => return Err(err),
            }
        };
        match self.session.set_data(&channel, &[], None).await {
            Ok(_) => {}
            Err(err) if err.is_no_node() => return Err(self.departed(target)),
            Err(err) => return Err(err),
        }
        debug!(
            group = %self.name,
            %target,
            correlation_id = %request.correlation_id,
            bytes = data.len(),
            "peer request sent"
        );

        loop {
            let response = self.dispatcher.waiter(&self.paths.responses);
            let answered = self.session.watch_children(&self.paths.responses).await?;
            if answered.contains(&request.correlation_id) {
                break;
            }

            let member = self.dispatcher.waiter(&target_path);
            if self.session.watch_node(&target_path).await?.is_none() {
                self.session.delete(&request_path, None).await?;
                return Err(self.departed(target));
            }

            let wake = tokio::select! {
                wake = response.wait(Some(deadline)) => wake?,
                wake = member.wait(Some(deadline)) => wake?,
            };
            if wake == Wake::TimedOut {
                self.session.delete(&request_path, None).await?;
                return Err(self.request_timeout(target));
            }
        }

        self.collect_response(&self.paths.response(&request.correlation_id))
            .await
    }

    fn departed(&self, target: &str) -> CoordinationError {
        CoordinationError::MessageFailed(format!("{target} left group '{}'", self.name))
    }

    fn request_timeout(&self, target: &str) -> CoordinationError {
        CoordinationError::timeout(format!("request to {target} in group '{}'", self.name))
    }

    /// Wait for a member's request channel to exist. Fails if the member
    /// leaves or the deadline passes first.
    async fn await_request_channel(
        &self,
        target: &str,
        target_path: &str,
        channel: &str,
        deadline: Instant,
    ) -> CoordinationResult<()> {
        loop {
            let created = self.dispatcher.waiter(channel);
            if self.session.watch_node(channel).await?.is_some() {
                return Ok(());
            }

            let member = self.dispatcher.waiter(target_path);
            if self.session.watch_node(target_path).await?.is_none() {
                return Err(self.departed(target));
            }

            trace!(group = %self.name, %target, "waiting for request channel");
            let wake = tokio::select! {
                wake = created.wait(Some(deadline)) => wake?,
                wake = member.wait(Some(deadline)) => wake?,
            };
            if wake == Wake::TimedOut {
                return Err(self.request_timeout(target));
            }
        }
    }

    async fn collect_response(&self, response_path: &str) -> CoordinationResult<Vec<u8>> {
        let (envelope, _) = self.session.get_data(response_path).await?;
        self.session.delete(response_path, None).await?;
        let response: PeerResponse = serde_json::from_slice(&envelope)?;

        if !response.success {
            return Err(CoordinationError::MessageFailed(
                response
                    .error
                    .unwrap_or_else(|| "peer reported a failure".to_string()),
            ));
        }

        let mut reply = Vec::new();
        for chunk in &response.chunks {
            let path = join_path(&self.paths.responses, chunk);
            match self.session.get_data(&path).await {
                Ok((data, _)) => reply.extend_from_slice(&data),
                Err(err) if err.is_no_node() => {
                    return Err(CoordinationError::MessageFailed(format!(
                        "reply chunk {chunk} is missing"
                    )));
                }
                Err(err) => return Err(err),
            }
            self.session.delete(&path, None).await?;
        }

        trace!(
            correlation_id = %response.correlation_id,
            chunks = response.chunks.len(),
            bytes = reply.len(),
            "peer reply received"
        );
        Ok(reply)
    }

    /// Answer pending requests on a separate task, so listeners may use
    /// blocking primitives.
    pub(super) fn spawn_request_handling(&self) {
        if let Some(this) = self.this.upgrade() {
            tokio::spawn(async move { this.answer_requests().await });
        }
    }

    async fn answer_requests(&self) {
        let children = match self.session.children(&self.request_channel).await {
            Ok(children) => children,
            Err(err) => {
                debug!(group = %self.name, error = %err, "could not list peer requests");
                return;
            }
        };

        for request in sort_sequenced(children, REQUEST_PREFIX) {
            if !self.is_active() {
                return;
            }
            let path = join_path(&self.request_channel, request.name());
            let data = match self.session.get_data(&path).await {
                Ok((data, _)) => data,
                Err(err) if err.is_no_node() => continue,
                Err(err) => {
                    warn!(group = %self.name, %path, error = %err, "could not read peer request");
                    return;
                }
            };
            // Whoever deletes the request owns it.
            if !matches!(self.session.delete(&path, None).await, Ok(true)) {
                continue;
            }

            let request: PeerRequest = match serde_json::from_slice(&data) {
                Ok(request) => request,
                Err(err) => {
                    warn!(group = %self.name, %path, error = %err, "dropping malformed peer request");
                    continue;
                }
            };
            debug!(
                group = %self.name,
                sender = %request.sender,
                correlation_id = %request.correlation_id,
                latency_ms = (Utc::now() - request.sent_at).num_milliseconds(),
                "peer request received"
            );

            let reply = match self.listener() {
                Some(listener) => listener.on_peer_message(&request.payload).await,
                None => Err("no group event listener registered".into()),
            };
            if let Err(err) = self.respond(&request.correlation_id, reply).await {
                warn!(
                    group = %self.name,
                    correlation_id = %request.correlation_id,
                    error = %err,
                    "could not answer peer request"
                );
            }
        }
    }

    async fn respond(&self, correlation_id: &str, reply: super::PeerReply) -> CoordinationResult<()> {
        let response = match reply {
            Ok(data) => {
                let mut chunks = Vec::new();
                for (index, chunk) in data.chunks(MAX_NODE_PAYLOAD).enumerate() {
                    let name = format!("{correlation_id}-{index:04}");
                    let path = self
                        .session
                        .create_ephemeral(&join_path(&self.paths.responses, &name), chunk)
                        .await?;
                    expire_later(&self.session, path, self.message_timeout);
                    chunks.push(name);
                }
                PeerResponse {
                    correlation_id: correlation_id.to_string(),
                    success: true,
                    error: None,
                    chunks,
                }
            }
            Err(err) => PeerResponse {
                correlation_id: correlation_id.to_string(),
                success: false,
                error: Some(err.to_string()),
                chunks: Vec::new(),
            },
        };

        let path = self
            .session
            .create_ephemeral(&self.paths.response(correlation_id), &serde_json::to_vec(&response)?)
            .await?;
        expire_later(&self.session, path, self.message_timeout);
        Ok(())
    }

    pub(super) async fn clear_group_messages(&self) -> CoordinationResult<()> {
        self.ensure_active()?;
        let children = self.session.children(&self.paths.broadcast).await?;
        let messages = sort_sequenced(children, MESSAGE_PREFIX);
        for message in &messages {
            self.session
                .delete(&join_path(&self.paths.broadcast, message.name()), None)
                .await?;
        }
        debug!(group = %self.name, count = messages.len(), "cleared group messages");
        Ok(())
    }

    pub(super) async fn remove_request_channel(&self) {
        remove_channel(&self.session, &self.request_channel).await;
    }
}

/// Delete a request channel together with any requests still in it.
pub(super) async fn remove_channel(session: &SessionManager, channel: &str) {
    if let Ok(children) = session.children(channel).await {
        for child in children {
            let _ = session.delete(&join_path(channel, &child), None).await;
        }
    }
    if let Err(err) = session.delete(channel, None).await {
        debug!(path = %channel, error = %err, "could not remove request channel");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_envelope() {
        let request = PeerRequest {
            correlation_id: "c1".to_string(),
            sender: "member-0000000001".to_string(),
            sent_at: Utc::now(),
            payload: vec![0, 1, 2, 255],
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["payload"], "AAEC/w==");

        let decoded: PeerRequest = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.payload, vec![0, 1, 2, 255]);
        assert_eq!(decoded.sender, "member-0000000001");
    }

    #[test]
    fn test_failure_envelope_defaults() {
        let response: PeerResponse =
            serde_json::from_str(r#"{"correlation_id":"c1","success":false,"error":"boom"}"#).unwrap();
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("boom"));
        assert!(response.chunks.is_empty());
    }

    #[test]
    fn test_max_node_payload_fits_store_limit() {
        assert!(MAX_NODE_PAYLOAD < 1024 * 1024);
        assert_eq!(vec![0u8; 3 * 1024 * 1024].chunks(MAX_NODE_PAYLOAD).count(), 4);
    }
}

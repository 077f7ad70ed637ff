//! Store path layout.
//!
//! Everything lives under the configured root:
//!
//! ```text
//! {root}/groups/{group}/members/member-NNNNNNNNNN      ephemeral-sequential
//! {root}/groups/{group}/broadcast/msg-NNNNNNNNNN       ephemeral-sequential
//! {root}/groups/{group}/requests/{member}/req-NNNNNNNNNN
//! {root}/groups/{group}/responses/{correlation-id}
//! {root}/groups/{group}/locks/{lock}/lock-NNNNNNNNNN
//! {root}/locks/{lock}/lock-NNNNNNNNNN
//! {root}/barriers/{barrier}/party-NNNNNNNNNN
//! {root}/barriers/{barrier}/ready
//! {root}/queues/{queue}/entry-PPPPPPPPPP-NNNNNNNNNN    persistent-sequential
//! ```

use crate::error::{CoordinationError, CoordinationResult};

pub const MEMBER_PREFIX: &str = "member-";
pub const MESSAGE_PREFIX: &str = "msg-";
pub const REQUEST_PREFIX: &str = "req-";
pub const LOCK_PREFIX: &str = "lock-";
pub const PARTY_PREFIX: &str = "party-";
pub const ENTRY_PREFIX: &str = "entry-";
pub const READY_NODE: &str = "ready";

/// Join a parent path and a child name.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Parent of an absolute path; the root is its own parent.
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(index) => &path[..index],
    }
}

/// Last segment of a path.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Check that a primitive or member name can be used as one path segment.
pub fn validate_name(name: &str) -> CoordinationResult<&str> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.chars().any(char::is_control);
    if valid {
        Ok(name)
    } else {
        Err(CoordinationError::InvalidName(name.to_string()))
    }
}

/// Maps primitive names to their store paths under a common root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRegistry {
    root: String,
}

impl PathRegistry {
    pub fn new(root: impl Into<String>) -> Self {
        let root = root.into();
        let root = match root.trim_end_matches('/') {
            "" => "/".to_string(),
            trimmed => trimmed.to_string(),
        };
        Self { root }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Paths of a named group.
    pub fn group(&self, name: &str) -> CoordinationResult<GroupPaths> {
        let base = join_path(&join_path(&self.root, "groups"), validate_name(name)?);
        Ok(GroupPaths {
            members: join_path(&base, "members"),
            broadcast: join_path(&base, "broadcast"),
            requests: join_path(&base, "requests"),
            responses: join_path(&base, "responses"),
            locks: join_path(&base, "locks"),
            base,
        })
    }

    /// Directory of a standalone lock.
    pub fn lock(&self, name: &str) -> CoordinationResult<String> {
        Ok(join_path(&join_path(&self.root, "locks"), validate_name(name)?))
    }

    /// Directory of a barrier.
    pub fn barrier(&self, name: &str) -> CoordinationResult<String> {
        Ok(join_path(&join_path(&self.root, "barriers"), validate_name(name)?))
    }

    /// Directory of a queue.
    pub fn queue(&self, name: &str) -> CoordinationResult<String> {
        Ok(join_path(&join_path(&self.root, "queues"), validate_name(name)?))
    }
}

/// Paths belonging to one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPaths {
    pub base: String,
    pub members: String,
    pub broadcast: String,
    pub requests: String,
    pub responses: String,
    pub locks: String,
}

impl GroupPaths {
    /// Node of a member, given its id (the member node's name).
    pub fn member(&self, member_id: &str) -> String {
        join_path(&self.members, member_id)
    }

    /// Request channel of a member.
    pub fn request_channel(&self, member_id: &str) -> String {
        join_path(&self.requests, member_id)
    }

    /// Response node for a correlation id.
    pub fn response(&self, correlation_id: &str) -> String {
        join_path(&self.responses, correlation_id)
    }

    /// Directory of a lock scoped to this group.
    pub fn lock(&self, name: &str) -> CoordinationResult<String> {
        Ok(join_path(&self.locks, validate_name(name)?))
    }
}

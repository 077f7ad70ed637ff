//! Error types for coordination primitives.

use crate::store::StoreError;
use synod_config::ConfigError;
use thiserror::Error;

/// Result type for coordination operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Errors surfaced by the coordination service and its primitives.
///
/// Callers can tell apart "timed out, try again" ([`is_timeout`]),
/// "session lost, every held resource is gone" ([`is_session_lost`]) and
/// "permanently misconfigured" ([`is_permanent`]).
///
/// [`is_timeout`]: CoordinationError::is_timeout
/// [`is_session_lost`]: CoordinationError::is_session_lost
/// [`is_permanent`]: CoordinationError::is_permanent
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Malformed or incomplete configuration.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// The coordination service is disabled in its configuration.
    #[error("Coordination service is disabled")]
    ServiceDisabled,

    /// A session could not be established or re-established in time.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A blocking operation exceeded its wait budget.
    #[error("Operation timed out: {operation}")]
    Timeout {
        /// Description of the operation.
        operation: String,
    },

    /// A peer request could not be answered.
    #[error("Message failed: {0}")]
    MessageFailed(String),

    /// The owning session expired; ephemeral state is gone.
    #[error("Session expired")]
    SessionExpired,

    /// The service (or the primitive) was closed.
    #[error("Coordination service closed")]
    Closed,

    /// The call is not valid in the primitive's current state.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// A primitive name cannot be mapped to a store path.
    #[error("Invalid name: '{0}'")]
    InvalidName(String),

    /// Message envelope could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Non-recoverable store error.
    #[error("Store error: {0}")]
    Store(StoreError),
}

impl CoordinationError {
    pub(crate) fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// The wait budget ran out; retrying may succeed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The session is gone (expired or closed); held resources were lost.
    pub fn is_session_lost(&self) -> bool {
        matches!(self, Self::SessionExpired | Self::Closed)
    }

    /// Retrying without changing configuration cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::ServiceDisabled | Self::InvalidName(_))
    }

    pub(crate) fn is_no_node(&self) -> bool {
        matches!(self, Self::Store(StoreError::NoNode(_)))
    }
}

impl From<StoreError> for CoordinationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SessionExpired => Self::SessionExpired,
            StoreError::Closed => Self::Closed,
            StoreError::ConnectionLoss => {
                Self::Connection("connection to the coordination store was lost".to_string())
            }
            other => Self::Store(other),
        }
    }
}

impl From<serde_json::Error> for CoordinationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

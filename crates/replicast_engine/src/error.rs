//! Error types for the replica engine.

use replicast_protocol::{EntityId, ProtocolError};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while mirroring channels.
///
/// Only [`EngineError::Auth`] at initial login is fatal; every other variant
/// is isolated to the channel or connect cycle that raised it.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Login exchange failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Access token refresh could not be performed.
    #[error("access token refresh failed: {0}")]
    RefreshFailure(String),

    /// A channel message could not be decoded.
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] ProtocolError),

    /// An `update` or `delete` targeted an entity the replica does not hold.
    #[error("unknown entity {id} on {channel}")]
    UnknownReference {
        /// Channel label.
        channel: String,
        /// Referenced id.
        id: EntityId,
    },

    /// A channel subscription failed or its stream errored.
    #[error("subscription to {channel} failed: {reason}")]
    SubscriptionFailure {
        /// Channel name.
        channel: String,
        /// Failure reason.
        reason: String,
    },

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// HTTP exchange error.
    #[error("http error: {0}")]
    Http(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The session token was already set for this process.
    #[error("session already established")]
    SessionAlreadySet,

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,

    /// Timeout.
    #[error("operation timed out")]
    Timeout,
}

impl EngineError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a subscription failure.
    pub fn subscription(channel: impl ToString, reason: impl Into<String>) -> Self {
        Self::SubscriptionFailure {
            channel: channel.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns true if this error can be retried on a later cycle.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Transport { retryable, .. } => *retryable,
            EngineError::RefreshFailure(_)
            | EngineError::SubscriptionFailure { .. }
            | EngineError::Http(_)
            | EngineError::Timeout
            | EngineError::NotConnected => true,
            _ => false,
        }
    }

    /// Returns true if this error must stop the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Auth(_))
    }
}

//! Error types for the channel protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding channel traffic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The envelope is not a JSON object carrying a string `msg` field.
    #[error("message has no `msg` kind")]
    MissingKind,

    /// The payload does not match what the message kind requires.
    #[error("invalid `{kind}` payload: {reason}")]
    InvalidPayload {
        /// Message kind being decoded.
        kind: String,
        /// What was wrong with the payload.
        reason: String,
    },

    /// A record has no usable `id`.
    #[error("entity has no usable `id`")]
    MissingId,

    /// A record is not a JSON object.
    #[error("entity must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    /// The raw text is not JSON.
    #[error("invalid JSON: {0}")]
    Json(String),

    /// A channel name does not follow `/<entity-type>[/<organization>]`.
    #[error("invalid channel name `{0}`")]
    InvalidChannel(String),
}

impl ProtocolError {
    pub(crate) fn invalid_payload(kind: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            kind: kind.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

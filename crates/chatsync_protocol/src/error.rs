//! Error types for protocol values.

use thiserror::Error;

/// Result type for protocol parsing.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while parsing protocol values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A channel identifier was not of the form `type:id`.
    #[error("invalid channel cid: {0:?}")]
    InvalidCid(String),

    /// A pending task carried a kind this layer cannot execute.
    #[error("unsupported pending task kind: {0}")]
    UnsupportedTaskKind(String),

    /// A pending task payload did not match its kind.
    #[error("invalid pending task payload: {0}")]
    InvalidTaskPayload(String),
}

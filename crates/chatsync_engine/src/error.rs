//! Error types for the consistency layer.

use chatsync_protocol::{MessageError, TaskKind};
use chatsync_storage::StorageError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type for network collaborator calls.
pub type ClientResult<T> = Result<T, ClientError>;

/// A failure reported by the network collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The connection is down or unhealthy.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The server answered with an error.
    #[error("api error {code} (status {status}): {message}")]
    Api {
        /// Server error code.
        code: i64,
        /// HTTP status.
        status: u16,
        /// Server error message.
        message: String,
    },

    /// The request failed below the API layer (timeout, DNS, TLS...).
    #[error("transport error: {0}")]
    Transport(String),
}

impl ClientError {
    /// Creates an API error.
    pub fn api(code: i64, status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            code,
            status,
            message: message.into(),
        }
    }

    /// Converts to the structured error attached to a failed local message.
    pub fn to_message_error(&self) -> MessageError {
        match self {
            ClientError::Api {
                code,
                status,
                message,
            } => MessageError {
                code: Some(*code),
                status: Some(*status),
                message: message.clone(),
            },
            other => MessageError {
                code: None,
                status: None,
                message: other.to_string(),
            },
        }
    }
}

/// Errors that can occur in the consistency layer.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The network collaborator failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The storage driver failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A pending task lacks data its kind requires.
    #[error("invalid {kind} task: {reason}")]
    InvalidTask {
        /// Task kind.
        kind: TaskKind,
        /// What is missing.
        reason: String,
    },
}

impl EngineError {
    /// Returns the network failure behind this error, if any.
    pub fn client_error(&self) -> Option<&ClientError> {
        match self {
            EngineError::Client(error) => Some(error),
            _ => None,
        }
    }
}

/// Classification of a failure, independent of how the transport shaped it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Worth retrying later.
    Transient,
    /// The server will never accept this request.
    PermanentRejection,
    /// The entity already exists server-side.
    DuplicateWrite,
}

impl ErrorKind {
    /// Returns true if retrying can never succeed.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, ErrorKind::Transient)
    }
}

/// Error signatures used to classify failures.
///
/// This is the only place that looks at server error codes or messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPolicy {
    /// API codes that are never retried (bad request, missing capability).
    pub permanent_codes: Vec<i64>,
    /// API code of a duplicate creation.
    pub duplicate_code: i64,
    /// Text that distinguishes a duplicate creation from other errors with the same code.
    pub duplicate_marker: String,
}

impl ErrorPolicy {
    /// Classifies a network failure.
    pub fn classify(&self, error: &ClientError) -> ErrorKind {
        match error {
            ClientError::Api { code, message, .. } => {
                if *code == self.duplicate_code && message.contains(&self.duplicate_marker) {
                    ErrorKind::DuplicateWrite
                } else if self.permanent_codes.contains(code) {
                    ErrorKind::PermanentRejection
                } else {
                    ErrorKind::Transient
                }
            }
            ClientError::ConnectionLost(_) | ClientError::Transport(_) => ErrorKind::Transient,
        }
    }

    /// Classifies any engine failure.
    ///
    /// Malformed tasks can never succeed; storage failures may clear up.
    pub fn classify_engine(&self, error: &EngineError) -> ErrorKind {
        match error {
            EngineError::Client(error) => self.classify(error),
            EngineError::InvalidTask { .. } => ErrorKind::PermanentRejection,
            EngineError::Storage(_) => ErrorKind::Transient,
        }
    }
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            permanent_codes: vec![4, 17],
            duplicate_code: 4,
            duplicate_marker: "already exists".into(),
        }
    }
}

/// A pipeline handler failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    /// Handler id.
    pub handler_id: String,
    /// Position of the handler in the run's snapshot.
    pub index: usize,
    /// Error text.
    pub message: String,
}

/// Errors surfaced by a pipeline run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// One or more handlers failed; the others still ran.
    #[error("{} pipeline handler(s) failed", .0.len())]
    HandlerFailures(Vec<HandlerFailure>),

    /// The run task was aborted before completing.
    #[error("pipeline run aborted: {0}")]
    Aborted(String),
}

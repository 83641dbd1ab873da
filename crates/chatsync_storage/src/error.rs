//! Error types for storage operations.

use chatsync_protocol::{Cid, ProtocolError};
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A dependent row referenced a parent row that does not exist.
    #[error("foreign key violation: {table} row references missing {parent}")]
    ForeignKey {
        /// Table of the rejected row.
        table: &'static str,
        /// Description of the missing parent.
        parent: String,
    },

    /// A row was missing a required column.
    #[error("constraint violation in {table}: {reason}")]
    Constraint {
        /// Table of the rejected row.
        table: &'static str,
        /// What was wrong.
        reason: String,
    },

    /// A stored row could not be decoded.
    #[error("stored row could not be decoded: {0}")]
    Decode(#[from] ProtocolError),

    /// Backend specific failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Creates a foreign key violation for a row depending on a channel.
    pub fn missing_channel(table: &'static str, cid: &Cid) -> Self {
        Self::ForeignKey {
            table,
            parent: format!("channel {cid}"),
        }
    }
}

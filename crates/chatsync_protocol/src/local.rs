//! Locally held message state.

use crate::model::Message;
use serde::{Deserialize, Serialize};

/// Delivery status of a locally held message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// A network call for this message is in flight.
    Sending,
    /// The server confirmed the message.
    Received,
    /// The last network call failed; the message can be retried.
    Failed,
}

/// Structured error attached to a failed message, renderable by a UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageError {
    /// Server error code, when the server produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    /// HTTP status, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Human readable message.
    pub message: String,
}

/// A message plus its local delivery state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalMessage {
    /// The message payload.
    pub message: Message,
    /// Delivery status.
    pub status: MessageStatus,
    /// Error of the last failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MessageError>,
}

impl LocalMessage {
    /// Wraps a message in the `sending` state with no error.
    pub fn sending(message: Message) -> Self {
        Self {
            message,
            status: MessageStatus::Sending,
            error: None,
        }
    }

    /// Wraps a server-confirmed message.
    pub fn received(message: Message) -> Self {
        Self {
            message,
            status: MessageStatus::Received,
            error: None,
        }
    }

    /// Returns the message id.
    pub fn id(&self) -> &str {
        &self.message.id
    }

    /// Returns true while a network call is in flight.
    pub fn is_sending(&self) -> bool {
        self.status == MessageStatus::Sending
    }
}

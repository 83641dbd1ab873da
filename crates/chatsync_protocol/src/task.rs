//! Pending mutations buffered while offline.

use crate::cid::Cid;
use crate::error::{ProtocolError, ProtocolResult};
use crate::model::{Draft, Message, Reaction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind of pending mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// `delete-message`
    DeleteMessage,
    /// `send-message`
    SendMessage,
    /// `send-reaction`
    SendReaction,
    /// `delete-reaction`
    DeleteReaction,
    /// `create-draft`
    CreateDraft,
    /// `delete-draft`
    DeleteDraft,
}

impl TaskKind {
    /// Returns the stored name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::DeleteMessage => "delete-message",
            TaskKind::SendMessage => "send-message",
            TaskKind::SendReaction => "send-reaction",
            TaskKind::DeleteReaction => "delete-reaction",
            TaskKind::CreateDraft => "create-draft",
            TaskKind::DeleteDraft => "delete-draft",
        }
    }

    /// Parses a stored name.
    pub fn parse(name: &str) -> ProtocolResult<Self> {
        match name {
            "delete-message" => Ok(TaskKind::DeleteMessage),
            "send-message" => Ok(TaskKind::SendMessage),
            "send-reaction" => Ok(TaskKind::SendReaction),
            "delete-reaction" => Ok(TaskKind::DeleteReaction),
            "create-draft" => Ok(TaskKind::CreateDraft),
            "delete-draft" => Ok(TaskKind::DeleteDraft),
            other => Err(ProtocolError::UnsupportedTaskKind(other.to_string())),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments of a pending mutation, one variant per [`TaskKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum TaskPayload {
    /// Delete a message.
    DeleteMessage {
        /// Hard delete instead of soft delete.
        #[serde(default)]
        hard: bool,
    },
    /// Send a message.
    SendMessage {
        /// The message as composed locally.
        message: Message,
    },
    /// Send a reaction.
    SendReaction {
        /// The reaction.
        reaction: Reaction,
        /// Replace the user's other reactions on the message.
        #[serde(default)]
        enforce_unique: bool,
    },
    /// Delete a reaction.
    DeleteReaction {
        /// Reaction type to remove.
        reaction_type: String,
        /// Owner of the reaction, when acting on someone else's behalf.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    /// Create or replace a draft.
    CreateDraft {
        /// The draft.
        draft: Draft,
    },
    /// Delete a draft.
    DeleteDraft {
        /// Thread parent, for thread drafts.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
    },
}

impl TaskPayload {
    /// Returns the kind of this payload.
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::DeleteMessage { .. } => TaskKind::DeleteMessage,
            TaskPayload::SendMessage { .. } => TaskKind::SendMessage,
            TaskPayload::SendReaction { .. } => TaskKind::SendReaction,
            TaskPayload::DeleteReaction { .. } => TaskKind::DeleteReaction,
            TaskPayload::CreateDraft { .. } => TaskKind::CreateDraft,
            TaskPayload::DeleteDraft { .. } => TaskKind::DeleteDraft,
        }
    }
}

/// A deferred write operation.
///
/// `id` is assigned by the storage layer when the task is persisted and is
/// `None` before that.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTask {
    /// Durable id.
    pub id: Option<i64>,
    /// Target channel.
    pub cid: Option<Cid>,
    /// Target message.
    pub message_id: String,
    /// Creation time; execution follows this order.
    pub created_at: DateTime<Utc>,
    /// Kind-specific arguments.
    pub payload: TaskPayload,
}

impl PendingTask {
    /// Creates an unpersisted task stamped with the current time.
    pub fn new(cid: Option<Cid>, message_id: impl Into<String>, payload: TaskPayload) -> Self {
        Self {
            id: None,
            cid,
            message_id: message_id.into(),
            created_at: Utc::now(),
            payload,
        }
    }

    /// Returns the task kind.
    pub fn kind(&self) -> TaskKind {
        self.payload.kind()
    }

    /// Converts to the flat record shape a storage driver persists.
    pub fn to_record(&self) -> ProtocolResult<TaskRecord> {
        let tagged = serde_json::to_value(&self.payload)
            .map_err(|e| ProtocolError::InvalidTaskPayload(e.to_string()))?;
        let payload = tagged.get("payload").cloned().unwrap_or(Value::Null);
        Ok(TaskRecord {
            id: self.id,
            kind: self.kind().as_str().to_string(),
            cid: self.cid.clone(),
            message_id: self.message_id.clone(),
            created_at: self.created_at,
            payload,
        })
    }

    /// Rebuilds a task from a stored record.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnsupportedTaskKind`] for a kind this layer
    /// does not know how to execute.
    pub fn from_record(record: TaskRecord) -> ProtocolResult<Self> {
        TaskKind::parse(&record.kind)?;
        let tagged = serde_json::json!({ "type": record.kind, "payload": record.payload });
        let payload = serde_json::from_value(tagged)
            .map_err(|e| ProtocolError::InvalidTaskPayload(e.to_string()))?;
        Ok(Self {
            id: record.id,
            cid: record.cid,
            message_id: record.message_id,
            created_at: record.created_at,
            payload,
        })
    }
}

/// Storage shape of a pending task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Durable id.
    pub id: Option<i64>,
    /// Task kind name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Target channel.
    pub cid: Option<Cid>,
    /// Target message.
    pub message_id: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Kind-specific arguments.
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid() -> Option<Cid> {
        Some(Cid::new("messaging", "general"))
    }

    #[test]
    fn kind_names() {
        for kind in [
            TaskKind::DeleteMessage,
            TaskKind::SendMessage,
            TaskKind::SendReaction,
            TaskKind::DeleteReaction,
            TaskKind::CreateDraft,
            TaskKind::DeleteDraft,
        ] {
            assert_eq!(TaskKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert_eq!(
            TaskKind::parse("pin-message"),
            Err(ProtocolError::UnsupportedTaskKind("pin-message".into()))
        );
    }

    #[test]
    fn record_keeps_payload_arguments() {
        let task = PendingTask::new(
            cid(),
            "m1",
            TaskPayload::SendReaction {
                reaction: Reaction::new("m1", "alice", "like"),
                enforce_unique: true,
            },
        );

        let record = task.to_record().unwrap();
        assert_eq!(record.kind, "send-reaction");
        assert_eq!(record.payload["enforce_unique"], serde_json::json!(true));

        let back = PendingTask::from_record(record).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn unknown_record_kind_is_rejected() {
        let record = TaskRecord {
            id: Some(3),
            kind: "pin-message".into(),
            cid: cid(),
            message_id: "m1".into(),
            created_at: Utc::now(),
            payload: serde_json::json!({}),
        };
        assert!(matches!(
            PendingTask::from_record(record),
            Err(ProtocolError::UnsupportedTaskKind(kind)) if kind == "pin-message"
        ));
    }
}

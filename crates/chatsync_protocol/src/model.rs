//! Server entities mirrored by the local store.
//!
//! Each type carries the fields the consistency layer reasons about plus a
//! flattened `custom` map so payload extensions survive a round trip through
//! local storage untouched.

use crate::cid::Cid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A chat user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// User id.
    pub id: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl User {
    /// Creates a user with only an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

/// Channel data as stored in the channel row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelData {
    /// Channel identifier.
    pub cid: Cid,
    /// Channel name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Number of members, as last reported by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_count: Option<u32>,
    /// Whether the channel is hidden for the current user.
    #[serde(default)]
    pub hidden: bool,
    /// Creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Last update time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Extra fields.
    #[serde(default, flatten)]
    pub custom: Map<String, Value>,
}

impl ChannelData {
    /// Creates channel data with only a cid.
    pub fn new(cid: Cid) -> Self {
        Self {
            cid,
            name: None,
            member_count: None,
            hidden: false,
            created_at: None,
            updated_at: None,
            custom: Map::new(),
        }
    }
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message id.
    pub id: String,
    /// Channel the message belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<Cid>,
    /// Message text.
    #[serde(default)]
    pub text: String,
    /// Sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    /// Parent message id for thread replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Whether a thread reply is also shown in the channel.
    #[serde(default)]
    pub show_in_channel: bool,
    /// Poll attached to this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_id: Option<String>,
    /// Creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Last update time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Soft-delete time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Reaction counts by reaction type.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reaction_counts: BTreeMap<String, u32>,
    /// Extra fields.
    #[serde(default, flatten)]
    pub custom: Map<String, Value>,
}

impl Message {
    /// Creates a message with an id and text.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cid: None,
            text: text.into(),
            user: None,
            parent_id: None,
            show_in_channel: false,
            poll_id: None,
            created_at: None,
            updated_at: None,
            deleted_at: None,
            reaction_counts: BTreeMap::new(),
            custom: Map::new(),
        }
    }

    /// Returns the sender id, if known.
    pub fn sender_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }

    /// Returns true for a thread reply that is not also shown in the channel.
    pub fn is_thread_only_reply(&self) -> bool {
        self.parent_id.is_some() && !self.show_in_channel
    }
}

/// A reaction on a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    /// Message the reaction belongs to.
    pub message_id: String,
    /// Reacting user.
    pub user_id: String,
    /// Reaction type, e.g. `like`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Score.
    #[serde(default = "default_score")]
    pub score: u32,
    /// Creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

fn default_score() -> u32 {
    1
}

impl Reaction {
    /// Creates a reaction with score 1.
    pub fn new(
        message_id: impl Into<String>,
        user_id: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            user_id: user_id.into(),
            kind: kind.into(),
            score: 1,
            created_at: None,
        }
    }
}

/// A channel member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// Member user id.
    pub user_id: String,
    /// Member user payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    /// Channel role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Join time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Member {
    /// Creates a member for a user id.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user: None,
            role: None,
            created_at: None,
        }
    }
}

/// Read cursor of one user in one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadState {
    /// The reader.
    pub user: User,
    /// Time of the last read.
    pub last_read: DateTime<Utc>,
    /// Id of the last read message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_message_id: Option<String>,
    /// Unread message count.
    #[serde(default)]
    pub unread_messages: u32,
}

/// Body of a draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftMessage {
    /// Draft message id.
    pub id: String,
    /// Draft text.
    #[serde(default)]
    pub text: String,
}

/// An unsent message draft, scoped to a channel and optionally a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    /// Channel.
    pub cid: Cid,
    /// Thread parent, for thread drafts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Draft content.
    pub message: DraftMessage,
    /// Creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// A poll attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poll {
    /// Poll id.
    pub id: String,
    /// Poll question.
    #[serde(default)]
    pub name: String,
    /// Whether voting is closed.
    #[serde(default)]
    pub is_closed: bool,
    /// Total votes.
    #[serde(default)]
    pub vote_count: u32,
    /// Last update time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Extra fields.
    #[serde(default, flatten)]
    pub custom: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn thread_only_reply() {
        let mut message = Message::new("m1", "hi");
        assert!(!message.is_thread_only_reply());

        message.parent_id = Some("p1".into());
        assert!(message.is_thread_only_reply());

        message.show_in_channel = true;
        assert!(!message.is_thread_only_reply());
    }

    #[test]
    fn message_keeps_unknown_fields() {
        let raw = json!({
            "id": "m1",
            "text": "hello",
            "cid": "messaging:general",
            "user": {"id": "alice"},
            "pinned": true
        });
        let message: Message = serde_json::from_value(raw).unwrap();
        assert_eq!(message.sender_id(), Some("alice"));
        assert_eq!(message.custom.get("pinned"), Some(&json!(true)));

        let back = serde_json::to_value(&message).unwrap();
        assert_eq!(back["pinned"], json!(true));
    }

    #[test]
    fn reaction_type_field() {
        let reaction: Reaction =
            serde_json::from_value(json!({"message_id": "m1", "user_id": "u1", "type": "love"}))
                .unwrap();
        assert_eq!(reaction.kind, "love");
        assert_eq!(reaction.score, 1);
    }
}

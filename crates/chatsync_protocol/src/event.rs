//! Inbound server events.

use crate::cid::Cid;
use crate::model::{ChannelData, Draft, Member, Message, Poll, Reaction, User};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Event discriminant.
///
/// Parsing never fails: unknown wire names become [`EventKind::Other`] so a
/// newer server cannot break an older client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    /// `connection.changed`
    ConnectionChanged,
    /// `message.new`
    MessageNew,
    /// `message.updated`
    MessageUpdated,
    /// `message.deleted`
    MessageDeleted,
    /// `message.undeleted`
    MessageUndeleted,
    /// `message.read`
    MessageRead,
    /// `notification.mark_read`
    NotificationMarkRead,
    /// `notification.mark_unread`
    NotificationMarkUnread,
    /// `notification.message_new`
    NotificationMessageNew,
    /// `notification.added_to_channel`
    NotificationAddedToChannel,
    /// `notification.removed_from_channel`
    NotificationRemovedFromChannel,
    /// `notification.channel_deleted`
    NotificationChannelDeleted,
    /// `reaction.new`
    ReactionNew,
    /// `reaction.updated`
    ReactionUpdated,
    /// `reaction.deleted`
    ReactionDeleted,
    /// `member.added`
    MemberAdded,
    /// `member.updated`
    MemberUpdated,
    /// `member.removed`
    MemberRemoved,
    /// `channel.updated`
    ChannelUpdated,
    /// `channel.deleted`
    ChannelDeleted,
    /// `channel.hidden`
    ChannelHidden,
    /// `channel.visible`
    ChannelVisible,
    /// `channel.truncated`
    ChannelTruncated,
    /// `draft.updated`
    DraftUpdated,
    /// `draft.deleted`
    DraftDeleted,
    /// `poll.updated`
    PollUpdated,
    /// `poll.closed`
    PollClosed,
    /// `poll.vote_casted`
    PollVoteCasted,
    /// `poll.vote_changed`
    PollVoteChanged,
    /// `poll.vote_removed`
    PollVoteRemoved,
    /// Any other event type.
    Other(String),
}

const KNOWN_KINDS: &[(&str, EventKind)] = &[
    ("connection.changed", EventKind::ConnectionChanged),
    ("message.new", EventKind::MessageNew),
    ("message.updated", EventKind::MessageUpdated),
    ("message.deleted", EventKind::MessageDeleted),
    ("message.undeleted", EventKind::MessageUndeleted),
    ("message.read", EventKind::MessageRead),
    ("notification.mark_read", EventKind::NotificationMarkRead),
    ("notification.mark_unread", EventKind::NotificationMarkUnread),
    ("notification.message_new", EventKind::NotificationMessageNew),
    ("notification.added_to_channel", EventKind::NotificationAddedToChannel),
    (
        "notification.removed_from_channel",
        EventKind::NotificationRemovedFromChannel,
    ),
    ("notification.channel_deleted", EventKind::NotificationChannelDeleted),
    ("reaction.new", EventKind::ReactionNew),
    ("reaction.updated", EventKind::ReactionUpdated),
    ("reaction.deleted", EventKind::ReactionDeleted),
    ("member.added", EventKind::MemberAdded),
    ("member.updated", EventKind::MemberUpdated),
    ("member.removed", EventKind::MemberRemoved),
    ("channel.updated", EventKind::ChannelUpdated),
    ("channel.deleted", EventKind::ChannelDeleted),
    ("channel.hidden", EventKind::ChannelHidden),
    ("channel.visible", EventKind::ChannelVisible),
    ("channel.truncated", EventKind::ChannelTruncated),
    ("draft.updated", EventKind::DraftUpdated),
    ("draft.deleted", EventKind::DraftDeleted),
    ("poll.updated", EventKind::PollUpdated),
    ("poll.closed", EventKind::PollClosed),
    ("poll.vote_casted", EventKind::PollVoteCasted),
    ("poll.vote_changed", EventKind::PollVoteChanged),
    ("poll.vote_removed", EventKind::PollVoteRemoved),
];

impl EventKind {
    /// Returns the wire name.
    pub fn as_str(&self) -> &str {
        if let EventKind::Other(name) = self {
            return name;
        }
        KNOWN_KINDS
            .iter()
            .find(|(_, kind)| kind == self)
            .map(|(name, _)| *name)
            .unwrap_or("unknown")
    }

    /// Parses a wire name.
    pub fn parse(name: &str) -> Self {
        KNOWN_KINDS
            .iter()
            .find(|(known, _)| *known == name)
            .map(|(_, kind)| kind.clone())
            .unwrap_or_else(|| EventKind::Other(name.to_string()))
    }

    /// Returns true for `reaction.*` events.
    pub fn is_reaction(&self) -> bool {
        matches!(
            self,
            EventKind::ReactionNew | EventKind::ReactionUpdated | EventKind::ReactionDeleted
        )
    }

    /// Returns true for `member.*` events.
    pub fn is_member(&self) -> bool {
        matches!(
            self,
            EventKind::MemberAdded | EventKind::MemberUpdated | EventKind::MemberRemoved
        )
    }

    /// Returns true for `poll.*` events.
    pub fn is_poll(&self) -> bool {
        matches!(
            self,
            EventKind::PollUpdated
                | EventKind::PollClosed
                | EventKind::PollVoteCasted
                | EventKind::PollVoteChanged
                | EventKind::PollVoteRemoved
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for EventKind {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<&str> for EventKind {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

/// An inbound event.
///
/// The `kind` decides which optional fields are meaningful. Consumers must
/// not assume a field is present because another event kind carries it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Channel the event targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<Cid>,
    /// Channel payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelData>,
    /// Message payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    /// Reaction payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction: Option<Reaction>,
    /// Member payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<Member>,
    /// Acting user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    /// Draft payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft: Option<Draft>,
    /// Poll payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll: Option<Poll>,
    /// Hard delete flag for `message.deleted`.
    #[serde(default)]
    pub hard_delete: bool,
    /// Connectivity flag for `connection.changed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    /// Server time of the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Read cursor: last read message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_message_id: Option<String>,
    /// Read cursor: unread count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_messages: Option<u32>,
    /// Read cursor: first unread message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_unread_message_id: Option<String>,
}

impl Event {
    /// Creates an event with only a kind set.
    pub fn new(kind: impl Into<EventKind>) -> Self {
        Self {
            kind: kind.into(),
            cid: None,
            channel: None,
            message: None,
            reaction: None,
            member: None,
            user: None,
            draft: None,
            poll: None,
            hard_delete: false,
            online: None,
            created_at: None,
            last_read_message_id: None,
            unread_messages: None,
            first_unread_message_id: None,
        }
    }

    /// Creates a `connection.changed` event.
    pub fn connection_changed(online: bool) -> Self {
        let mut event = Self::new(EventKind::ConnectionChanged);
        event.online = Some(online);
        event
    }

    /// Sets the cid.
    pub fn with_cid(mut self, cid: Cid) -> Self {
        self.cid = Some(cid);
        self
    }

    /// Sets the channel payload.
    pub fn with_channel(mut self, channel: ChannelData) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Sets the message payload.
    pub fn with_message(mut self, message: Message) -> Self {
        self.message = Some(message);
        self
    }

    /// Sets the reaction payload.
    pub fn with_reaction(mut self, reaction: Reaction) -> Self {
        self.reaction = Some(reaction);
        self
    }

    /// Sets the member payload.
    pub fn with_member(mut self, member: Member) -> Self {
        self.member = Some(member);
        self
    }

    /// Sets the acting user.
    pub fn with_user(mut self, user: User) -> Self {
        self.user = Some(user);
        self
    }

    /// Sets the draft payload.
    pub fn with_draft(mut self, draft: Draft) -> Self {
        self.draft = Some(draft);
        self
    }

    /// Sets the poll payload.
    pub fn with_poll(mut self, poll: Poll) -> Self {
        self.poll = Some(poll);
        self
    }

    /// Sets the server time.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_known_kind_round_trips_its_name() {
        for (name, kind) in KNOWN_KINDS {
            assert_eq!(EventKind::parse(name), *kind);
            assert_eq!(kind.as_str(), *name);
        }
    }

    #[test]
    fn unknown_kind_is_preserved() {
        let kind = EventKind::parse("typing.start");
        assert_eq!(kind, EventKind::Other("typing.start".into()));
        assert_eq!(kind.to_string(), "typing.start");
    }

    #[test]
    fn family_predicates() {
        assert!(EventKind::ReactionDeleted.is_reaction());
        assert!(!EventKind::MessageNew.is_reaction());
        assert!(EventKind::MemberRemoved.is_member());
        assert!(EventKind::PollVoteCasted.is_poll());
    }

    #[test]
    fn deserialize_wire_event() {
        let event: Event = serde_json::from_value(json!({
            "type": "message.deleted",
            "cid": "messaging:general",
            "hard_delete": true,
            "message": {"id": "m1", "text": ""}
        }))
        .unwrap();

        assert_eq!(event.kind, EventKind::MessageDeleted);
        assert_eq!(event.cid, Some(Cid::new("messaging", "general")));
        assert!(event.hard_delete);
        assert!(event.channel.is_none());
        assert_eq!(event.message.unwrap().id, "m1");
    }

    #[test]
    fn connection_changed_helper() {
        let event = Event::connection_changed(false);
        assert_eq!(event.kind, EventKind::ConnectionChanged);
        assert_eq!(event.online, Some(false));
    }
}

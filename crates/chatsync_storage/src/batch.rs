//! Write operations and atomic batches.

use chatsync_protocol::{
    ChannelData, Cid, Draft, Member, Message, Poll, Reaction, ReadState,
};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// A single persisted-storage write.
///
/// Building a `WriteOp` has no effect on its own; it only takes effect when
/// a [`Batch`] containing it is executed by a storage driver. This is what
/// lets callers prepare writes for several events and commit them as one
/// atomic unit.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert or replace channel data.
    UpsertChannelData {
        /// The channel.
        channel: ChannelData,
    },
    /// Delete a channel and every row that depends on it.
    DeleteChannel {
        /// The channel.
        cid: Cid,
    },
    /// Toggle the hidden flag of an existing channel.
    SetChannelHidden {
        /// The channel.
        cid: Cid,
        /// New flag value.
        hidden: bool,
    },
    /// Insert or replace messages.
    UpsertMessages {
        /// The messages; each must carry a cid.
        messages: Vec<Message>,
    },
    /// Update an existing message; no-op when absent.
    UpdateMessage {
        /// The message.
        message: Message,
    },
    /// Hard delete a message and its reactions.
    DeleteMessage {
        /// Message id.
        id: String,
    },
    /// Delete channel messages created at or before `truncated_at` (all when `None`).
    DeleteMessagesForChannel {
        /// The channel.
        cid: Cid,
        /// Truncation time.
        truncated_at: Option<DateTime<Utc>>,
    },
    /// Insert a reaction, optionally refreshing its message.
    InsertReaction {
        /// The reaction.
        reaction: Reaction,
        /// Message with refreshed reaction counts.
        message: Option<Message>,
    },
    /// Replace a reaction, optionally refreshing its message.
    UpdateReaction {
        /// The reaction.
        reaction: Reaction,
        /// Message with refreshed reaction counts.
        message: Option<Message>,
    },
    /// Delete a reaction, optionally refreshing its message.
    DeleteReaction {
        /// The reaction.
        reaction: Reaction,
        /// Message with refreshed reaction counts.
        message: Option<Message>,
    },
    /// Insert or replace a channel member.
    UpsertMember {
        /// The channel.
        cid: Cid,
        /// The member.
        member: Member,
    },
    /// Remove a channel member.
    DeleteMember {
        /// The channel.
        cid: Cid,
        /// Member user id.
        user_id: String,
    },
    /// Insert or replace a read cursor.
    UpsertRead {
        /// The channel.
        cid: Cid,
        /// The read cursor.
        read: ReadState,
    },
    /// Insert or replace a draft.
    UpsertDraft {
        /// The draft.
        draft: Draft,
    },
    /// Delete a draft.
    DeleteDraft {
        /// The channel.
        cid: Cid,
        /// Thread parent.
        parent_id: Option<String>,
    },
    /// Insert or replace a poll.
    UpsertPoll {
        /// The poll.
        poll: Poll,
    },
    /// Insert or replace app settings for a user.
    UpsertAppSettings {
        /// Owner of the settings.
        user_id: String,
        /// Raw settings document.
        settings: Value,
    },
    /// Record the last successful sync of a user.
    UpsertUserSyncStatus {
        /// The user.
        user_id: String,
        /// Sync time.
        last_synced_at: DateTime<Utc>,
    },
    /// Remove a pending task.
    DeletePendingTask {
        /// Task id.
        id: i64,
    },
}

impl WriteOp {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            WriteOp::UpsertChannelData { .. } => "upsert_channel_data",
            WriteOp::DeleteChannel { .. } => "delete_channel",
            WriteOp::SetChannelHidden { .. } => "set_channel_hidden",
            WriteOp::UpsertMessages { .. } => "upsert_messages",
            WriteOp::UpdateMessage { .. } => "update_message",
            WriteOp::DeleteMessage { .. } => "delete_message",
            WriteOp::DeleteMessagesForChannel { .. } => "delete_messages_for_channel",
            WriteOp::InsertReaction { .. } => "insert_reaction",
            WriteOp::UpdateReaction { .. } => "update_reaction",
            WriteOp::DeleteReaction { .. } => "delete_reaction",
            WriteOp::UpsertMember { .. } => "upsert_member",
            WriteOp::DeleteMember { .. } => "delete_member",
            WriteOp::UpsertRead { .. } => "upsert_read",
            WriteOp::UpsertDraft { .. } => "upsert_draft",
            WriteOp::DeleteDraft { .. } => "delete_draft",
            WriteOp::UpsertPoll { .. } => "upsert_poll",
            WriteOp::UpsertAppSettings { .. } => "upsert_app_settings",
            WriteOp::UpsertUserSyncStatus { .. } => "upsert_user_sync_status",
            WriteOp::DeletePendingTask { .. } => "delete_pending_task",
        }
    }
}

/// An ordered group of writes executed all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    ops: Vec<WriteOp>,
}

impl Batch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a write.
    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    /// Appends every write of another batch.
    pub fn extend(&mut self, other: Batch) {
        self.ops.extend(other.ops);
    }

    /// Puts every write of `head` in front of this batch's writes.
    pub fn prepend(&mut self, head: Batch) {
        let mut ops = head.ops;
        ops.append(&mut self.ops);
        self.ops = ops;
    }

    /// Returns the writes in execution order.
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Consumes the batch, returning its writes.
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    /// Returns the number of writes.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if there is nothing to write.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Returns the log names of the writes, in order.
    pub fn op_names(&self) -> Vec<&'static str> {
        self.ops.iter().map(WriteOp::name).collect()
    }
}

impl From<WriteOp> for Batch {
    fn from(op: WriteOp) -> Self {
        Self { ops: vec![op] }
    }
}

impl From<Vec<WriteOp>> for Batch {
    fn from(ops: Vec<WriteOp>) -> Self {
        Self { ops }
    }
}

impl FromIterator<Batch> for Batch {
    fn from_iter<I: IntoIterator<Item = Batch>>(iter: I) -> Self {
        let mut batch = Batch::new();
        for part in iter {
            batch.extend(part);
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delete(id: &str) -> WriteOp {
        WriteOp::DeleteMessage { id: id.into() }
    }

    #[test]
    fn prepend_keeps_head_first() {
        let mut batch = Batch::from(vec![delete("b"), delete("c")]);
        batch.prepend(Batch::from(delete("a")));

        assert_eq!(
            batch.ops(),
            &[delete("a"), delete("b"), delete("c")]
        );
    }

    #[test]
    fn collect_concatenates_in_order() {
        let batch: Batch = vec![Batch::from(delete("a")), Batch::new(), Batch::from(delete("b"))]
            .into_iter()
            .collect();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.op_names(), vec!["delete_message", "delete_message"]);
    }
}

//! Maps inbound events to storage batches.
//!
//! Every [`EventKind`] has one rule turning the event into a [`Batch`].
//! Rules whose writes hang off a channel row go through the channel guard,
//! which makes sure the channel exists before any dependent row is written.

use crate::client::ChatClient;
use crate::error::EngineResult;
use chatsync_protocol::{ChannelData, Cid, Event, EventKind, Message, ReadState, User};
use chatsync_storage::{Batch, StorageDriver, WriteOp};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// How a rule's batch relates to the channel row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Guard {
    /// The batch does not depend on the channel row.
    None,
    /// The channel row must exist first.
    Channel,
    /// The channel row must exist and be refreshed from live data.
    RefreshChannel,
}

/// Turns inbound events into storage batches.
pub struct EventMutationRouter<S, C> {
    storage: Arc<S>,
    client: Arc<C>,
}

impl<S: StorageDriver, C: ChatClient> EventMutationRouter<S, C> {
    /// Creates a router.
    pub fn new(storage: Arc<S>, client: Arc<C>) -> Self {
        Self { storage, client }
    }

    /// Routes an event and optionally executes the resulting batch.
    ///
    /// Never fails: errors are logged and produce an empty batch so that a
    /// bad event cannot stall the stream feeding the router.
    pub async fn handle_event(&self, event: &Event, execute: bool) -> Batch {
        match self.try_handle_event(event, execute).await {
            Ok(batch) => batch,
            Err(err) => {
                error!(kind = %event.kind, error = %err, "failed to mirror event");
                Batch::new()
            }
        }
    }

    /// Routes an event and optionally executes the resulting batch, propagating errors.
    pub async fn try_handle_event(&self, event: &Event, execute: bool) -> EngineResult<Batch> {
        let batch = self.route(event).await?;
        if execute && !batch.is_empty() {
            self.storage.execute_batch(&batch).await?;
            debug!(kind = %event.kind, ops = ?batch.op_names(), "mirrored event");
        }
        Ok(batch)
    }

    /// Builds the batch for an event without executing it.
    pub async fn route(&self, event: &Event) -> EngineResult<Batch> {
        let (batch, guard) = self.rule(event);
        if batch.is_empty() {
            return Ok(batch);
        }
        match (guard, event_cid(event)) {
            (Guard::None, _) | (_, None) => Ok(batch),
            (Guard::Channel, Some(cid)) => self.guard_channel(event, &cid, false, batch).await,
            (Guard::RefreshChannel, Some(cid)) => self.guard_channel(event, &cid, true, batch).await,
        }
    }

    fn rule(&self, event: &Event) -> (Batch, Guard) {
        match &event.kind {
            EventKind::ReactionNew | EventKind::ReactionUpdated | EventKind::ReactionDeleted => {
                (reaction_batch(event), Guard::Channel)
            }
            EventKind::MessageNew => (self.new_message_batch(event), Guard::Channel),
            EventKind::MessageDeleted if event.hard_delete => {
                (hard_delete_batch(event), Guard::Channel)
            }
            EventKind::MessageDeleted | EventKind::MessageUpdated | EventKind::MessageUndeleted => {
                (update_message_batch(event), Guard::Channel)
            }
            EventKind::MemberAdded | EventKind::MemberUpdated | EventKind::MemberRemoved => {
                (member_batch(event), Guard::RefreshChannel)
            }
            EventKind::ChannelHidden | EventKind::ChannelVisible => {
                (visibility_batch(event), Guard::None)
            }
            EventKind::ChannelTruncated => (self.truncate_batch(event), Guard::Channel),
            EventKind::ChannelUpdated | EventKind::NotificationAddedToChannel => {
                (channel_batch(event), Guard::None)
            }
            EventKind::NotificationMessageNew => {
                (message_upsert_batch(event), Guard::RefreshChannel)
            }
            EventKind::ChannelDeleted
            | EventKind::NotificationChannelDeleted
            | EventKind::NotificationRemovedFromChannel => (channel_delete_batch(event), Guard::None),
            EventKind::MessageRead | EventKind::NotificationMarkRead => {
                (mark_read_batch(event), Guard::Channel)
            }
            EventKind::NotificationMarkUnread => (mark_unread_batch(event), Guard::Channel),
            EventKind::DraftUpdated | EventKind::DraftDeleted => (draft_batch(event), Guard::Channel),
            EventKind::PollUpdated
            | EventKind::PollClosed
            | EventKind::PollVoteCasted
            | EventKind::PollVoteChanged
            | EventKind::PollVoteRemoved => (poll_batch(event), Guard::None),
            EventKind::ConnectionChanged | EventKind::Other(_) => (Batch::new(), Guard::None),
        }
    }

    /// Prepends a channel upsert when the channel row is missing or must be refreshed.
    async fn guard_channel(
        &self,
        event: &Event,
        cid: &Cid,
        force_update: bool,
        batch: Batch,
    ) -> EngineResult<Batch> {
        if !force_update && self.storage.channel_exists(cid).await? {
            return Ok(batch);
        }

        let Some(channel) = self.resolve_channel(event, cid) else {
            warn!(%cid, kind = %event.kind, "channel data unavailable; skipping write");
            return Ok(Batch::new());
        };

        let mut guarded = Batch::from(WriteOp::UpsertChannelData { channel });
        guarded.extend(batch);
        Ok(guarded)
    }

    fn resolve_channel(&self, event: &Event, cid: &Cid) -> Option<ChannelData> {
        if let Some(channel) = event.channel.as_ref().filter(|c| &c.cid == cid) {
            return Some(channel.clone());
        }
        self.client
            .channel_runtime(cid)
            .filter(|runtime| runtime.is_usable())
            .and_then(|runtime| runtime.data)
    }

    fn new_message_batch(&self, event: &Event) -> Batch {
        let Some(message) = event_message(event) else {
            return Batch::new();
        };
        let cid = message.cid.clone();
        let from_other = message.sender_id() != self.client.user_id().as_deref();

        let mut batch = Batch::from(WriteOp::UpsertMessages {
            messages: vec![message],
        });
        if let (true, Some(cid)) = (from_other, cid) {
            if let Some(read) = self.own_read_cursor(&cid) {
                batch.push(read);
            }
        }
        batch
    }

    fn truncate_batch(&self, event: &Event) -> Batch {
        let Some(cid) = event_cid(event) else {
            return Batch::new();
        };
        let mut batch = Batch::from(WriteOp::DeleteMessagesForChannel {
            cid: cid.clone(),
            truncated_at: event.created_at,
        });
        if let Some(read) = self.own_read_cursor(&cid) {
            batch.push(read);
        }
        batch
    }

    /// Read cursor of the local user with the live unread count.
    fn own_read_cursor(&self, cid: &Cid) -> Option<WriteOp> {
        let user_id = self.client.user_id()?;
        let runtime = self.client.channel_runtime(cid)?;
        Some(WriteOp::UpsertRead {
            cid: cid.clone(),
            read: ReadState {
                user: User::new(user_id),
                last_read: runtime.last_read.unwrap_or_else(Utc::now),
                last_read_message_id: runtime.last_read_message_id,
                unread_messages: runtime.unread_count,
            },
        })
    }
}

/// The channel an event targets, from the most specific field available.
fn event_cid(event: &Event) -> Option<Cid> {
    event
        .cid
        .clone()
        .or_else(|| event.channel.as_ref().map(|c| c.cid.clone()))
        .or_else(|| event.message.as_ref().and_then(|m| m.cid.clone()))
        .or_else(|| event.draft.as_ref().map(|d| d.cid.clone()))
}

/// The event's message with its cid filled in from the event.
fn event_message(event: &Event) -> Option<Message> {
    let mut message = event.message.clone()?;
    if message.cid.is_none() {
        message.cid = event_cid(event);
    }
    Some(message)
}

fn reaction_batch(event: &Event) -> Batch {
    let Some(reaction) = event.reaction.clone() else {
        return Batch::new();
    };
    let message = event_message(event);
    let op = match event.kind {
        EventKind::ReactionNew => WriteOp::InsertReaction { reaction, message },
        EventKind::ReactionUpdated => WriteOp::UpdateReaction { reaction, message },
        _ => WriteOp::DeleteReaction { reaction, message },
    };
    Batch::from(op)
}

fn hard_delete_batch(event: &Event) -> Batch {
    match &event.message {
        Some(message) if !message.is_thread_only_reply() => Batch::from(WriteOp::DeleteMessage {
            id: message.id.clone(),
        }),
        _ => Batch::new(),
    }
}

fn update_message_batch(event: &Event) -> Batch {
    match event_message(event) {
        Some(message) if !message.is_thread_only_reply() => {
            Batch::from(WriteOp::UpdateMessage { message })
        }
        _ => Batch::new(),
    }
}

fn message_upsert_batch(event: &Event) -> Batch {
    match event_message(event) {
        Some(message) => Batch::from(WriteOp::UpsertMessages {
            messages: vec![message],
        }),
        None => Batch::new(),
    }
}

fn member_batch(event: &Event) -> Batch {
    let (Some(cid), Some(member)) = (event_cid(event), event.member.clone()) else {
        return Batch::new();
    };
    let op = match event.kind {
        EventKind::MemberRemoved => WriteOp::DeleteMember {
            cid,
            user_id: member.user_id,
        },
        _ => WriteOp::UpsertMember { cid, member },
    };
    Batch::from(op)
}

fn visibility_batch(event: &Event) -> Batch {
    let hidden = event.kind == EventKind::ChannelHidden;
    if let Some(channel) = &event.channel {
        let mut channel = channel.clone();
        channel.hidden = hidden;
        return Batch::from(WriteOp::UpsertChannelData { channel });
    }
    match event_cid(event) {
        Some(cid) => Batch::from(WriteOp::SetChannelHidden { cid, hidden }),
        None => Batch::new(),
    }
}

fn channel_batch(event: &Event) -> Batch {
    match &event.channel {
        Some(channel) => Batch::from(WriteOp::UpsertChannelData {
            channel: channel.clone(),
        }),
        None => Batch::new(),
    }
}

fn channel_delete_batch(event: &Event) -> Batch {
    match event_cid(event) {
        Some(cid) => Batch::from(WriteOp::DeleteChannel { cid }),
        None => Batch::new(),
    }
}

fn mark_read_batch(event: &Event) -> Batch {
    let (Some(cid), Some(user)) = (event_cid(event), event.user.clone()) else {
        return Batch::new();
    };
    Batch::from(WriteOp::UpsertRead {
        cid,
        read: ReadState {
            user,
            last_read: event.created_at.unwrap_or_else(Utc::now),
            last_read_message_id: event.last_read_message_id.clone(),
            unread_messages: 0,
        },
    })
}

fn mark_unread_batch(event: &Event) -> Batch {
    let (Some(cid), Some(user)) = (event_cid(event), event.user.clone()) else {
        return Batch::new();
    };
    Batch::from(WriteOp::UpsertRead {
        cid,
        read: ReadState {
            user,
            last_read: event.created_at.unwrap_or_else(Utc::now),
            last_read_message_id: event.last_read_message_id.clone(),
            unread_messages: event.unread_messages.unwrap_or(0),
        },
    })
}

fn draft_batch(event: &Event) -> Batch {
    let Some(draft) = event.draft.clone() else {
        return Batch::new();
    };
    match event.kind {
        EventKind::DraftDeleted => Batch::from(WriteOp::DeleteDraft {
            cid: draft.cid,
            parent_id: draft.parent_id,
        }),
        _ => Batch::from(WriteOp::UpsertDraft { draft }),
    }
}

fn poll_batch(event: &Event) -> Batch {
    match &event.poll {
        Some(poll) => Batch::from(WriteOp::UpsertPoll { poll: poll.clone() }),
        None => Batch::new(),
    }
}

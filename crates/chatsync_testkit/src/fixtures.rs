//! Test fixtures.
//!
//! Builders for the values most tests need, and a harness wiring
//! [`InMemoryStorage`] to a [`MockChatClient`].

use chatsync_engine::{
    ChannelRuntime, EngineConfig, EventMutationRouter, MessageReconciler, MockChatClient,
    OfflineSupport, PendingMutationQueue, SyncCoordinator,
};
use chatsync_protocol::{
    ChannelData, Cid, Draft, DraftMessage, Event, EventKind, Message, PendingTask, Reaction,
    TaskPayload, User,
};
use chatsync_storage::{Batch, InMemoryStorage, StorageDriver, WriteOp};
use chrono::{Duration, Utc};
use std::sync::Arc;

/// Returns a `messaging` channel id.
pub fn cid(id: &str) -> Cid {
    Cid::new("messaging", id)
}

/// Returns channel data for `cid`.
pub fn channel(cid: &Cid) -> ChannelData {
    ChannelData::new(cid.clone())
}

/// Returns a message in `cid` sent by `sender`.
pub fn message(cid: &Cid, id: &str, sender: &str) -> Message {
    let mut message = Message::new(id, format!("message {id}"));
    message.cid = Some(cid.clone());
    message.user = Some(User::new(sender));
    message.created_at = Some(Utc::now());
    message
}

/// Returns a thread reply that is not shown in the channel.
pub fn thread_reply(cid: &Cid, id: &str, parent_id: &str, sender: &str) -> Message {
    let mut reply = message(cid, id, sender);
    reply.parent_id = Some(parent_id.to_string());
    reply
}

/// Returns a channel draft.
pub fn draft(cid: &Cid, text: &str) -> Draft {
    Draft {
        cid: cid.clone(),
        parent_id: None,
        message: DraftMessage {
            id: format!("draft-{}", cid.channel_id()),
            text: text.to_string(),
        },
        created_at: Some(Utc::now()),
    }
}

/// Returns a `message.new` event without channel payload.
pub fn message_new(message: Message) -> Event {
    let mut event = Event::new(EventKind::MessageNew).with_message(message.clone());
    event.cid = message.cid;
    event
}

/// Returns a `message.new` event carrying its channel payload.
pub fn message_new_with_channel(message: Message) -> Event {
    let event = message_new(message);
    match event.cid.clone() {
        Some(cid) => event.with_channel(ChannelData::new(cid)),
        None => event,
    }
}

/// Returns a `reaction.new` event.
pub fn reaction_new(cid: &Cid, message: Message, kind: &str, user_id: &str) -> Event {
    Event::new(EventKind::ReactionNew)
        .with_cid(cid.clone())
        .with_reaction(Reaction::new(message.id.clone(), user_id, kind))
        .with_message(message)
}

/// Returns a pending send-message task.
pub fn send_message_task(cid: &Cid, id: &str) -> PendingTask {
    PendingTask::new(
        Some(cid.clone()),
        id,
        TaskPayload::SendMessage {
            message: Message::new(id, format!("queued {id}")),
        },
    )
}

/// Returns a live channel that can stand in for stored channel data.
pub fn live_runtime(cid: &Cid, unread_count: u32) -> ChannelRuntime {
    ChannelRuntime {
        data: Some(ChannelData::new(cid.clone())),
        initialized: true,
        disconnected: false,
        unread_count,
        last_read: Some(Utc::now()),
        last_read_message_id: None,
    }
}

/// In-memory storage and a mock client for one user.
pub struct TestHarness {
    /// The storage driver.
    pub storage: Arc<InMemoryStorage>,
    /// The client.
    pub client: Arc<MockChatClient>,
    /// The configuration passed to components.
    pub config: EngineConfig,
}

impl TestHarness {
    /// Creates a harness with an empty store and a healthy client for `user_id`.
    pub fn new(user_id: &str) -> Self {
        Self {
            storage: Arc::new(InMemoryStorage::new().with_recording()),
            client: Arc::new(MockChatClient::new(user_id)),
            config: EngineConfig::default(),
        }
    }

    /// Creates a harness whose store already mirrors `cids`.
    pub fn with_channels(user_id: &str, cids: &[Cid]) -> Self {
        Self {
            storage: Arc::new(InMemoryStorage::with_channels(cids.iter().map(channel)).with_recording()),
            ..Self::new(user_id)
        }
    }

    /// Builds a queue.
    pub fn queue(&self) -> PendingMutationQueue<InMemoryStorage, MockChatClient> {
        PendingMutationQueue::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.client),
            self.config.error_policy.clone(),
        )
    }

    /// Builds a router.
    pub fn router(&self) -> EventMutationRouter<InMemoryStorage, MockChatClient> {
        EventMutationRouter::new(Arc::clone(&self.storage), Arc::clone(&self.client))
    }

    /// Builds a coordinator with its own queue and router.
    pub fn coordinator(&self) -> Arc<SyncCoordinator<InMemoryStorage, MockChatClient>> {
        Arc::new(SyncCoordinator::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.client),
            Arc::new(self.queue()),
            Arc::new(self.router()),
            self.config.clone(),
        ))
    }

    /// Builds a reconciler.
    pub fn reconciler(&self) -> MessageReconciler<MockChatClient> {
        MessageReconciler::new(Arc::clone(&self.client), self.config.error_policy.clone())
    }

    /// Builds the full offline support layer.
    pub fn offline_support(&self) -> OfflineSupport<InMemoryStorage, MockChatClient> {
        OfflineSupport::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.client),
            self.config.clone(),
        )
    }

    /// Stores a sync cursor `days` days in the past for `user_id`.
    pub async fn set_cursor_days_ago(&self, user_id: &str, days: i64) {
        self.storage
            .execute_batch(&Batch::from(WriteOp::UpsertUserSyncStatus {
                user_id: user_id.to_string(),
                last_synced_at: Utc::now() - Duration::days(days),
            }))
            .await
            .expect("Failed to store sync cursor");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_new_takes_cid_from_message() {
        let general = cid("general");
        let event = message_new(message(&general, "m1", "bob"));
        assert_eq!(event.cid, Some(general.clone()));
        assert!(event.channel.is_none());

        let event = message_new_with_channel(message(&general, "m2", "bob"));
        assert_eq!(event.channel.map(|c| c.cid), Some(general));
    }

    #[test]
    fn thread_reply_is_thread_only() {
        let reply = thread_reply(&cid("general"), "r1", "m1", "bob");
        assert!(reply.is_thread_only_reply());
    }

    #[tokio::test]
    async fn harness_with_channels_mirrors_them() {
        let harness = TestHarness::with_channels("alice", &[cid("a"), cid("b")]);
        let cids = harness.storage.get_all_channel_cids().await.unwrap();
        assert_eq!(cids.len(), 2);

        harness.set_cursor_days_ago("alice", 3).await;
        let cursor = harness.storage.get_last_synced_at("alice").await.unwrap();
        assert_eq!((Utc::now() - cursor.unwrap()).num_days(), 3);
    }
}

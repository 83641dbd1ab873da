//! Storage driver contract.

use crate::batch::Batch;
use crate::error::StorageResult;
use async_trait::async_trait;
use chatsync_protocol::{ChannelData, Cid, Draft, Member, Message, PendingTask, Poll, Reaction, ReadState};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Persistent storage behind the local mirror.
///
/// Drivers are **capability contracts**: the consistency layer only needs
/// read accessors, atomic batch execution and a handful of lifecycle calls.
/// It never depends on a concrete engine or query language.
///
/// # Invariants
///
/// - `execute_batch` applies every write of the batch or none of them
/// - Writes of a batch are applied in order
/// - Rows that depend on a channel are rejected when the channel row is missing
/// - `get_pending_tasks` returns tasks in creation order
/// - `add_pending_task` assigns a durable id that is never reused
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Creates the schema if needed. Returns true when the store is usable.
    async fn initialize_db(&self) -> StorageResult<bool>;

    /// Drops every row, including sync status and pending tasks.
    async fn reset_db(&self) -> StorageResult<()>;

    /// Executes a batch atomically.
    ///
    /// # Errors
    ///
    /// Returns an error, and leaves the store unchanged, if any write fails.
    async fn execute_batch(&self, batch: &Batch) -> StorageResult<()>;

    /// Returns true if a channel row exists.
    async fn channel_exists(&self, cid: &Cid) -> StorageResult<bool>;

    /// Returns a channel row.
    async fn get_channel(&self, cid: &Cid) -> StorageResult<Option<ChannelData>>;

    /// Returns every stored channel id.
    async fn get_all_channel_cids(&self) -> StorageResult<Vec<Cid>>;

    /// Returns the last successful sync time of a user.
    async fn get_last_synced_at(&self, user_id: &str) -> StorageResult<Option<DateTime<Utc>>>;

    /// Returns every pending task in creation order.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::Decode`] if a stored task has a kind
    /// this layer cannot execute.
    async fn get_pending_tasks(&self) -> StorageResult<Vec<PendingTask>>;

    /// Persists a pending task and returns its durable id.
    async fn add_pending_task(&self, task: &PendingTask) -> StorageResult<i64>;

    /// Removes a pending task. Removing an absent id is not an error.
    async fn delete_pending_task(&self, id: i64) -> StorageResult<()>;

    /// Returns a message.
    async fn get_message(&self, id: &str) -> StorageResult<Option<Message>>;

    /// Returns the draft of a channel or thread.
    async fn get_draft(&self, cid: &Cid, parent_id: Option<&str>) -> StorageResult<Option<Draft>>;

    /// Returns the reactions of a message.
    async fn get_reactions(&self, message_id: &str) -> StorageResult<Vec<Reaction>>;

    /// Returns the members of a channel.
    async fn get_members(&self, cid: &Cid) -> StorageResult<Vec<Member>>;

    /// Returns the read cursors of a channel.
    async fn get_reads(&self, cid: &Cid) -> StorageResult<Vec<ReadState>>;

    /// Returns a poll.
    async fn get_poll(&self, id: &str) -> StorageResult<Option<Poll>>;

    /// Returns the app settings stored for a user.
    async fn get_app_settings(&self, user_id: &str) -> StorageResult<Option<Value>>;
}

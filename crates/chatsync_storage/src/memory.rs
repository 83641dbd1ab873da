//! In-memory storage driver.

use crate::batch::{Batch, WriteOp};
use crate::driver::StorageDriver;
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use chatsync_protocol::{
    ChannelData, Cid, Draft, Member, Message, PendingTask, Poll, Reaction, ReadState, TaskRecord,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Reaction key: message id, user id, reaction type.
type ReactionKey = (String, String, String);

#[derive(Debug, Clone, Default)]
struct Tables {
    channels: BTreeMap<Cid, ChannelData>,
    messages: BTreeMap<String, Message>,
    reactions: BTreeMap<ReactionKey, Reaction>,
    members: BTreeMap<(Cid, String), Member>,
    reads: BTreeMap<(Cid, String), ReadState>,
    drafts: BTreeMap<(Cid, Option<String>), Draft>,
    polls: BTreeMap<String, Poll>,
    app_settings: BTreeMap<String, Value>,
    sync_status: BTreeMap<String, DateTime<Utc>>,
    tasks: BTreeMap<i64, TaskRecord>,
    next_task_id: i64,
}

impl Tables {
    fn require_channel(&self, table: &'static str, cid: &Cid) -> StorageResult<()> {
        if self.channels.contains_key(cid) {
            Ok(())
        } else {
            Err(StorageError::missing_channel(table, cid))
        }
    }

    fn put_message(&mut self, message: &Message) -> StorageResult<()> {
        let cid = message.cid.as_ref().ok_or_else(|| StorageError::Constraint {
            table: "messages",
            reason: format!("message {} has no cid", message.id),
        })?;
        self.require_channel("messages", cid)?;
        self.messages.insert(message.id.clone(), message.clone());
        Ok(())
    }

    /// Replaces an existing message, keeping its cid if the update lacks one.
    fn refresh_message(&mut self, message: &Message) -> StorageResult<()> {
        match self.messages.get_mut(&message.id) {
            Some(existing) => {
                let cid = message.cid.clone().or_else(|| existing.cid.clone());
                *existing = message.clone();
                existing.cid = cid;
                Ok(())
            }
            None if message.cid.is_some() => self.put_message(message),
            None => Ok(()),
        }
    }

    fn remove_messages<F: Fn(&Message) -> bool>(&mut self, predicate: F) {
        let doomed: Vec<String> = self
            .messages
            .values()
            .filter(|m| predicate(m))
            .map(|m| m.id.clone())
            .collect();
        for id in &doomed {
            self.messages.remove(id);
        }
        self.reactions.retain(|(message_id, _, _), _| !doomed.contains(message_id));
    }

    fn put_reaction(&mut self, reaction: &Reaction) -> StorageResult<()> {
        if !self.messages.contains_key(&reaction.message_id) {
            return Err(StorageError::ForeignKey {
                table: "reactions",
                parent: format!("message {}", reaction.message_id),
            });
        }
        self.reactions.insert(reaction_key(reaction), reaction.clone());
        Ok(())
    }

    fn apply(&mut self, op: &WriteOp) -> StorageResult<()> {
        match op {
            WriteOp::UpsertChannelData { channel } => {
                self.channels.insert(channel.cid.clone(), channel.clone());
            }
            WriteOp::DeleteChannel { cid } => {
                self.channels.remove(cid);
                self.remove_messages(|m| m.cid.as_ref() == Some(cid));
                self.members.retain(|(c, _), _| c != cid);
                self.reads.retain(|(c, _), _| c != cid);
                self.drafts.retain(|(c, _), _| c != cid);
            }
            WriteOp::SetChannelHidden { cid, hidden } => {
                if let Some(channel) = self.channels.get_mut(cid) {
                    channel.hidden = *hidden;
                }
            }
            WriteOp::UpsertMessages { messages } => {
                for message in messages {
                    self.put_message(message)?;
                }
            }
            WriteOp::UpdateMessage { message } => {
                if self.messages.contains_key(&message.id) {
                    self.refresh_message(message)?;
                }
            }
            WriteOp::DeleteMessage { id } => {
                self.remove_messages(|m| &m.id == id);
            }
            WriteOp::DeleteMessagesForChannel { cid, truncated_at } => {
                self.remove_messages(|m| {
                    m.cid.as_ref() == Some(cid)
                        && match (truncated_at, m.created_at) {
                            (Some(limit), Some(created)) => created <= *limit,
                            _ => true,
                        }
                });
            }
            WriteOp::InsertReaction { reaction, message }
            | WriteOp::UpdateReaction { reaction, message } => {
                if let Some(message) = message {
                    self.refresh_message(message)?;
                }
                self.put_reaction(reaction)?;
            }
            WriteOp::DeleteReaction { reaction, message } => {
                if let Some(message) = message {
                    self.refresh_message(message)?;
                }
                self.reactions.remove(&reaction_key(reaction));
            }
            WriteOp::UpsertMember { cid, member } => {
                self.require_channel("members", cid)?;
                self.members
                    .insert((cid.clone(), member.user_id.clone()), member.clone());
            }
            WriteOp::DeleteMember { cid, user_id } => {
                self.members.remove(&(cid.clone(), user_id.clone()));
            }
            WriteOp::UpsertRead { cid, read } => {
                self.require_channel("reads", cid)?;
                self.reads
                    .insert((cid.clone(), read.user.id.clone()), read.clone());
            }
            WriteOp::UpsertDraft { draft } => {
                self.require_channel("drafts", &draft.cid)?;
                self.drafts
                    .insert((draft.cid.clone(), draft.parent_id.clone()), draft.clone());
            }
            WriteOp::DeleteDraft { cid, parent_id } => {
                self.drafts.remove(&(cid.clone(), parent_id.clone()));
            }
            WriteOp::UpsertPoll { poll } => {
                self.polls.insert(poll.id.clone(), poll.clone());
            }
            WriteOp::UpsertAppSettings { user_id, settings } => {
                self.app_settings.insert(user_id.clone(), settings.clone());
            }
            WriteOp::UpsertUserSyncStatus {
                user_id,
                last_synced_at,
            } => {
                self.sync_status.insert(user_id.clone(), *last_synced_at);
            }
            WriteOp::DeletePendingTask { id } => {
                self.tasks.remove(id);
            }
        }
        Ok(())
    }
}

fn reaction_key(reaction: &Reaction) -> ReactionKey {
    (
        reaction.message_id.clone(),
        reaction.user_id.clone(),
        reaction.kind.clone(),
    )
}

/// An in-memory storage driver.
///
/// Behaves like a relational driver with foreign keys on: rows that depend on
/// a channel (messages, members, reads, drafts) or on a message (reactions)
/// are rejected when the parent is missing, and a rejected write rolls back
/// the whole batch.
///
/// Suitable for:
/// - Unit and integration tests
/// - Ephemeral sessions that don't need persistence
///
/// Counts resets. Committed batches are kept only when recording is turned
/// on with [`InMemoryStorage::with_recording`], so long sessions don't grow
/// an unbounded log.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    tables: RwLock<Tables>,
    recording: AtomicBool,
    committed: Mutex<Vec<Batch>>,
    initialized: AtomicBool,
    resets: AtomicUsize,
    fail_next_batch: Mutex<Option<String>>,
}

impl InMemoryStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store with pre-existing channel rows.
    #[must_use]
    pub fn with_channels(channels: impl IntoIterator<Item = ChannelData>) -> Self {
        let storage = Self::new();
        {
            let mut tables = storage.tables.write();
            for channel in channels {
                tables.channels.insert(channel.cid.clone(), channel);
            }
        }
        storage
    }

    /// Keeps a copy of every committed batch for [`committed_batches`](Self::committed_batches).
    #[must_use]
    pub fn with_recording(self) -> Self {
        self.recording.store(true, Ordering::SeqCst);
        self
    }

    /// Makes the next `execute_batch` fail without applying anything.
    pub fn fail_next_batch(&self, reason: impl Into<String>) {
        *self.fail_next_batch.lock() = Some(reason.into());
    }

    /// Returns every committed batch, oldest first.
    ///
    /// Always empty unless the store was built with recording on.
    pub fn committed_batches(&self) -> Vec<Batch> {
        self.committed.lock().clone()
    }

    /// Returns how many times the store was reset.
    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    /// Returns true once `initialize_db` has run.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Returns the number of stored pending tasks.
    pub fn pending_task_count(&self) -> usize {
        self.tables.read().tasks.len()
    }

    /// Stores a raw task record as-is, assigning it an id.
    ///
    /// Useful for simulating rows written by another client version.
    pub fn insert_task_record(&self, mut record: TaskRecord) -> i64 {
        let mut tables = self.tables.write();
        tables.next_task_id += 1;
        let id = tables.next_task_id;
        record.id = Some(id);
        tables.tasks.insert(id, record);
        id
    }

    /// Returns the stored messages of a channel.
    pub fn messages_for_channel(&self, cid: &Cid) -> Vec<Message> {
        self.tables
            .read()
            .messages
            .values()
            .filter(|m| m.cid.as_ref() == Some(cid))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StorageDriver for InMemoryStorage {
    async fn initialize_db(&self) -> StorageResult<bool> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(true)
    }

    async fn reset_db(&self) -> StorageResult<()> {
        *self.tables.write() = Tables::default();
        self.resets.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("in-memory storage reset");
        Ok(())
    }

    async fn execute_batch(&self, batch: &Batch) -> StorageResult<()> {
        if let Some(reason) = self.fail_next_batch.lock().take() {
            return Err(StorageError::Backend(reason));
        }

        let mut tables = self.tables.write();
        let mut working = tables.clone();
        for op in batch.ops() {
            working.apply(op)?;
        }
        *tables = working;
        drop(tables);

        if self.recording.load(Ordering::SeqCst) {
            self.committed.lock().push(batch.clone());
        }
        Ok(())
    }

    async fn channel_exists(&self, cid: &Cid) -> StorageResult<bool> {
        Ok(self.tables.read().channels.contains_key(cid))
    }

    async fn get_channel(&self, cid: &Cid) -> StorageResult<Option<ChannelData>> {
        Ok(self.tables.read().channels.get(cid).cloned())
    }

    async fn get_all_channel_cids(&self) -> StorageResult<Vec<Cid>> {
        Ok(self.tables.read().channels.keys().cloned().collect())
    }

    async fn get_last_synced_at(&self, user_id: &str) -> StorageResult<Option<DateTime<Utc>>> {
        Ok(self.tables.read().sync_status.get(user_id).copied())
    }

    async fn get_pending_tasks(&self) -> StorageResult<Vec<PendingTask>> {
        let mut records: Vec<TaskRecord> = self.tables.read().tasks.values().cloned().collect();
        records.sort_by_key(|r| (r.created_at, r.id));
        records
            .into_iter()
            .map(|r| PendingTask::from_record(r).map_err(StorageError::from))
            .collect()
    }

    async fn add_pending_task(&self, task: &PendingTask) -> StorageResult<i64> {
        let record = task.to_record()?;
        Ok(self.insert_task_record(record))
    }

    async fn delete_pending_task(&self, id: i64) -> StorageResult<()> {
        self.tables.write().tasks.remove(&id);
        Ok(())
    }

    async fn get_message(&self, id: &str) -> StorageResult<Option<Message>> {
        Ok(self.tables.read().messages.get(id).cloned())
    }

    async fn get_draft(&self, cid: &Cid, parent_id: Option<&str>) -> StorageResult<Option<Draft>> {
        let key = (cid.clone(), parent_id.map(str::to_string));
        Ok(self.tables.read().drafts.get(&key).cloned())
    }

    async fn get_reactions(&self, message_id: &str) -> StorageResult<Vec<Reaction>> {
        Ok(self
            .tables
            .read()
            .reactions
            .values()
            .filter(|r| r.message_id == message_id)
            .cloned()
            .collect())
    }

    async fn get_members(&self, cid: &Cid) -> StorageResult<Vec<Member>> {
        Ok(self
            .tables
            .read()
            .members
            .iter()
            .filter(|((c, _), _)| c == cid)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn get_reads(&self, cid: &Cid) -> StorageResult<Vec<ReadState>> {
        Ok(self
            .tables
            .read()
            .reads
            .iter()
            .filter(|((c, _), _)| c == cid)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn get_poll(&self, id: &str) -> StorageResult<Option<Poll>> {
        Ok(self.tables.read().polls.get(id).cloned())
    }

    async fn get_app_settings(&self, user_id: &str) -> StorageResult<Option<Value>> {
        Ok(self.tables.read().app_settings.get(user_id).cloned())
    }
}

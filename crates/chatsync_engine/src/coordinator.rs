//! Connectivity-driven resynchronization.
//!
//! On every reconnect the coordinator first replays the pending mutation
//! queue, then catches up on missed events since the stored cursor. A cursor
//! older than the drift limit, or any failure during catch-up, resets the
//! local store instead.

use crate::client::{BoxFuture, ChatClient, EventFilter, Subscription};
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::queue::PendingMutationQueue;
use crate::router::EventMutationRouter;
use chatsync_protocol::{Event, EventKind};
use chatsync_storage::{Batch, StorageDriver, WriteOp};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Listener for sync status transitions.
pub type StatusListener = Arc<dyn Fn(bool) + Send + Sync>;

type ScheduledCallback = Box<dyn FnOnce() -> BoxFuture<()> + Send>;

/// Sync progress.
///
/// Connectivity is tracked separately, see [`SyncCoordinator::is_online`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// No sync has run yet.
    NeverSynced,
    /// A sync is running.
    Syncing,
    /// The last sync finished.
    Synced,
}

/// Why the local store was reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// The cursor was older than the drift limit.
    Drift {
        /// Whole days since the cursor.
        days: i64,
    },
    /// The catch-up failed.
    Failure,
}

/// Result of one catch-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No user or no mirrored channels; nothing to do.
    Skipped,
    /// No cursor yet; a first cursor was recorded.
    FirstSync,
    /// Missed events were applied.
    CaughtUp {
        /// Events received.
        events: usize,
        /// Writes applied.
        writes: usize,
    },
    /// The local store was reset.
    Reset(ResetReason),
}

/// Keeps the local store in step with the server across reconnects.
pub struct SyncCoordinator<S, C> {
    storage: Arc<S>,
    client: Arc<C>,
    queue: Arc<PendingMutationQueue<S, C>>,
    router: Arc<EventMutationRouter<S, C>>,
    config: EngineConfig,
    phase: RwLock<SyncPhase>,
    online: AtomicBool,
    synced: AtomicBool,
    sync_lock: tokio::sync::Mutex<()>,
    connection_listener: Mutex<Option<Subscription>>,
    status_listeners: Arc<Mutex<Vec<(u64, StatusListener)>>>,
    next_listener: AtomicU64,
    scheduled: Mutex<HashMap<String, ScheduledCallback>>,
}

impl<S, C> SyncCoordinator<S, C>
where
    S: StorageDriver + 'static,
    C: ChatClient + 'static,
{
    /// Creates a coordinator.
    pub fn new(
        storage: Arc<S>,
        client: Arc<C>,
        queue: Arc<PendingMutationQueue<S, C>>,
        router: Arc<EventMutationRouter<S, C>>,
        config: EngineConfig,
    ) -> Self {
        Self {
            storage,
            client,
            queue,
            router,
            config,
            phase: RwLock::new(SyncPhase::NeverSynced),
            online: AtomicBool::new(false),
            synced: AtomicBool::new(false),
            sync_lock: tokio::sync::Mutex::new(()),
            connection_listener: Mutex::new(None),
            status_listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener: AtomicU64::new(1),
            scheduled: Mutex::new(HashMap::new()),
        }
    }

    /// Starts the coordinator.
    ///
    /// Syncs right away when connected with a user, then listens for
    /// connectivity changes. Calling it again replaces the previous listener.
    pub async fn init(self: &Arc<Self>) {
        if self.client.user_id().is_some() && self.client.is_connection_healthy() {
            self.online.store(true, Ordering::SeqCst);
            self.sync_and_execute_pending().await;
            self.notify_status(true).await;
        }

        if let Some(previous) = self.connection_listener.lock().take() {
            previous.unsubscribe();
        }

        let coordinator = Arc::downgrade(self);
        let subscription = self.client.subscribe(
            EventFilter::Kind(EventKind::ConnectionChanged),
            Arc::new(move |event: &Event| {
                let Some(coordinator) = coordinator.upgrade() else {
                    return;
                };
                let online = event.online.unwrap_or(false);
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(async move {
                            coordinator.handle_connection_changed(online).await;
                        });
                    }
                    Err(_) => warn!(online, "no async runtime; connectivity change ignored"),
                }
            }),
        );
        *self.connection_listener.lock() = Some(subscription);
    }

    /// Stops listening for connectivity changes.
    pub fn shutdown(&self) {
        if let Some(listener) = self.connection_listener.lock().take() {
            listener.unsubscribe();
        }
    }

    /// Reacts to a connectivity change.
    pub async fn handle_connection_changed(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if online {
            self.sync_and_execute_pending().await;
        }
        self.notify_status(online).await;
    }

    /// Replays pending tasks, then catches up on missed events.
    ///
    /// Concurrent calls run one after the other.
    pub async fn sync_and_execute_pending(&self) -> SyncOutcome {
        let _guard = self.sync_lock.lock().await;
        *self.phase.write() = SyncPhase::Syncing;

        if let Err(err) = self.queue.execute_all().await {
            error!(error = %err, "failed to replay pending tasks");
        }
        let outcome = self.sync().await;

        *self.phase.write() = SyncPhase::Synced;
        outcome
    }

    /// Catches up on events missed since the stored cursor.
    ///
    /// Failures are absorbed: the local store is reset and the next
    /// reconnect starts over.
    pub async fn sync(&self) -> SyncOutcome {
        match self.try_sync().await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "sync failed; resetting local store");
                if let Err(reset_err) = self.storage.reset_db().await {
                    error!(error = %reset_err, "failed to reset local store");
                }
                SyncOutcome::Reset(ResetReason::Failure)
            }
        }
    }

    async fn try_sync(&self) -> EngineResult<SyncOutcome> {
        let Some(user_id) = self.client.user_id() else {
            return Ok(SyncOutcome::Skipped);
        };
        let cids = self.storage.get_all_channel_cids().await?;
        if cids.is_empty() {
            debug!("no mirrored channels; skipping sync");
            return Ok(SyncOutcome::Skipped);
        }

        let outcome = match self.storage.get_last_synced_at(&user_id).await? {
            None => SyncOutcome::FirstSync,
            Some(cursor) => {
                let drift_days = (Utc::now() - cursor).num_days();
                if drift_days > self.config.drift_limit_days {
                    warn!(drift_days, limit = self.config.drift_limit_days, "cursor too old; resetting local store");
                    self.storage.reset_db().await?;
                    SyncOutcome::Reset(ResetReason::Drift { days: drift_days })
                } else {
                    let response = self.client.sync(&cids, cursor).await?;
                    let mut batch = Batch::new();
                    for event in &response.events {
                        batch.extend(self.router.route(event).await?);
                    }
                    if !batch.is_empty() {
                        self.storage.execute_batch(&batch).await?;
                    }
                    info!(events = response.events.len(), writes = batch.len(), "caught up");
                    SyncOutcome::CaughtUp {
                        events: response.events.len(),
                        writes: batch.len(),
                    }
                }
            }
        };

        self.storage
            .execute_batch(&Batch::from(WriteOp::UpsertUserSyncStatus {
                user_id,
                last_synced_at: Utc::now(),
            }))
            .await?;
        Ok(outcome)
    }

    /// Registers a sync status listener.
    pub fn on_status_change(&self, listener: impl Fn(bool) + Send + Sync + 'static) -> Subscription {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        self.status_listeners.lock().push((id, Arc::new(listener)));
        let listeners = Arc::downgrade(&self.status_listeners);
        Subscription::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners.lock().retain(|(listener_id, _)| *listener_id != id);
            }
        })
    }

    /// Runs `callback` once after the next successful sync.
    ///
    /// Scheduling again under the same tag replaces the earlier callback.
    pub fn schedule_after_sync<F, Fut>(&self, tag: impl Into<String>, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: ScheduledCallback = Box::new(move || Box::pin(callback()));
        self.scheduled.lock().insert(tag.into(), callback);
    }

    /// Returns the number of callbacks waiting for the next sync.
    pub fn scheduled_count(&self) -> usize {
        self.scheduled.lock().len()
    }

    /// Returns the last notified sync status.
    pub fn sync_status(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    /// Returns the sync phase.
    pub fn phase(&self) -> SyncPhase {
        *self.phase.read()
    }

    /// Returns true if the last connectivity change reported online.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn notify_status(&self, status: bool) {
        self.synced.store(status, Ordering::SeqCst);
        let listeners: Vec<StatusListener> = self
            .status_listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(status);
        }

        if !status {
            return;
        }
        let callbacks: Vec<ScheduledCallback> =
            self.scheduled.lock().drain().map(|(_, callback)| callback).collect();
        if callbacks.is_empty() {
            return;
        }
        let mut running = JoinSet::new();
        for callback in callbacks {
            running.spawn(callback());
        }
        while let Some(joined) = running.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "scheduled sync callback failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::mock::{MockChatClient, Rpc};
    use chatsync_protocol::{
        ChannelData, Cid, Draft, Member, Message, PendingTask, Poll, Reaction, ReadState, TaskPayload,
    };
    use chatsync_storage::{InMemoryStorage, StorageError, StorageResult};
    use chrono::{DateTime, Duration};
    use std::sync::atomic::AtomicUsize;

    fn cid() -> Cid {
        Cid::new("messaging", "general")
    }

    fn coordinator<S: StorageDriver + 'static>(
        storage: S,
        client: MockChatClient,
    ) -> (Arc<SyncCoordinator<S, MockChatClient>>, Arc<S>, Arc<MockChatClient>) {
        let storage = Arc::new(storage);
        let client = Arc::new(client);
        let config = EngineConfig::default();
        let queue = Arc::new(PendingMutationQueue::new(
            Arc::clone(&storage),
            Arc::clone(&client),
            config.error_policy.clone(),
        ));
        let router = Arc::new(EventMutationRouter::new(Arc::clone(&storage), Arc::clone(&client)));
        let coordinator = Arc::new(SyncCoordinator::new(
            Arc::clone(&storage),
            Arc::clone(&client),
            queue,
            router,
            config,
        ));
        (coordinator, storage, client)
    }

    async fn set_cursor(storage: &InMemoryStorage, days_ago: i64) {
        storage
            .execute_batch(&Batch::from(WriteOp::UpsertUserSyncStatus {
                user_id: "alice".into(),
                last_synced_at: Utc::now() - Duration::days(days_ago),
            }))
            .await
            .unwrap();
    }

    fn mirrored() -> InMemoryStorage {
        InMemoryStorage::with_channels([ChannelData::new(cid())])
    }

    #[tokio::test]
    async fn no_channels_is_a_no_op() {
        let (coordinator, storage, client) = coordinator(InMemoryStorage::new(), MockChatClient::new("alice"));

        assert_eq!(coordinator.sync().await, SyncOutcome::Skipped);
        assert_eq!(client.call_count(Rpc::Sync), 0);
        assert!(storage.get_last_synced_at("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn first_sync_records_cursor_without_diff() {
        let (coordinator, storage, client) = coordinator(mirrored(), MockChatClient::new("alice"));

        assert_eq!(coordinator.sync().await, SyncOutcome::FirstSync);
        assert_eq!(client.call_count(Rpc::Sync), 0);
        assert!(storage.get_last_synced_at("alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn drift_beyond_limit_resets_without_diff() {
        let (coordinator, storage, client) = coordinator(mirrored(), MockChatClient::new("alice"));
        set_cursor(&storage, 40).await;

        let outcome = coordinator.sync().await;

        assert_eq!(outcome, SyncOutcome::Reset(ResetReason::Drift { days: 40 }));
        assert_eq!(storage.reset_count(), 1);
        assert_eq!(client.call_count(Rpc::Sync), 0);
    }

    #[tokio::test]
    async fn drift_within_limit_diffs_without_reset() {
        let (coordinator, storage, client) = coordinator(mirrored(), MockChatClient::new("alice"));
        set_cursor(&storage, 10).await;
        let mut message = Message::new("m1", "missed");
        message.user = Some(chatsync_protocol::User::new("alice"));
        client.set_sync_events(vec![Event::new(EventKind::MessageNew)
            .with_cid(cid())
            .with_message(message)]);

        let outcome = coordinator.sync().await;

        assert_eq!(outcome, SyncOutcome::CaughtUp { events: 1, writes: 1 });
        assert_eq!(storage.reset_count(), 0);
        assert_eq!(client.call_count(Rpc::Sync), 1);
        assert!(storage.get_message("m1").await.unwrap().is_some());
        let cursor = storage.get_last_synced_at("alice").await.unwrap().unwrap();
        assert!(Utc::now() - cursor < Duration::minutes(1));
    }

    /// Fails every channel lookup, like a locked database.
    struct LockedLookups(InMemoryStorage);

    #[async_trait::async_trait]
    impl StorageDriver for LockedLookups {
        async fn initialize_db(&self) -> StorageResult<bool> {
            self.0.initialize_db().await
        }
        async fn reset_db(&self) -> StorageResult<()> {
            self.0.reset_db().await
        }
        async fn execute_batch(&self, batch: &Batch) -> StorageResult<()> {
            self.0.execute_batch(batch).await
        }
        async fn channel_exists(&self, _cid: &Cid) -> StorageResult<bool> {
            Err(StorageError::Backend("db locked".into()))
        }
        async fn get_channel(&self, cid: &Cid) -> StorageResult<Option<ChannelData>> {
            self.0.get_channel(cid).await
        }
        async fn get_all_channel_cids(&self) -> StorageResult<Vec<Cid>> {
            self.0.get_all_channel_cids().await
        }
        async fn get_last_synced_at(&self, user_id: &str) -> StorageResult<Option<DateTime<Utc>>> {
            self.0.get_last_synced_at(user_id).await
        }
        async fn get_pending_tasks(&self) -> StorageResult<Vec<PendingTask>> {
            self.0.get_pending_tasks().await
        }
        async fn add_pending_task(&self, task: &PendingTask) -> StorageResult<i64> {
            self.0.add_pending_task(task).await
        }
        async fn delete_pending_task(&self, id: i64) -> StorageResult<()> {
            self.0.delete_pending_task(id).await
        }
        async fn get_message(&self, id: &str) -> StorageResult<Option<Message>> {
            self.0.get_message(id).await
        }
        async fn get_draft(&self, cid: &Cid, parent_id: Option<&str>) -> StorageResult<Option<Draft>> {
            self.0.get_draft(cid, parent_id).await
        }
        async fn get_reactions(&self, message_id: &str) -> StorageResult<Vec<Reaction>> {
            self.0.get_reactions(message_id).await
        }
        async fn get_members(&self, cid: &Cid) -> StorageResult<Vec<Member>> {
            self.0.get_members(cid).await
        }
        async fn get_reads(&self, cid: &Cid) -> StorageResult<Vec<ReadState>> {
            self.0.get_reads(cid).await
        }
        async fn get_poll(&self, id: &str) -> StorageResult<Option<Poll>> {
            self.0.get_poll(id).await
        }
        async fn get_app_settings(&self, user_id: &str) -> StorageResult<Option<serde_json::Value>> {
            self.0.get_app_settings(user_id).await
        }
    }

    #[tokio::test]
    async fn routing_failure_during_catch_up_resets() {
        let (coordinator, storage, client) =
            coordinator(LockedLookups(mirrored()), MockChatClient::new("alice"));
        set_cursor(&storage.0, 5).await;
        let mut message = Message::new("m1", "missed");
        message.user = Some(chatsync_protocol::User::new("bob"));
        client.set_sync_events(vec![Event::new(EventKind::MessageNew)
            .with_cid(cid())
            .with_message(message)]);

        assert_eq!(coordinator.sync().await, SyncOutcome::Reset(ResetReason::Failure));
        assert_eq!(client.call_count(Rpc::Sync), 1);
        assert_eq!(storage.0.reset_count(), 1);
        assert!(storage.0.get_message("m1").await.unwrap().is_none());
        assert!(storage.0.get_last_synced_at("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn diff_failure_resets_and_is_absorbed() {
        let (coordinator, storage, client) = coordinator(mirrored(), MockChatClient::new("alice"));
        set_cursor(&storage, 2).await;
        client.fail_next(Rpc::Sync, ClientError::api(-1, 400, "too many events"));

        assert_eq!(coordinator.sync().await, SyncOutcome::Reset(ResetReason::Failure));
        assert_eq!(storage.reset_count(), 1);
    }

    #[tokio::test]
    async fn queue_is_replayed_before_diff() {
        let (coordinator, storage, client) = coordinator(mirrored(), MockChatClient::new("alice"));
        set_cursor(&storage, 1).await;
        storage
            .add_pending_task(&PendingTask::new(
                Some(cid()),
                "m1",
                TaskPayload::SendMessage {
                    message: Message::new("m1", "queued"),
                },
            ))
            .await
            .unwrap();

        coordinator.sync_and_execute_pending().await;

        let rpcs: Vec<Rpc> = client.calls().iter().map(|call| call.rpc()).collect();
        assert_eq!(rpcs, vec![Rpc::SendMessage, Rpc::Sync]);
        assert_eq!(storage.pending_task_count(), 0);
        assert_eq!(coordinator.phase(), SyncPhase::Synced);
    }

    #[tokio::test]
    async fn init_syncs_when_healthy_and_reinit_keeps_one_listener() {
        let (coordinator, _, client) = coordinator(mirrored(), MockChatClient::new("alice"));
        assert_eq!(coordinator.phase(), SyncPhase::NeverSynced);

        coordinator.init().await;
        coordinator.init().await;

        assert!(coordinator.sync_status());
        assert_eq!(coordinator.phase(), SyncPhase::Synced);
        assert_eq!(client.subscriber_count(), 1);

        coordinator.shutdown();
        assert_eq!(client.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn init_waits_when_offline() {
        let client = MockChatClient::new("alice");
        client.set_healthy(false);
        let (coordinator, _, _) = coordinator(mirrored(), client);

        coordinator.init().await;

        assert!(!coordinator.sync_status());
        assert_eq!(coordinator.phase(), SyncPhase::NeverSynced);
    }

    #[tokio::test]
    async fn connectivity_changes_notify_listeners() {
        let (coordinator, _, client) = coordinator(mirrored(), MockChatClient::new("alice"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&seen);
        let subscription = coordinator.on_status_change(move |status| recorded.lock().push(status));

        coordinator.handle_connection_changed(false).await;
        assert!(!coordinator.is_online());
        assert_eq!(client.call_count(Rpc::Sync), 0);
        coordinator.handle_connection_changed(true).await;
        assert!(coordinator.is_online());

        subscription.unsubscribe();
        coordinator.handle_connection_changed(false).await;

        assert_eq!(*seen.lock(), vec![false, true]);
        assert!(!coordinator.sync_status());
    }

    #[tokio::test]
    async fn scheduled_callbacks_fire_once_and_tags_replace() {
        let (coordinator, _, _) = coordinator(mirrored(), MockChatClient::new("alice"));
        let fired = Arc::new(AtomicUsize::new(0));

        for increment in [1, 10] {
            let fired = Arc::clone(&fired);
            coordinator.schedule_after_sync("reload", move || async move {
                fired.fetch_add(increment, Ordering::SeqCst);
            });
        }
        let other = Arc::clone(&fired);
        coordinator.schedule_after_sync("other", move || async move {
            other.fetch_add(100, Ordering::SeqCst);
        });
        assert_eq!(coordinator.scheduled_count(), 2);

        coordinator.handle_connection_changed(false).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        coordinator.handle_connection_changed(true).await;
        assert_eq!(fired.load(Ordering::SeqCst), 110);
        assert_eq!(coordinator.scheduled_count(), 0);

        coordinator.handle_connection_changed(true).await;
        assert_eq!(fired.load(Ordering::SeqCst), 110);
    }
}

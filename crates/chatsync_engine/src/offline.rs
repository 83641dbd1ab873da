//! Entry point wiring the consistency layer together.

use crate::client::{ChatClient, EventFilter, Subscription};
use crate::config::EngineConfig;
use crate::coordinator::SyncCoordinator;
use crate::error::EngineResult;
use crate::pipeline::{handler, EventPipeline, Flow, PipelineUnsubscribe};
use crate::queue::PendingMutationQueue;
use crate::reconciler::MessageReconciler;
use crate::router::EventMutationRouter;
use chatsync_protocol::Event;
use chatsync_storage::StorageDriver;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// State surfaced to the host application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineState {
    /// Local storage is ready.
    pub initialized: bool,
    /// User the local store belongs to.
    pub user_id: Option<String>,
}

/// Offline support for one client.
///
/// Mirrors every inbound event into storage through a dedicated pipeline,
/// and keeps storage in step with the server across reconnects.
pub struct OfflineSupport<S, C> {
    storage: Arc<S>,
    client: Arc<C>,
    config: EngineConfig,
    queue: Arc<PendingMutationQueue<S, C>>,
    router: Arc<EventMutationRouter<S, C>>,
    coordinator: Arc<SyncCoordinator<S, C>>,
    mirror: EventPipeline<Event, ()>,
    mirror_handler: Mutex<Option<PipelineUnsubscribe<Event, ()>>>,
    event_subscription: Mutex<Option<Subscription>>,
    state: watch::Sender<OfflineState>,
}

impl<S, C> OfflineSupport<S, C>
where
    S: StorageDriver + 'static,
    C: ChatClient + 'static,
{
    /// Builds the layer around a storage driver and a client.
    pub fn new(storage: Arc<S>, client: Arc<C>, config: EngineConfig) -> Self {
        let queue = Arc::new(PendingMutationQueue::new(
            Arc::clone(&storage),
            Arc::clone(&client),
            config.error_policy.clone(),
        ));
        let router = Arc::new(EventMutationRouter::new(Arc::clone(&storage), Arc::clone(&client)));
        let coordinator = Arc::new(SyncCoordinator::new(
            Arc::clone(&storage),
            Arc::clone(&client),
            Arc::clone(&queue),
            Arc::clone(&router),
            config.clone(),
        ));
        let (state, _) = watch::channel(OfflineState::default());

        Self {
            mirror: EventPipeline::new(config.mirror_pipeline_name.clone()),
            storage,
            client,
            config,
            queue,
            router,
            coordinator,
            mirror_handler: Mutex::new(None),
            event_subscription: Mutex::new(None),
            state,
        }
    }

    /// Prepares storage for `user_id` and starts mirroring and syncing.
    ///
    /// Returns false if storage could not be initialized.
    pub async fn init(&self, user_id: &str) -> EngineResult<bool> {
        if !self.storage.initialize_db().await? {
            warn!(user_id, "local storage unavailable; offline support disabled");
            return Ok(false);
        }

        self.install_mirror();
        self.state.send_replace(OfflineState {
            initialized: true,
            user_id: Some(user_id.to_string()),
        });
        info!(user_id, pipeline = %self.config.mirror_pipeline_name, "offline support ready");

        self.coordinator.init().await;
        Ok(true)
    }

    /// Stops mirroring and syncing. Pending tasks stay queued.
    pub fn shutdown(&self) {
        if let Some(subscription) = self.event_subscription.lock().take() {
            subscription.unsubscribe();
        }
        if let Some(mirror) = self.mirror_handler.lock().take() {
            mirror.unsubscribe();
        }
        self.coordinator.shutdown();
        self.state.send_replace(OfflineState::default());
    }

    fn install_mirror(&self) {
        if let Some(mirror) = self.mirror_handler.lock().take() {
            mirror.unsubscribe();
        }
        let router = Arc::clone(&self.router);
        let mirror = self.mirror.append(
            "router",
            handler(move |event: Arc<Event>, _| {
                let router = Arc::clone(&router);
                async move {
                    router.handle_event(&event, true).await;
                    Ok(Flow::Continue)
                }
            }),
        );
        *self.mirror_handler.lock() = Some(mirror);

        if let Some(previous) = self.event_subscription.lock().take() {
            previous.unsubscribe();
        }
        let pipeline = self.mirror.clone();
        let subscription = self.client.subscribe(
            EventFilter::All,
            Arc::new(move |event: &Event| {
                let _ = pipeline.run(event.clone(), ());
            }),
        );
        *self.event_subscription.lock() = Some(subscription);
    }

    /// Returns the current state.
    pub fn state(&self) -> OfflineState {
        self.state.borrow().clone()
    }

    /// Subscribes to state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<OfflineState> {
        self.state.subscribe()
    }

    /// Creates a reconciler for optimistic message state.
    pub fn message_reconciler(&self) -> MessageReconciler<C> {
        MessageReconciler::new(Arc::clone(&self.client), self.config.error_policy.clone())
    }

    /// Returns the storage driver.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Returns the pending mutation queue.
    pub fn queue(&self) -> &Arc<PendingMutationQueue<S, C>> {
        &self.queue
    }

    /// Returns the event router.
    pub fn router(&self) -> &Arc<EventMutationRouter<S, C>> {
        &self.router
    }

    /// Returns the sync coordinator.
    pub fn coordinator(&self) -> &Arc<SyncCoordinator<S, C>> {
        &self.coordinator
    }

    /// Returns the pipeline mirroring inbound events into storage.
    pub fn mirror(&self) -> &EventPipeline<Event, ()> {
        &self.mirror
    }
}

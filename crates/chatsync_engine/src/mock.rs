//! Scripted in-process chat client.

use crate::client::{
    ChannelRuntime, ChatClient, DraftResponse, EventCallback, EventFilter, MessageResponse,
    ReactionResponse, Subscription, SyncResponse, UpdateMessageOptions,
};
use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use chatsync_protocol::{Cid, Draft, Event, Message, Reaction};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Client RPCs, used to script and inspect [`MockChatClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rpc {
    /// [`ChatClient::sync`].
    Sync,
    /// [`ChatClient::send_message`].
    SendMessage,
    /// [`ChatClient::update_message`].
    UpdateMessage,
    /// [`ChatClient::delete_message`].
    DeleteMessage,
    /// [`ChatClient::send_reaction`].
    SendReaction,
    /// [`ChatClient::delete_reaction`].
    DeleteReaction,
    /// [`ChatClient::create_draft`].
    CreateDraft,
    /// [`ChatClient::delete_draft`].
    DeleteDraft,
}

/// A recorded RPC.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    /// A diff sync.
    Sync {
        /// Requested channels.
        cids: Vec<Cid>,
        /// Requested cursor.
        since: DateTime<Utc>,
    },
    /// A message send.
    SendMessage {
        /// Target channel.
        cid: Cid,
        /// Message id.
        message_id: String,
    },
    /// A message update.
    UpdateMessage {
        /// Message id.
        message_id: String,
        /// Forwarded options.
        options: UpdateMessageOptions,
    },
    /// A message deletion.
    DeleteMessage {
        /// Message id.
        message_id: String,
        /// Hard delete flag.
        hard: bool,
    },
    /// A reaction send.
    SendReaction {
        /// Target channel.
        cid: Cid,
        /// Message id.
        message_id: String,
        /// Reaction type.
        reaction_type: String,
    },
    /// A reaction deletion.
    DeleteReaction {
        /// Target channel.
        cid: Cid,
        /// Message id.
        message_id: String,
        /// Reaction type.
        reaction_type: String,
    },
    /// A draft creation.
    CreateDraft {
        /// Target channel.
        cid: Cid,
    },
    /// A draft deletion.
    DeleteDraft {
        /// Target channel.
        cid: Cid,
        /// Thread parent.
        parent_id: Option<String>,
    },
}

impl MockCall {
    /// Returns the RPC this call went to.
    pub fn rpc(&self) -> Rpc {
        match self {
            MockCall::Sync { .. } => Rpc::Sync,
            MockCall::SendMessage { .. } => Rpc::SendMessage,
            MockCall::UpdateMessage { .. } => Rpc::UpdateMessage,
            MockCall::DeleteMessage { .. } => Rpc::DeleteMessage,
            MockCall::SendReaction { .. } => Rpc::SendReaction,
            MockCall::DeleteReaction { .. } => Rpc::DeleteReaction,
            MockCall::CreateDraft { .. } => Rpc::CreateDraft,
            MockCall::DeleteDraft { .. } => Rpc::DeleteDraft,
        }
    }
}

#[derive(Debug)]
enum Scripted {
    Fail(ClientError),
    Message(Message),
}

struct Subscriber {
    id: u64,
    filter: EventFilter,
    callback: EventCallback,
}

/// A chat client for tests.
///
/// Every RPC is recorded. By default RPCs succeed and echo their input back
/// as the canonical entity; results can be scripted per RPC with
/// [`MockChatClient::fail_next`] and [`MockChatClient::respond_next`], and an
/// RPC can be held open with [`MockChatClient::hold_next`].
pub struct MockChatClient {
    user_id: RwLock<Option<String>>,
    healthy: AtomicBool,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    next_subscriber: AtomicU64,
    runtimes: RwLock<HashMap<Cid, ChannelRuntime>>,
    sync_events: Mutex<Vec<Event>>,
    scripted: Mutex<HashMap<Rpc, VecDeque<Scripted>>>,
    gates: Mutex<HashMap<Rpc, VecDeque<oneshot::Receiver<()>>>>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockChatClient {
    /// Creates a healthy client connected as `user_id`.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: RwLock::new(Some(user_id.into())),
            healthy: AtomicBool::new(true),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_subscriber: AtomicU64::new(1),
            runtimes: RwLock::new(HashMap::new()),
            sync_events: Mutex::new(Vec::new()),
            scripted: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Sets the connected user.
    pub fn set_user_id(&self, user_id: Option<String>) {
        *self.user_id.write() = user_id;
    }

    /// Sets connection health.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Sets the live state of a channel.
    pub fn set_runtime(&self, cid: Cid, runtime: ChannelRuntime) {
        self.runtimes.write().insert(cid, runtime);
    }

    /// Sets the events returned by every diff sync.
    pub fn set_sync_events(&self, events: Vec<Event>) {
        *self.sync_events.lock() = events;
    }

    /// Makes the next call to `rpc` fail.
    pub fn fail_next(&self, rpc: Rpc, error: ClientError) {
        self.script(rpc, Scripted::Fail(error));
    }

    /// Makes the next call to a message RPC answer with `message`.
    pub fn respond_next(&self, rpc: Rpc, message: Message) {
        self.script(rpc, Scripted::Message(message));
    }

    /// Holds the next call to `rpc` open until the returned sender fires
    /// or is dropped. The call is recorded before it blocks.
    pub fn hold_next(&self, rpc: Rpc) -> oneshot::Sender<()> {
        let (release, gate) = oneshot::channel();
        self.gates.lock().entry(rpc).or_default().push_back(gate);
        release
    }

    /// Dispatches an event to matching subscribers.
    pub fn emit(&self, event: &Event) {
        let callbacks: Vec<EventCallback> = self
            .subscribers
            .lock()
            .iter()
            .filter(|s| s.filter.matches(&event.kind))
            .map(|s| Arc::clone(&s.callback))
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }

    /// Returns the number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Returns every recorded call, oldest first.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Returns how many times `rpc` was called.
    pub fn call_count(&self, rpc: Rpc) -> usize {
        self.calls.lock().iter().filter(|c| c.rpc() == rpc).count()
    }

    fn script(&self, rpc: Rpc, result: Scripted) {
        self.scripted.lock().entry(rpc).or_default().push_back(result);
    }

    async fn enter(&self, call: MockCall) -> Option<Scripted> {
        let rpc = call.rpc();
        self.calls.lock().push(call);
        let gate = self.gates.lock().get_mut(&rpc).and_then(VecDeque::pop_front);
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.scripted.lock().get_mut(&rpc).and_then(VecDeque::pop_front)
    }

    async fn message_call(&self, call: MockCall, echo: Message) -> ClientResult<Message> {
        match self.enter(call).await {
            Some(Scripted::Fail(error)) => Err(error),
            Some(Scripted::Message(message)) => Ok(message),
            None => Ok(echo),
        }
    }
}

impl Default for MockChatClient {
    fn default() -> Self {
        Self::new("local-user")
    }
}

#[async_trait]
impl ChatClient for MockChatClient {
    fn user_id(&self) -> Option<String> {
        self.user_id.read().clone()
    }

    fn is_connection_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn subscribe(&self, filter: EventFilter, callback: EventCallback) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().push(Subscriber {
            id,
            filter,
            callback,
        });
        let subscribers = Arc::downgrade(&self.subscribers);
        Subscription::new(move || {
            if let Some(subscribers) = subscribers.upgrade() {
                subscribers.lock().retain(|s| s.id != id);
            }
        })
    }

    fn channel_runtime(&self, cid: &Cid) -> Option<ChannelRuntime> {
        self.runtimes.read().get(cid).cloned()
    }

    async fn sync(&self, cids: &[Cid], since: DateTime<Utc>) -> ClientResult<SyncResponse> {
        let call = MockCall::Sync {
            cids: cids.to_vec(),
            since,
        };
        match self.enter(call).await {
            Some(Scripted::Fail(error)) => Err(error),
            _ => Ok(SyncResponse {
                events: self.sync_events.lock().clone(),
            }),
        }
    }

    async fn send_message(&self, cid: &Cid, message: &Message) -> ClientResult<MessageResponse> {
        let call = MockCall::SendMessage {
            cid: cid.clone(),
            message_id: message.id.clone(),
        };
        let mut echo = message.clone();
        echo.cid = Some(cid.clone());
        echo.created_at = echo.created_at.or_else(|| Some(Utc::now()));
        let message = self.message_call(call, echo).await?;
        Ok(MessageResponse { message })
    }

    async fn update_message(
        &self,
        message: &Message,
        options: &UpdateMessageOptions,
    ) -> ClientResult<MessageResponse> {
        let call = MockCall::UpdateMessage {
            message_id: message.id.clone(),
            options: options.clone(),
        };
        let mut echo = message.clone();
        echo.updated_at = Some(Utc::now());
        let message = self.message_call(call, echo).await?;
        Ok(MessageResponse { message })
    }

    async fn delete_message(&self, message_id: &str, hard: bool) -> ClientResult<MessageResponse> {
        let call = MockCall::DeleteMessage {
            message_id: message_id.to_string(),
            hard,
        };
        let mut echo = Message::new(message_id, "");
        echo.deleted_at = Some(Utc::now());
        let message = self.message_call(call, echo).await?;
        Ok(MessageResponse { message })
    }

    async fn send_reaction(
        &self,
        cid: &Cid,
        message_id: &str,
        reaction: &Reaction,
        _enforce_unique: bool,
    ) -> ClientResult<ReactionResponse> {
        let call = MockCall::SendReaction {
            cid: cid.clone(),
            message_id: message_id.to_string(),
            reaction_type: reaction.kind.clone(),
        };
        let mut echo = Message::new(message_id, "");
        echo.cid = Some(cid.clone());
        echo.reaction_counts.insert(reaction.kind.clone(), 1);
        let message = self.message_call(call, echo).await?;
        Ok(ReactionResponse {
            message,
            reaction: reaction.clone(),
        })
    }

    async fn delete_reaction(
        &self,
        cid: &Cid,
        message_id: &str,
        reaction_type: &str,
        user_id: Option<&str>,
    ) -> ClientResult<ReactionResponse> {
        let call = MockCall::DeleteReaction {
            cid: cid.clone(),
            message_id: message_id.to_string(),
            reaction_type: reaction_type.to_string(),
        };
        let owner = user_id
            .map(str::to_string)
            .or_else(|| self.user_id())
            .unwrap_or_default();
        let mut echo = Message::new(message_id, "");
        echo.cid = Some(cid.clone());
        let message = self.message_call(call, echo).await?;
        Ok(ReactionResponse {
            message,
            reaction: Reaction::new(message_id, owner, reaction_type),
        })
    }

    async fn create_draft(&self, cid: &Cid, draft: &Draft) -> ClientResult<DraftResponse> {
        let call = MockCall::CreateDraft { cid: cid.clone() };
        match self.enter(call).await {
            Some(Scripted::Fail(error)) => Err(error),
            _ => Ok(DraftResponse {
                draft: draft.clone(),
            }),
        }
    }

    async fn delete_draft(&self, cid: &Cid, parent_id: Option<&str>) -> ClientResult<()> {
        let call = MockCall::DeleteDraft {
            cid: cid.clone(),
            parent_id: parent_id.map(str::to_string),
        };
        match self.enter(call).await {
            Some(Scripted::Fail(error)) => Err(error),
            _ => Ok(()),
        }
    }
}

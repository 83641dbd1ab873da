//! Optimistic message state.
//!
//! A message is marked `sending` before its network call is issued and is
//! reconciled with the server's answer afterwards:
//!
//! - a success is adopted if the local entry is missing, still in flight,
//!   or older than the response;
//! - a duplicate-creation failure while still in flight means an earlier
//!   attempt went through, so the message converges to `received`;
//! - any other failure marks the message `failed` with the error attached.
//!
//! Failures are always returned to the caller, converged or not.

use crate::client::{BoxFuture, ChatClient, MessageResponse, UpdateMessageOptions};
use crate::error::{ClientResult, EngineResult, ErrorKind, ErrorPolicy};
use chatsync_protocol::{Cid, LocalMessage, Message, MessageStatus};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Replacement for the built-in send or retry call.
pub type SendHandler = Arc<dyn Fn(Cid, Message) -> BoxFuture<ClientResult<MessageResponse>> + Send + Sync>;

/// Replacement for the built-in update call.
pub type UpdateHandler =
    Arc<dyn Fn(Message, UpdateMessageOptions) -> BoxFuture<ClientResult<MessageResponse>> + Send + Sync>;

/// Caller supplied replacements for the built-in network calls.
///
/// `retry` falls back to `send`, then to the built-in call.
#[derive(Clone, Default)]
pub struct MessageOverrides {
    /// Replaces sending.
    pub send: Option<SendHandler>,
    /// Replaces retrying.
    pub retry: Option<SendHandler>,
    /// Replaces updating.
    pub update: Option<UpdateHandler>,
}

impl fmt::Debug for MessageOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageOverrides")
            .field("send", &self.send.is_some())
            .field("retry", &self.retry.is_some())
            .field("update", &self.update.is_some())
            .finish()
    }
}

/// Holds local message state and reconciles it with server responses.
pub struct MessageReconciler<C> {
    client: Arc<C>,
    policy: ErrorPolicy,
    overrides: MessageOverrides,
    messages: RwLock<HashMap<String, LocalMessage>>,
}

impl<C: ChatClient> MessageReconciler<C> {
    /// Creates a reconciler using the client's built-in calls.
    pub fn new(client: Arc<C>, policy: ErrorPolicy) -> Self {
        Self {
            client,
            policy,
            overrides: MessageOverrides::default(),
            messages: RwLock::new(HashMap::new()),
        }
    }

    /// Sets replacements for the built-in calls.
    pub fn with_overrides(mut self, overrides: MessageOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Returns the local state of a message.
    pub fn get(&self, id: &str) -> Option<LocalMessage> {
        self.messages.read().get(id).cloned()
    }

    /// Returns every locally held message.
    pub fn messages(&self) -> Vec<LocalMessage> {
        self.messages.read().values().cloned().collect()
    }

    /// Stores a message as-is, e.g. one loaded from storage.
    pub fn track(&self, local: LocalMessage) {
        self.messages.write().insert(local.id().to_string(), local);
    }

    /// Stops holding a message and returns its last local state.
    pub fn untrack(&self, id: &str) -> Option<LocalMessage> {
        self.messages.write().remove(id)
    }

    /// Drops every message the server confirmed. Returns how many were dropped.
    ///
    /// Messages still in flight or failed are kept so they can settle or be retried.
    pub fn evict_received(&self) -> usize {
        let mut messages = self.messages.write();
        let before = messages.len();
        messages.retain(|_, local| local.status != MessageStatus::Received);
        before - messages.len()
    }

    /// Sends a message.
    pub async fn send(&self, cid: &Cid, message: Message) -> EngineResult<Message> {
        let id = self.begin(&message);
        let result = match &self.overrides.send {
            Some(send) => send(cid.clone(), message).await,
            None => self.client.send_message(cid, &message).await,
        };
        self.settle(&id, result)
    }

    /// Sends a message again after a failure.
    pub async fn retry(&self, cid: &Cid, message: Message) -> EngineResult<Message> {
        let id = self.begin(&message);
        let result = match self.overrides.retry.as_ref().or(self.overrides.send.as_ref()) {
            Some(retry) => retry(cid.clone(), message).await,
            None => self.client.send_message(cid, &message).await,
        };
        self.settle(&id, result)
    }

    /// Updates a message. Only the supported option keys are forwarded.
    pub async fn update(&self, message: Message, options: &Map<String, Value>) -> EngineResult<Message> {
        let options = UpdateMessageOptions::from_raw(options);
        let id = self.begin(&message);
        let result = match &self.overrides.update {
            Some(update) => update(message, options).await,
            None => self.client.update_message(&message, &options).await,
        };
        self.settle(&id, result)
    }

    /// Applies the optimistic `sending` state and returns the message id.
    fn begin(&self, message: &Message) -> String {
        self.messages
            .write()
            .insert(message.id.clone(), LocalMessage::sending(message.clone()));
        debug!(message_id = %message.id, "message sending");
        message.id.clone()
    }

    fn settle(&self, id: &str, result: ClientResult<MessageResponse>) -> EngineResult<Message> {
        match result {
            Ok(response) => Ok(self.adopt(response.message)),
            Err(err) => {
                let kind = self.policy.classify(&err);
                let mut messages = self.messages.write();
                if let Some(local) = messages.get_mut(id) {
                    if kind == ErrorKind::DuplicateWrite && local.is_sending() {
                        info!(message_id = %id, "message already exists server-side; marking received");
                        local.status = MessageStatus::Received;
                        local.error = None;
                    } else {
                        debug!(message_id = %id, error = %err, "message failed");
                        local.status = MessageStatus::Failed;
                        local.error = Some(err.to_message_error());
                    }
                }
                Err(err.into())
            }
        }
    }

    /// Stores a server response unless the local entry is settled and at least as new.
    fn adopt(&self, server: Message) -> Message {
        let mut messages = self.messages.write();
        let keep_local = match messages.get(&server.id) {
            None => false,
            Some(local) => !local.is_sending() && !is_newer(&server, &local.message),
        };
        if keep_local {
            debug!(message_id = %server.id, "ignoring stale response");
            return server;
        }
        messages.insert(server.id.clone(), LocalMessage::received(server.clone()));
        server
    }
}

fn is_newer(server: &Message, local: &Message) -> bool {
    match (server.updated_at, local.updated_at) {
        (Some(server), Some(local)) => server > local,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ClientError, EngineError};
    use crate::mock::{MockCall, MockChatClient, Rpc};
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn cid() -> Cid {
        Cid::new("messaging", "general")
    }

    fn setup() -> (Arc<MessageReconciler<MockChatClient>>, Arc<MockChatClient>) {
        let client = Arc::new(MockChatClient::new("alice"));
        let reconciler = MessageReconciler::new(Arc::clone(&client), ErrorPolicy::default());
        (Arc::new(reconciler), client)
    }

    fn failed(id: &str) -> LocalMessage {
        LocalMessage {
            message: Message::new(id, "hi"),
            status: MessageStatus::Failed,
            error: Some(ClientError::Transport("timed out".into()).to_message_error()),
        }
    }

    #[tokio::test]
    async fn sending_state_is_applied_before_the_call_resolves() {
        let (reconciler, client) = setup();
        reconciler.track(failed("m1"));
        let release = client.hold_next(Rpc::SendMessage);

        let task = {
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move { reconciler.send(&cid(), Message::new("m1", "hi")).await })
        };
        while client.call_count(Rpc::SendMessage) == 0 {
            tokio::task::yield_now().await;
        }
        let local = reconciler.get("m1").unwrap();
        assert_eq!(local.status, MessageStatus::Sending);
        assert!(local.error.is_none());

        release.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(reconciler.get("m1").unwrap().status, MessageStatus::Received);
    }

    #[tokio::test]
    async fn settled_messages_can_be_evicted() {
        let (reconciler, client) = setup();
        reconciler.send(&cid(), Message::new("m1", "hi")).await.unwrap();
        reconciler.send(&cid(), Message::new("m2", "hi")).await.unwrap();
        client.fail_next(Rpc::SendMessage, ClientError::api(17, 403, "not allowed"));
        assert!(reconciler.send(&cid(), Message::new("m3", "hi")).await.is_err());

        assert_eq!(reconciler.untrack("m1").map(|l| l.status), Some(MessageStatus::Received));
        assert!(reconciler.untrack("m1").is_none());
        assert_eq!(reconciler.evict_received(), 1);

        let left: Vec<String> = reconciler.messages().into_iter().map(|l| l.message.id).collect();
        assert_eq!(left, vec!["m3".to_string()]);
        assert_eq!(reconciler.get("m3").unwrap().status, MessageStatus::Failed);
    }

    #[tokio::test]
    async fn duplicate_while_sending_converges_to_received() {
        let (reconciler, client) = setup();
        client.fail_next(
            Rpc::SendMessage,
            ClientError::api(4, 400, "message with id m1 already exists"),
        );

        let err = reconciler
            .send(&cid(), Message::new("m1", "hi"))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Client(ClientError::Api { code: 4, .. })));
        let local = reconciler.get("m1").unwrap();
        assert_eq!(local.status, MessageStatus::Received);
        assert_eq!(local.message.text, "hi");
        assert!(local.error.is_none());
    }

    #[tokio::test]
    async fn other_failures_mark_failed_with_error() {
        let (reconciler, client) = setup();
        client.fail_next(Rpc::SendMessage, ClientError::api(17, 403, "not allowed"));

        assert!(reconciler.send(&cid(), Message::new("m1", "hi")).await.is_err());

        let local = reconciler.get("m1").unwrap();
        assert_eq!(local.status, MessageStatus::Failed);
        let error = local.error.unwrap();
        assert_eq!(error.code, Some(17));
        assert_eq!(error.status, Some(403));
    }

    #[tokio::test]
    async fn newer_local_state_survives_a_stale_response() {
        let (reconciler, client) = setup();
        let now = Utc::now();
        let mut stale = Message::new("m1", "old");
        stale.updated_at = Some(now - Duration::seconds(30));
        client.respond_next(Rpc::SendMessage, stale);

        let mut fresh = Message::new("m1", "new");
        fresh.updated_at = Some(now);
        let release = client.hold_next(Rpc::SendMessage);
        let task = {
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move { reconciler.send(&cid(), Message::new("m1", "draft")).await })
        };
        while client.call_count(Rpc::SendMessage) == 0 {
            tokio::task::yield_now().await;
        }
        reconciler.track(LocalMessage::received(fresh));
        release.send(()).unwrap();
        task.await.unwrap().unwrap();

        let local = reconciler.get("m1").unwrap();
        assert_eq!(local.message.text, "new");
        assert_eq!(local.status, MessageStatus::Received);
    }

    #[tokio::test]
    async fn in_flight_entry_always_accepts_the_response() {
        let (reconciler, client) = setup();
        let mut server = Message::new("m1", "canonical");
        server.updated_at = None;
        client.respond_next(Rpc::SendMessage, server);

        let message = reconciler.send(&cid(), Message::new("m1", "local")).await.unwrap();

        assert_eq!(message.text, "canonical");
        assert_eq!(reconciler.get("m1").unwrap().message.text, "canonical");
    }

    #[tokio::test]
    async fn update_forwards_only_supported_options() {
        let (reconciler, client) = setup();
        let options = json!({"skip_push": true, "pending": true, "extra": 1});

        reconciler
            .update(Message::new("m1", "edited"), options.as_object().unwrap())
            .await
            .unwrap();

        match &client.calls()[0] {
            MockCall::UpdateMessage { options, .. } => {
                assert_eq!(
                    options,
                    &UpdateMessageOptions {
                        skip_enrich_url: None,
                        skip_push: Some(true)
                    }
                );
            }
            other => panic!("unexpected call {other:?}"),
        }
        assert_eq!(reconciler.get("m1").unwrap().status, MessageStatus::Received);
    }

    #[tokio::test]
    async fn retry_falls_back_to_send_override_then_default() {
        let client = Arc::new(MockChatClient::new("alice"));
        let send: SendHandler = Arc::new(
            |_cid: Cid, mut message: Message| -> BoxFuture<ClientResult<MessageResponse>> {
                Box::pin(async move {
                    message.text = format!("{} (custom)", message.text);
                    Ok(MessageResponse { message })
                })
            },
        );
        let reconciler = MessageReconciler::new(Arc::clone(&client), ErrorPolicy::default())
            .with_overrides(MessageOverrides {
                send: Some(send),
                ..MessageOverrides::default()
            });

        let message = reconciler.retry(&cid(), Message::new("m1", "hi")).await.unwrap();
        assert_eq!(message.text, "hi (custom)");
        assert_eq!(client.call_count(Rpc::SendMessage), 0);

        let plain = MessageReconciler::new(Arc::clone(&client), ErrorPolicy::default());
        plain.retry(&cid(), Message::new("m2", "hi")).await.unwrap();
        assert_eq!(client.call_count(Rpc::SendMessage), 1);
    }

    #[tokio::test]
    async fn retry_override_wins_over_send_override() {
        let client = Arc::new(MockChatClient::new("alice"));
        let tagged = |tag: &'static str| -> SendHandler {
            Arc::new(
                move |_cid: Cid, mut message: Message| -> BoxFuture<ClientResult<MessageResponse>> {
                    Box::pin(async move {
                        message.text = tag.to_string();
                        Ok(MessageResponse { message })
                    })
                },
            )
        };
        let reconciler = MessageReconciler::new(client, ErrorPolicy::default()).with_overrides(
            MessageOverrides {
                send: Some(tagged("send")),
                retry: Some(tagged("retry")),
                update: None,
            },
        );

        let message = reconciler.retry(&cid(), Message::new("m1", "hi")).await.unwrap();
        assert_eq!(message.text, "retry");
    }
}

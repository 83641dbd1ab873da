//! The network collaborator.
//!
//! The consistency layer never talks to the wire itself. Everything it needs
//! from the connected client (identity, connectivity, live channel state,
//! the event stream and the RPCs) goes through [`ChatClient`].

use crate::error::ClientResult;
use async_trait::async_trait;
use chatsync_protocol::{ChannelData, Cid, Draft, Event, EventKind, Message, Reaction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A boxed, sendable future.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Callback invoked for each matching inbound event.
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Selects which events a subscription receives.
#[derive(Debug, Clone, PartialEq)]
pub enum EventFilter {
    /// Every event.
    All,
    /// Only events of one kind.
    Kind(EventKind),
}

impl EventFilter {
    /// Returns true if an event of `kind` passes this filter.
    pub fn matches(&self, kind: &EventKind) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Kind(expected) => expected == kind,
        }
    }
}

/// Handle to an event or status subscription.
///
/// Dropping the handle keeps the subscription alive; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Creates a subscription that runs `cancel` on unsubscribe.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Creates a subscription with nothing to cancel.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    /// Removes the subscription.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Snapshot of a live channel held by the client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelRuntime {
    /// Channel data as last seen by the client.
    pub data: Option<ChannelData>,
    /// The channel finished its initial query.
    pub initialized: bool,
    /// The channel's watch was interrupted.
    pub disconnected: bool,
    /// Unread count of the local user, as computed live.
    pub unread_count: u32,
    /// When the local user last read the channel.
    pub last_read: Option<DateTime<Utc>>,
    /// Last message the local user read.
    pub last_read_message_id: Option<String>,
}

impl ChannelRuntime {
    /// Returns true if the live channel can stand in for stored channel data.
    pub fn is_usable(&self) -> bool {
        self.initialized && !self.disconnected
    }
}

/// Options accepted by [`ChatClient::update_message`].
///
/// Only these keys are forwarded to the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMessageOptions {
    /// Do not enrich URLs in the updated text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_enrich_url: Option<bool>,
    /// Do not send push notifications for the update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_push: Option<bool>,
}

impl UpdateMessageOptions {
    /// Keeps only the supported keys of caller supplied options.
    pub fn from_raw(raw: &Map<String, Value>) -> Self {
        Self {
            skip_enrich_url: raw.get("skip_enrich_url").and_then(Value::as_bool),
            skip_push: raw.get("skip_push").and_then(Value::as_bool),
        }
    }
}

/// Response of a diff sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Events missed since the cursor, oldest first.
    #[serde(default)]
    pub events: Vec<Event>,
}

/// Response of a message RPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    /// Canonical message.
    pub message: Message,
}

/// Response of a reaction RPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionResponse {
    /// Canonical message, with refreshed reaction counts.
    pub message: Message,
    /// Canonical reaction.
    pub reaction: Reaction,
}

/// Response of a draft RPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftResponse {
    /// Canonical draft.
    pub draft: Draft,
}

/// The connected chat client.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Returns the connected user, if any.
    fn user_id(&self) -> Option<String>;

    /// Returns true if the connection is up and healthy.
    fn is_connection_healthy(&self) -> bool;

    /// Subscribes to inbound events.
    fn subscribe(&self, filter: EventFilter, callback: EventCallback) -> Subscription;

    /// Returns the live state of a channel the client is watching.
    fn channel_runtime(&self, cid: &Cid) -> Option<ChannelRuntime>;

    /// Fetches events missed by `cids` since `since`.
    async fn sync(&self, cids: &[Cid], since: DateTime<Utc>) -> ClientResult<SyncResponse>;

    /// Sends a message.
    async fn send_message(&self, cid: &Cid, message: &Message) -> ClientResult<MessageResponse>;

    /// Updates a message.
    async fn update_message(
        &self,
        message: &Message,
        options: &UpdateMessageOptions,
    ) -> ClientResult<MessageResponse>;

    /// Deletes a message.
    async fn delete_message(&self, message_id: &str, hard: bool) -> ClientResult<MessageResponse>;

    /// Sends a reaction.
    async fn send_reaction(
        &self,
        cid: &Cid,
        message_id: &str,
        reaction: &Reaction,
        enforce_unique: bool,
    ) -> ClientResult<ReactionResponse>;

    /// Deletes a reaction.
    async fn delete_reaction(
        &self,
        cid: &Cid,
        message_id: &str,
        reaction_type: &str,
        user_id: Option<&str>,
    ) -> ClientResult<ReactionResponse>;

    /// Creates or replaces a draft.
    async fn create_draft(&self, cid: &Cid, draft: &Draft) -> ClientResult<DraftResponse>;

    /// Deletes a draft.
    async fn delete_draft(&self, cid: &Cid, parent_id: Option<&str>) -> ClientResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn update_options_keep_only_supported_keys() {
        let raw = json!({
            "skip_enrich_url": true,
            "skip_push": false,
            "pending": true,
            "silent": "yes",
        });
        let options = UpdateMessageOptions::from_raw(raw.as_object().unwrap());

        assert_eq!(options.skip_enrich_url, Some(true));
        assert_eq!(options.skip_push, Some(false));
        assert_eq!(
            serde_json::to_value(&options).unwrap(),
            json!({"skip_enrich_url": true, "skip_push": false})
        );
    }

    #[test]
    fn update_options_ignore_non_boolean_values() {
        let raw = json!({"skip_push": "true"});
        let options = UpdateMessageOptions::from_raw(raw.as_object().unwrap());
        assert_eq!(options, UpdateMessageOptions::default());
    }

    #[test]
    fn filter_matching() {
        assert!(EventFilter::All.matches(&EventKind::MessageNew));
        assert!(EventFilter::Kind(EventKind::MessageNew).matches(&EventKind::MessageNew));
        assert!(!EventFilter::Kind(EventKind::MessageNew).matches(&EventKind::ChannelHidden));
    }

    #[test]
    fn runtime_usability() {
        let mut runtime = ChannelRuntime {
            initialized: true,
            ..ChannelRuntime::default()
        };
        assert!(runtime.is_usable());
        runtime.disconnected = true;
        assert!(!runtime.is_usable());
    }

    #[test]
    fn unsubscribe_runs_cancel_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let subscription = Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        subscription.unsubscribe();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        Subscription::noop().unsubscribe();
    }
}

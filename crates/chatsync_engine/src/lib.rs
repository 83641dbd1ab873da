//! # chatsync engine
//!
//! Local consistency layer for an offline-capable chat client.
//!
//! This crate provides:
//! - [`EventPipeline`]: ordered handlers with serialized runs
//! - [`PendingMutationQueue`]: durable queue of writes made while offline
//! - [`EventMutationRouter`]: event to storage batch mapping with a channel guard
//! - [`SyncCoordinator`]: cursor-based catch-up with drift detection and reset
//! - [`MessageReconciler`]: optimistic message state
//! - [`OfflineSupport`]: the above wired around one client and one storage driver
//!
//! ## Architecture
//!
//! The layer sits between a connected [`ChatClient`] and a
//! [`StorageDriver`](chatsync_storage::StorageDriver). Inbound events are
//! mirrored into storage one at a time. On reconnect:
//! 1. Replay queued writes
//! 2. Fetch events missed since the cursor
//! 3. Apply them as one batch and move the cursor
//!
//! ## Key Invariants
//!
//! - Queued writes replay before the catch-up
//! - A dependent row is never written before its channel row
//! - Runs on one pipeline never interleave
//! - Sync failures reset local storage instead of propagating

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod client;
mod config;
mod coordinator;
mod error;
mod mock;
mod offline;
mod pipeline;
mod queue;
mod reconciler;
mod router;

pub use client::{
    BoxFuture, ChannelRuntime, ChatClient, DraftResponse, EventCallback, EventFilter,
    MessageResponse, ReactionResponse, Subscription, SyncResponse, UpdateMessageOptions,
};
pub use config::EngineConfig;
pub use coordinator::{ResetReason, StatusListener, SyncCoordinator, SyncOutcome, SyncPhase};
pub use error::{
    ClientError, ClientResult, EngineError, EngineResult, ErrorKind, ErrorPolicy, HandlerFailure,
    PipelineError,
};
pub use mock::{MockCall, MockChatClient, Rpc};
pub use offline::{OfflineState, OfflineSupport};
pub use pipeline::{
    handler, EventPipeline, Flow, Handler, HandlerError, HandlerFuture, HandlerMatch,
    HandlerResult, InsertOptions, PipelineUnsubscribe, RunHandle,
};
pub use queue::{PendingMutationQueue, ReplayReport, TaskOutcome};
pub use reconciler::{MessageOverrides, MessageReconciler, SendHandler, UpdateHandler};
pub use router::EventMutationRouter;

//! # chatsync protocol
//!
//! Value types shared by every chatsync crate.
//!
//! This crate provides:
//! - [`Event`] and its [`EventKind`] discriminant for inbound server events
//! - Mirrored entities: channels, messages, reactions, members, reads, drafts, polls
//! - [`PendingTask`] for writes buffered while offline
//! - [`LocalMessage`] for optimistic message state
//!
//! This is a pure data crate with no I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cid;
mod error;
mod event;
mod local;
mod model;
mod task;

pub use cid::Cid;
pub use error::{ProtocolError, ProtocolResult};
pub use event::{Event, EventKind};
pub use local::{LocalMessage, MessageError, MessageStatus};
pub use model::{ChannelData, Draft, DraftMessage, Member, Message, Poll, Reaction, ReadState, User};
pub use task::{PendingTask, TaskKind, TaskPayload, TaskRecord};

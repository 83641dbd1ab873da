//! # chatsync storage
//!
//! Storage driver contract for the chatsync local mirror.
//!
//! The consistency layer never talks to a concrete database. It builds
//! [`Batch`]es of [`WriteOp`]s and hands them to a [`StorageDriver`], which
//! executes each batch atomically.
//!
//! ## Design Principles
//!
//! - Writes are plain values; preparing a write has no side effect
//! - A batch is all-or-nothing
//! - Dependent rows are never written before their parent row exists
//! - Drivers must be `Send + Sync`
//!
//! ## Available Drivers
//!
//! - [`InMemoryStorage`] - For testing and ephemeral sessions

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod driver;
mod error;
mod memory;

pub use batch::{Batch, WriteOp};
pub use driver::StorageDriver;
pub use error::{StorageError, StorageResult};
pub use memory::InMemoryStorage;

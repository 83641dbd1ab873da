//! # chatsync testkit
//!
//! Test utilities for chatsync.
//!
//! This crate provides:
//! - Fixture builders for channels, messages, events and pending tasks
//! - A [`TestHarness`] wiring in-memory storage to a mock client
//! - Property-based test generators using proptest
//! - Test logging controlled by `RUST_LOG`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use chatsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn mirrors_new_messages() {
//!     init_test_logging();
//!     let harness = TestHarness::new("alice").with_channel(cid("general"));
//!     let support = harness.offline_support();
//!     // ... emit events through harness.client
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod logging;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::logging::*;
}

pub use fixtures::*;
pub use generators::*;
pub use logging::*;

//! # KvSync Testkit
//!
//! Test utilities for KvSync.
//!
//! This crate provides:
//! - In-process peer fixtures wired over a [`kvsync_engine::VirtualNetwork`]
//! - Property-based test generators using proptest
//! - Concurrent sync stress helpers
//! - Test logging setup
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kvsync_testkit::prelude::*;
//!
//! #[test]
//! fn push_reaches_peer() {
//!     let net = TestNetwork::new();
//!     let a = net.peer("a");
//!     let b = net.peer("b");
//!     a.storage.put(b"k", b"v");
//!     let statuses = a.sync_and_wait(&["b"], SyncMode::Push).unwrap();
//!     assert!(statuses["b"].is_success());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
    pub use kvsync_engine::{OperationStatus, SyncRequest, SyncerConfig};
    pub use kvsync_protocol::SyncMode;
}

pub use fixtures::*;
pub use generators::*;
pub use stress::*;

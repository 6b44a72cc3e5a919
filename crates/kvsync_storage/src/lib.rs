//! # KvSync Storage
//!
//! Storage collaborator trait and in-memory store for the KvSync engine.
//!
//! The sync core never owns records. It talks to the local key-value store
//! through [`SyncStorage`], which exposes two namespaces:
//!
//! - a **metadata** namespace (opaque key/value bytes) where the engine
//!   persists watermarks, clock offsets and query cursors
//! - the **sync data** view: records ordered by their logical timestamp,
//!   read in ranges for sending and written in batches when received
//!
//! ## Design Principles
//!
//! - Storage is the single source of truth for records and conflict handling
//! - The engine only ever reads records by timestamp range
//! - Implementations must be `Send + Sync`
//!
//! ## Available Stores
//!
//! - [`MemoryStorage`] - For testing and in-process peers, with fault injection
//!
//! ## Example
//!
//! ```rust
//! use kvsync_storage::{MemoryStorage, SyncStorage};
//!
//! let storage = MemoryStorage::new("store-a");
//! storage.put(b"k1", b"v1");
//! let items = storage.sync_data(0, u64::MAX, None, 10).unwrap();
//! assert_eq!(items.len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod memory;
mod record;
mod storage;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryStorage;
pub use record::DataItem;
pub use storage::{DbProperties, SecurityLabel, SecurityOption, SyncStorage};

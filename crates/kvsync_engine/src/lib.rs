//! # KvSync Engine
//!
//! Peer-to-peer synchronization engine for embedded key-value stores.
//!
//! This crate provides:
//! - [`GenericSyncer`], the per-store façade accepting sync requests
//! - [`SyncOperation`], tracking one request's per-device progress
//! - A per-peer state machine running time sync, ability negotiation,
//!   data transfer and subscription control
//! - Persistent watermarks in the store's metadata namespace ([`Metadata`])
//! - Pluggable transport ([`Communicator`]) and scheduling ([`Runtime`])
//!   seams, with in-process implementations for tests
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐
//! │   GenericSyncer    │  validation, queued-sync limit, operation map
//! └─────────┬──────────┘
//!           │ SyncOperation
//! ┌─────────▼──────────┐
//! │     SyncEngine     │  routes messages, one context per peer
//! └─────────┬──────────┘
//!           │ targets and inbound messages
//! ┌─────────▼──────────┐      ┌──────────────┐
//! │  SyncTaskContext   │─────▶│ Communicator │
//! │  (state machine)   │      └──────────────┘
//! └─────────┬──────────┘
//!           │ records and metadata
//! ┌─────────▼──────────┐
//! │    SyncStorage     │
//! └────────────────────┘
//! ```
//!
//! ## Key Invariants
//!
//! - A context runs one task at a time; its inputs are handled serially
//! - A peer watermark only moves forward after the peer acknowledged data
//! - Responses from a previous session are ignored
//! - Every operation ends with one terminal status per device, and its
//!   completion callback runs at most once
//!
//! ## Example
//!
//! ```rust,no_run
//! use kvsync_engine::{GenericSyncer, SyncRequest, SyncerConfig, TokioRuntime, VirtualNetwork};
//! use kvsync_protocol::SyncMode;
//! use kvsync_storage::{MemoryStorage, SyncStorage};
//! use std::sync::Arc;
//!
//! let runtime = Arc::new(TokioRuntime::new()?);
//! let network = VirtualNetwork::new(runtime.clone());
//!
//! let store_a = Arc::new(MemoryStorage::new("store"));
//! store_a.put(b"greeting", b"hello");
//! let a = GenericSyncer::new(network.join("a"), runtime.clone(), SyncerConfig::default());
//! a.initialize(Some(store_a as Arc<dyn SyncStorage>), true)?;
//!
//! let b = GenericSyncer::new(network.join("b"), runtime, SyncerConfig::default());
//! b.initialize(Some(Arc::new(MemoryStorage::new("store")) as Arc<dyn SyncStorage>), true)?;
//!
//! a.sync(SyncRequest::new(["b"], SyncMode::Push).with_wait(true))?;
//! # Ok::<(), kvsync_engine::SyncError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod ability_sync;
mod communicator;
mod config;
mod data_sync;
mod engine;
mod error;
mod metadata;
mod operation;
mod query_water_mark;
mod registry;
mod remote_query;
mod runtime;
mod state_machine;
mod state_table;
mod syncer;
mod task_context;
mod time_helper;
mod time_sync;

pub use communicator::{
    mask_device, Communicator, ConnectHandler, Envelope, MessageFilter, MessageHandler,
    SendConfig, SendErrorHandler, VirtualCommunicator, VirtualNetwork, DEFAULT_MTU,
    DEFAULT_TIMEOUT,
};
pub use config::{
    backoff_timeout, SyncerConfig, AUTO_RETRY_TIMES, MANUAL_RETRY_TIMES, NEGOTIATION_LIMIT,
    QUEUED_SYNC_LIMIT_DEFAULT,
};
pub use error::{SyncError, SyncResult};
pub use metadata::{
    hash_device_id, MetaDataValue, Metadata, DEVICE_ID_PREFIX, LOCAL_TIME_OFFSET_KEY,
};
pub use operation::{CompletionCallback, FinalizeCallback, OperationStatus, SyncOperation};
pub use query_water_mark::{DeleteWaterMark, QueryWaterMark, DELETE_SYNC_PREFIX, QUERY_SYNC_PREFIX};
pub use registry::SyncRegistry;
pub use runtime::{
    ListenerId, ManualRuntime, PermissionCheck, PermissionFlags, Runtime, RuntimeHooks, Task,
    TimeChangeListener, TimerAction, TimerFinalizer, TimerId, TokioRuntime,
};
pub use state_table::{SyncEvent, SyncState};
pub use syncer::{CloseReason, GenericSyncer, SyncRequest};
pub use time_helper::{current_system_time, TimeHelper};

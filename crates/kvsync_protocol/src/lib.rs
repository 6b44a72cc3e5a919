//! # KvSync Protocol
//!
//! Wire messages and CBOR codecs for KvSync peer-to-peer sync.
//!
//! This crate provides:
//! - [`SyncMode`] describing the direction of one sync task
//! - The [`Message`] envelope (id, type, session id, sequence id)
//! - Packets for time sync, ability sync, data sync, control commands,
//!   remote queries and keep-alive notifications
//! - Software version constants used to select compatible behavior
//! - CBOR encoding/decoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod message;
mod mode;
mod packets;
mod version;

pub use error::{ProtocolError, ProtocolResult};
pub use kvsync_storage::DataItem;
pub use message::{Message, MessageId, MessageType, WIRE_VERSION};
pub use mode::SyncMode;
pub use packets::{
    AbilitySyncAck, AbilitySyncRequest, AckCode, ControlCommand, ControlPacket, DataAckPacket,
    DataRequestPacket, DbAbility, Packet, QuerySpec, RemoteQueryRequest, RemoteQueryResponse,
    SecurityClassification, TimeSyncPacket,
};
pub use version::{
    SOFTWARE_VERSION_CURRENT, SOFTWARE_VERSION_RELEASE_1_0, SOFTWARE_VERSION_RELEASE_2_0,
    SOFTWARE_VERSION_RELEASE_3_0, SOFTWARE_VERSION_RELEASE_4_0, TIME_SYNC_VERSION_V1,
};

//! Packet bodies carried inside a [`crate::Message`].

use crate::message::MessageId;
use crate::mode::SyncMode;
use crate::version::{SOFTWARE_VERSION_CURRENT, TIME_SYNC_VERSION_V1};
use kvsync_storage::{DataItem, SecurityOption};
use serde::{Deserialize, Serialize};

/// Four-timestamp clock exchange.
///
/// The requester fills `source_time_begin`; the responder fills both target
/// timestamps; the requester stamps `source_time_end` on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSyncPacket {
    /// Packet layout version.
    pub version: u32,
    /// Requester clock when the request was sent.
    pub source_time_begin: u64,
    /// Requester clock when the ack arrived.
    pub source_time_end: u64,
    /// Responder clock when the request arrived.
    pub target_time_begin: u64,
    /// Responder clock when the ack was sent.
    pub target_time_end: u64,
}

impl TimeSyncPacket {
    /// Creates a request stamped with the local send time.
    pub fn request(source_time_begin: u64) -> Self {
        Self {
            version: TIME_SYNC_VERSION_V1,
            source_time_begin,
            source_time_end: 0,
            target_time_begin: 0,
            target_time_end: 0,
        }
    }
}

/// How a peer describes its security classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityClassification {
    /// The platform has no security classification.
    NotSupported,
    /// The classification exists but could not be read.
    Unavailable,
    /// The store's security option.
    Option(SecurityOption),
}

/// Optional capabilities of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbAbility {
    /// Query-restricted sync.
    pub query_sync: bool,
    /// Subscribe/unsubscribe control commands.
    pub subscribe: bool,
    /// Remote queries.
    pub remote_query: bool,
}

impl Default for DbAbility {
    fn default() -> Self {
        Self {
            query_sync: true,
            subscribe: true,
            remote_query: true,
        }
    }
}

/// Ability sync request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbilitySyncRequest {
    /// Software version of the requester.
    pub software_version: u32,
    /// Schema definition (empty for schemaless stores).
    pub schema: String,
    /// Security classification.
    pub security: SecurityClassification,
    /// Creation time of the requester's store.
    pub db_create_time: u64,
    /// Capabilities.
    pub ability: DbAbility,
}

impl AbilitySyncRequest {
    /// Creates a request at the current software version.
    pub fn new(schema: impl Into<String>, security: SecurityClassification, db_create_time: u64) -> Self {
        Self {
            software_version: SOFTWARE_VERSION_CURRENT,
            schema: schema.into(),
            security,
            db_create_time,
            ability: DbAbility::default(),
        }
    }
}

/// Result code carried by acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckCode {
    /// Accepted.
    Ok,
    /// Security labels differ.
    SecurityOptionMismatch,
    /// Schemas cannot be synced.
    SchemaMismatch,
    /// Permission check failed on the receiver.
    PermissionDenied,
    /// The receiver is busy or closing.
    Busy,
    /// The receiver has no ability info for the sender.
    NeedAbilitySync,
    /// The receiver failed internally.
    InternalError,
}

impl AckCode {
    /// Whether the ack reports success.
    pub fn is_ok(&self) -> bool {
        matches!(self, AckCode::Ok)
    }
}

/// Ability sync ack.
///
/// Sent as a response to [`AbilitySyncRequest`], and once more as a notify
/// by the requester after it accepted the responder's ack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbilitySyncAck {
    /// Software version of the sender.
    pub software_version: u32,
    /// Result of the receiver's checks.
    pub code: AckCode,
    /// Schema definition of the sender.
    pub schema: String,
    /// Security classification of the sender.
    pub security: SecurityClassification,
    /// Creation time of the sender's store.
    pub db_create_time: u64,
    /// Whether the sender permits data sync with the receiver's schema.
    pub permit_sync: bool,
    /// Capabilities.
    pub ability: DbAbility,
}

impl AbilitySyncAck {
    /// Creates an ack at the current software version.
    pub fn new(code: AckCode) -> Self {
        Self {
            software_version: SOFTWARE_VERSION_CURRENT,
            code,
            schema: String::new(),
            security: SecurityClassification::NotSupported,
            db_create_time: 0,
            permit_sync: code.is_ok(),
            ability: DbAbility::default(),
        }
    }
}

/// A named key-prefix query restricting which records a task carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuerySpec {
    /// Stable query identifier; query watermarks are keyed on it.
    pub id: String,
    /// Records whose keys start with this prefix match.
    pub key_prefix: Vec<u8>,
}

impl QuerySpec {
    /// Creates a query.
    pub fn new(id: impl Into<String>, key_prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            key_prefix: key_prefix.into(),
        }
    }
}

/// One batch of records, or a pull request when `items` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequestPacket {
    /// Mode of the sending task.
    pub mode: SyncMode,
    /// Records in ascending timestamp order.
    pub items: Vec<DataItem>,
    /// Cursor the batch starts after.
    pub begin_watermark: u64,
    /// Cursor the receiver may record once this batch is saved.
    pub end_watermark: u64,
    /// Requester's receive cursor for the pull half of the task.
    pub pull_begin: u64,
    /// Query restriction.
    pub query: Option<QuerySpec>,
    /// Whether this is the final batch of the transfer.
    pub last: bool,
}

impl DataRequestPacket {
    /// Creates a batch.
    pub fn batch(mode: SyncMode, items: Vec<DataItem>, begin_watermark: u64, end_watermark: u64) -> Self {
        Self {
            mode,
            items,
            begin_watermark,
            end_watermark,
            pull_begin: 0,
            query: None,
            last: false,
        }
    }

    /// Creates a bare pull request.
    pub fn pull(pull_begin: u64) -> Self {
        Self {
            mode: SyncMode::Pull,
            items: Vec::new(),
            begin_watermark: 0,
            end_watermark: 0,
            pull_begin,
            query: None,
            last: true,
        }
    }

    /// Sets the query restriction.
    pub fn with_query(mut self, query: Option<QuerySpec>) -> Self {
        self.query = query;
        self
    }

    /// Marks the final batch.
    pub fn with_last(mut self, last: bool) -> Self {
        self.last = last;
        self
    }

    /// Sets the pull cursor.
    pub fn with_pull_begin(mut self, pull_begin: u64) -> Self {
        self.pull_begin = pull_begin;
        self
    }

    /// Whether the receiver is asked to send data back.
    pub fn requests_pull(&self) -> bool {
        self.last && matches!(self.mode, SyncMode::Pull | SyncMode::PushAndPull)
    }

    /// Approximate payload size in bytes.
    pub fn payload_size(&self) -> usize {
        self.items.iter().map(DataItem::approximate_size).sum()
    }
}

/// Ack for a [`DataRequestPacket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAckPacket {
    /// Result of saving the batch.
    pub code: AckCode,
    /// Receiver's cursor for the sender after saving.
    pub watermark: u64,
}

impl DataAckPacket {
    /// Creates a successful ack.
    pub fn ok(watermark: u64) -> Self {
        Self {
            code: AckCode::Ok,
            watermark,
        }
    }

    /// Creates a failed ack.
    pub fn error(code: AckCode) -> Self {
        Self { code, watermark: 0 }
    }
}

/// Subscription command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCommand {
    /// Register a query subscription.
    Subscribe,
    /// Remove a query subscription.
    Unsubscribe,
}

/// Subscription control packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPacket {
    /// Command.
    pub command: ControlCommand,
    /// Query the command applies to.
    pub query: QuerySpec,
}

/// Remote query request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteQueryRequest {
    /// Requester-local request id.
    pub request_id: u64,
    /// Key prefix to match.
    pub key_prefix: Vec<u8>,
}

/// Remote query response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteQueryResponse {
    /// Id of the request answered.
    pub request_id: u64,
    /// Result code.
    pub code: AckCode,
    /// Matching live records.
    pub items: Vec<DataItem>,
}

/// Packet body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    /// Clock exchange (request and response).
    TimeSync(TimeSyncPacket),
    /// Ability request.
    AbilityRequest(AbilitySyncRequest),
    /// Ability ack or ack-notify.
    AbilityAck(AbilitySyncAck),
    /// Data batch or pull request.
    DataRequest(DataRequestPacket),
    /// Data ack.
    DataAck(DataAckPacket),
    /// Subscription command.
    Control(ControlPacket),
    /// Subscription command ack.
    ControlAck(AckCode),
    /// Remote query request.
    RemoteQueryRequest(RemoteQueryRequest),
    /// Remote query response.
    RemoteQueryResponse(RemoteQueryResponse),
    /// "Still working" keep-alive for an outstanding exchange.
    Notify {
        /// Exchange the keep-alive belongs to.
        for_message: MessageId,
    },
}

impl Packet {
    /// Message id this packet travels under.
    pub fn message_id(&self) -> MessageId {
        match self {
            Packet::TimeSync(_) => MessageId::TimeSync,
            Packet::AbilityRequest(_) | Packet::AbilityAck(_) => MessageId::AbilitySync,
            Packet::DataRequest(_) | Packet::DataAck(_) => MessageId::DataSync,
            Packet::Control(_) | Packet::ControlAck(_) => MessageId::ControlSync,
            Packet::RemoteQueryRequest(_) | Packet::RemoteQueryResponse(_) => {
                MessageId::RemoteExecute
            }
            Packet::Notify { for_message } => *for_message,
        }
    }
}

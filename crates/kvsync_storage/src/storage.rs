//! Storage collaborator trait definition.

use crate::error::StorageResult;
use crate::record::DataItem;
use serde::{Deserialize, Serialize};

/// Security classification of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityLabel {
    /// No label configured.
    NotSet,
    /// Public data.
    S0,
    /// Low sensitivity.
    S1,
    /// Medium sensitivity.
    S2,
    /// High sensitivity.
    S3,
    /// Critical data.
    S4,
}

/// Security option of a store: classification label plus policy flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityOption {
    /// Classification label.
    pub label: SecurityLabel,
    /// Policy flag (e.g. per-file vs per-directory protection).
    pub flag: u32,
}

impl SecurityOption {
    /// Creates a security option.
    pub fn new(label: SecurityLabel, flag: u32) -> Self {
        Self { label, flag }
    }
}

impl Default for SecurityOption {
    fn default() -> Self {
        Self::new(SecurityLabel::NotSet, 0)
    }
}

/// Static properties of a store relevant to sync activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbProperties {
    /// Store identifier shared by all replicas of the same logical database.
    pub identifier: String,
    /// Local user the store belongs to (dual-tuple mode only).
    pub user_id: String,
    /// Sync identity is scoped per user rather than per device.
    pub dual_tuple: bool,
    /// The store never syncs.
    pub local_only: bool,
}

impl DbProperties {
    /// Creates properties for a plain device-scoped store.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Self::default()
        }
    }

    /// Marks the store as dual-tuple (per-user identity).
    pub fn with_dual_tuple(mut self, user_id: impl Into<String>) -> Self {
        self.dual_tuple = true;
        self.user_id = user_id.into();
        self
    }

    /// Marks the store as local-only.
    pub fn with_local_only(mut self) -> Self {
        self.local_only = true;
        self
    }
}

/// The storage engine as seen by the sync core.
///
/// # Invariants
///
/// - `put_meta_data` is durable once it returns `Ok`
/// - `sync_data` returns records ordered by ascending `timestamp`
/// - `put_sync_data` assigns each accepted record a fresh local `timestamp`
///   greater than every timestamp previously handed out
/// - `max_timestamp` never decreases
pub trait SyncStorage: Send + Sync {
    /// Reads a metadata value.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::NotFound`] if the key is absent.
    fn get_meta_data(&self, key: &[u8]) -> StorageResult<Vec<u8>>;

    /// Writes a metadata value.
    fn put_meta_data(&self, key: &[u8], value: &[u8]) -> StorageResult<()>;

    /// Deletes a set of metadata keys. Missing keys are ignored.
    fn delete_meta_data(&self, keys: &[Vec<u8>]) -> StorageResult<()>;

    /// Deletes every metadata key starting with `prefix`.
    fn delete_meta_data_by_prefix(&self, prefix: &[u8]) -> StorageResult<()>;

    /// Lists all metadata keys.
    fn all_meta_keys(&self) -> StorageResult<Vec<Vec<u8>>>;

    /// Highest record timestamp in the store (0 when empty).
    fn max_timestamp(&self) -> u64;

    /// Static store properties.
    fn db_properties(&self) -> DbProperties;

    /// Security option of the store.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::NotSupported`] when the platform has no
    /// security classification.
    fn security_option(&self) -> StorageResult<SecurityOption>;

    /// Schema definition of the store (empty for schemaless stores).
    fn schema(&self) -> String;

    /// Creation time of the store.
    fn db_create_time(&self) -> StorageResult<u64>;

    /// Reads up to `limit` records with `begin < timestamp <= end`,
    /// optionally restricted to keys starting with `key_prefix`.
    fn sync_data(
        &self,
        begin: u64,
        end: u64,
        key_prefix: Option<&[u8]>,
        limit: usize,
    ) -> StorageResult<Vec<DataItem>>;

    /// Saves records received from `device`.
    fn put_sync_data(&self, device: &str, items: Vec<DataItem>) -> StorageResult<()>;

    /// Removes every record that originated on `device`.
    fn remove_device_data(&self, device: &str) -> StorageResult<()>;

    /// Returns live records whose keys start with `key_prefix`.
    fn query(&self, key_prefix: &[u8]) -> StorageResult<Vec<DataItem>>;
}

//! Replicated records.

use serde::{Deserialize, Serialize};

/// A single replicated key-value record.
///
/// `timestamp` is the logical time at which the record entered the store
/// that owns this copy; it orders records for incremental sync and is what
/// watermarks are compared against. `write_timestamp` is the time of the
/// original write, rebased into the local clock, and is what conflict
/// resolution compares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataItem {
    /// Record key.
    pub key: Vec<u8>,
    /// Record value (empty for tombstones).
    pub value: Vec<u8>,
    /// Logical timestamp in the owning store's clock.
    pub timestamp: u64,
    /// Original write time.
    pub write_timestamp: u64,
    /// Whether this record is a deletion marker.
    pub deleted: bool,
    /// Device the record was originally written on (empty for local writes).
    pub origin: String,
}

impl DataItem {
    /// Creates a live record.
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, timestamp: u64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            timestamp,
            write_timestamp: timestamp,
            deleted: false,
            origin: String::new(),
        }
    }

    /// Creates a tombstone.
    pub fn tombstone(key: impl Into<Vec<u8>>, timestamp: u64) -> Self {
        Self {
            key: key.into(),
            value: Vec::new(),
            timestamp,
            write_timestamp: timestamp,
            deleted: true,
            origin: String::new(),
        }
    }

    /// Approximate encoded size in bytes.
    pub fn approximate_size(&self) -> usize {
        self.key.len() + self.value.len() + self.origin.len() + 2 * std::mem::size_of::<u64>() + 1
    }
}

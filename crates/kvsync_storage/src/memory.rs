//! In-memory store for testing and in-process peers.

use crate::error::{StorageError, StorageResult};
use crate::record::DataItem;
use crate::storage::{DbProperties, SecurityOption, SyncStorage};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Records plus the logical clock that stamps them.
#[derive(Debug, Default)]
struct Records {
    by_key: BTreeMap<Vec<u8>, DataItem>,
    clock: u64,
}

impl Records {
    fn next_timestamp(&mut self) -> u64 {
        self.clock = now_timestamp().max(self.clock + 1);
        self.clock
    }
}

/// Current wall clock in 100ns units.
fn now_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_nanos() / 100) as u64)
        .unwrap_or_default()
}

/// An in-memory [`SyncStorage`].
///
/// Records live in a key-ordered map and are stamped by a monotonic clock.
/// Received records are resolved last-writer-wins on `write_timestamp`.
///
/// Metadata writes can be made to fail after a budget of successful writes
/// with [`MemoryStorage::fail_meta_writes_after`], which lets tests stop a
/// multi-step metadata update at any point and inspect what survived.
///
/// # Example
///
/// ```rust
/// use kvsync_storage::{MemoryStorage, SyncStorage};
///
/// let storage = MemoryStorage::new("db");
/// storage.put_meta_data(b"k", b"v").unwrap();
/// assert_eq!(storage.get_meta_data(b"k").unwrap(), b"v");
/// ```
#[derive(Debug)]
pub struct MemoryStorage {
    properties: DbProperties,
    create_time: RwLock<u64>,
    security: RwLock<Option<SecurityOption>>,
    schema: RwLock<String>,
    meta: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    records: RwLock<Records>,
    meta_write_budget: Mutex<Option<usize>>,
    closed: AtomicBool,
}

impl MemoryStorage {
    /// Creates an empty device-scoped store.
    #[must_use]
    pub fn new(identifier: impl Into<String>) -> Self {
        Self::with_properties(DbProperties::new(identifier))
    }

    /// Creates an empty store with explicit properties.
    #[must_use]
    pub fn with_properties(properties: DbProperties) -> Self {
        Self {
            properties,
            create_time: RwLock::new(now_timestamp()),
            security: RwLock::new(Some(SecurityOption::default())),
            schema: RwLock::new(String::new()),
            meta: RwLock::new(BTreeMap::new()),
            records: RwLock::new(Records::default()),
            meta_write_budget: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Sets the security option.
    pub fn set_security_option(&self, option: SecurityOption) {
        *self.security.write() = Some(option);
    }

    /// Makes [`SyncStorage::security_option`] report "not supported".
    pub fn disable_security_classification(&self) {
        *self.security.write() = None;
    }

    /// Sets the schema definition.
    pub fn set_schema(&self, schema: impl Into<String>) {
        *self.schema.write() = schema.into();
    }

    /// Overrides the creation time, simulating a recreated store.
    pub fn set_db_create_time(&self, create_time: u64) {
        *self.create_time.write() = create_time;
    }

    /// Writes a local record and returns its timestamp.
    pub fn put(&self, key: &[u8], value: &[u8]) -> u64 {
        let mut records = self.records.write();
        let timestamp = records.next_timestamp();
        records
            .by_key
            .insert(key.to_vec(), DataItem::put(key.to_vec(), value.to_vec(), timestamp));
        timestamp
    }

    /// Deletes a local record and returns the tombstone timestamp.
    pub fn delete(&self, key: &[u8]) -> u64 {
        let mut records = self.records.write();
        let timestamp = records.next_timestamp();
        records
            .by_key
            .insert(key.to_vec(), DataItem::tombstone(key.to_vec(), timestamp));
        timestamp
    }

    /// Reads the live value of a key.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.records
            .read()
            .by_key
            .get(key)
            .filter(|item| !item.deleted)
            .map(|item| item.value.clone())
    }

    /// Returns all records, tombstones included, ordered by key.
    #[must_use]
    pub fn records(&self) -> Vec<DataItem> {
        self.records.read().by_key.values().cloned().collect()
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .read()
            .by_key
            .values()
            .filter(|item| !item.deleted)
            .count()
    }

    /// Whether the store holds no live records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lets `count` more metadata writes succeed, then rejects every write.
    pub fn fail_meta_writes_after(&self, count: usize) {
        *self.meta_write_budget.lock() = Some(count);
    }

    /// Removes any metadata write fault.
    pub fn clear_meta_write_fault(&self) {
        *self.meta_write_budget.lock() = None;
    }

    /// Snapshot of the metadata namespace.
    #[must_use]
    pub fn meta_snapshot(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.meta.read().clone()
    }

    /// Closes the store; every later call fails with [`StorageError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn consume_meta_write(&self) -> StorageResult<()> {
        self.check_open()?;
        let mut budget = self.meta_write_budget.lock();
        match budget.as_mut() {
            Some(0) => Err(StorageError::WriteRejected("metadata write fault".into())),
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new("")
    }
}

impl SyncStorage for MemoryStorage {
    fn get_meta_data(&self, key: &[u8]) -> StorageResult<Vec<u8>> {
        self.check_open()?;
        self.meta.read().get(key).cloned().ok_or(StorageError::NotFound)
    }

    fn put_meta_data(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.consume_meta_write()?;
        self.meta.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete_meta_data(&self, keys: &[Vec<u8>]) -> StorageResult<()> {
        self.consume_meta_write()?;
        let mut meta = self.meta.write();
        for key in keys {
            meta.remove(key);
        }
        Ok(())
    }

    fn delete_meta_data_by_prefix(&self, prefix: &[u8]) -> StorageResult<()> {
        self.consume_meta_write()?;
        self.meta.write().retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }

    fn all_meta_keys(&self) -> StorageResult<Vec<Vec<u8>>> {
        self.check_open()?;
        Ok(self.meta.read().keys().cloned().collect())
    }

    fn max_timestamp(&self) -> u64 {
        self.records.read().clock
    }

    fn db_properties(&self) -> DbProperties {
        self.properties.clone()
    }

    fn security_option(&self) -> StorageResult<SecurityOption> {
        self.check_open()?;
        (*self.security.read())
            .ok_or_else(|| StorageError::NotSupported("security classification".into()))
    }

    fn schema(&self) -> String {
        self.schema.read().clone()
    }

    fn db_create_time(&self) -> StorageResult<u64> {
        self.check_open()?;
        Ok(*self.create_time.read())
    }

    fn sync_data(
        &self,
        begin: u64,
        end: u64,
        key_prefix: Option<&[u8]>,
        limit: usize,
    ) -> StorageResult<Vec<DataItem>> {
        self.check_open()?;
        let records = self.records.read();
        let mut items: Vec<DataItem> = records
            .by_key
            .values()
            .filter(|item| item.timestamp > begin && item.timestamp <= end)
            .filter(|item| key_prefix.map_or(true, |prefix| item.key.starts_with(prefix)))
            .cloned()
            .collect();
        items.sort_by_key(|item| item.timestamp);
        items.truncate(limit);
        Ok(items)
    }

    fn put_sync_data(&self, device: &str, items: Vec<DataItem>) -> StorageResult<()> {
        self.check_open()?;
        let mut records = self.records.write();
        for mut item in items {
            if let Some(existing) = records.by_key.get(&item.key) {
                if existing.write_timestamp > item.write_timestamp {
                    continue;
                }
            }
            item.timestamp = records.next_timestamp();
            if item.origin.is_empty() {
                item.origin = device.to_string();
            }
            records.by_key.insert(item.key.clone(), item);
        }
        Ok(())
    }

    fn remove_device_data(&self, device: &str) -> StorageResult<()> {
        self.check_open()?;
        self.records
            .write()
            .by_key
            .retain(|_, item| item.origin != device);
        Ok(())
    }

    fn query(&self, key_prefix: &[u8]) -> StorageResult<Vec<DataItem>> {
        self.check_open()?;
        Ok(self
            .records
            .read()
            .by_key
            .range(key_prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(key_prefix))
            .filter(|(_, item)| !item.deleted)
            .map(|(_, item)| item.clone())
            .collect())
    }
}

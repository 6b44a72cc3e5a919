//! Persistent per-peer sync metadata.
//!
//! Every value is cached in memory and written through to the storage
//! engine's metadata namespace before the cache is updated, so a failed
//! write leaves both in their previous state.
//!
//! ## Watermarks
//!
//! Two device-level cursors are kept per peer, both in the timestamp space
//! of the store that owns the records:
//!
//! - the **peer watermark** is the highest local timestamp the peer has
//!   acknowledged (where the next push starts)
//! - the **local watermark** is the highest peer timestamp received here
//!   (where the next pull starts)
//!
//! Per-query and delete-sync cursors refine these for restricted syncs.

use crate::error::{SyncError, SyncResult};
use crate::query_water_mark::{QueryWaterMarkHelper, QueryWaterMark};
use crate::time_helper::current_system_time;
use kvsync_storage::{StorageError, SyncStorage};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Metadata key prefix of device-level values.
pub const DEVICE_ID_PREFIX: &str = "deviceId";
/// Metadata key of the local clock offset.
pub const LOCAL_TIME_OFFSET_KEY: &[u8] = b"localTimeOffset";

/// Hex SHA-256 of a device id; metadata never stores raw device ids.
pub fn hash_device_id(device: &str) -> String {
    Sha256::digest(device.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn device_key(hashed_device: &str) -> Vec<u8> {
    format!("{DEVICE_ID_PREFIX}{hashed_device}").into_bytes()
}

pub(crate) fn encode_value<T: Serialize>(value: &T) -> SyncResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| SyncError::inner(format!("metadata encode: {e}")))?;
    Ok(bytes)
}

pub(crate) fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> SyncResult<T> {
    ciborium::from_reader(bytes)
        .map_err(|e| SyncError::Storage(StorageError::Corrupted(format!("metadata decode: {e}"))))
}

/// Device-level values persisted per peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaDataValue {
    /// Peer clock minus local clock, in 100ns units.
    pub time_offset: i64,
    /// When `time_offset` was last negotiated.
    pub last_update_time: u64,
    /// Highest peer timestamp received.
    pub local_water_mark: u64,
    /// Highest local timestamp acknowledged by the peer.
    pub peer_water_mark: u64,
    /// Creation time of the peer's store as last reported.
    pub db_create_time: u64,
    /// The peer's store was recreated; its data here must be purged.
    pub clear_device_data_mark: bool,
}

/// Watermark store.
pub struct Metadata {
    storage: Arc<dyn SyncStorage>,
    values: Mutex<HashMap<String, MetaDataValue>>,
    local_time_offset: Mutex<i64>,
    last_local_time: Mutex<u64>,
    queries: QueryWaterMarkHelper,
}

impl Metadata {
    /// Creates an empty store over `storage`; call [`Metadata::initialize`]
    /// to load persisted values.
    pub fn new(storage: Arc<dyn SyncStorage>, query_capacity: usize) -> Self {
        Self {
            queries: QueryWaterMarkHelper::new(Arc::clone(&storage), query_capacity),
            storage,
            values: Mutex::new(HashMap::new()),
            local_time_offset: Mutex::new(0),
            last_local_time: Mutex::new(0),
        }
    }

    /// Loads every persisted value into the cache.
    pub fn initialize(&self) -> SyncResult<()> {
        match self.storage.get_meta_data(LOCAL_TIME_OFFSET_KEY) {
            Ok(bytes) => *self.local_time_offset.lock() = decode_value(&bytes)?,
            Err(StorageError::NotFound) => {
                let offset: i64 = 0;
                self.storage
                    .put_meta_data(LOCAL_TIME_OFFSET_KEY, &encode_value(&offset)?)?;
                *self.local_time_offset.lock() = offset;
            }
            Err(e) => return Err(e.into()),
        }

        let keys = self.storage.all_meta_keys()?;
        let mut loaded = HashMap::new();
        for key in keys.iter().filter(|k| k.starts_with(DEVICE_ID_PREFIX.as_bytes())) {
            let hashed = String::from_utf8_lossy(&key[DEVICE_ID_PREFIX.len()..]).into_owned();
            let bytes = self.storage.get_meta_data(key)?;
            loaded.insert(hashed, decode_value::<MetaDataValue>(&bytes)?);
        }
        debug!(devices = loaded.len(), "loaded device metadata");
        *self.values.lock() = loaded;
        self.queries.load(&keys)
    }

    fn value(&self, device: &str) -> MetaDataValue {
        self.values
            .lock()
            .get(&hash_device_id(device))
            .copied()
            .unwrap_or_default()
    }

    fn update(&self, device: &str, apply: impl FnOnce(&mut MetaDataValue)) -> SyncResult<()> {
        let hashed = hash_device_id(device);
        let mut values = self.values.lock();
        let mut value = values.get(&hashed).copied().unwrap_or_default();
        apply(&mut value);
        self.storage
            .put_meta_data(&device_key(&hashed), &encode_value(&value)?)?;
        values.insert(hashed, value);
        Ok(())
    }

    /// Full device-level record of a peer.
    pub fn get_meta_data_value(&self, device: &str) -> MetaDataValue {
        self.value(device)
    }

    /// Clock offset towards a peer.
    pub fn get_time_offset(&self, device: &str) -> i64 {
        self.value(device).time_offset
    }

    /// When the clock offset towards a peer was last negotiated.
    pub fn get_last_update_time(&self, device: &str) -> u64 {
        self.value(device).last_update_time
    }

    /// Persists a freshly negotiated clock offset.
    pub fn save_time_offset(&self, device: &str, offset: i64) -> SyncResult<()> {
        self.update(device, |v| {
            v.time_offset = offset;
            v.last_update_time = current_system_time();
        })
    }

    /// Highest peer timestamp received from `device`.
    pub fn get_local_water_mark(&self, device: &str) -> u64 {
        self.value(device).local_water_mark
    }

    /// Records the highest peer timestamp received from `device`.
    pub fn save_local_water_mark(&self, device: &str, water_mark: u64) -> SyncResult<()> {
        self.update(device, |v| v.local_water_mark = water_mark)
    }

    /// Highest local timestamp acknowledged by `device`.
    pub fn get_peer_water_mark(&self, device: &str) -> u64 {
        self.value(device).peer_water_mark
    }

    /// Records the highest local timestamp acknowledged by `device`.
    pub fn save_peer_water_mark(&self, device: &str, water_mark: u64) -> SyncResult<()> {
        self.update(device, |v| v.peer_water_mark = water_mark)
    }

    /// Offset applied to the wall clock for local timestamps.
    pub fn get_local_time_offset(&self) -> i64 {
        *self.local_time_offset.lock()
    }

    /// Persists the local clock offset.
    pub fn save_local_time_offset(&self, offset: i64) -> SyncResult<()> {
        let mut current = self.local_time_offset.lock();
        self.storage
            .put_meta_data(LOCAL_TIME_OFFSET_KEY, &encode_value(&offset)?)?;
        *current = offset;
        Ok(())
    }

    /// Raises the last handed-out local timestamp.
    pub fn set_last_local_time(&self, time: u64) {
        let mut last = self.last_local_time.lock();
        if time > *last {
            *last = time;
        }
    }

    /// Last handed-out local timestamp.
    pub fn get_last_local_time(&self) -> u64 {
        *self.last_local_time.lock()
    }

    /// Send cursor of a query; lifted to the device-level cursor when
    /// `auto_lift` is set.
    pub fn get_send_query_water_mark(
        &self,
        query_id: &str,
        device: &str,
        auto_lift: bool,
    ) -> SyncResult<u64> {
        let mark = self.query_water_mark(query_id, device)?;
        Ok(if auto_lift {
            mark.send_water_mark.max(self.get_peer_water_mark(device))
        } else {
            mark.send_water_mark
        })
    }

    /// Records the send cursor of a query.
    pub fn save_send_query_water_mark(
        &self,
        query_id: &str,
        device: &str,
        water_mark: u64,
    ) -> SyncResult<()> {
        self.queries
            .set_send_query_water_mark(&hash_device_id(device), query_id, water_mark)
    }

    /// Receive cursor of a query; lifted to the device-level cursor when
    /// `auto_lift` is set.
    pub fn get_recv_query_water_mark(
        &self,
        query_id: &str,
        device: &str,
        auto_lift: bool,
    ) -> SyncResult<u64> {
        let mark = self.query_water_mark(query_id, device)?;
        Ok(if auto_lift {
            mark.recv_water_mark.max(self.get_local_water_mark(device))
        } else {
            mark.recv_water_mark
        })
    }

    /// Records the receive cursor of a query.
    pub fn save_recv_query_water_mark(
        &self,
        query_id: &str,
        device: &str,
        water_mark: u64,
    ) -> SyncResult<()> {
        self.queries
            .set_recv_query_water_mark(&hash_device_id(device), query_id, water_mark)
    }

    /// Raw cursors of a query.
    pub fn query_water_mark(&self, query_id: &str, device: &str) -> SyncResult<QueryWaterMark> {
        self.queries
            .get_query_water_mark(&hash_device_id(device), query_id)
    }

    /// Tombstone send cursor.
    pub fn get_send_delete_sync_water_mark(&self, device: &str, auto_lift: bool) -> SyncResult<u64> {
        let mark = self.queries.get_delete_water_mark(&hash_device_id(device))?;
        Ok(if auto_lift {
            mark.send_water_mark.max(self.get_peer_water_mark(device))
        } else {
            mark.send_water_mark
        })
    }

    /// Records the tombstone send cursor.
    pub fn save_send_delete_sync_water_mark(&self, device: &str, water_mark: u64) -> SyncResult<()> {
        self.queries
            .set_send_delete_water_mark(&hash_device_id(device), water_mark)
    }

    /// Tombstone receive cursor.
    pub fn get_recv_delete_sync_water_mark(&self, device: &str, auto_lift: bool) -> SyncResult<u64> {
        let mark = self.queries.get_delete_water_mark(&hash_device_id(device))?;
        Ok(if auto_lift {
            mark.recv_water_mark.max(self.get_local_water_mark(device))
        } else {
            mark.recv_water_mark
        })
    }

    /// Records the tombstone receive cursor.
    pub fn save_recv_delete_sync_water_mark(&self, device: &str, water_mark: u64) -> SyncResult<()> {
        self.queries
            .set_recv_delete_water_mark(&hash_device_id(device), water_mark)
    }

    /// Forgets all sync progress with a peer.
    ///
    /// Delete-sync cursors go first, then query cursors, then the device
    /// cursors. The first failing step aborts the erase, so an interrupted
    /// erase never leaves a query cursor ahead of a reset device cursor.
    pub fn erase_device_water_mark(&self, device: &str) -> SyncResult<()> {
        let hashed = hash_device_id(device);
        self.queries.reset_delete_water_mark(&hashed)?;
        self.queries.reset_query_water_marks(&hashed)?;
        self.update(device, |v| {
            v.local_water_mark = 0;
            v.peer_water_mark = 0;
        })?;
        info!(device = %crate::communicator::mask_device(device), "erased device watermarks");
        Ok(())
    }

    /// Creation time of the peer's store as last reported.
    pub fn get_db_create_time(&self, device: &str) -> u64 {
        self.value(device).db_create_time
    }

    /// Records the peer's store creation time, marking its data for removal
    /// if the store was recreated since the last report.
    pub fn set_db_create_time(&self, device: &str, create_time: u64) -> SyncResult<()> {
        self.update(device, |v| {
            if v.db_create_time != 0 && v.db_create_time != create_time {
                info!(
                    device = %crate::communicator::mask_device(device),
                    create_time,
                    "peer store recreated, marking its data for removal"
                );
                v.clear_device_data_mark = true;
            }
            v.db_create_time = create_time;
        })
    }

    /// Whether the peer's data must be purged before syncing.
    pub fn get_remove_data_mark(&self, device: &str) -> bool {
        self.value(device).clear_device_data_mark
    }

    /// Clears the removal mark once the peer's data is gone.
    pub fn reset_meta_data_after_remove_data(&self, device: &str) -> SyncResult<()> {
        if !self.values.lock().contains_key(&hash_device_id(device)) {
            return Err(StorageError::NotFound.into());
        }
        self.update(device, |v| v.clear_device_data_mark = false)
    }

    /// Number of peers with device-level metadata.
    pub fn device_count(&self) -> usize {
        self.values.lock().len()
    }

    /// Number of cached query cursors.
    pub fn query_count(&self) -> usize {
        self.queries.query_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvsync_storage::MemoryStorage;

    fn metadata(storage: &Arc<MemoryStorage>) -> Metadata {
        let meta = Metadata::new(storage.clone(), 16);
        meta.initialize().unwrap();
        meta
    }

    #[test]
    fn values_survive_reload() {
        let storage = Arc::new(MemoryStorage::new("db"));
        let meta = metadata(&storage);
        meta.save_peer_water_mark("dev-b", 42).unwrap();
        meta.save_local_water_mark("dev-b", 7).unwrap();
        meta.save_time_offset("dev-b", -300).unwrap();
        meta.save_local_time_offset(11).unwrap();

        let reloaded = metadata(&storage);
        assert_eq!(reloaded.get_peer_water_mark("dev-b"), 42);
        assert_eq!(reloaded.get_local_water_mark("dev-b"), 7);
        assert_eq!(reloaded.get_time_offset("dev-b"), -300);
        assert!(reloaded.get_last_update_time("dev-b") > 0);
        assert_eq!(reloaded.get_local_time_offset(), 11);
        assert_eq!(reloaded.get_peer_water_mark("unknown"), 0);
    }

    #[test]
    fn keys_hold_hashed_device_ids() {
        let storage = Arc::new(MemoryStorage::new("db"));
        let meta = metadata(&storage);
        meta.save_peer_water_mark("secret-device", 1).unwrap();

        let keys = storage.meta_snapshot();
        assert!(keys
            .keys()
            .all(|k| !String::from_utf8_lossy(k).contains("secret-device")));
        assert!(keys.contains_key(&device_key(&hash_device_id("secret-device"))));
    }

    #[test]
    fn failed_write_leaves_cache_unchanged() {
        let storage = Arc::new(MemoryStorage::new("db"));
        let meta = metadata(&storage);
        meta.save_peer_water_mark("dev", 10).unwrap();

        storage.fail_meta_writes_after(0);
        assert!(meta.save_peer_water_mark("dev", 20).is_err());
        assert_eq!(meta.get_peer_water_mark("dev"), 10);
    }

    #[test]
    fn query_water_marks_auto_lift() {
        let storage = Arc::new(MemoryStorage::new("db"));
        let meta = metadata(&storage);
        meta.save_peer_water_mark("dev", 100).unwrap();
        meta.save_local_water_mark("dev", 60).unwrap();
        meta.save_send_query_water_mark("q", "dev", 40).unwrap();
        meta.save_recv_query_water_mark("q", "dev", 90).unwrap();

        assert_eq!(meta.get_send_query_water_mark("q", "dev", true).unwrap(), 100);
        assert_eq!(meta.get_send_query_water_mark("q", "dev", false).unwrap(), 40);
        assert_eq!(meta.get_recv_query_water_mark("q", "dev", true).unwrap(), 90);
        assert_eq!(meta.get_recv_query_water_mark("q", "dev", false).unwrap(), 90);
        assert_eq!(meta.get_send_query_water_mark("other", "dev", false).unwrap(), 0);
    }

    #[test]
    fn db_create_time_change_sets_removal_mark() {
        let storage = Arc::new(MemoryStorage::new("db"));
        let meta = metadata(&storage);

        meta.set_db_create_time("dev", 1000).unwrap();
        assert!(!meta.get_remove_data_mark("dev"));
        meta.set_db_create_time("dev", 1000).unwrap();
        assert!(!meta.get_remove_data_mark("dev"));

        meta.set_db_create_time("dev", 2000).unwrap();
        assert!(meta.get_remove_data_mark("dev"));
        assert_eq!(meta.get_db_create_time("dev"), 2000);

        meta.reset_meta_data_after_remove_data("dev").unwrap();
        assert!(!meta.get_remove_data_mark("dev"));
        assert!(meta.reset_meta_data_after_remove_data("never-seen").is_err());
    }

    #[test]
    fn erase_resets_every_cursor() {
        let storage = Arc::new(MemoryStorage::new("db"));
        let meta = metadata(&storage);
        meta.save_peer_water_mark("dev", 100).unwrap();
        meta.save_local_water_mark("dev", 100).unwrap();
        meta.save_send_query_water_mark("q", "dev", 50).unwrap();
        meta.save_send_delete_sync_water_mark("dev", 30).unwrap();
        meta.save_peer_water_mark("other", 5).unwrap();

        meta.erase_device_water_mark("dev").unwrap();
        assert_eq!(meta.get_peer_water_mark("dev"), 0);
        assert_eq!(meta.get_local_water_mark("dev"), 0);
        assert_eq!(meta.get_send_query_water_mark("q", "dev", false).unwrap(), 0);
        assert_eq!(meta.get_send_delete_sync_water_mark("dev", false).unwrap(), 0);
        assert_eq!(meta.get_peer_water_mark("other"), 5);
    }

    #[test]
    fn interrupted_erase_never_leaves_query_ahead_of_device() {
        for budget in 0..=3 {
            let storage = Arc::new(MemoryStorage::new("db"));
            let meta = metadata(&storage);
            meta.save_peer_water_mark("dev", 100).unwrap();
            meta.save_send_query_water_mark("q1", "dev", 50).unwrap();
            meta.save_send_query_water_mark("q2", "dev", 80).unwrap();
            meta.save_send_delete_sync_water_mark("dev", 30).unwrap();

            storage.fail_meta_writes_after(budget);
            let result = meta.erase_device_water_mark("dev");
            assert_eq!(result.is_ok(), budget == 3, "budget {budget}");
            storage.clear_meta_write_fault();

            // What survived on disk after the crash.
            let recovered = metadata(&storage);
            let device = recovered.get_peer_water_mark("dev");
            for query in ["q1", "q2"] {
                let q = recovered
                    .get_send_query_water_mark(query, "dev", false)
                    .unwrap();
                assert!(q <= device, "budget {budget}: {query}={q} > device={device}");
            }
            let delete = recovered.get_send_delete_sync_water_mark("dev", false).unwrap();
            assert!(delete <= device);
        }
    }

    #[test]
    fn query_capacity_evicts_least_recently_used() {
        let storage = Arc::new(MemoryStorage::new("db"));
        {
            let meta = Metadata::new(storage.clone(), 100);
            meta.initialize().unwrap();
            for i in 0..5 {
                meta.save_send_query_water_mark(&format!("q{i}"), "dev", i).unwrap();
            }
        }
        storage
            .put_meta_data(b"querySyncbroken", &[0xff, 0xff])
            .unwrap();

        let meta = Metadata::new(storage.clone(), 3);
        meta.initialize().unwrap();
        assert_eq!(meta.query_count(), 3);
        assert!(!storage.meta_snapshot().contains_key(b"querySyncbroken".as_slice()));
        // q0 and q1 were written first.
        assert_eq!(meta.get_send_query_water_mark("q0", "dev", false).unwrap(), 0);
        assert_eq!(meta.get_send_query_water_mark("q4", "dev", false).unwrap(), 4);
    }
}

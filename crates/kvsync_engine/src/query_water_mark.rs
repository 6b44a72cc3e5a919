//! Per-query and delete-sync cursors.

use crate::error::SyncResult;
use crate::metadata::{decode_value, encode_value};
use crate::time_helper::current_system_time;
use kvsync_protocol::SOFTWARE_VERSION_CURRENT;
use kvsync_storage::{StorageError, SyncStorage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Metadata key prefix of per-query cursors.
pub const QUERY_SYNC_PREFIX: &str = "querySync";
/// Metadata key prefix of delete-sync cursors.
pub const DELETE_SYNC_PREFIX: &str = "deleteSync";

/// Send/receive cursors of one named query towards one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryWaterMark {
    /// Layout version.
    pub version: u32,
    /// Highest local timestamp the peer confirmed for this query.
    pub send_water_mark: u64,
    /// Highest peer timestamp received for this query.
    pub recv_water_mark: u64,
    /// Last time the entry was written; drives eviction.
    pub last_used_time: u64,
}

/// Send/receive cursors for tombstones towards one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteWaterMark {
    /// Layout version.
    pub version: u32,
    /// Highest local tombstone timestamp the peer confirmed.
    pub send_water_mark: u64,
    /// Highest peer tombstone timestamp received.
    pub recv_water_mark: u64,
}

fn query_key(hashed_device: &str, query_id: &str) -> Vec<u8> {
    format!("{QUERY_SYNC_PREFIX}{hashed_device}{query_id}").into_bytes()
}

fn query_prefix(hashed_device: &str) -> Vec<u8> {
    format!("{QUERY_SYNC_PREFIX}{hashed_device}").into_bytes()
}

fn delete_key(hashed_device: &str) -> Vec<u8> {
    format!("{DELETE_SYNC_PREFIX}{hashed_device}").into_bytes()
}

/// Write-through cache of query and delete-sync cursors.
pub(crate) struct QueryWaterMarkHelper {
    storage: Arc<dyn SyncStorage>,
    capacity: usize,
    queries: Mutex<HashMap<Vec<u8>, QueryWaterMark>>,
    deletes: Mutex<HashMap<Vec<u8>, DeleteWaterMark>>,
}

impl QueryWaterMarkHelper {
    pub(crate) fn new(storage: Arc<dyn SyncStorage>, capacity: usize) -> Self {
        Self {
            storage,
            capacity,
            queries: Mutex::new(HashMap::new()),
            deletes: Mutex::new(HashMap::new()),
        }
    }

    /// Loads every query cursor, dropping unreadable entries and evicting
    /// the least recently used ones beyond capacity.
    pub(crate) fn load(&self, keys: &[Vec<u8>]) -> SyncResult<()> {
        let mut broken = Vec::new();
        let mut loaded = Vec::new();
        for key in keys.iter().filter(|k| k.starts_with(QUERY_SYNC_PREFIX.as_bytes())) {
            let bytes = self.storage.get_meta_data(key)?;
            match decode_value::<QueryWaterMark>(&bytes) {
                Ok(mark) => loaded.push((key.clone(), mark)),
                Err(_) => broken.push(key.clone()),
            }
        }

        let mut evicted = Vec::new();
        if loaded.len() > self.capacity {
            loaded.sort_by_key(|(_, mark)| mark.last_used_time);
            let excess = loaded.len() - self.capacity;
            evicted.extend(loaded.drain(..excess).map(|(key, _)| key));
        }
        if !broken.is_empty() || !evicted.is_empty() {
            info!(
                broken = broken.len(),
                evicted = evicted.len(),
                "removing query watermarks"
            );
            let mut remove = broken;
            remove.extend(evicted);
            self.storage.delete_meta_data(&remove)?;
        }

        let mut queries = self.queries.lock();
        queries.clear();
        queries.extend(loaded);
        Ok(())
    }

    pub(crate) fn get_query_water_mark(
        &self,
        hashed_device: &str,
        query_id: &str,
    ) -> SyncResult<QueryWaterMark> {
        let key = query_key(hashed_device, query_id);
        if let Some(mark) = self.queries.lock().get(&key) {
            return Ok(*mark);
        }
        match self.storage.get_meta_data(&key) {
            Ok(bytes) => {
                let mark = decode_value::<QueryWaterMark>(&bytes)?;
                self.queries.lock().insert(key, mark);
                Ok(mark)
            }
            Err(StorageError::NotFound) => Ok(QueryWaterMark {
                version: SOFTWARE_VERSION_CURRENT,
                ..QueryWaterMark::default()
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn update_query(
        &self,
        hashed_device: &str,
        query_id: &str,
        apply: impl FnOnce(&mut QueryWaterMark),
    ) -> SyncResult<()> {
        let mut mark = self.get_query_water_mark(hashed_device, query_id)?;
        apply(&mut mark);
        mark.last_used_time = current_system_time();
        let key = query_key(hashed_device, query_id);
        self.storage.put_meta_data(&key, &encode_value(&mark)?)?;
        self.queries.lock().insert(key, mark);
        Ok(())
    }

    pub(crate) fn set_send_query_water_mark(
        &self,
        hashed_device: &str,
        query_id: &str,
        water_mark: u64,
    ) -> SyncResult<()> {
        self.update_query(hashed_device, query_id, |mark| {
            mark.send_water_mark = water_mark;
        })
    }

    pub(crate) fn set_recv_query_water_mark(
        &self,
        hashed_device: &str,
        query_id: &str,
        water_mark: u64,
    ) -> SyncResult<()> {
        self.update_query(hashed_device, query_id, |mark| {
            mark.recv_water_mark = water_mark;
        })
    }

    /// Removes every query cursor of a peer.
    pub(crate) fn reset_query_water_marks(&self, hashed_device: &str) -> SyncResult<()> {
        let prefix = query_prefix(hashed_device);
        self.storage.delete_meta_data_by_prefix(&prefix)?;
        self.queries.lock().retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }

    pub(crate) fn get_delete_water_mark(&self, hashed_device: &str) -> SyncResult<DeleteWaterMark> {
        let key = delete_key(hashed_device);
        if let Some(mark) = self.deletes.lock().get(&key) {
            return Ok(*mark);
        }
        match self.storage.get_meta_data(&key) {
            Ok(bytes) => {
                let mark = decode_value::<DeleteWaterMark>(&bytes)?;
                self.deletes.lock().insert(key, mark);
                Ok(mark)
            }
            Err(StorageError::NotFound) => Ok(DeleteWaterMark {
                version: SOFTWARE_VERSION_CURRENT,
                ..DeleteWaterMark::default()
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn update_delete(
        &self,
        hashed_device: &str,
        apply: impl FnOnce(&mut DeleteWaterMark),
    ) -> SyncResult<()> {
        let mut mark = self.get_delete_water_mark(hashed_device)?;
        apply(&mut mark);
        let key = delete_key(hashed_device);
        self.storage.put_meta_data(&key, &encode_value(&mark)?)?;
        self.deletes.lock().insert(key, mark);
        Ok(())
    }

    pub(crate) fn set_send_delete_water_mark(
        &self,
        hashed_device: &str,
        water_mark: u64,
    ) -> SyncResult<()> {
        self.update_delete(hashed_device, |mark| mark.send_water_mark = water_mark)
    }

    pub(crate) fn set_recv_delete_water_mark(
        &self,
        hashed_device: &str,
        water_mark: u64,
    ) -> SyncResult<()> {
        self.update_delete(hashed_device, |mark| mark.recv_water_mark = water_mark)
    }

    /// Removes the delete-sync cursors of a peer.
    pub(crate) fn reset_delete_water_mark(&self, hashed_device: &str) -> SyncResult<()> {
        let key = delete_key(hashed_device);
        self.storage.delete_meta_data(std::slice::from_ref(&key))?;
        self.deletes.lock().remove(&key);
        Ok(())
    }

    pub(crate) fn query_count(&self) -> usize {
        self.queries.lock().len()
    }
}

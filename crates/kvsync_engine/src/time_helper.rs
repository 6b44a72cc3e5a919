//! Local logical clock.

use crate::error::SyncResult;
use crate::metadata::Metadata;
use kvsync_storage::SyncStorage;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// Wall clock in 100ns units.
pub fn current_system_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_nanos() / 100) as u64)
        .unwrap_or_default()
}

/// Hands out strictly increasing local timestamps.
///
/// A timestamp is the wall clock shifted by the persisted local time offset,
/// but never less than one past the previous timestamp or the store's
/// highest record timestamp.
pub struct TimeHelper {
    metadata: Arc<Metadata>,
    last_time: Mutex<u64>,
}

impl TimeHelper {
    /// Creates a clock seeded from the store's highest timestamp.
    pub fn new(storage: &dyn SyncStorage, metadata: Arc<Metadata>) -> Self {
        let seed = storage.max_timestamp().max(metadata.get_last_local_time());
        Self {
            metadata,
            last_time: Mutex::new(seed),
        }
    }

    /// Returns the next timestamp.
    pub fn get_time(&self) -> u64 {
        let now = shift(current_system_time(), self.metadata.get_local_time_offset());
        let mut last = self.last_time.lock();
        *last = now.max(last.saturating_add(1));
        self.metadata.set_last_local_time(*last);
        *last
    }

    /// Absorbs a system clock jump of `change` (100ns units) into the local
    /// offset so logical time stays continuous.
    pub fn on_time_changed(&self, change: i64) -> SyncResult<()> {
        let offset = self.metadata.get_local_time_offset().saturating_sub(change);
        info!(change, offset, "system time changed");
        self.metadata.save_local_time_offset(offset)
    }
}

/// Applies a signed offset to a timestamp without wrapping.
pub(crate) fn shift(time: u64, offset: i64) -> u64 {
    if offset >= 0 {
        time.saturating_add(offset as u64)
    } else {
        time.saturating_sub(offset.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvsync_storage::MemoryStorage;

    fn helper(storage: Arc<MemoryStorage>) -> (TimeHelper, Arc<Metadata>) {
        let metadata = Arc::new(Metadata::new(storage.clone(), 16));
        metadata.initialize().unwrap();
        (TimeHelper::new(storage.as_ref(), metadata.clone()), metadata)
    }

    #[test]
    fn timestamps_strictly_increase() {
        let (clock, _) = helper(Arc::new(MemoryStorage::new("db")));
        let mut prev = clock.get_time();
        for _ in 0..1000 {
            let next = clock.get_time();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn seeded_above_store_max() {
        let storage = Arc::new(MemoryStorage::new("db"));
        storage.put(b"k", b"v");
        let max = storage.max_timestamp();
        let (clock, _) = helper(storage);
        assert!(clock.get_time() > max);
    }

    #[test]
    fn time_change_adjusts_offset() {
        let (clock, metadata) = helper(Arc::new(MemoryStorage::new("db")));
        clock.on_time_changed(1_000).unwrap();
        assert_eq!(metadata.get_local_time_offset(), -1_000);
        clock.on_time_changed(-400).unwrap();
        assert_eq!(metadata.get_local_time_offset(), -600);
    }

    #[test]
    fn shift_saturates() {
        assert_eq!(shift(10, -20), 0);
        assert_eq!(shift(u64::MAX - 1, 5), u64::MAX);
        assert_eq!(shift(100, 5), 105);
    }
}

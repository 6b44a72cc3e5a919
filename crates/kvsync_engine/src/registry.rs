//! Sync id allocation and shared state tables.

use crate::error::{SyncError, SyncResult};
use crate::state_table::StateTables;
use parking_lot::Mutex;
use std::sync::OnceLock;

const MAX_SYNC_ID: u32 = i32::MAX as u32;

/// Process-level services shared by syncers.
///
/// Holds the sync id counter and the validated state tables. Syncers that
/// should never hand out the same id share one registry.
#[derive(Debug)]
pub struct SyncRegistry {
    next_id: Mutex<u32>,
    tables: OnceLock<SyncResult<StateTables>>,
}

impl SyncRegistry {
    /// Creates a registry whose first id is 1.
    pub fn new() -> Self {
        Self::with_start(1)
    }

    /// Creates a registry whose first id is `start` (clamped into range).
    pub fn with_start(start: u32) -> Self {
        Self {
            next_id: Mutex::new(start.clamp(1, MAX_SYNC_ID)),
            tables: OnceLock::new(),
        }
    }

    /// Allocates the next sync id, wrapping from `i32::MAX` to 1 and
    /// skipping ids for which `in_use` returns true.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Busy`] if every id is in use.
    pub fn next_sync_id(&self, in_use: impl Fn(u32) -> bool) -> SyncResult<u32> {
        let mut next = self.next_id.lock();
        for _ in 0..MAX_SYNC_ID {
            let candidate = *next;
            *next = if candidate >= MAX_SYNC_ID { 1 } else { candidate + 1 };
            if !in_use(candidate) {
                return Ok(candidate);
            }
        }
        Err(SyncError::Busy)
    }

    /// Validated state tables, built on first use.
    pub(crate) fn tables(&self) -> SyncResult<&StateTables> {
        self.tables
            .get_or_init(StateTables::build)
            .as_ref()
            .map_err(Clone::clone)
    }
}

impl Default for SyncRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn ids_increase() {
        let registry = SyncRegistry::new();
        assert_eq!(registry.next_sync_id(|_| false).unwrap(), 1);
        assert_eq!(registry.next_sync_id(|_| false).unwrap(), 2);
    }

    #[test]
    fn ids_wrap_to_one() {
        let registry = SyncRegistry::with_start(MAX_SYNC_ID);
        assert_eq!(registry.next_sync_id(|_| false).unwrap(), MAX_SYNC_ID);
        assert_eq!(registry.next_sync_id(|_| false).unwrap(), 1);
    }

    #[test]
    fn wrap_skips_in_flight_ids() {
        let registry = SyncRegistry::with_start(MAX_SYNC_ID - 1);
        let in_use: HashSet<u32> = [MAX_SYNC_ID, 1, 2].into_iter().collect();
        assert_eq!(registry.next_sync_id(|id| in_use.contains(&id)).unwrap(), MAX_SYNC_ID - 1);
        assert_eq!(registry.next_sync_id(|id| in_use.contains(&id)).unwrap(), 3);
    }

    #[test]
    fn tables_are_built_once() {
        let registry = SyncRegistry::new();
        let first = registry.tables().unwrap() as *const StateTables;
        let second = registry.tables().unwrap() as *const StateTables;
        assert_eq!(first, second);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn allocated_ids_never_collide(start in 1u32..=MAX_SYNC_ID, held in prop::collection::hash_set(1u32..64, 0..16)) {
            let registry = SyncRegistry::with_start(start);
            let mut live: HashSet<u32> = held.clone();
            for _ in 0..32 {
                let id = registry.next_sync_id(|id| live.contains(&id)).unwrap();
                prop_assert!(id >= 1 && id <= MAX_SYNC_ID);
                prop_assert!(live.insert(id));
            }
        }
    }
}

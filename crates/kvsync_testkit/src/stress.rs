//! Concurrent sync stress helpers.
//!
//! Fire many sync requests from several threads at once and tally how the
//! syncer answered them.

use crate::fixtures::TestPeer;
use kvsync_engine::{SyncError, SyncRequest};
use kvsync_protocol::SyncMode;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Configuration for a sync stress run.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Threads issuing requests.
    pub threads: usize,
    /// Requests per thread.
    pub requests_per_thread: usize,
    /// Mode of every request.
    pub mode: SyncMode,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            requests_per_thread: 8,
            mode: SyncMode::Push,
        }
    }
}

/// Tally of a stress run.
#[derive(Debug, Clone, Default)]
pub struct StressResult {
    /// Ids of accepted syncs.
    pub accepted: Vec<u32>,
    /// Requests rejected with [`SyncError::Busy`].
    pub busy: usize,
    /// Requests rejected for any other reason.
    pub failed: usize,
    /// Wall time of the run.
    pub duration: Duration,
}

impl StressResult {
    /// Whether every accepted id is distinct.
    pub fn ids_unique(&self) -> bool {
        let distinct: BTreeSet<u32> = self.accepted.iter().copied().collect();
        distinct.len() == self.accepted.len()
    }
}

/// Issues non-blocking syncs from `peer` to `targets` concurrently.
pub fn concurrent_syncs(peer: &TestPeer, targets: &[&str], config: &StressConfig) -> StressResult {
    let start = Instant::now();
    let targets: Arc<Vec<String>> = Arc::new(targets.iter().map(|t| t.to_string()).collect());
    let handles: Vec<_> = (0..config.threads)
        .map(|_| {
            let syncer = Arc::clone(&peer.syncer);
            let targets = Arc::clone(&targets);
            let config = config.clone();
            thread::spawn(move || {
                let mut result = StressResult::default();
                for _ in 0..config.requests_per_thread {
                    let request = SyncRequest::new(targets.iter().cloned(), config.mode);
                    match syncer.sync(request) {
                        Ok(id) => result.accepted.push(id),
                        Err(SyncError::Busy) => result.busy += 1,
                        Err(_) => result.failed += 1,
                    }
                }
                result
            })
        })
        .collect();

    let mut total = StressResult::default();
    for handle in handles {
        let result = handle.join().expect("stress thread panicked");
        total.accepted.extend(result.accepted);
        total.busy += result.busy;
        total.failed += result.failed;
    }
    total.duration = start.elapsed();
    total
}

//! Clock offset negotiation with a peer.
//!
//! The requester stamps `source_time_begin`, the responder stamps the two
//! target timestamps and the requester stamps `source_time_end` on receipt.
//! The offset (peer clock minus local clock) is the average of the two
//! one-way estimates after removing half the round trip from each.

use crate::error::{SyncError, SyncResult};
use crate::metadata::Metadata;
use crate::runtime::{Runtime, TimerId};
use crate::time_helper::current_system_time;
use kvsync_protocol::TimeSyncPacket;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Deviation (100ns units) beyond which a stored offset is considered stale.
pub(crate) const TIME_SYNC_NOISE_BOUND: u64 = 10_000_000;

/// Computes the peer clock offset from a completed exchange.
pub(crate) fn compute_offset(packet: &TimeSyncPacket) -> SyncResult<i64> {
    if packet.source_time_end < packet.source_time_begin
        || packet.target_time_end < packet.target_time_begin
    {
        return Err(SyncError::inner("time sync timestamps out of order"));
    }
    let source_begin = i128::from(packet.source_time_begin);
    let source_end = i128::from(packet.source_time_end);
    let target_begin = i128::from(packet.target_time_begin);
    let target_end = i128::from(packet.target_time_end);

    let round_trip = (source_end - source_begin) - (target_end - target_begin);
    let offset_request = target_begin - source_begin - round_trip / 2;
    let offset_response = target_end + round_trip / 2 - source_end;
    let offset = offset_request / 2 + offset_response / 2;
    i64::try_from(offset).map_err(|_| SyncError::inner("time offset out of range"))
}

/// Fills the responder's timestamps.
pub(crate) fn respond(request: &TimeSyncPacket, received_at: u64, sent_at: u64) -> TimeSyncPacket {
    TimeSyncPacket {
        target_time_begin: received_at,
        target_time_end: sent_at.max(received_at),
        ..*request
    }
}

/// Per-peer time sync status.
pub(crate) struct TimeSync {
    synced: Arc<AtomicBool>,
    driver: Mutex<Option<TimerId>>,
}

impl TimeSync {
    pub(crate) fn new() -> Self {
        Self {
            synced: Arc::new(AtomicBool::new(false)),
            driver: Mutex::new(None),
        }
    }

    pub(crate) fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    pub(crate) fn invalidate(&self) {
        self.synced.store(false, Ordering::SeqCst);
    }

    /// Whether a fresh negotiation is needed before the next transfer.
    pub(crate) fn needs_sync(&self, metadata: &Metadata, device: &str, interval: Duration) -> bool {
        if !self.is_synced() {
            return true;
        }
        let interval = u64::try_from(interval.as_nanos() / 100).unwrap_or(u64::MAX);
        let last = metadata.get_last_update_time(device);
        current_system_time().saturating_sub(last) >= interval
    }

    /// Persists a negotiated offset and arms the refresh timer.
    pub(crate) fn finish(
        &self,
        metadata: &Metadata,
        runtime: &dyn Runtime,
        device: &str,
        offset: i64,
        interval: Duration,
    ) -> SyncResult<()> {
        metadata.save_time_offset(device, offset)?;
        self.synced.store(true, Ordering::SeqCst);
        info!(device = %crate::communicator::mask_device(device), offset, "time offset negotiated");

        let mut driver = self.driver.lock();
        if driver.is_none() {
            let synced = Arc::clone(&self.synced);
            let id = runtime.set_timer(
                interval,
                Arc::new(move |_| synced.store(false, Ordering::SeqCst)),
                None,
            )?;
            *driver = Some(id);
        }
        Ok(())
    }

    /// Drops the cached offset when the peer's clock reading disagrees with
    /// it by more than [`TIME_SYNC_NOISE_BOUND`].
    pub(crate) fn check_noise(
        &self,
        metadata: &Metadata,
        device: &str,
        request: &TimeSyncPacket,
        received_at: u64,
    ) {
        if !self.is_synced() {
            return;
        }
        let observed = i128::from(request.source_time_begin) - i128::from(received_at);
        let stored = i128::from(metadata.get_time_offset(device));
        if (stored - observed).unsigned_abs() > u128::from(TIME_SYNC_NOISE_BOUND) {
            debug!(
                device = %crate::communicator::mask_device(device),
                "peer clock drifted, time sync required"
            );
            self.invalidate();
        }
    }

    pub(crate) fn stop(&self, runtime: &dyn Runtime) {
        if let Some(id) = self.driver.lock().take() {
            runtime.remove_timer(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ManualRuntime;
    use kvsync_storage::MemoryStorage;

    fn exchange(begin: u64, peer_skew: i64, one_way: u64) -> TimeSyncPacket {
        let mut packet = TimeSyncPacket::request(begin);
        let target_begin = ((begin + one_way) as i64 + peer_skew) as u64;
        packet = respond(&packet, target_begin, target_begin + 50);
        packet.source_time_end = begin + 2 * one_way + 50;
        packet
    }

    #[test]
    fn symmetric_delay_yields_exact_skew() {
        let packet = exchange(1_000_000, 12_346, 400);
        assert_eq!(compute_offset(&packet).unwrap(), 12_346);

        let packet = exchange(5_000_000, -777_000, 1_000);
        assert_eq!(compute_offset(&packet).unwrap(), -777_000);
    }

    #[test]
    fn out_of_order_timestamps_rejected() {
        let mut packet = exchange(1_000, 0, 10);
        packet.source_time_end = 10;
        assert!(compute_offset(&packet).is_err());
    }

    #[test]
    fn finish_persists_and_arms_driver() {
        let storage = Arc::new(MemoryStorage::new("db"));
        let metadata = Metadata::new(storage, 16);
        metadata.initialize().unwrap();
        let runtime = ManualRuntime::new();
        let sync = TimeSync::new();

        assert!(sync.needs_sync(&metadata, "peer", Duration::from_secs(60)));
        sync.finish(&metadata, &runtime, "peer", -42, Duration::from_secs(60))
            .unwrap();
        assert_eq!(metadata.get_time_offset("peer"), -42);
        assert!(!sync.needs_sync(&metadata, "peer", Duration::from_secs(60)));

        let timers = runtime.timers();
        assert_eq!(timers.len(), 1);
        runtime.fire_timer(timers[0]);
        assert!(sync.needs_sync(&metadata, "peer", Duration::from_secs(60)));

        sync.stop(&runtime);
        assert!(runtime.timers().is_empty());
    }

    #[test]
    fn noisy_request_invalidates_offset() {
        let storage = Arc::new(MemoryStorage::new("db"));
        let metadata = Metadata::new(storage, 16);
        metadata.initialize().unwrap();
        let runtime = ManualRuntime::new();
        let sync = TimeSync::new();
        sync.finish(&metadata, &runtime, "peer", 1_000, Duration::from_secs(60))
            .unwrap();

        sync.check_noise(&metadata, "peer", &TimeSyncPacket::request(5_000), 4_000);
        assert!(sync.is_synced());

        let far = 4_000 + TIME_SYNC_NOISE_BOUND * 2;
        sync.check_noise(&metadata, "peer", &TimeSyncPacket::request(far), 4_000);
        assert!(!sync.is_synced());
    }
}

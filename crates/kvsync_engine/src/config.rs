//! Configuration for the syncer.

use std::time::Duration;

/// Default limit on queued non-blocking manual syncs.
pub const QUEUED_SYNC_LIMIT_DEFAULT: u32 = 32;
/// Retries granted to manual syncs marked retryable.
pub const MANUAL_RETRY_TIMES: u32 = 1;
/// Retries granted to auto syncs and subscription commands.
pub const AUTO_RETRY_TIMES: u32 = 3;
/// Re-negotiation rounds before cursors stop being auto-lifted.
pub const NEGOTIATION_LIMIT: u32 = 2;

/// Configuration for a [`crate::GenericSyncer`].
#[derive(Debug, Clone)]
pub struct SyncerConfig {
    /// Maximum outstanding non-blocking manual syncs.
    pub queued_sync_limit: u32,
    /// Retry budget for manual syncs.
    pub manual_retry_times: u32,
    /// Retry budget for auto syncs and subscribe/unsubscribe.
    pub auto_retry_times: u32,
    /// Maximum records per data packet.
    pub batch_size: usize,
    /// Upper bound on how long teardown waits for in-flight callbacks.
    pub kill_wait: Duration,
    /// Cadence of keep-alive ticks and notify packets.
    pub data_notify_interval: Duration,
    /// Maximum notify packets sent during one save or fetch.
    pub max_data_notify_count: u32,
    /// How long a negotiated clock offset stays fresh.
    pub time_sync_interval: Duration,
    /// Re-negotiation rounds before cursors stop being auto-lifted.
    pub negotiation_limit: u32,
    /// Start an auto push when a peer comes online.
    pub auto_sync_on_online: bool,
    /// How long a remote query waits for its answer.
    pub remote_query_timeout: Duration,
    /// Capacity of the per-query watermark table.
    pub query_water_mark_capacity: usize,
}

impl SyncerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            queued_sync_limit: QUEUED_SYNC_LIMIT_DEFAULT,
            manual_retry_times: MANUAL_RETRY_TIMES,
            auto_retry_times: AUTO_RETRY_TIMES,
            batch_size: 128,
            kill_wait: Duration::from_secs(5),
            data_notify_interval: Duration::from_millis(3000),
            max_data_notify_count: 15,
            time_sync_interval: Duration::from_secs(24 * 60 * 60),
            negotiation_limit: NEGOTIATION_LIMIT,
            auto_sync_on_online: false,
            remote_query_timeout: Duration::from_secs(5),
            query_water_mark_capacity: 100_000,
        }
    }

    /// Sets the queued sync limit.
    pub fn with_queued_sync_limit(mut self, limit: u32) -> Self {
        self.queued_sync_limit = limit;
        self
    }

    /// Sets both retry budgets.
    pub fn with_retry_times(mut self, manual: u32, auto: u32) -> Self {
        self.manual_retry_times = manual;
        self.auto_retry_times = auto;
        self
    }

    /// Sets the data batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the teardown wait ceiling.
    pub fn with_kill_wait(mut self, wait: Duration) -> Self {
        self.kill_wait = wait;
        self
    }

    /// Sets the keep-alive cadence.
    pub fn with_data_notify_interval(mut self, interval: Duration) -> Self {
        self.data_notify_interval = interval;
        self
    }

    /// Sets how many keep-alive notifies one slow read may send.
    pub fn with_max_data_notify_count(mut self, count: u32) -> Self {
        self.max_data_notify_count = count;
        self
    }

    /// Sets the clock offset freshness window.
    pub fn with_time_sync_interval(mut self, interval: Duration) -> Self {
        self.time_sync_interval = interval;
        self
    }

    /// Sets the negotiation limit.
    pub fn with_negotiation_limit(mut self, limit: u32) -> Self {
        self.negotiation_limit = limit;
        self
    }

    /// Enables auto push when peers come online.
    pub fn with_auto_sync_on_online(mut self, enabled: bool) -> Self {
        self.auto_sync_on_online = enabled;
        self
    }

    /// Sets the remote query timeout.
    pub fn with_remote_query_timeout(mut self, timeout: Duration) -> Self {
        self.remote_query_timeout = timeout;
        self
    }

    /// Sets the query watermark capacity.
    pub fn with_query_water_mark_capacity(mut self, capacity: usize) -> Self {
        self.query_water_mark_capacity = capacity;
        self
    }

    /// Retry budget for a task.
    pub fn retry_limit(&self, is_auto: bool, is_control: bool) -> u32 {
        if is_auto || is_control {
            self.auto_retry_times
        } else {
            self.manual_retry_times
        }
    }
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Watchdog interval after `retry` consecutive timeouts: `base * 2^retry`.
pub fn backoff_timeout(base: Duration, retry: u32) -> Duration {
    base.saturating_mul(1u32 << retry.min(16))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syncer_config_builder() {
        let config = SyncerConfig::new()
            .with_queued_sync_limit(4)
            .with_retry_times(2, 5)
            .with_batch_size(0)
            .with_auto_sync_on_online(true);

        assert_eq!(config.queued_sync_limit, 4);
        assert_eq!(config.manual_retry_times, 2);
        assert_eq!(config.auto_retry_times, 5);
        assert_eq!(config.batch_size, 1);
        assert!(config.auto_sync_on_online);
    }

    #[test]
    fn defaults() {
        let config = SyncerConfig::default();
        assert_eq!(config.queued_sync_limit, QUEUED_SYNC_LIMIT_DEFAULT);
        assert_eq!(config.kill_wait, Duration::from_secs(5));
        assert_eq!(config.max_data_notify_count, 15);
        assert_eq!(config.retry_limit(true, false), AUTO_RETRY_TIMES);
        assert_eq!(config.retry_limit(false, true), AUTO_RETRY_TIMES);
        assert_eq!(config.retry_limit(false, false), MANUAL_RETRY_TIMES);
    }

    #[test]
    fn backoff_doubles() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_timeout(base, 0), base);
        assert_eq!(backoff_timeout(base, 1), Duration::from_millis(200));
        assert_eq!(backoff_timeout(base, 3), Duration::from_millis(800));
    }
}

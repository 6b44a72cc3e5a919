//! Key-prefix queries answered by a peer's store.

use crate::communicator::{mask_device, Communicator, SendConfig};
use crate::error::{SyncError, SyncResult};
use kvsync_protocol::{AckCode, Message, Packet, RemoteQueryRequest, RemoteQueryResponse};
use kvsync_storage::DataItem;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

struct PendingQuery {
    device: String,
    connection_id: u64,
    result: Option<SyncResult<Vec<DataItem>>>,
}

/// Tracks remote queries waiting for their response.
pub(crate) struct RemoteExecutor {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingQuery>>,
    done: Condvar,
}

impl RemoteExecutor {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            done: Condvar::new(),
        }
    }

    /// Sends a query to `device` and blocks until it is answered, cancelled
    /// or `timeout` elapses.
    pub(crate) fn query(
        self: &Arc<Self>,
        communicator: &dyn Communicator,
        device: &str,
        key_prefix: Vec<u8>,
        connection_id: u64,
        timeout: Duration,
    ) -> SyncResult<Vec<DataItem>> {
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.pending.lock().insert(
            request_id,
            PendingQuery {
                device: device.to_string(),
                connection_id,
                result: None,
            },
        );
        let message = Message::request(
            0,
            0,
            Packet::RemoteQueryRequest(RemoteQueryRequest {
                request_id,
                key_prefix,
            }),
        );
        let executor = Arc::downgrade(self);
        let sent = communicator.send_message(
            device,
            message,
            &SendConfig::new(timeout),
            Some(Box::new(move |error| {
                if let Some(executor) = executor.upgrade() {
                    executor.complete(request_id, Err(error));
                }
            })),
        );
        if let Err(e) = sent {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        let deadline = Instant::now() + timeout;
        let mut pending = self.pending.lock();
        loop {
            match pending.get_mut(&request_id) {
                None => return Err(SyncError::Cancelled),
                Some(entry) => {
                    if let Some(result) = entry.result.take() {
                        pending.remove(&request_id);
                        return result;
                    }
                }
            }
            if self.done.wait_until(&mut pending, deadline).timed_out() {
                pending.remove(&request_id);
                info!(device = %mask_device(device), request_id, "remote query timed out");
                return Err(SyncError::Timeout);
            }
        }
    }

    /// Delivers a peer's response.
    pub(crate) fn on_response(&self, response: RemoteQueryResponse) {
        let result = if response.code == AckCode::Ok {
            Ok(response.items)
        } else {
            Err(SyncError::from_ack(response.code))
        };
        self.complete(response.request_id, result);
    }

    fn complete(&self, request_id: u64, result: SyncResult<Vec<DataItem>>) {
        let mut pending = self.pending.lock();
        match pending.get_mut(&request_id) {
            Some(entry) if entry.result.is_none() => {
                entry.result = Some(result);
                self.done.notify_all();
            }
            _ => debug!(request_id, "late remote query response dropped"),
        }
    }

    fn fail_where(&self, error: SyncError, matches: impl Fn(&PendingQuery) -> bool) {
        let mut pending = self.pending.lock();
        let mut failed = false;
        for entry in pending.values_mut().filter(|entry| entry.result.is_none()) {
            if matches(entry) {
                entry.result = Some(Err(error.clone()));
                failed = true;
            }
        }
        if failed {
            self.done.notify_all();
        }
    }

    pub(crate) fn cancel_connection(&self, connection_id: u64) {
        self.fail_where(SyncError::Cancelled, |entry| entry.connection_id == connection_id);
    }

    pub(crate) fn cancel_device(&self, device: &str) {
        self.fail_where(SyncError::CommunicationAbnormal, |entry| entry.device == device);
    }

    pub(crate) fn cancel_all(&self) {
        self.fail_where(SyncError::Cancelled, |_| true);
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

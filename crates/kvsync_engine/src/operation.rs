//! Sync operations and their per-device status.

use crate::error::SyncError;
use crate::runtime::Runtime;
use kvsync_protocol::{QuerySpec, SyncMode};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-device progress of a sync operation.
///
/// Variants are ordered: everything from [`OperationStatus::FinishedAll`]
/// onwards is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperationStatus {
    /// Queued, not started.
    Waiting,
    /// Running.
    Syncing,
    /// The send half finished; the receive half is still running.
    SendFinished,
    /// The receive half finished; the send half is still running.
    RecvFinished,
    /// Both halves finished.
    FinishedAll,
    /// Generic failure.
    Failed,
    /// The peer stopped answering.
    Timeout,
    /// The permission hook refused the sync.
    PermissionCheckFailed,
    /// The peer could not be reached.
    CommAbnormal,
    /// Security labels differ.
    SecurityOptionCheckFailure,
    /// The store's key was revoked while syncing.
    EKeyRevokedFailure,
    /// The peer was busy.
    BusyFailure,
    /// Schemas cannot be synced.
    SchemaIncompatible,
    /// The local user changed while syncing.
    UserChanged,
    /// The peer does not support the requested mode.
    NotSupport,
}

impl OperationStatus {
    /// Returns true once no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        *self >= OperationStatus::FinishedAll
    }

    /// Returns true for the single success status.
    pub fn is_success(&self) -> bool {
        matches!(self, OperationStatus::FinishedAll)
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationStatus::Waiting => "OP_WAITING",
            OperationStatus::Syncing => "OP_SYNCING",
            OperationStatus::SendFinished => "OP_SEND_FINISHED",
            OperationStatus::RecvFinished => "OP_RECV_FINISHED",
            OperationStatus::FinishedAll => "OP_FINISHED_ALL",
            OperationStatus::Failed => "OP_FAILED",
            OperationStatus::Timeout => "OP_TIMEOUT",
            OperationStatus::PermissionCheckFailed => "OP_PERMISSION_CHECK_FAILED",
            OperationStatus::CommAbnormal => "OP_COMM_ABNORMAL",
            OperationStatus::SecurityOptionCheckFailure => "OP_SECURITY_OPTION_CHECK_FAILURE",
            OperationStatus::EKeyRevokedFailure => "OP_EKEYREVOKED_FAILURE",
            OperationStatus::BusyFailure => "OP_BUSY_FAILURE",
            OperationStatus::SchemaIncompatible => "OP_SCHEMA_INCOMPATIBLE",
            OperationStatus::UserChanged => "OP_USER_CHANGED",
            OperationStatus::NotSupport => "OP_NOT_SUPPORT",
        };
        f.write_str(name)
    }
}

/// Receives the final status of every device.
pub type CompletionCallback = Box<dyn FnOnce(&BTreeMap<String, OperationStatus>) + Send>;

/// Runs when the operation is released.
pub type FinalizeCallback = Box<dyn FnOnce() + Send>;

pub(crate) type FinishedHook = Box<dyn FnOnce(u32) + Send>;

#[derive(Default)]
struct WaitState {
    permits: usize,
    done: bool,
    released: bool,
}

/// One sync request across a set of devices.
///
/// # Invariants
///
/// - A device's status only moves towards a terminal status
/// - The completion callback runs at most once, after every device is
///   terminal
/// - After [`SyncOperation::kill`] no status changes and no callback runs
pub struct SyncOperation {
    id: u32,
    devices: Vec<String>,
    mode: SyncMode,
    is_auto: bool,
    is_blocking: bool,
    query: Option<QuerySpec>,
    statuses: Mutex<BTreeMap<String, OperationStatus>>,
    on_complete: Mutex<Option<CompletionCallback>>,
    on_finished: Mutex<Option<FinishedHook>>,
    on_finalize: Mutex<Option<FinalizeCallback>>,
    killed: AtomicBool,
    finish_scheduled: AtomicBool,
    finish_ran: AtomicBool,
    wait: Mutex<WaitState>,
    cond: Condvar,
}

impl SyncOperation {
    /// Creates an operation with every device in [`OperationStatus::Waiting`].
    /// Duplicate devices are collapsed.
    pub fn new(
        id: u32,
        devices: Vec<String>,
        mode: SyncMode,
        is_auto: bool,
        is_blocking: bool,
        query: Option<QuerySpec>,
    ) -> Self {
        let mut unique = Vec::with_capacity(devices.len());
        for device in devices {
            if !unique.contains(&device) {
                unique.push(device);
            }
        }
        let statuses = unique
            .iter()
            .map(|d| (d.clone(), OperationStatus::Waiting))
            .collect();
        Self {
            id,
            devices: unique,
            mode,
            is_auto,
            is_blocking,
            query,
            statuses: Mutex::new(statuses),
            on_complete: Mutex::new(None),
            on_finished: Mutex::new(None),
            on_finalize: Mutex::new(None),
            killed: AtomicBool::new(false),
            finish_scheduled: AtomicBool::new(false),
            finish_ran: AtomicBool::new(false),
            wait: Mutex::new(WaitState::default()),
            cond: Condvar::new(),
        }
    }

    /// Sets the callback receiving the final statuses.
    pub fn set_on_complete(&self, callback: CompletionCallback) {
        *self.on_complete.lock() = Some(callback);
    }

    /// Sets the callback run when the operation is released.
    pub fn set_on_finalize(&self, callback: FinalizeCallback) {
        *self.on_finalize.lock() = Some(callback);
    }

    pub(crate) fn set_on_finished(&self, hook: FinishedHook) {
        *self.on_finished.lock() = Some(hook);
    }

    /// Sync id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Target devices.
    pub fn devices(&self) -> &[String] {
        &self.devices
    }

    /// Sync mode.
    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Whether the engine started this operation on its own.
    pub fn is_auto(&self) -> bool {
        self.is_auto
    }

    /// Whether the requester blocks until completion.
    pub fn is_blocking(&self) -> bool {
        self.is_blocking
    }

    /// Query restriction.
    pub fn query(&self) -> Option<&QuerySpec> {
        self.query.as_ref()
    }

    /// Current status of a device.
    pub fn status(&self, device: &str) -> Option<OperationStatus> {
        self.statuses.lock().get(device).copied()
    }

    /// Snapshot of every device status.
    pub fn statuses(&self) -> BTreeMap<String, OperationStatus> {
        self.statuses.lock().clone()
    }

    /// Updates a device status.
    ///
    /// Returns true exactly once: on the update that made every device
    /// terminal. The caller is then responsible for running
    /// [`SyncOperation::finished`].
    pub fn set_status(&self, device: &str, status: OperationStatus) -> bool {
        self.set_status_with_cause(device, status, None)
    }

    /// Like [`SyncOperation::set_status`], recording the error that caused it.
    ///
    /// A device reaching both [`OperationStatus::SendFinished`] and
    /// [`OperationStatus::RecvFinished`] is promoted to
    /// [`OperationStatus::FinishedAll`], or to
    /// [`OperationStatus::EKeyRevokedFailure`] if `cause` is a revoked key.
    pub fn set_status_with_cause(
        &self,
        device: &str,
        status: OperationStatus,
        cause: Option<&SyncError>,
    ) -> bool {
        if self.is_killed() {
            return false;
        }
        let mut statuses = self.statuses.lock();
        let Some(current) = statuses.get_mut(device) else {
            return false;
        };
        if current.is_terminal() {
            return false;
        }
        let next = match (*current, status) {
            (OperationStatus::SendFinished, OperationStatus::RecvFinished)
            | (OperationStatus::RecvFinished, OperationStatus::SendFinished) => {
                if cause.is_some_and(SyncError::is_key_revoked) {
                    OperationStatus::EKeyRevokedFailure
                } else {
                    OperationStatus::FinishedAll
                }
            }
            _ => status,
        };
        if !next.is_terminal() && next <= *current {
            return false;
        }
        debug!(sync_id = self.id, from = %current, to = %next, "operation status changed");
        *current = next;

        if next.is_terminal() {
            self.wait.lock().permits += 1;
            self.cond.notify_all();
        }
        statuses.values().all(OperationStatus::is_terminal)
            && !self.finish_scheduled.swap(true, Ordering::SeqCst)
    }

    /// Returns true once every device is terminal.
    pub fn check_is_all_finished(&self) -> bool {
        self.statuses
            .lock()
            .values()
            .all(OperationStatus::is_terminal)
    }

    /// Runs the completion callback, the syncer's removal hook and the
    /// finalizer, then releases waiters. Only the first call has an effect.
    pub fn finished(&self) {
        if self.finish_ran.swap(true, Ordering::SeqCst) {
            return;
        }
        self.finish_scheduled.store(true, Ordering::SeqCst);
        let statuses = self.statuses();
        if let Some(callback) = self.on_complete.lock().take() {
            if !self.is_killed() {
                callback(&statuses);
            }
        }
        if let Some(hook) = self.on_finished.lock().take() {
            hook(self.id);
        }
        if let Some(finalize) = self.on_finalize.lock().take() {
            finalize();
        }
        self.wait.lock().done = true;
        self.cond.notify_all();
    }

    /// Blocks a blocking operation until it has finished or been released.
    pub fn wait_if_need(&self) {
        if !self.is_blocking {
            return;
        }
        let mut wait = self.wait.lock();
        while !(wait.released || (wait.done && wait.permits >= self.devices.len())) {
            self.cond.wait(&mut wait);
        }
    }

    /// Releases a blocked waiter without waiting for completion.
    pub fn notify_if_need(&self) {
        if !self.is_blocking {
            return;
        }
        self.wait.lock().released = true;
        self.cond.notify_all();
    }

    /// Stops the operation: statuses freeze, callbacks are dropped and
    /// waiters are released.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.on_complete.lock().take();
        let mut wait = self.wait.lock();
        wait.released = true;
        self.cond.notify_all();
    }

    /// Whether [`SyncOperation::kill`] was called.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Whether [`SyncOperation::finished`] has run.
    pub fn is_finished(&self) -> bool {
        self.wait.lock().done
    }
}

impl Drop for SyncOperation {
    fn drop(&mut self) {
        if let Some(finalize) = self.on_finalize.get_mut().take() {
            finalize();
        }
    }
}

impl std::fmt::Debug for SyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOperation")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("is_auto", &self.is_auto)
            .field("statuses", &self.statuses())
            .finish()
    }
}

/// Updates a device status and, if that finished the operation, schedules
/// its completion on the runtime.
pub(crate) fn report_status(
    operation: &Arc<SyncOperation>,
    runtime: &dyn Runtime,
    device: &str,
    status: OperationStatus,
    cause: Option<&SyncError>,
) {
    if !operation.set_status_with_cause(device, status, cause) {
        return;
    }
    let op = Arc::clone(operation);
    if let Err(e) = runtime.schedule_task(Box::new(move || op.finished())) {
        warn!(sync_id = operation.id(), error = %e, "completion not scheduled, running inline");
        operation.finished();
    }
}

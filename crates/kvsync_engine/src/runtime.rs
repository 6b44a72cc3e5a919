//! Deferred-task and timer services consumed by the engine.
//!
//! The engine never spawns threads itself. Every callback (message
//! delivery, timer expiry, completion notification) is handed to a
//! [`Runtime`], which decides where it runs. Two implementations ship with
//! the crate:
//!
//! - [`TokioRuntime`] runs tasks on tokio's blocking pool and drives timers
//!   with tokio tasks
//! - [`ManualRuntime`] queues everything until the caller pumps it, which
//!   makes timer-driven behavior deterministic in tests

use crate::error::{SyncError, SyncResult};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Identifier of an armed timer.
pub type TimerId = u64;

/// Identifier of a registered time-change listener.
pub type ListenerId = u64;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send>;

/// Called each time a timer fires.
pub type TimerAction = Arc<dyn Fn(TimerId) + Send + Sync>;

/// Called once after a timer has been removed.
pub type TimerFinalizer = Box<dyn FnOnce() + Send>;

/// Decides whether a sync direction is allowed for a device.
pub type PermissionCheck = Arc<dyn Fn(&str, PermissionFlags) -> bool + Send + Sync>;

/// Receives the system clock change in 100ns units.
pub type TimeChangeListener = Arc<dyn Fn(i64) + Send + Sync>;

const MIN_TIMER_INTERVAL: Duration = Duration::from_millis(1);

/// Direction flags passed to the permission hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PermissionFlags(u8);

impl PermissionFlags {
    /// Local data leaves the store.
    pub const SEND: Self = Self(0b0001);
    /// Remote data enters the store.
    pub const RECEIVE: Self = Self(0b0010);
    /// The sync was started automatically.
    pub const AUTO_SYNC: Self = Self(0b0100);
    /// This side initiated the sync.
    pub const SPONSOR: Self = Self(0b1000);

    /// No flags.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Whether all flags in `other` are set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PermissionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Permission hook and time-change listeners shared by runtime implementations.
#[derive(Default)]
pub struct RuntimeHooks {
    permission: RwLock<Option<PermissionCheck>>,
    listeners: Mutex<BTreeMap<ListenerId, TimeChangeListener>>,
    next_listener: AtomicU64,
}

impl RuntimeHooks {
    /// Installs the permission hook. Without one every check passes.
    pub fn set_permission_check(&self, check: Option<PermissionCheck>) {
        *self.permission.write() = check;
    }

    /// Runs the permission hook.
    pub fn check_permission(&self, device: &str, flags: PermissionFlags) -> bool {
        match self.permission.read().as_ref() {
            Some(check) => check(device, flags),
            None => true,
        }
    }

    /// Registers a time-change listener.
    pub fn add_listener(&self, listener: TimeChangeListener) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst) + 1;
        self.listeners.lock().insert(id, listener);
        id
    }

    /// Removes a time-change listener.
    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.lock().remove(&id);
    }

    /// Reports a system clock change to every listener.
    pub fn notify_time_changed(&self, change: i64) {
        let listeners: Vec<_> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(change);
        }
    }
}

/// Process-wide runtime services.
///
/// # Invariants
///
/// - Tasks and timer actions never run on the caller's stack
/// - A removed timer never fires again, and its finalizer runs exactly once
/// - Timers are periodic until removed
pub trait Runtime: Send + Sync {
    /// Runs `task` later on a worker.
    fn schedule_task(&self, task: Task) -> SyncResult<()>;

    /// Arms a periodic timer.
    fn set_timer(
        &self,
        interval: Duration,
        action: TimerAction,
        finalizer: Option<TimerFinalizer>,
    ) -> SyncResult<TimerId>;

    /// Changes the period of an armed timer and restarts its countdown.
    fn modify_timer(&self, id: TimerId, interval: Duration) -> SyncResult<()>;

    /// Disarms a timer. Unknown ids are ignored.
    fn remove_timer(&self, id: TimerId);

    /// Permission hook and time-change listeners.
    fn hooks(&self) -> &RuntimeHooks;

    /// Checks whether the directions in `flags` are allowed for `device`.
    fn check_permission(&self, device: &str, flags: PermissionFlags) -> bool {
        self.hooks().check_permission(device, flags)
    }

    /// Subscribes to system clock changes.
    fn register_time_change_listener(&self, listener: TimeChangeListener) -> ListenerId {
        self.hooks().add_listener(listener)
    }

    /// Unsubscribes from system clock changes.
    fn unregister_time_change_listener(&self, id: ListenerId) {
        self.hooks().remove_listener(id);
    }
}

struct TimerSlot {
    interval: watch::Sender<Duration>,
    task: JoinHandle<()>,
    finalizer: Option<TimerFinalizer>,
}

/// A [`Runtime`] backed by tokio.
///
/// Tasks run on the blocking pool because engine callbacks take locks and
/// may block on storage. Each timer is a tokio task sleeping on its period;
/// the action itself also runs on the blocking pool, so ticks of one timer
/// never overlap.
pub struct TokioRuntime {
    handle: Handle,
    owned: Mutex<Option<tokio::runtime::Runtime>>,
    timers: Mutex<HashMap<TimerId, TimerSlot>>,
    next_timer: AtomicU64,
    hooks: RuntimeHooks,
}

impl TokioRuntime {
    /// Creates a runtime that owns a multi-threaded tokio runtime.
    pub fn new() -> SyncResult<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("kvsync-runtime")
            .build()
            .map_err(|e| SyncError::inner(format!("failed to start tokio runtime: {e}")))?;
        let handle = rt.handle().clone();
        Ok(Self::build(handle, Some(rt)))
    }

    /// Creates a runtime on an existing tokio handle.
    pub fn with_handle(handle: Handle) -> Self {
        Self::build(handle, None)
    }

    /// Creates a runtime on the ambient tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotInitialized`] outside a tokio context.
    pub fn current() -> SyncResult<Self> {
        Handle::try_current()
            .map(Self::with_handle)
            .map_err(|_| SyncError::NotInitialized)
    }

    fn build(handle: Handle, owned: Option<tokio::runtime::Runtime>) -> Self {
        Self {
            handle,
            owned: Mutex::new(owned),
            timers: Mutex::new(HashMap::new()),
            next_timer: AtomicU64::new(1),
            hooks: RuntimeHooks::default(),
        }
    }

    /// Number of armed timers.
    pub fn active_timers(&self) -> usize {
        self.timers.lock().len()
    }
}

impl Runtime for TokioRuntime {
    fn schedule_task(&self, task: Task) -> SyncResult<()> {
        drop(self.handle.spawn_blocking(task));
        Ok(())
    }

    fn set_timer(
        &self,
        interval: Duration,
        action: TimerAction,
        finalizer: Option<TimerFinalizer>,
    ) -> SyncResult<TimerId> {
        let id = self.next_timer.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = watch::channel(interval.max(MIN_TIMER_INTERVAL));
        let task = self.handle.spawn(async move {
            loop {
                let period = *rx.borrow_and_update();
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        let action = Arc::clone(&action);
                        if tokio::task::spawn_blocking(move || action(id)).await.is_err() {
                            break;
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        self.timers.lock().insert(
            id,
            TimerSlot {
                interval: tx,
                task,
                finalizer,
            },
        );
        Ok(id)
    }

    fn modify_timer(&self, id: TimerId, interval: Duration) -> SyncResult<()> {
        let timers = self.timers.lock();
        let slot = timers
            .get(&id)
            .ok_or_else(|| SyncError::invalid_args(format!("unknown timer {id}")))?;
        slot.interval.send_replace(interval.max(MIN_TIMER_INTERVAL));
        Ok(())
    }

    fn remove_timer(&self, id: TimerId) {
        let Some(slot) = self.timers.lock().remove(&id) else {
            return;
        };
        slot.task.abort();
        if let Some(finalizer) = slot.finalizer {
            if let Err(e) = self.schedule_task(finalizer) {
                warn!(timer = id, error = %e, "failed to schedule timer finalizer");
            }
        }
    }

    fn hooks(&self) -> &RuntimeHooks {
        &self.hooks
    }
}

impl Drop for TokioRuntime {
    fn drop(&mut self) {
        for (_, slot) in self.timers.lock().drain() {
            slot.task.abort();
        }
        if let Some(rt) = self.owned.lock().take() {
            rt.shutdown_background();
        }
    }
}

struct ManualTimer {
    interval: Duration,
    action: TimerAction,
    finalizer: Option<TimerFinalizer>,
}

/// A [`Runtime`] that only makes progress when pumped.
///
/// Scheduled tasks are queued until [`ManualRuntime::run_pending`]; timers
/// fire only through [`ManualRuntime::fire_timer`]. Intervals are recorded
/// so tests can observe backoff without waiting for it.
#[derive(Default)]
pub struct ManualRuntime {
    tasks: Mutex<VecDeque<Task>>,
    timers: Mutex<BTreeMap<TimerId, ManualTimer>>,
    next_timer: AtomicU64,
    hooks: RuntimeHooks,
}

impl ManualRuntime {
    /// Creates an idle runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs queued tasks, including tasks they schedule, until none remain.
    /// Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.tasks.lock().pop_front();
            match next {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Number of queued tasks.
    pub fn pending_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Fires a timer once. Returns false if it is not armed.
    pub fn fire_timer(&self, id: TimerId) -> bool {
        let action = match self.timers.lock().get(&id) {
            Some(timer) => Arc::clone(&timer.action),
            None => return false,
        };
        debug!(timer = id, "firing manual timer");
        action(id);
        true
    }

    /// Current period of a timer.
    pub fn timer_interval(&self, id: TimerId) -> Option<Duration> {
        self.timers.lock().get(&id).map(|timer| timer.interval)
    }

    /// Ids of all armed timers, oldest first.
    pub fn timers(&self) -> Vec<TimerId> {
        self.timers.lock().keys().copied().collect()
    }
}

impl Runtime for ManualRuntime {
    fn schedule_task(&self, task: Task) -> SyncResult<()> {
        self.tasks.lock().push_back(task);
        Ok(())
    }

    fn set_timer(
        &self,
        interval: Duration,
        action: TimerAction,
        finalizer: Option<TimerFinalizer>,
    ) -> SyncResult<TimerId> {
        let id = self.next_timer.fetch_add(1, Ordering::SeqCst) + 1;
        self.timers.lock().insert(
            id,
            ManualTimer {
                interval,
                action,
                finalizer,
            },
        );
        Ok(id)
    }

    fn modify_timer(&self, id: TimerId, interval: Duration) -> SyncResult<()> {
        let mut timers = self.timers.lock();
        let timer = timers
            .get_mut(&id)
            .ok_or_else(|| SyncError::invalid_args(format!("unknown timer {id}")))?;
        timer.interval = interval;
        Ok(())
    }

    fn remove_timer(&self, id: TimerId) {
        let removed = self.timers.lock().remove(&id);
        if let Some(finalizer) = removed.and_then(|timer| timer.finalizer) {
            self.tasks.lock().push_back(finalizer);
        }
    }

    fn hooks(&self) -> &RuntimeHooks {
        &self.hooks
    }
}

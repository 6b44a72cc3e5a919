//! Per-peer task queue, dispatch path and timers.
//!
//! Every input for a peer (a queued target, an inbound message, a timer
//! expiry, a transport error, an abort) is posted to the context's inbox
//! and handled by a single drain loop on the runtime. Handling is therefore
//! serialized per peer and decided in one place, while different peers run
//! in parallel.

use crate::ability_sync::AbilityState;
use crate::communicator::{mask_device, SendConfig, SendErrorHandler};
use crate::engine::EngineShared;
use crate::error::{SyncError, SyncResult};
use crate::operation::{report_status, OperationStatus, SyncOperation};
use crate::runtime::{PermissionFlags, TimerId};
use crate::state_table::SyncState;
use crate::time_helper::current_system_time;
use crate::time_sync::TimeSync;
use kvsync_protocol::{Message, MessageId, Packet, QuerySpec, SyncMode};
use parking_lot::{Condvar, Mutex};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Work queued on a peer.
pub(crate) enum SyncTarget {
    /// A task started locally.
    Request {
        /// Operation the task reports to.
        operation: Arc<SyncOperation>,
    },
    /// Data the peer pulled, sent back on the peer's session.
    Response {
        /// Session of the peer's pull.
        session_id: u32,
        /// Peer's receive cursor.
        begin: u64,
        /// Query restriction of the pull.
        query: Option<QuerySpec>,
    },
}

impl SyncTarget {
    pub(crate) fn mode(&self) -> SyncMode {
        match self {
            SyncTarget::Request { operation } => operation.mode(),
            SyncTarget::Response { .. } => SyncMode::ResponsePull,
        }
    }

    fn is_auto(&self) -> bool {
        matches!(self, SyncTarget::Request { operation } if operation.is_auto())
    }

    fn permission_flags(&self) -> PermissionFlags {
        let direction = match self.mode() {
            SyncMode::Push | SyncMode::ResponsePull => PermissionFlags::SEND,
            SyncMode::Pull => PermissionFlags::RECEIVE,
            SyncMode::PushAndPull => PermissionFlags::SEND | PermissionFlags::RECEIVE,
            SyncMode::SubscribeQuery | SyncMode::UnsubscribeQuery => PermissionFlags::SEND,
        };
        let mut flags = direction;
        if self.is_auto() {
            flags = flags | PermissionFlags::AUTO_SYNC;
        }
        if matches!(self, SyncTarget::Request { .. }) {
            flags = flags | PermissionFlags::SPONSOR;
        }
        flags
    }
}

/// Everything the drain loop reacts to.
pub(crate) enum MachineInput {
    TaskAdded,
    Message(Message),
    Timeout(TimerId),
    CommError { session_id: u32, error: SyncError },
    Abort { sync_id: u32 },
    Offline,
}

#[derive(Default)]
struct TargetQueues {
    requests: VecDeque<SyncTarget>,
    responses: VecDeque<SyncTarget>,
}

#[derive(Default)]
struct Inbox {
    pending: VecDeque<MachineInput>,
    draining: bool,
}

/// The packet a task is waiting to have acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outstanding {
    Batch {
        end_watermark: u64,
        last: bool,
        tombstones: bool,
        feed_dog: bool,
    },
    PullRequest,
}

/// Progress of the data phase of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DataTransfer {
    pub(crate) cursor: u64,
    pub(crate) end: u64,
    pub(crate) outstanding: Option<Outstanding>,
}

/// Mutable state of the running task.
pub(crate) struct TaskState {
    pub(crate) machine: SyncState,
    pub(crate) operation: Option<Arc<SyncOperation>>,
    pub(crate) mode: SyncMode,
    pub(crate) query: Option<QuerySpec>,
    pub(crate) is_auto: bool,
    pub(crate) session_id: u32,
    pub(crate) last_session_id: u32,
    pub(crate) sequence_id: u32,
    pub(crate) response_begin: u64,
    pub(crate) retry_count: u32,
    pub(crate) timer_id: Option<TimerId>,
    pub(crate) negotiation_count: u32,
    pub(crate) transfer: Option<DataTransfer>,
    pub(crate) failure: Option<(OperationStatus, Option<SyncError>)>,
}

impl TaskState {
    fn new() -> Self {
        Self {
            machine: SyncState::Idle,
            operation: None,
            mode: SyncMode::Push,
            query: None,
            is_auto: false,
            session_id: 0,
            last_session_id: 0,
            sequence_id: 0,
            response_begin: 0,
            retry_count: 0,
            timer_id: None,
            negotiation_count: 0,
            transfer: None,
            failure: None,
        }
    }

    /// Resets per-task fields, remembering the finished session.
    pub(crate) fn clear(&mut self) {
        self.last_session_id = self.session_id;
        self.operation = None;
        self.mode = SyncMode::Push;
        self.query = None;
        self.is_auto = false;
        self.session_id = 0;
        self.sequence_id = 0;
        self.response_begin = 0;
        self.retry_count = 0;
        self.negotiation_count = 0;
        self.transfer = None;
        self.failure = None;
    }
}

/// Keep-alive direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FeedDogDirection {
    Send = 0,
    Receive = 1,
}

#[derive(Default)]
struct FeedDog {
    refs: u32,
    timer: Option<TimerId>,
}

/// Execution context of one peer.
pub(crate) struct SyncTaskContext {
    pub(crate) device: String,
    pub(crate) shared: Arc<EngineShared>,
    weak_self: Weak<SyncTaskContext>,
    queues: Mutex<TargetQueues>,
    pub(crate) state: Mutex<TaskState>,
    inbox: Mutex<Inbox>,
    in_flight: Mutex<usize>,
    idle: Condvar,
    killed: AtomicBool,
    comm_normal: AtomicBool,
    pub(crate) ability: Mutex<AbilityState>,
    pub(crate) time_sync: TimeSync,
    feed_dogs: Mutex<[FeedDog; 2]>,
}

impl SyncTaskContext {
    pub(crate) fn new(device: impl Into<String>, shared: Arc<EngineShared>) -> Arc<Self> {
        let device = device.into();
        Arc::new_cyclic(|weak_self| Self {
            device,
            shared,
            weak_self: weak_self.clone(),
            queues: Mutex::new(TargetQueues::default()),
            state: Mutex::new(TaskState::new()),
            inbox: Mutex::new(Inbox::default()),
            in_flight: Mutex::new(0),
            idle: Condvar::new(),
            killed: AtomicBool::new(false),
            comm_normal: AtomicBool::new(true),
            ability: Mutex::new(AbilityState::default()),
            time_sync: TimeSync::new(),
            feed_dogs: Mutex::new([FeedDog::default(), FeedDog::default()]),
        })
    }

    pub(crate) fn masked(&self) -> String {
        mask_device(&self.device)
    }

    pub(crate) fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_comm_normal(&self, normal: bool) {
        self.comm_normal.store(normal, Ordering::SeqCst);
    }

    /// Queues a target and wakes the drain loop.
    ///
    /// A new request for the same mode as a running auto task, or for
    /// push-and-pull, cancels that task's remaining retries so the request
    /// does not wait out the backoff.
    pub(crate) fn add_sync_target(&self, target: SyncTarget) {
        let incoming_mode = target.mode();
        let is_request = matches!(target, SyncTarget::Request { .. });
        {
            let mut queues = self.queues.lock();
            match target {
                SyncTarget::Request { .. } => queues.requests.push_back(target),
                SyncTarget::Response { .. } => queues.responses.push_back(target),
            }
        }
        if is_request {
            self.cancel_retry_if_superseded(incoming_mode);
        }
        self.post(MachineInput::TaskAdded);
    }

    fn cancel_retry_if_superseded(&self, incoming_mode: SyncMode) {
        let superseded = {
            let mut state = self.state.lock();
            let covers =
                incoming_mode == state.mode || incoming_mode == SyncMode::PushAndPull;
            if state.is_auto && state.machine.is_working() && covers {
                state.retry_count = self.shared.config.auto_retry_times;
                state.timer_id
            } else {
                None
            }
        };
        if let Some(timer) = superseded {
            if let Err(e) = self.shared.runtime.modify_timer(timer, self.base_timeout()) {
                debug!(device = %self.masked(), error = %e, "watchdog already gone");
            }
        }
    }

    /// Pops the next runnable target, requests first.
    ///
    /// Targets of killed operations are dropped; targets refused by the
    /// permission hook fail their operation and are skipped.
    pub(crate) fn get_next_target(&self) -> Option<SyncTarget> {
        loop {
            let target = {
                let mut queues = self.queues.lock();
                queues
                    .requests
                    .pop_front()
                    .or_else(|| queues.responses.pop_front())
            }?;
            if let SyncTarget::Request { operation } = &target {
                if operation.is_killed() {
                    continue;
                }
            }
            if self
                .shared
                .runtime
                .check_permission(&self.device, target.permission_flags())
            {
                return Some(target);
            }
            warn!(device = %self.masked(), mode = %target.mode(), "permission check failed");
            if let SyncTarget::Request { operation } = &target {
                report_status(
                    operation,
                    self.shared.runtime.as_ref(),
                    &self.device,
                    OperationStatus::PermissionCheckFailed,
                    Some(&SyncError::PermissionDenied),
                );
            }
        }
    }

    /// Fails every queued request with `status` and drops queued responses.
    pub(crate) fn fail_queued(&self, status: OperationStatus) {
        let requests: Vec<SyncTarget> = {
            let mut queues = self.queues.lock();
            queues.responses.clear();
            queues.requests.drain(..).collect()
        };
        for target in requests {
            if let SyncTarget::Request { operation } = target {
                report_status(
                    &operation,
                    self.shared.runtime.as_ref(),
                    &self.device,
                    status,
                    None,
                );
            }
        }
    }

    pub(crate) fn queued(&self) -> (usize, usize) {
        let queues = self.queues.lock();
        (queues.requests.len(), queues.responses.len())
    }

    /// Session id for a new task: derived from device, sync id and time,
    /// never 0 and never equal to the previous session.
    pub(crate) fn generate_session_id(&self, sync_id: u32, last_session_id: u32) -> u32 {
        let mut hasher = Sha256::new();
        hasher.update(self.device.as_bytes());
        hasher.update(sync_id.to_le_bytes());
        hasher.update(current_system_time().to_le_bytes());
        let digest = hasher.finalize();
        let mut id = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
        while id == 0 || id == last_session_id {
            id = id.wrapping_add(1);
        }
        id
    }

    /// Hands an input to the drain loop.
    pub(crate) fn post(&self, input: MachineInput) {
        if self.is_killed() {
            return;
        }
        let start = {
            let mut inbox = self.inbox.lock();
            inbox.pending.push_back(input);
            !std::mem::replace(&mut inbox.draining, true)
        };
        if !start {
            return;
        }
        let Some(ctx) = self.weak_self.upgrade() else {
            self.inbox.lock().draining = false;
            return;
        };
        *self.in_flight.lock() += 1;
        let scheduled = self.shared.runtime.schedule_task(Box::new(move || {
            ctx.drain_inbox();
            ctx.release_in_flight();
        }));
        if let Err(e) = scheduled {
            warn!(device = %self.masked(), error = %e, "failed to schedule dispatch");
            let mut inbox = self.inbox.lock();
            inbox.pending.clear();
            inbox.draining = false;
            drop(inbox);
            self.release_in_flight();
        }
    }

    fn drain_inbox(&self) {
        loop {
            let input = {
                let mut inbox = self.inbox.lock();
                match inbox.pending.pop_front() {
                    Some(input) => input,
                    None => {
                        inbox.draining = false;
                        return;
                    }
                }
            };
            if self.is_killed() {
                continue;
            }
            self.dispatch(input);
        }
    }

    fn release_in_flight(&self) {
        let mut in_flight = self.in_flight.lock();
        *in_flight = in_flight.saturating_sub(1);
        if *in_flight == 0 {
            self.idle.notify_all();
        }
    }

    /// Stops the context: no further input is handled, the running task and
    /// queued requests fail, and the caller waits (up to `wait`) for a
    /// dispatch already in progress to return.
    pub(crate) fn kill_wait(&self, wait: Duration) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.fail_queued(OperationStatus::Failed);
        let deadline = Instant::now() + wait;
        let mut in_flight = self.in_flight.lock();
        while *in_flight > 0 {
            if self.idle.wait_until(&mut in_flight, deadline).timed_out() {
                warn!(device = %self.masked(), in_flight = *in_flight, "kill wait timed out");
                break;
            }
        }
        drop(in_flight);

        self.stop_watchdog();
        self.stop_all_feed_dogs();
        self.time_sync.stop(self.shared.runtime.as_ref());
        let operation = {
            let mut state = self.state.lock();
            let operation = state.operation.take();
            state.clear();
            state.machine = SyncState::Idle;
            operation
        };
        if let Some(operation) = operation {
            report_status(
                &operation,
                self.shared.runtime.as_ref(),
                &self.device,
                OperationStatus::Failed,
                None,
            );
        }
        debug!(device = %self.masked(), "context killed");
    }

    pub(crate) fn base_timeout(&self) -> Duration {
        self.shared.communicator.timeout(&self.device)
    }

    /// Arms the task watchdog at the base timeout.
    pub(crate) fn start_watchdog(&self) -> SyncResult<()> {
        self.stop_watchdog();
        let weak = self.weak_self.clone();
        let id = self.shared.runtime.set_timer(
            self.base_timeout(),
            Arc::new(move |id| {
                if let Some(ctx) = weak.upgrade() {
                    ctx.post(MachineInput::Timeout(id));
                }
            }),
            None,
        )?;
        self.state.lock().timer_id = Some(id);
        Ok(())
    }

    /// Progress was made: restarts the watchdog at the base timeout and
    /// clears the retry counter.
    pub(crate) fn reset_watchdog(&self) {
        let timer = {
            let mut state = self.state.lock();
            state.retry_count = 0;
            state.timer_id
        };
        if let Some(id) = timer {
            if let Err(e) = self.shared.runtime.modify_timer(id, self.base_timeout()) {
                debug!(device = %self.masked(), error = %e, "watchdog reset skipped");
            }
        }
    }

    pub(crate) fn stop_watchdog(&self) {
        let timer = self.state.lock().timer_id.take();
        if let Some(id) = timer {
            self.shared.runtime.remove_timer(id);
        }
    }

    /// Keeps the watchdog fed while a slow transfer is in progress.
    ///
    /// Ticks every notify interval, at most `timeout / interval` times
    /// (capped at 255). Starts are reference counted per direction.
    pub(crate) fn start_feed_dog(&self, direction: FeedDogDirection) {
        let mut dogs = self.feed_dogs.lock();
        let dog = &mut dogs[direction as usize];
        dog.refs += 1;
        if dog.timer.is_some() {
            return;
        }
        let interval = self.shared.config.data_notify_interval;
        let limit = (self.base_timeout().as_millis() / interval.as_millis().max(1)).clamp(1, 255) as u32;
        let ticks = Arc::new(AtomicU32::new(0));
        let weak = self.weak_self.clone();
        let timer = self.shared.runtime.set_timer(
            interval,
            Arc::new(move |_| {
                let Some(ctx) = weak.upgrade() else {
                    return;
                };
                if ticks.fetch_add(1, Ordering::SeqCst) >= limit {
                    ctx.disarm_feed_dog(direction);
                } else {
                    ctx.reset_watchdog();
                }
            }),
            None,
        );
        match timer {
            Ok(id) => dog.timer = Some(id),
            Err(e) => warn!(device = %self.masked(), error = %e, "feed dog not armed"),
        }
    }

    pub(crate) fn stop_feed_dog(&self, direction: FeedDogDirection) {
        let mut dogs = self.feed_dogs.lock();
        let dog = &mut dogs[direction as usize];
        dog.refs = dog.refs.saturating_sub(1);
        if dog.refs == 0 {
            if let Some(id) = dog.timer.take() {
                self.shared.runtime.remove_timer(id);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn feed_dog_refs(&self, direction: FeedDogDirection) -> u32 {
        self.feed_dogs.lock()[direction as usize].refs
    }

    fn disarm_feed_dog(&self, direction: FeedDogDirection) {
        let timer = self.feed_dogs.lock()[direction as usize].timer.take();
        if let Some(id) = timer {
            self.shared.runtime.remove_timer(id);
        }
    }

    pub(crate) fn stop_all_feed_dogs(&self) {
        let timers: Vec<TimerId> = {
            let mut dogs = self.feed_dogs.lock();
            dogs.iter_mut()
                .filter_map(|dog| {
                    dog.refs = 0;
                    dog.timer.take()
                })
                .collect()
        };
        for id in timers {
            self.shared.runtime.remove_timer(id);
        }
    }

    /// Runs `work` while periodically telling the peer the exchange
    /// `(session_id, sequence_id)` is still being handled.
    pub(crate) fn with_data_notify<T>(
        &self,
        session_id: u32,
        sequence_id: u32,
        work: impl FnOnce() -> T,
    ) -> T {
        let sent = Arc::new(AtomicU32::new(0));
        let max = self.shared.config.max_data_notify_count;
        let weak = self.weak_self.clone();
        let timer = self.shared.runtime.set_timer(
            self.shared.config.data_notify_interval,
            Arc::new(move |_| {
                if sent.fetch_add(1, Ordering::SeqCst) >= max {
                    return;
                }
                if let Some(ctx) = weak.upgrade() {
                    let notify = Message::notify(
                        session_id,
                        sequence_id,
                        Packet::Notify {
                            for_message: MessageId::DataSync,
                        },
                    );
                    if let Err(e) = ctx.send_message(notify, false) {
                        debug!(device = %ctx.masked(), error = %e, "notify not sent");
                    }
                }
            }),
            None,
        );
        let result = work();
        match timer {
            Ok(id) => self.shared.runtime.remove_timer(id),
            Err(e) => debug!(device = %self.masked(), error = %e, "notify timer not armed"),
        }
        result
    }

    /// Current `(session, sequence)`.
    pub(crate) fn current_ids(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.session_id, state.sequence_id)
    }

    /// Sends a request under the running session with a fresh sequence id.
    pub(crate) fn send_request(&self, packet: Packet) -> SyncResult<()> {
        let message = {
            let mut state = self.state.lock();
            state.sequence_id = state.sequence_id.wrapping_add(1);
            Message::request(state.session_id, state.sequence_id, packet)
        };
        self.send_message(message, true)
    }

    /// Sends a response or notification; delivery failures are not tracked.
    pub(crate) fn send_reply(&self, message: Message) -> SyncResult<()> {
        self.send_message(message, false)
    }

    fn send_message(&self, message: Message, track_errors: bool) -> SyncResult<()> {
        let identifier = self
            .shared
            .equal_identifiers
            .read()
            .get(&self.device)
            .cloned();
        let config = SendConfig::new(self.base_timeout()).with_extended_identifier(identifier);
        let on_error: Option<SendErrorHandler> = if track_errors {
            let weak = self.weak_self.clone();
            let session_id = message.session_id;
            Some(Box::new(move |error| {
                if let Some(ctx) = weak.upgrade() {
                    ctx.post(MachineInput::CommError { session_id, error });
                }
            }))
        } else {
            None
        };
        self.shared
            .communicator
            .send_message(&self.device, message, &config, on_error)
            .inspect_err(|e| warn!(device = %self.masked(), error = %e, "send failed"))
    }

    pub(crate) fn dump(&self) -> String {
        let (requests, responses) = self.queued();
        let state = self.state.lock();
        let ability = *self.ability.lock();
        format!(
            "device={} state={:?} mode={} session={} sequence={} retry={} sync_id={} requests={} responses={} ability_known={} remote_version={} time_synced={} comm_normal={}",
            self.masked(),
            state.machine,
            state.mode,
            state.session_id,
            state.sequence_id,
            state.retry_count,
            state.operation.as_ref().map_or(0, |op| op.id()),
            requests,
            responses,
            ability.known,
            ability.remote_software_version,
            self.time_sync.is_synced(),
            self.comm_normal.load(Ordering::SeqCst),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::{Envelope, VirtualNetwork};
    use crate::config::SyncerConfig;
    use crate::engine::EngineShared;
    use crate::metadata::Metadata;
    use crate::runtime::{ManualRuntime, Runtime};
    use crate::state_table::StateTables;
    use crate::time_helper::TimeHelper;
    use kvsync_storage::{MemoryStorage, SyncStorage};
    use parking_lot::RwLock;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    struct Harness {
        runtime: Arc<ManualRuntime>,
        network: Arc<VirtualNetwork>,
        context: Arc<SyncTaskContext>,
    }

    fn harness(config: SyncerConfig) -> Harness {
        let runtime = Arc::new(ManualRuntime::new());
        let network = VirtualNetwork::new(runtime.clone());
        let communicator = network.join("local");
        network.join("peer");
        let storage: Arc<dyn SyncStorage> = Arc::new(MemoryStorage::new("store"));
        let metadata = Arc::new(Metadata::new(Arc::clone(&storage), 16));
        metadata.initialize().unwrap();
        let time_helper = Arc::new(TimeHelper::new(storage.as_ref(), Arc::clone(&metadata)));
        let shared = Arc::new(EngineShared::new(
            storage,
            communicator,
            runtime.clone(),
            metadata,
            time_helper,
            config,
            StateTables::build().unwrap(),
            Arc::new(AtomicBool::new(false)),
            Arc::new(RwLock::new(HashMap::new())),
        ));
        let context = SyncTaskContext::new("peer", shared);
        Harness {
            runtime,
            network,
            context,
        }
    }

    fn operation(id: u32, mode: SyncMode) -> Arc<SyncOperation> {
        Arc::new(SyncOperation::new(
            id,
            vec!["peer".to_string()],
            mode,
            false,
            false,
            None,
        ))
    }

    fn response(session_id: u32) -> SyncTarget {
        SyncTarget::Response {
            session_id,
            begin: 0,
            query: None,
        }
    }

    #[test]
    fn requests_run_before_responses_in_arrival_order() {
        let h = harness(SyncerConfig::default());
        let killed = operation(12, SyncMode::Push);
        h.context.add_sync_target(response(1));
        h.context.add_sync_target(SyncTarget::Request {
            operation: operation(10, SyncMode::Push),
        });
        h.context.add_sync_target(SyncTarget::Request {
            operation: Arc::clone(&killed),
        });
        h.context.add_sync_target(response(2));
        h.context.add_sync_target(SyncTarget::Request {
            operation: operation(11, SyncMode::Pull),
        });
        killed.kill();
        assert_eq!(h.context.queued(), (3, 2));

        let mut order = Vec::new();
        while let Some(target) = h.context.get_next_target() {
            order.push(match target {
                SyncTarget::Request { operation } => format!("request {}", operation.id()),
                SyncTarget::Response { session_id, .. } => format!("response {session_id}"),
            });
        }
        assert_eq!(
            order,
            ["request 10", "request 11", "response 1", "response 2"]
        );
        assert_eq!(h.context.queued(), (0, 0));
    }

    #[test]
    fn refused_target_fails_its_operation() {
        let h = harness(SyncerConfig::default());
        h.runtime
            .hooks()
            .set_permission_check(Some(Arc::new(|_: &str, flags: PermissionFlags| {
                !flags.contains(PermissionFlags::RECEIVE)
            })));
        let refused = operation(20, SyncMode::Pull);
        h.context.add_sync_target(SyncTarget::Request {
            operation: Arc::clone(&refused),
        });
        h.context.add_sync_target(SyncTarget::Request {
            operation: operation(21, SyncMode::Push),
        });

        match h.context.get_next_target() {
            Some(SyncTarget::Request { operation }) => assert_eq!(operation.id(), 21),
            _ => panic!("expected the push request"),
        }
        assert_eq!(
            refused.status("peer"),
            Some(OperationStatus::PermissionCheckFailed)
        );
    }

    #[test]
    fn feed_dog_is_counted_per_direction() {
        let h = harness(SyncerConfig::default());
        h.context.start_feed_dog(FeedDogDirection::Send);
        h.context.start_feed_dog(FeedDogDirection::Send);
        assert_eq!(h.runtime.timers().len(), 1);

        h.context.start_feed_dog(FeedDogDirection::Receive);
        assert_eq!(h.runtime.timers().len(), 2);

        h.context.stop_feed_dog(FeedDogDirection::Send);
        assert_eq!(h.context.feed_dog_refs(FeedDogDirection::Send), 1);
        assert_eq!(h.runtime.timers().len(), 2);

        h.context.stop_feed_dog(FeedDogDirection::Send);
        assert_eq!(h.runtime.timers().len(), 1);
        assert_eq!(h.context.feed_dog_refs(FeedDogDirection::Receive), 1);

        h.context.stop_feed_dog(FeedDogDirection::Receive);
        assert!(h.runtime.timers().is_empty());
    }

    #[test]
    fn data_notify_stops_at_configured_count() {
        let h = harness(SyncerConfig::default().with_max_data_notify_count(2));
        let notifies = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notifies);
        h.network.add_filter(Arc::new(move |envelope: &Envelope| {
            if envelope.message.session_id == 7
                && matches!(envelope.message.packet, Packet::Notify { .. })
            {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            false
        }));

        let runtime = Arc::clone(&h.runtime);
        let value = h.context.with_data_notify(7, 3, || {
            let timer = *runtime.timers().last().expect("notify timer armed");
            for _ in 0..5 {
                assert!(runtime.fire_timer(timer));
            }
            42
        });
        assert_eq!(value, 42);
        assert_eq!(notifies.load(Ordering::SeqCst), 2);
        assert!(h.runtime.timers().is_empty());
    }

    #[test]
    fn kill_wait_gives_up_on_stuck_dispatch() {
        let h = harness(SyncerConfig::default());
        let queued = operation(30, SyncMode::Push);
        h.context.add_sync_target(SyncTarget::Request {
            operation: Arc::clone(&queued),
        });
        assert_eq!(*h.context.in_flight.lock(), 1);

        let started = Instant::now();
        h.context.kill_wait(Duration::from_millis(50));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_secs(5));
        assert!(h.context.is_killed());
        assert_eq!(queued.status("peer"), Some(OperationStatus::Failed));
        assert_eq!(*h.context.in_flight.lock(), 1);

        h.runtime.run_pending();
        assert_eq!(*h.context.in_flight.lock(), 0);
    }

    #[test]
    fn kill_wait_returns_once_dispatch_drains() {
        let h = harness(SyncerConfig::default());
        h.context.post(MachineInput::Offline);
        assert_eq!(*h.context.in_flight.lock(), 1);

        let runtime = Arc::clone(&h.runtime);
        let drainer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            runtime.run_pending();
        });
        let started = Instant::now();
        h.context.kill_wait(Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(10));
        drainer.join().unwrap();
        assert_eq!(*h.context.in_flight.lock(), 0);
    }
}

//! Public sync façade.

use crate::communicator::{mask_device, Communicator};
use crate::config::SyncerConfig;
use crate::engine::{EngineShared, SyncEngine};
use crate::error::{SyncError, SyncResult};
use crate::metadata::Metadata;
use crate::operation::{CompletionCallback, FinalizeCallback, OperationStatus, SyncOperation};
use crate::registry::SyncRegistry;
use crate::runtime::Runtime;
use crate::time_helper::TimeHelper;
use kvsync_protocol::{QuerySpec, SyncMode};
use kvsync_storage::{DataItem, SyncStorage};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Why a syncer is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The store is closing; every resource is released.
    Closed,
    /// The local user changed; metadata stays loaded.
    UserChanged,
}

impl CloseReason {
    fn status(self) -> OperationStatus {
        match self {
            CloseReason::Closed => OperationStatus::Failed,
            CloseReason::UserChanged => OperationStatus::UserChanged,
        }
    }
}

/// Parameters of one [`GenericSyncer::sync`] call.
///
/// # Example
///
/// ```rust
/// use kvsync_engine::SyncRequest;
/// use kvsync_protocol::SyncMode;
///
/// let request = SyncRequest::new(["peer-b"], SyncMode::Push)
///     .with_wait(true)
///     .with_on_complete(|statuses| {
///         for (device, status) in statuses {
///             println!("{device}: {status}");
///         }
///     });
/// # let _ = request;
/// ```
pub struct SyncRequest {
    devices: Vec<String>,
    mode: SyncMode,
    wait: bool,
    query: Option<QuerySpec>,
    on_complete: Option<CompletionCallback>,
    on_finalize: Option<FinalizeCallback>,
    connection_id: u64,
    is_auto: bool,
}

impl SyncRequest {
    /// Creates a non-blocking manual request.
    pub fn new<I, S>(devices: I, mode: SyncMode) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            devices: devices.into_iter().map(Into::into).collect(),
            mode,
            wait: false,
            query: None,
            on_complete: None,
            on_finalize: None,
            connection_id: 0,
            is_auto: false,
        }
    }

    /// Blocks [`GenericSyncer::sync`] until every device is terminal.
    pub fn with_wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    /// Restricts the sync to a query.
    pub fn with_query(mut self, query: QuerySpec) -> Self {
        self.query = Some(query);
        self
    }

    /// Called once with every device's final status.
    pub fn with_on_complete(
        mut self,
        callback: impl FnOnce(&BTreeMap<String, OperationStatus>) + Send + 'static,
    ) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Called when the operation is released.
    pub fn with_on_finalize(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_finalize = Some(Box::new(callback));
        self
    }

    /// Ties the operation to a client connection for [`GenericSyncer::stop_sync`].
    pub fn with_connection_id(mut self, connection_id: u64) -> Self {
        self.connection_id = connection_id;
        self
    }

    fn auto(mut self) -> Self {
        self.is_auto = true;
        self
    }

    fn counts_against_limit(&self) -> bool {
        !self.wait && !self.is_auto && self.mode.is_manual()
    }
}

fn counts_against_limit(operation: &SyncOperation) -> bool {
    !operation.is_blocking() && !operation.is_auto() && operation.mode().is_manual()
}

struct QueuedSyncs {
    count: u32,
    limit: u32,
    manual_disabled: bool,
}

/// Holds a slot in the queued-sync counter until committed; dropping it
/// uncommitted gives the slot back.
struct QueuedSyncGuard<'a> {
    queued: &'a Mutex<QueuedSyncs>,
    counted: bool,
    committed: bool,
}

impl<'a> QueuedSyncGuard<'a> {
    fn acquire(queued: &'a Mutex<QueuedSyncs>, request: &SyncRequest) -> SyncResult<Self> {
        let counted = request.counts_against_limit();
        let mut state = queued.lock();
        if !request.is_auto && state.manual_disabled {
            return Err(SyncError::Busy);
        }
        if counted {
            if state.count >= state.limit {
                return Err(SyncError::Busy);
            }
            state.count += 1;
        }
        Ok(Self {
            queued,
            counted,
            committed: false,
        })
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for QueuedSyncGuard<'_> {
    fn drop(&mut self) {
        if self.counted && !self.committed {
            let mut state = self.queued.lock();
            state.count = state.count.saturating_sub(1);
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    storage: Option<Arc<dyn SyncStorage>>,
    metadata: Option<Arc<Metadata>>,
    time_helper: Option<Arc<TimeHelper>>,
    engine: Option<Arc<SyncEngine>>,
    initialized: bool,
    closing: bool,
}

/// Sync façade of one store.
///
/// Accepts sync requests, tracks their operations, and owns the engine
/// that runs the per-peer tasks.
///
/// # Example
///
/// ```rust,no_run
/// use kvsync_engine::{GenericSyncer, SyncRequest, SyncerConfig, TokioRuntime, VirtualNetwork};
/// use kvsync_protocol::SyncMode;
/// use kvsync_storage::MemoryStorage;
/// use std::sync::Arc;
///
/// let runtime = Arc::new(TokioRuntime::new()?);
/// let network = VirtualNetwork::new(runtime.clone());
/// let syncer = GenericSyncer::new(network.join("device-a"), runtime, SyncerConfig::default());
/// let storage: Arc<dyn kvsync_storage::SyncStorage> = Arc::new(MemoryStorage::new("store"));
/// syncer.initialize(Some(storage), true)?;
///
/// let sync_id = syncer.sync(SyncRequest::new(["device-b"], SyncMode::Push))?;
/// println!("queued sync {sync_id}");
/// syncer.close(kvsync_engine::CloseReason::Closed)?;
/// # Ok::<(), kvsync_engine::SyncError>(())
/// ```
pub struct GenericSyncer {
    weak_self: Weak<GenericSyncer>,
    communicator: Arc<dyn Communicator>,
    runtime: Arc<dyn Runtime>,
    config: SyncerConfig,
    registry: Arc<SyncRegistry>,
    lifecycle: Mutex<Lifecycle>,
    operations: Mutex<BTreeMap<u32, Arc<SyncOperation>>>,
    connections: Mutex<HashMap<u64, BTreeSet<u32>>>,
    queued: Mutex<QueuedSyncs>,
    sync_retry: Arc<AtomicBool>,
    equal_identifiers: Arc<RwLock<HashMap<String, String>>>,
}

impl GenericSyncer {
    /// Creates a syncer with its own id registry.
    pub fn new(
        communicator: Arc<dyn Communicator>,
        runtime: Arc<dyn Runtime>,
        config: SyncerConfig,
    ) -> Arc<Self> {
        Self::with_registry(communicator, runtime, config, Arc::new(SyncRegistry::new()))
    }

    /// Creates a syncer drawing sync ids from a shared registry.
    pub fn with_registry(
        communicator: Arc<dyn Communicator>,
        runtime: Arc<dyn Runtime>,
        config: SyncerConfig,
        registry: Arc<SyncRegistry>,
    ) -> Arc<Self> {
        let limit = config.queued_sync_limit;
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            communicator,
            runtime,
            config,
            registry,
            lifecycle: Mutex::new(Lifecycle::default()),
            operations: Mutex::new(BTreeMap::new()),
            connections: Mutex::new(HashMap::new()),
            queued: Mutex::new(QueuedSyncs {
                count: 0,
                limit,
                manual_disabled: false,
            }),
            sync_retry: Arc::new(AtomicBool::new(false)),
            equal_identifiers: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Binds the syncer to a store and starts the engine.
    ///
    /// Calling it again while initialized is a no-op.
    ///
    /// # Errors
    ///
    /// - [`SyncError::InvalidArgs`] without a store
    /// - [`SyncError::Busy`] while a close is in progress
    /// - [`SyncError::NoNeedActive`] for local-only stores (nothing is
    ///   started), and for dual-tuple stores opened with `need_active`
    ///   unset (the engine is started but the store reports inactive)
    pub fn initialize(
        &self,
        storage: Option<Arc<dyn SyncStorage>>,
        need_active: bool,
    ) -> SyncResult<()> {
        let storage = storage.ok_or_else(|| SyncError::invalid_args("storage is required"))?;
        let properties = storage.db_properties();
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.closing {
                return Err(SyncError::Busy);
            }
            if lifecycle.initialized {
                return Ok(());
            }
            if properties.local_only {
                info!(store = %properties.identifier, "local-only store, sync not activated");
                return Err(SyncError::NoNeedActive);
            }
            let metadata = Arc::new(Metadata::new(
                Arc::clone(&storage),
                self.config.query_water_mark_capacity,
            ));
            metadata.initialize()?;
            let time_helper = Arc::new(TimeHelper::new(storage.as_ref(), Arc::clone(&metadata)));
            let engine = SyncEngine::new(EngineShared::new(
                Arc::clone(&storage),
                Arc::clone(&self.communicator),
                Arc::clone(&self.runtime),
                Arc::clone(&metadata),
                Arc::clone(&time_helper),
                self.config.clone(),
                self.registry.tables()?.clone(),
                Arc::clone(&self.sync_retry),
                Arc::clone(&self.equal_identifiers),
            ));
            engine.start();
            *lifecycle = Lifecycle {
                storage: Some(storage),
                metadata: Some(metadata),
                time_helper: Some(time_helper),
                engine: Some(engine),
                initialized: true,
                closing: false,
            };
        }
        self.register_connect_callback();
        info!(store = %properties.identifier, dual_tuple = properties.dual_tuple, "syncer initialized");
        if properties.dual_tuple && !need_active {
            return Err(SyncError::NoNeedActive);
        }
        Ok(())
    }

    fn register_connect_callback(&self) {
        let syncer = self.weak_self.clone();
        self.communicator
            .register_connect_callback(Some(Arc::new(move |device: &str, online: bool| {
                if let Some(syncer) = syncer.upgrade() {
                    syncer.on_device_connect(device, online);
                }
            })));
    }

    fn on_device_connect(&self, device: &str, online: bool) {
        let Some(engine) = self.engine() else {
            return;
        };
        info!(device = %mask_device(device), online, "peer connectivity changed");
        if !online {
            engine.offline(device);
            return;
        }
        engine.online(device);
        if self.config.auto_sync_on_online {
            let request = SyncRequest::new([device], SyncMode::Push).auto();
            if let Err(e) = self.sync(request) {
                debug!(device = %mask_device(device), error = %e, "auto sync not started");
            }
        }
    }

    fn engine(&self) -> Option<Arc<SyncEngine>> {
        self.lifecycle.lock().engine.clone()
    }

    fn running_engine(&self) -> SyncResult<Arc<SyncEngine>> {
        let lifecycle = self.lifecycle.lock();
        if lifecycle.closing {
            return Err(SyncError::Busy);
        }
        lifecycle.engine.clone().ok_or(SyncError::NotInitialized)
    }

    /// Starts a sync and returns its id.
    ///
    /// With [`SyncRequest::with_wait`] the call returns once every device
    /// is terminal; otherwise it returns as soon as the request is queued.
    ///
    /// # Errors
    ///
    /// - [`SyncError::NotInitialized`] before [`GenericSyncer::initialize`]
    /// - [`SyncError::Busy`] while closing, while manual sync is disabled,
    ///   or when the queued-sync limit is reached
    /// - [`SyncError::InvalidArgs`] for an empty device list, the internal
    ///   response mode, or a control mode without a query
    pub fn sync(&self, request: SyncRequest) -> SyncResult<u32> {
        let engine = self.running_engine()?;
        if request.devices.is_empty() {
            return Err(SyncError::invalid_args("no devices"));
        }
        if !request.mode.is_requestable() {
            return Err(SyncError::invalid_args(format!(
                "mode {} cannot be requested",
                request.mode
            )));
        }
        if request.mode.is_control() && request.query.is_none() {
            return Err(SyncError::invalid_args("control modes need a query"));
        }
        let guard = QueuedSyncGuard::acquire(&self.queued, &request)?;

        let SyncRequest {
            devices,
            mode,
            wait,
            query,
            on_complete,
            on_finalize,
            connection_id,
            is_auto,
        } = request;
        let operation = {
            let mut operations = self.operations.lock();
            let id = self
                .registry
                .next_sync_id(|id| operations.contains_key(&id))?;
            let operation = Arc::new(SyncOperation::new(id, devices, mode, is_auto, wait, query));
            if let Some(callback) = on_complete {
                operation.set_on_complete(callback);
            }
            if let Some(callback) = on_finalize {
                operation.set_on_finalize(callback);
            }
            let syncer = self.weak_self.clone();
            operation.set_on_finished(Box::new(move |sync_id| {
                if let Some(syncer) = syncer.upgrade() {
                    if let Err(e) = syncer.remove_sync_operation(sync_id) {
                        debug!(sync_id, error = %e, "finished operation already removed");
                    }
                }
            }));
            operations.insert(id, Arc::clone(&operation));
            operation
        };
        let sync_id = operation.id();
        if connection_id != 0 {
            self.connections
                .lock()
                .entry(connection_id)
                .or_default()
                .insert(sync_id);
        }
        if let Err(e) = engine.add_sync_operation(&operation) {
            self.operations.lock().remove(&sync_id);
            self.forget_connection(sync_id);
            operation.kill();
            return Err(e);
        }
        guard.commit();
        info!(
            sync_id,
            %mode,
            devices = operation.devices().len(),
            wait,
            auto = is_auto,
            "sync queued"
        );
        if wait {
            operation.wait_if_need();
        }
        Ok(sync_id)
    }

    fn forget_connection(&self, sync_id: u32) {
        let mut connections = self.connections.lock();
        connections.retain(|_, ids| {
            ids.remove(&sync_id);
            !ids.is_empty()
        });
    }

    /// Drops an operation: releases its queued slot and any blocked
    /// waiter, and aborts its tasks if it has not finished.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidArgs`] for an unknown id.
    pub fn remove_sync_operation(&self, sync_id: u32) -> SyncResult<()> {
        let operation = self
            .operations
            .lock()
            .remove(&sync_id)
            .ok_or_else(|| SyncError::invalid_args(format!("unknown sync id {sync_id}")))?;
        if counts_against_limit(&operation) {
            let mut queued = self.queued.lock();
            queued.count = queued.count.saturating_sub(1);
        }
        operation.notify_if_need();
        self.forget_connection(sync_id);
        if !operation.check_is_all_finished() {
            if let Some(engine) = self.engine() {
                engine.abort_operation(&operation);
            }
        }
        operation.kill();
        debug!(sync_id, "sync operation removed");
        Ok(())
    }

    /// Cancels every operation started under `connection_id`.
    pub fn stop_sync(&self, connection_id: u64) -> SyncResult<()> {
        let ids = self
            .connections
            .lock()
            .remove(&connection_id)
            .unwrap_or_default();
        for sync_id in &ids {
            if let Err(e) = self.remove_sync_operation(*sync_id) {
                debug!(sync_id, error = %e, "operation already gone");
            }
        }
        if let Some(engine) = self.engine() {
            engine.notify_connection_closed(connection_id);
        }
        info!(connection_id, cancelled = ids.len(), "connection syncs stopped");
        Ok(())
    }

    /// Closes the syncer.
    ///
    /// On [`CloseReason::UserChanged`] every operation finishes with
    /// [`OperationStatus::UserChanged`] for devices not yet terminal. On
    /// [`CloseReason::Closed`] blocking operations finish with
    /// [`OperationStatus::Failed`] and other operations are cancelled without
    /// a callback. Metadata is released only for [`CloseReason::Closed`].
    ///
    /// # Errors
    ///
    /// - [`SyncError::NotInitialized`] if the syncer is not running
    /// - [`SyncError::Busy`] if another close is in progress
    pub fn close(&self, reason: CloseReason) -> SyncResult<()> {
        let engine = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.closing {
                return Err(SyncError::Busy);
            }
            if !lifecycle.initialized {
                return Err(SyncError::NotInitialized);
            }
            lifecycle.closing = true;
            lifecycle.engine.clone()
        };

        let status = reason.status();
        let operations: Vec<Arc<SyncOperation>> =
            self.operations.lock().values().cloned().collect();
        for operation in operations {
            if operation.is_blocking() || reason == CloseReason::UserChanged {
                for device in operation.devices() {
                    operation.set_status(device, status);
                }
                operation.finished();
            } else if let Err(e) = self.remove_sync_operation(operation.id()) {
                debug!(sync_id = operation.id(), error = %e, "operation already gone");
            }
        }

        if let Some(engine) = engine {
            engine.close();
        }
        self.communicator.register_connect_callback(None);

        let mut lifecycle = self.lifecycle.lock();
        lifecycle.engine = None;
        lifecycle.initialized = false;
        lifecycle.closing = false;
        if reason == CloseReason::Closed {
            lifecycle.storage = None;
            lifecycle.metadata = None;
            lifecycle.time_helper = None;
        }
        info!(?reason, "syncer closed");
        Ok(())
    }

    /// Next local logical timestamp.
    pub fn get_timestamp(&self) -> SyncResult<u64> {
        self.lifecycle
            .lock()
            .time_helper
            .as_ref()
            .map(|helper| helper.get_time())
            .ok_or(SyncError::NotInitialized)
    }

    /// Number of queued non-blocking manual syncs.
    pub fn get_queued_sync_size(&self) -> u32 {
        self.queued.lock().count
    }

    /// Sets the queued-sync limit.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidArgs`] for a zero limit.
    pub fn set_queued_sync_limit(&self, limit: u32) -> SyncResult<()> {
        if limit == 0 {
            return Err(SyncError::invalid_args("queued sync limit must be positive"));
        }
        self.queued.lock().limit = limit;
        Ok(())
    }

    /// Current queued-sync limit.
    pub fn get_queued_sync_limit(&self) -> u32 {
        self.queued.lock().limit
    }

    /// Rejects manual syncs from now on.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Busy`] while manual syncs are queued.
    pub fn disable_manual_sync(&self) -> SyncResult<()> {
        let mut queued = self.queued.lock();
        if queued.count > 0 {
            return Err(SyncError::Busy);
        }
        queued.manual_disabled = true;
        Ok(())
    }

    /// Accepts manual syncs again.
    pub fn enable_manual_sync(&self) {
        self.queued.lock().manual_disabled = false;
    }

    /// Identity of the local device.
    pub fn local_identity(&self) -> SyncResult<String> {
        self.communicator.local_identity()
    }

    /// Lets manual syncs retry on timeout like auto syncs do.
    pub fn set_sync_retry(&self, enabled: bool) {
        self.sync_retry.store(enabled, Ordering::SeqCst);
    }

    /// Sends `identifier` as the extended header on every message to
    /// `devices`.
    pub fn set_equal_identifier(&self, identifier: &str, devices: &[String]) -> SyncResult<()> {
        if identifier.is_empty() {
            return Err(SyncError::invalid_args("empty identifier"));
        }
        let mut identifiers = self.equal_identifiers.write();
        for device in devices {
            identifiers.insert(device.clone(), identifier.to_string());
        }
        Ok(())
    }

    /// Asks `device` for its live records under `key_prefix`.
    ///
    /// Blocks until the peer answers, the configured timeout elapses
    /// ([`SyncError::Timeout`]) or the query is cancelled through
    /// [`GenericSyncer::stop_sync`] ([`SyncError::Cancelled`]).
    pub fn remote_query(
        &self,
        device: &str,
        key_prefix: &[u8],
        connection_id: u64,
    ) -> SyncResult<Vec<DataItem>> {
        self.running_engine()?
            .remote_query(device, key_prefix.to_vec(), connection_id)
    }

    /// Forgets a peer: its running task, subscriptions and cursors. The
    /// next sync with it starts from scratch.
    pub fn erase_peer(&self, device: &str) -> SyncResult<()> {
        self.running_engine()?.erase_peer(device)
    }

    /// Pushes local changes to every peer subscribed to a query, restricted
    /// to that query. Returns the ids of the started syncs.
    pub fn local_data_changed(&self) -> SyncResult<Vec<u32>> {
        let engine = self.running_engine()?;
        let mut started = Vec::new();
        for (device, query) in engine.subscribers() {
            let request = SyncRequest::new([device.as_str()], SyncMode::Push)
                .with_query(query)
                .auto();
            match self.sync(request) {
                Ok(sync_id) => started.push(sync_id),
                Err(e) => warn!(device = %mask_device(&device), error = %e, "subscriber push not started"),
            }
        }
        Ok(started)
    }

    /// Human-readable snapshot of the syncer and its engine.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let (initialized, closing, engine) = {
            let lifecycle = self.lifecycle.lock();
            (lifecycle.initialized, lifecycle.closing, lifecycle.engine.clone())
        };
        {
            let queued = self.queued.lock();
            let _ = writeln!(
                out,
                "syncer: initialized={initialized} closing={closing} queued={}/{} manual_disabled={} sync_retry={}",
                queued.count,
                queued.limit,
                queued.manual_disabled,
                self.sync_retry.load(Ordering::SeqCst)
            );
        }
        for operation in self.operations.lock().values() {
            let statuses: Vec<String> = operation
                .statuses()
                .iter()
                .map(|(device, status)| format!("{}={status}", mask_device(device)))
                .collect();
            let _ = writeln!(
                out,
                "  sync {} mode={} auto={} blocking={} [{}]",
                operation.id(),
                operation.mode(),
                operation.is_auto(),
                operation.is_blocking(),
                statuses.join(", ")
            );
        }
        if let Some(engine) = engine {
            out.push_str(&engine.dump());
        }
        out
    }

    #[cfg(test)]
    pub(crate) fn engine_for_test(&self) -> Option<Arc<SyncEngine>> {
        self.engine()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::{
        Envelope, VirtualCommunicator, VirtualNetwork, DEFAULT_MTU, DEFAULT_TIMEOUT,
    };
    use crate::runtime::ManualRuntime;
    use crate::state_table::SyncState;
    use crate::task_context::FeedDogDirection;
    use kvsync_protocol::{Message, MessageType, Packet, TimeSyncPacket};
    use kvsync_storage::{DbProperties, MemoryStorage};
    use std::thread;
    use std::time::Duration;

    struct Node {
        syncer: Arc<GenericSyncer>,
        storage: Arc<MemoryStorage>,
    }

    fn node(
        network: &Arc<VirtualNetwork>,
        runtime: &Arc<ManualRuntime>,
        device: &str,
        config: SyncerConfig,
    ) -> Node {
        let communicator: Arc<VirtualCommunicator> = network.join(device);
        let storage = Arc::new(MemoryStorage::new(format!("store-{device}")));
        let syncer = GenericSyncer::new(communicator, runtime.clone(), config);
        syncer
            .initialize(Some(storage.clone() as Arc<dyn SyncStorage>), true)
            .expect("initialize");
        Node { syncer, storage }
    }

    fn setup(config: SyncerConfig) -> (Arc<ManualRuntime>, Arc<VirtualNetwork>, Node, Node) {
        let runtime = Arc::new(ManualRuntime::new());
        let network = VirtualNetwork::new(runtime.clone());
        let a = node(&network, &runtime, "device-a", config.clone());
        let b = node(&network, &runtime, "device-b", config);
        (runtime, network, a, b)
    }

    fn capture() -> (
        Arc<Mutex<Option<BTreeMap<String, OperationStatus>>>>,
        impl FnOnce(&BTreeMap<String, OperationStatus>) + Send + 'static,
    ) {
        let slot = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&slot);
        (slot, move |statuses: &BTreeMap<String, OperationStatus>| {
            *sink.lock() = Some(statuses.clone());
        })
    }

    fn watchdog(syncer: &GenericSyncer, device: &str) -> Option<u64> {
        let engine = syncer.engine_for_test()?;
        let context = engine.context_for_test(device)?;
        let timer = context.state.lock().timer_id;
        timer
    }

    #[test]
    fn push_reaches_peer() {
        let (runtime, _network, a, b) = setup(SyncerConfig::default());
        a.storage.put(b"k1", b"v1");
        a.storage.put(b"k2", b"v2");

        let (result, on_complete) = capture();
        a.syncer
            .sync(SyncRequest::new(["device-b"], SyncMode::Push).with_on_complete(on_complete))
            .unwrap();
        runtime.run_pending();

        let statuses = result.lock().clone().expect("callback ran");
        assert_eq!(statuses["device-b"], OperationStatus::FinishedAll);
        assert_eq!(b.storage.get(b"k1"), Some(b"v1".to_vec()));
        assert_eq!(b.storage.get(b"k2"), Some(b"v2".to_vec()));
        assert_eq!(a.syncer.get_queued_sync_size(), 0);
    }

    #[test]
    fn auto_sync_watchdog_backs_off_then_times_out() {
        let config = SyncerConfig::default().with_retry_times(3, 3);
        let (runtime, network, a, _b) = setup(config);
        network.add_filter(Arc::new(|envelope: &Envelope| envelope.from == "device-a"));

        let (result, on_complete) = capture();
        a.syncer
            .sync(
                SyncRequest::new(["device-b"], SyncMode::Push)
                    .auto()
                    .with_on_complete(on_complete),
            )
            .unwrap();
        runtime.run_pending();

        let timer = watchdog(&a.syncer, "device-b").expect("watchdog armed");
        assert_eq!(runtime.timer_interval(timer), Some(DEFAULT_TIMEOUT));
        for factor in [2u32, 4, 8] {
            assert!(runtime.fire_timer(timer));
            runtime.run_pending();
            assert_eq!(runtime.timer_interval(timer), Some(DEFAULT_TIMEOUT * factor));
            assert!(result.lock().is_none());
        }
        assert!(runtime.fire_timer(timer));
        runtime.run_pending();

        let statuses = result.lock().clone().expect("callback ran");
        assert_eq!(statuses["device-b"], OperationStatus::Timeout);
        assert!(runtime.timer_interval(timer).is_none());
    }

    #[test]
    fn request_for_same_mode_cancels_auto_backoff() {
        let config = SyncerConfig::default().with_retry_times(3, 3);
        let (runtime, network, a, _b) = setup(config);
        network.add_filter(Arc::new(|envelope: &Envelope| envelope.from == "device-a"));

        let (auto_result, on_complete) = capture();
        a.syncer
            .sync(
                SyncRequest::new(["device-b"], SyncMode::Push)
                    .auto()
                    .with_on_complete(on_complete),
            )
            .unwrap();
        runtime.run_pending();
        let timer = watchdog(&a.syncer, "device-b").expect("watchdog armed");
        for _ in 0..2 {
            assert!(runtime.fire_timer(timer));
            runtime.run_pending();
        }
        assert_eq!(runtime.timer_interval(timer), Some(DEFAULT_TIMEOUT * 4));

        a.syncer
            .sync(SyncRequest::new(["device-b"], SyncMode::Pull))
            .unwrap();
        runtime.run_pending();
        assert_eq!(runtime.timer_interval(timer), Some(DEFAULT_TIMEOUT * 4));

        a.syncer
            .sync(SyncRequest::new(["device-b"], SyncMode::PushAndPull))
            .unwrap();
        runtime.run_pending();
        assert_eq!(runtime.timer_interval(timer), Some(DEFAULT_TIMEOUT));
        let context = a
            .syncer
            .engine_for_test()
            .and_then(|engine| engine.context_for_test("device-b"))
            .expect("context exists");
        assert_eq!(context.state.lock().retry_count, 3);

        assert!(runtime.fire_timer(timer));
        runtime.run_pending();
        let statuses = auto_result.lock().clone().expect("auto sync finished");
        assert_eq!(statuses["device-b"], OperationStatus::Timeout);
        let state = context.state.lock();
        assert!(!state.is_auto);
        assert_eq!(state.mode, SyncMode::Pull);
    }

    #[test]
    fn resent_batch_keeps_one_feed_dog() {
        let config = SyncerConfig::default().with_retry_times(3, 3);
        let (runtime, network, a, _b) = setup(config);
        network.add_filter(Arc::new(|envelope: &Envelope| {
            envelope.from == "device-a" && matches!(envelope.message.packet, Packet::DataRequest(_))
        }));
        a.storage.put(b"big", &vec![7u8; DEFAULT_MTU + 1]);

        a.syncer
            .sync(SyncRequest::new(["device-b"], SyncMode::Push).auto())
            .unwrap();
        runtime.run_pending();
        let context = a
            .syncer
            .engine_for_test()
            .and_then(|engine| engine.context_for_test("device-b"))
            .expect("context exists");
        assert_eq!(context.state.lock().machine, SyncState::InitiativeDataSync);
        assert_eq!(context.feed_dog_refs(FeedDogDirection::Send), 1);

        let timer = watchdog(&a.syncer, "device-b").expect("watchdog armed");
        for _ in 0..2 {
            assert!(runtime.fire_timer(timer));
            runtime.run_pending();
            assert_eq!(context.feed_dog_refs(FeedDogDirection::Send), 1);
        }
    }

    #[test]
    fn manual_retry_keeps_base_interval() {
        let config = SyncerConfig::default().with_retry_times(2, 3);
        let (runtime, network, a, _b) = setup(config);
        network.add_filter(Arc::new(|envelope: &Envelope| envelope.from == "device-a"));
        a.syncer.set_sync_retry(true);

        let (result, on_complete) = capture();
        a.syncer
            .sync(SyncRequest::new(["device-b"], SyncMode::Push).with_on_complete(on_complete))
            .unwrap();
        runtime.run_pending();

        let timer = watchdog(&a.syncer, "device-b").expect("watchdog armed");
        for _ in 0..2 {
            assert!(runtime.fire_timer(timer));
            runtime.run_pending();
            assert_eq!(runtime.timer_interval(timer), Some(DEFAULT_TIMEOUT));
            assert!(result.lock().is_none());
        }
        assert!(runtime.fire_timer(timer));
        runtime.run_pending();

        let statuses = result.lock().clone().expect("callback ran");
        assert_eq!(statuses["device-b"], OperationStatus::Timeout);
    }

    #[test]
    fn manual_sync_without_retry_times_out_on_first_expiry() {
        let (runtime, network, a, _b) = setup(SyncerConfig::default());
        network.add_filter(Arc::new(|envelope: &Envelope| envelope.from == "device-a"));

        let (result, on_complete) = capture();
        a.syncer
            .sync(SyncRequest::new(["device-b"], SyncMode::Pull).with_on_complete(on_complete))
            .unwrap();
        runtime.run_pending();
        let timer = watchdog(&a.syncer, "device-b").expect("watchdog armed");
        assert!(runtime.fire_timer(timer));
        runtime.run_pending();

        let statuses = result.lock().clone().expect("callback ran");
        assert_eq!(statuses["device-b"], OperationStatus::Timeout);
    }

    #[test]
    fn stale_response_is_ignored() {
        let (runtime, network, a, _b) = setup(SyncerConfig::default());
        network.add_filter(Arc::new(|envelope: &Envelope| envelope.from == "device-a"));
        a.syncer
            .sync(SyncRequest::new(["device-b"], SyncMode::Push))
            .unwrap();
        runtime.run_pending();

        let engine = a.syncer.engine_for_test().unwrap();
        let context = engine.context_for_test("device-b").unwrap();
        let (machine, session) = {
            let state = context.state.lock();
            (state.machine, state.session_id)
        };
        assert_eq!(machine, SyncState::TimeSync);

        engine.receive_message(
            "device-b",
            Message {
                kind: MessageType::Response,
                session_id: session.wrapping_add(1),
                sequence_id: 1,
                packet: Packet::TimeSync(TimeSyncPacket::request(1)),
            },
        );
        runtime.run_pending();

        let state = context.state.lock();
        assert_eq!(state.machine, SyncState::TimeSync);
        assert_eq!(state.session_id, session);
        assert!(state.failure.is_none());
    }

    #[test]
    fn queued_limit_rejects_with_busy() {
        let (_runtime, _network, a, _b) = setup(SyncerConfig::default());
        a.syncer.set_queued_sync_limit(1).unwrap();
        assert_eq!(a.syncer.get_queued_sync_limit(), 1);

        let first = a
            .syncer
            .sync(SyncRequest::new(["device-b"], SyncMode::Push))
            .unwrap();
        assert_eq!(a.syncer.get_queued_sync_size(), 1);
        let rejected = a
            .syncer
            .sync(SyncRequest::new(["device-b"], SyncMode::Pull));
        assert_eq!(rejected.unwrap_err(), SyncError::Busy);
        assert_eq!(a.syncer.get_queued_sync_size(), 1);

        a.syncer.remove_sync_operation(first).unwrap();
        assert_eq!(a.syncer.get_queued_sync_size(), 0);
        assert!(a
            .syncer
            .sync(SyncRequest::new(["device-b"], SyncMode::Pull))
            .is_ok());
    }

    #[test]
    fn auto_syncs_do_not_count_against_limit() {
        let (_runtime, _network, a, _b) = setup(SyncerConfig::default());
        a.syncer.set_queued_sync_limit(1).unwrap();
        a.syncer
            .sync(SyncRequest::new(["device-b"], SyncMode::Push))
            .unwrap();
        assert!(a
            .syncer
            .sync(SyncRequest::new(["device-b"], SyncMode::Push).auto())
            .is_ok());
        assert_eq!(a.syncer.get_queued_sync_size(), 1);
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let (_runtime, _network, a, _b) = setup(SyncerConfig::default());
        let empty: [&str; 0] = [];
        assert!(matches!(
            a.syncer.sync(SyncRequest::new(empty, SyncMode::Push)),
            Err(SyncError::InvalidArgs(_))
        ));
        assert!(matches!(
            a.syncer
                .sync(SyncRequest::new(["device-b"], SyncMode::ResponsePull)),
            Err(SyncError::InvalidArgs(_))
        ));
        assert!(matches!(
            a.syncer
                .sync(SyncRequest::new(["device-b"], SyncMode::SubscribeQuery)),
            Err(SyncError::InvalidArgs(_))
        ));
        assert!(matches!(
            a.syncer.set_queued_sync_limit(0),
            Err(SyncError::InvalidArgs(_))
        ));
        assert!(matches!(
            a.syncer.remove_sync_operation(9999),
            Err(SyncError::InvalidArgs(_))
        ));
        assert_eq!(a.syncer.get_queued_sync_size(), 0);
    }

    #[test]
    fn sync_before_initialize_fails() {
        let runtime = Arc::new(ManualRuntime::new());
        let network = VirtualNetwork::new(runtime.clone());
        let syncer = GenericSyncer::new(network.join("a"), runtime, SyncerConfig::default());
        assert_eq!(
            syncer
                .sync(SyncRequest::new(["b"], SyncMode::Push))
                .unwrap_err(),
            SyncError::NotInitialized
        );
        assert!(matches!(
            syncer.initialize(None, true),
            Err(SyncError::InvalidArgs(_))
        ));
        assert_eq!(
            syncer.close(CloseReason::Closed).unwrap_err(),
            SyncError::NotInitialized
        );
    }

    #[test]
    fn local_only_and_dual_tuple_stores() {
        let runtime = Arc::new(ManualRuntime::new());
        let network = VirtualNetwork::new(runtime.clone());

        let local = GenericSyncer::new(network.join("a"), runtime.clone(), SyncerConfig::default());
        let storage = Arc::new(MemoryStorage::with_properties(
            DbProperties::new("local").with_local_only(),
        ));
        assert_eq!(
            local.initialize(Some(storage as Arc<dyn SyncStorage>), true).unwrap_err(),
            SyncError::NoNeedActive
        );
        assert!(local.engine_for_test().is_none());

        let dual = GenericSyncer::new(network.join("b"), runtime, SyncerConfig::default());
        let storage = Arc::new(MemoryStorage::with_properties(
            DbProperties::new("dual").with_dual_tuple("user-1"),
        ));
        assert_eq!(
            dual.initialize(Some(storage.clone() as Arc<dyn SyncStorage>), false).unwrap_err(),
            SyncError::NoNeedActive
        );
        assert!(dual.engine_for_test().is_some());
        assert!(dual.initialize(Some(storage as Arc<dyn SyncStorage>), false).is_ok());
    }

    #[test]
    fn manual_sync_can_be_disabled() {
        let (_runtime, _network, a, _b) = setup(SyncerConfig::default());
        let id = a
            .syncer
            .sync(SyncRequest::new(["device-b"], SyncMode::Push))
            .unwrap();
        assert_eq!(a.syncer.disable_manual_sync().unwrap_err(), SyncError::Busy);

        a.syncer.remove_sync_operation(id).unwrap();
        a.syncer.disable_manual_sync().unwrap();
        assert_eq!(
            a.syncer
                .sync(SyncRequest::new(["device-b"], SyncMode::Push))
                .unwrap_err(),
            SyncError::Busy
        );
        assert!(a
            .syncer
            .sync(SyncRequest::new(["device-b"], SyncMode::Push).auto())
            .is_ok());

        a.syncer.enable_manual_sync();
        assert!(a
            .syncer
            .sync(SyncRequest::new(["device-b"], SyncMode::Push))
            .is_ok());
    }

    #[test]
    fn close_finishes_blocking_sync_with_user_changed() {
        let config = SyncerConfig::default().with_kill_wait(Duration::from_millis(50));
        let (runtime, network, a, _b) = setup(config);
        network.add_filter(Arc::new(|_: &Envelope| true));

        let (result, on_complete) = capture();
        let syncer = Arc::clone(&a.syncer);
        let waiter = thread::spawn(move || {
            syncer.sync(
                SyncRequest::new(["device-b"], SyncMode::Push)
                    .with_wait(true)
                    .with_on_complete(on_complete),
            )
        });
        while watchdog(&a.syncer, "device-b").is_none() {
            runtime.run_pending();
            thread::yield_now();
        }

        a.syncer.close(CloseReason::UserChanged).unwrap();
        runtime.run_pending();
        assert!(waiter.join().unwrap().is_ok());
        let statuses = result.lock().clone().expect("callback ran");
        assert_eq!(statuses["device-b"], OperationStatus::UserChanged);
        assert_eq!(
            a.syncer
                .sync(SyncRequest::new(["device-b"], SyncMode::Push))
                .unwrap_err(),
            SyncError::NotInitialized
        );
    }

    #[test]
    fn user_change_finishes_queued_syncs_with_callback() {
        let (runtime, network, a, _b) = setup(SyncerConfig::default());
        network.add_filter(Arc::new(|_: &Envelope| true));

        let (result, on_complete) = capture();
        a.syncer
            .sync(SyncRequest::new(["device-b"], SyncMode::Push).with_on_complete(on_complete))
            .unwrap();
        runtime.run_pending();
        assert!(result.lock().is_none());
        assert_eq!(a.syncer.get_queued_sync_size(), 1);

        a.syncer.close(CloseReason::UserChanged).unwrap();
        runtime.run_pending();
        let statuses = result.lock().clone().expect("callback ran");
        assert_eq!(statuses["device-b"], OperationStatus::UserChanged);
        assert_eq!(a.syncer.get_queued_sync_size(), 0);
        assert!(a.syncer.operations.lock().is_empty());
    }

    #[test]
    fn close_cancels_queued_syncs_silently() {
        let (runtime, network, a, _b) = setup(SyncerConfig::default());
        network.add_filter(Arc::new(|_: &Envelope| true));

        let (result, on_complete) = capture();
        a.syncer
            .sync(SyncRequest::new(["device-b"], SyncMode::Push).with_on_complete(on_complete))
            .unwrap();
        runtime.run_pending();

        a.syncer.close(CloseReason::Closed).unwrap();
        runtime.run_pending();
        assert!(result.lock().is_none());
        assert!(a.syncer.operations.lock().is_empty());
    }

    #[test]
    fn peer_coming_online_triggers_auto_push() {
        let config = SyncerConfig::default().with_auto_sync_on_online(true);
        let (runtime, network, a, b) = setup(config);
        a.storage.put(b"k", b"v");

        network.set_online("device-b", false);
        runtime.run_pending();
        assert!(b.storage.get(b"k").is_none());

        network.set_online("device-b", true);
        runtime.run_pending();
        assert_eq!(b.storage.get(b"k"), Some(b"v".to_vec()));
    }

    #[test]
    fn stop_sync_cancels_connection_operations() {
        let (_runtime, _network, a, _b) = setup(SyncerConfig::default());
        let (result, on_complete) = capture();
        a.syncer
            .sync(
                SyncRequest::new(["device-b"], SyncMode::Push)
                    .with_connection_id(42)
                    .with_on_complete(on_complete),
            )
            .unwrap();
        assert_eq!(a.syncer.get_queued_sync_size(), 1);

        a.syncer.stop_sync(42).unwrap();
        assert_eq!(a.syncer.get_queued_sync_size(), 0);
        assert!(result.lock().is_none());
        assert!(a.syncer.operations.lock().is_empty());
    }

    #[test]
    fn dump_lists_operations() {
        let (_runtime, _network, a, _b) = setup(SyncerConfig::default());
        let id = a
            .syncer
            .sync(SyncRequest::new(["device-b"], SyncMode::Push))
            .unwrap();
        let dump = a.syncer.dump();
        assert!(dump.contains(&format!("sync {id}")));
        assert!(dump.contains("queued=1/"));
    }
}

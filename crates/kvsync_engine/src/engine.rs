//! Sync engine: owns the per-peer contexts and routes messages to them.

use crate::communicator::{mask_device, Communicator, SendConfig};
use crate::config::SyncerConfig;
use crate::error::{SyncError, SyncResult};
use crate::metadata::Metadata;
use crate::operation::SyncOperation;
use crate::remote_query::RemoteExecutor;
use crate::runtime::{ListenerId, PermissionFlags, Runtime};
use crate::state_table::StateTables;
use crate::task_context::{MachineInput, SyncTarget, SyncTaskContext};
use crate::time_helper::TimeHelper;
use kvsync_protocol::{
    AckCode, Message, MessageId, MessageType, Packet, QuerySpec, RemoteQueryRequest,
    RemoteQueryResponse,
};
use kvsync_storage::{DataItem, SyncStorage};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// State shared by the engine and every context.
pub(crate) struct EngineShared {
    pub(crate) storage: Arc<dyn SyncStorage>,
    pub(crate) communicator: Arc<dyn Communicator>,
    pub(crate) runtime: Arc<dyn Runtime>,
    pub(crate) metadata: Arc<Metadata>,
    pub(crate) time_helper: Arc<TimeHelper>,
    pub(crate) config: SyncerConfig,
    pub(crate) tables: StateTables,
    pub(crate) sync_retry: Arc<AtomicBool>,
    pub(crate) equal_identifiers: Arc<RwLock<HashMap<String, String>>>,
    pub(crate) remote: Arc<RemoteExecutor>,
    subscriptions: Mutex<HashMap<String, BTreeMap<String, QuerySpec>>>,
}

impl EngineShared {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        storage: Arc<dyn SyncStorage>,
        communicator: Arc<dyn Communicator>,
        runtime: Arc<dyn Runtime>,
        metadata: Arc<Metadata>,
        time_helper: Arc<TimeHelper>,
        config: SyncerConfig,
        tables: StateTables,
        sync_retry: Arc<AtomicBool>,
        equal_identifiers: Arc<RwLock<HashMap<String, String>>>,
    ) -> Self {
        Self {
            storage,
            communicator,
            runtime,
            metadata,
            time_helper,
            config,
            tables,
            sync_retry,
            equal_identifiers,
            remote: Arc::new(RemoteExecutor::new()),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn subscribe(&self, device: &str, query: QuerySpec) {
        info!(device = %mask_device(device), query = %query.id, "peer subscribed");
        self.subscriptions
            .lock()
            .entry(device.to_string())
            .or_default()
            .insert(query.id.clone(), query);
    }

    pub(crate) fn unsubscribe(&self, device: &str, query_id: &str) {
        let mut subscriptions = self.subscriptions.lock();
        if let Some(queries) = subscriptions.get_mut(device) {
            queries.remove(query_id);
            if queries.is_empty() {
                subscriptions.remove(device);
            }
        }
        info!(device = %mask_device(device), query = %query_id, "peer unsubscribed");
    }

    fn drop_subscriptions(&self, device: &str) {
        self.subscriptions.lock().remove(device);
    }

    /// Every `(device, query)` subscription held by peers.
    pub(crate) fn subscriptions(&self) -> Vec<(String, QuerySpec)> {
        self.subscriptions
            .lock()
            .iter()
            .flat_map(|(device, queries)| {
                queries
                    .values()
                    .map(move |query| (device.clone(), query.clone()))
            })
            .collect()
    }
}

/// Owns one [`SyncTaskContext`] per peer.
pub(crate) struct SyncEngine {
    shared: Arc<EngineShared>,
    contexts: Mutex<HashMap<String, Arc<SyncTaskContext>>>,
    time_listener: Mutex<Option<ListenerId>>,
    closed: AtomicBool,
}

impl SyncEngine {
    pub(crate) fn new(shared: EngineShared) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(shared),
            contexts: Mutex::new(HashMap::new()),
            time_listener: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    /// Subscribes to inbound messages and clock changes.
    pub(crate) fn start(self: &Arc<Self>) {
        let engine = Arc::downgrade(self);
        self.shared
            .communicator
            .register_message_callback(Some(Arc::new(move |device: &str, message: Message| {
                if let Some(engine) = engine.upgrade() {
                    engine.receive_message(device, message);
                }
            })));
        let engine = Arc::downgrade(self);
        let listener = self
            .shared
            .runtime
            .register_time_change_listener(Arc::new(move |change| {
                if let Some(engine) = engine.upgrade() {
                    engine.on_time_changed(change);
                }
            }));
        *self.time_listener.lock() = Some(listener);
    }

    pub(crate) fn receive_message(&self, device: &str, message: Message) {
        if self.closed.load(Ordering::SeqCst) {
            debug!(device = %mask_device(device), "engine closed, message dropped");
            return;
        }
        if message.id() == MessageId::RemoteExecute {
            self.on_remote_execute(device, message);
            return;
        }
        let context = self.context(device);
        context.set_comm_normal(true);
        context.post(MachineInput::Message(message));
    }

    fn on_time_changed(&self, change: i64) {
        if let Err(e) = self.shared.time_helper.on_time_changed(change) {
            warn!(error = %e, "local time offset not saved");
        }
        for context in self.contexts.lock().values() {
            context.time_sync.invalidate();
        }
    }

    fn context(&self, device: &str) -> Arc<SyncTaskContext> {
        let mut contexts = self.contexts.lock();
        Arc::clone(contexts.entry(device.to_string()).or_insert_with(|| {
            debug!(device = %mask_device(device), "context created");
            SyncTaskContext::new(device, Arc::clone(&self.shared))
        }))
    }

    fn existing_context(&self, device: &str) -> Option<Arc<SyncTaskContext>> {
        self.contexts.lock().get(device).cloned()
    }

    /// Queues `operation` on each of its devices.
    pub(crate) fn add_sync_operation(&self, operation: &Arc<SyncOperation>) -> SyncResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Busy);
        }
        for device in operation.devices() {
            self.context(device).add_sync_target(SyncTarget::Request {
                operation: Arc::clone(operation),
            });
        }
        Ok(())
    }

    /// Aborts the running tasks of `operation`; queued targets are skipped
    /// once the operation is killed.
    pub(crate) fn abort_operation(&self, operation: &SyncOperation) {
        for device in operation.devices() {
            if let Some(context) = self.existing_context(device) {
                context.post(MachineInput::Abort {
                    sync_id: operation.id(),
                });
            }
        }
    }

    pub(crate) fn online(&self, device: &str) {
        if let Some(context) = self.existing_context(device) {
            context.set_comm_normal(true);
        }
    }

    pub(crate) fn offline(&self, device: &str) {
        if let Some(context) = self.existing_context(device) {
            context.post(MachineInput::Offline);
        }
        self.shared.remote.cancel_device(device);
    }

    pub(crate) fn notify_connection_closed(&self, connection_id: u64) {
        self.shared.remote.cancel_connection(connection_id);
    }

    /// Forgets a peer: its context, subscriptions and cursors.
    pub(crate) fn erase_peer(&self, device: &str) -> SyncResult<()> {
        let context = self.contexts.lock().remove(device);
        if let Some(context) = context {
            context.kill_wait(self.shared.config.kill_wait);
        }
        self.shared.drop_subscriptions(device);
        self.shared.metadata.erase_device_water_mark(device)?;
        info!(device = %mask_device(device), "peer erased");
        Ok(())
    }

    pub(crate) fn remote_query(
        &self,
        device: &str,
        key_prefix: Vec<u8>,
        connection_id: u64,
    ) -> SyncResult<Vec<DataItem>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Busy);
        }
        let remote = Arc::clone(&self.shared.remote);
        remote.query(
            self.shared.communicator.as_ref(),
            device,
            key_prefix,
            connection_id,
            self.shared.config.remote_query_timeout,
        )
    }

    fn on_remote_execute(&self, device: &str, message: Message) {
        let Message {
            kind,
            session_id,
            sequence_id,
            packet,
        } = message;
        match (kind, packet) {
            (MessageType::Request, Packet::RemoteQueryRequest(request)) => {
                self.answer_remote_query(device, session_id, sequence_id, request);
            }
            (MessageType::Response, Packet::RemoteQueryResponse(response)) => {
                self.shared.remote.on_response(response);
            }
            (kind, _) => debug!(device = %mask_device(device), ?kind, "malformed remote query dropped"),
        }
    }

    fn answer_remote_query(
        &self,
        device: &str,
        session_id: u32,
        sequence_id: u32,
        request: RemoteQueryRequest,
    ) {
        let (code, items) = if !self
            .shared
            .runtime
            .check_permission(device, PermissionFlags::SEND)
        {
            (AckCode::PermissionDenied, Vec::new())
        } else {
            match self.shared.storage.query(&request.key_prefix) {
                Ok(items) => (AckCode::Ok, items),
                Err(e) => {
                    warn!(device = %mask_device(device), error = %e, "remote query failed");
                    (SyncError::from(e).ack_code(), Vec::new())
                }
            }
        };
        let reply = Message {
            kind: MessageType::Response,
            session_id,
            sequence_id,
            packet: Packet::RemoteQueryResponse(RemoteQueryResponse {
                request_id: request.request_id,
                code,
                items,
            }),
        };
        let config = SendConfig::new(self.shared.communicator.timeout(device));
        if let Err(e) = self
            .shared
            .communicator
            .send_message(device, reply, &config, None)
        {
            debug!(device = %mask_device(device), error = %e, "remote query reply not sent");
        }
    }

    /// Devices that subscribed `query`-restricted pushes, with their queries.
    pub(crate) fn subscribers(&self) -> Vec<(String, QuerySpec)> {
        self.shared.subscriptions()
    }

    /// Stops every context and fails outstanding remote queries.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.communicator.register_message_callback(None);
        if let Some(listener) = self.time_listener.lock().take() {
            self.shared.runtime.unregister_time_change_listener(listener);
        }
        let contexts: Vec<Arc<SyncTaskContext>> =
            self.contexts.lock().drain().map(|(_, context)| context).collect();
        for context in contexts {
            context.kill_wait(self.shared.config.kill_wait);
        }
        self.shared.remote.cancel_all();
        info!("sync engine closed");
    }

    pub(crate) fn dump(&self) -> String {
        let contexts = self.contexts.lock();
        let mut devices: Vec<&String> = contexts.keys().collect();
        devices.sort();
        let mut out = format!(
            "engine: contexts={} subscriptions={} pending_remote_queries={}\n",
            contexts.len(),
            self.shared.subscriptions().len(),
            self.shared.remote.pending_count()
        );
        for device in devices {
            if let Some(context) = contexts.get(device) {
                out.push_str("  ");
                out.push_str(&context.dump());
                out.push('\n');
            }
        }
        out
    }

    #[cfg(test)]
    pub(crate) fn context_for_test(&self, device: &str) -> Option<Arc<SyncTaskContext>> {
        self.existing_context(device)
    }
}

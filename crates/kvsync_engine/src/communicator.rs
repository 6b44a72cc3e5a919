//! Message transport consumed by the engine.

use crate::error::{SyncError, SyncResult};
use crate::runtime::Runtime;
use kvsync_protocol::Message;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Receives `(source device, message)`.
pub type MessageHandler = Arc<dyn Fn(&str, Message) + Send + Sync>;

/// Receives `(device, online)`.
pub type ConnectHandler = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Called when a message accepted for sending could not be delivered.
pub type SendErrorHandler = Box<dyn FnOnce(SyncError) + Send>;

/// Default round-trip budget for one message exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default maximum packet size.
pub const DEFAULT_MTU: usize = 5 * 1024 * 1024;

/// Masks a device id for logging.
pub fn mask_device(device: &str) -> String {
    let prefix: String = device.chars().take(4).collect();
    format!("{prefix}***")
}

/// Options for one send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendConfig {
    /// Fail instead of waiting when the link is congested.
    pub non_block: bool,
    /// How long the communicator may try to deliver.
    pub timeout: Duration,
    /// Identifier placed in the extended header (dual-tuple stores).
    pub extended_identifier: Option<String>,
}

impl SendConfig {
    /// Creates a blocking send with the given timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            non_block: false,
            timeout,
            extended_identifier: None,
        }
    }

    /// Sets the extended header identifier.
    pub fn with_extended_identifier(mut self, identifier: Option<String>) -> Self {
        self.extended_identifier = identifier;
        self
    }
}

impl Default for SendConfig {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

/// Message transport between peers.
///
/// Implementations own connection management; the engine only sees
/// device ids, messages and online/offline events.
pub trait Communicator: Send + Sync {
    /// Sends a message.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::CommunicationAbnormal`] when the message cannot be
    /// accepted. Failures discovered after acceptance are reported through
    /// `on_error`.
    fn send_message(
        &self,
        target: &str,
        message: Message,
        config: &SendConfig,
        on_error: Option<SendErrorHandler>,
    ) -> SyncResult<()>;

    /// Installs (or with `None` clears) the inbound message handler.
    fn register_message_callback(&self, handler: Option<MessageHandler>);

    /// Installs (or with `None` clears) the online/offline handler.
    fn register_connect_callback(&self, handler: Option<ConnectHandler>);

    /// Round-trip budget for one exchange with `target`.
    fn timeout(&self, target: &str) -> Duration;

    /// Maximum packet size towards `target`.
    fn mtu_size(&self, target: &str) -> usize;

    /// Whether `target` is currently reachable.
    fn is_device_online(&self, target: &str) -> bool;

    /// Identity of the local device.
    fn local_identity(&self) -> SyncResult<String>;
}

/// A message as seen by [`VirtualNetwork`] filters.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Sending device.
    pub from: String,
    /// Receiving device.
    pub to: String,
    /// Decoded message.
    pub message: Message,
    /// Extended header identifier, if any.
    pub extended_identifier: Option<String>,
}

/// Returns true to drop a message.
pub type MessageFilter = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

struct Delivery {
    from: String,
    bytes: Vec<u8>,
    on_error: Option<SendErrorHandler>,
}

#[derive(Default)]
struct NodeState {
    message_handler: RwLock<Option<MessageHandler>>,
    connect_handler: RwLock<Option<ConnectHandler>>,
    inbox: Mutex<NodeInbox>,
}

#[derive(Default)]
struct NodeInbox {
    pending: VecDeque<Delivery>,
    draining: bool,
}

/// An in-process network of [`VirtualCommunicator`]s.
///
/// Messages are CBOR-encoded on send and decoded on delivery. Delivery runs
/// on the supplied runtime and is FIFO per receiving device.
pub struct VirtualNetwork {
    runtime: Arc<dyn Runtime>,
    nodes: RwLock<HashMap<String, Arc<NodeState>>>,
    offline: RwLock<HashSet<String>>,
    filters: RwLock<Vec<MessageFilter>>,
    timeout: RwLock<Duration>,
    mtu: usize,
    sent: Mutex<u64>,
}

impl VirtualNetwork {
    /// Creates an empty network delivering on `runtime`.
    pub fn new(runtime: Arc<dyn Runtime>) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            nodes: RwLock::new(HashMap::new()),
            offline: RwLock::new(HashSet::new()),
            filters: RwLock::new(Vec::new()),
            timeout: RwLock::new(DEFAULT_TIMEOUT),
            mtu: DEFAULT_MTU,
            sent: Mutex::new(0),
        })
    }

    /// Adds a device and returns its communicator.
    pub fn join(self: &Arc<Self>, device: impl Into<String>) -> Arc<VirtualCommunicator> {
        let device = device.into();
        self.nodes
            .write()
            .entry(device.clone())
            .or_insert_with(|| Arc::new(NodeState::default()));
        Arc::new(VirtualCommunicator {
            network: Arc::clone(self),
            device,
        })
    }

    /// Sets the per-exchange timeout reported to every device.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.write() = timeout;
    }

    /// Takes a device on or off the network and notifies the others.
    pub fn set_online(&self, device: &str, online: bool) {
        let changed = if online {
            self.offline.write().remove(device)
        } else {
            self.offline.write().insert(device.to_string())
        };
        if !changed {
            return;
        }
        debug!(device = %mask_device(device), online, "virtual device state changed");
        let nodes: Vec<(String, Arc<NodeState>)> = self
            .nodes
            .read()
            .iter()
            .filter(|(name, _)| name.as_str() != device)
            .map(|(name, node)| (name.clone(), Arc::clone(node)))
            .collect();
        for (_, node) in nodes {
            let Some(handler) = node.connect_handler.read().clone() else {
                continue;
            };
            let device = device.to_string();
            let _ = self
                .runtime
                .schedule_task(Box::new(move || handler(&device, online)));
        }
    }

    /// Whether a device is joined and online.
    pub fn is_online(&self, device: &str) -> bool {
        self.nodes.read().contains_key(device) && !self.offline.read().contains(device)
    }

    /// Adds a filter; messages for which any filter returns true are dropped.
    pub fn add_filter(&self, filter: MessageFilter) {
        self.filters.write().push(filter);
    }

    /// Removes every filter.
    pub fn clear_filters(&self) {
        self.filters.write().clear();
    }

    /// Number of messages accepted for delivery.
    pub fn sent_count(&self) -> u64 {
        *self.sent.lock()
    }

    fn send(
        &self,
        from: &str,
        to: &str,
        message: Message,
        config: &SendConfig,
        on_error: Option<SendErrorHandler>,
    ) -> SyncResult<()> {
        if !self.is_online(from) || !self.is_online(to) {
            return Err(SyncError::CommunicationAbnormal);
        }
        let envelope = Envelope {
            from: from.to_string(),
            to: to.to_string(),
            message,
            extended_identifier: config.extended_identifier.clone(),
        };
        if self.filters.read().iter().any(|filter| filter(&envelope)) {
            trace!(from = %mask_device(from), to = %mask_device(to), "message dropped by filter");
            return Ok(());
        }
        let bytes = envelope.message.encode()?;
        let node = self
            .nodes
            .read()
            .get(to)
            .cloned()
            .ok_or(SyncError::CommunicationAbnormal)?;
        *self.sent.lock() += 1;

        let start_drain = {
            let mut inbox = node.inbox.lock();
            inbox.pending.push_back(Delivery {
                from: from.to_string(),
                bytes,
                on_error,
            });
            !std::mem::replace(&mut inbox.draining, true)
        };
        if start_drain {
            let drained = Arc::clone(&node);
            let runtime = Arc::clone(&self.runtime);
            let scheduled = self.runtime.schedule_task(Box::new(move || {
                drain_node(&drained, runtime.as_ref());
            }));
            if let Err(e) = scheduled {
                let mut inbox = node.inbox.lock();
                inbox.pending.clear();
                inbox.draining = false;
                return Err(e);
            }
        }
        Ok(())
    }
}

fn drain_node(node: &NodeState, runtime: &dyn Runtime) {
    loop {
        let delivery = {
            let mut inbox = node.inbox.lock();
            match inbox.pending.pop_front() {
                Some(delivery) => delivery,
                None => {
                    inbox.draining = false;
                    return;
                }
            }
        };
        let handler = node.message_handler.read().clone();
        match (handler, Message::decode(&delivery.bytes)) {
            (Some(handler), Ok(message)) => handler(&delivery.from, message),
            (handler, decoded) => {
                let error = match decoded {
                    Err(e) => SyncError::from(e),
                    Ok(_) if handler.is_none() => SyncError::CommunicationAbnormal,
                    Ok(_) => SyncError::inner("undeliverable message"),
                };
                if let Some(on_error) = delivery.on_error {
                    let _ = runtime.schedule_task(Box::new(move || on_error(error)));
                }
            }
        }
    }
}

/// A [`Communicator`] attached to a [`VirtualNetwork`].
pub struct VirtualCommunicator {
    network: Arc<VirtualNetwork>,
    device: String,
}

impl VirtualCommunicator {
    /// The network this communicator is attached to.
    pub fn network(&self) -> &Arc<VirtualNetwork> {
        &self.network
    }

    fn node(&self) -> Option<Arc<NodeState>> {
        self.network.nodes.read().get(&self.device).cloned()
    }
}

impl Communicator for VirtualCommunicator {
    fn send_message(
        &self,
        target: &str,
        message: Message,
        config: &SendConfig,
        on_error: Option<SendErrorHandler>,
    ) -> SyncResult<()> {
        self.network
            .send(&self.device, target, message, config, on_error)
    }

    fn register_message_callback(&self, handler: Option<MessageHandler>) {
        if let Some(node) = self.node() {
            *node.message_handler.write() = handler;
        }
    }

    fn register_connect_callback(&self, handler: Option<ConnectHandler>) {
        if let Some(node) = self.node() {
            *node.connect_handler.write() = handler;
        }
    }

    fn timeout(&self, _target: &str) -> Duration {
        *self.network.timeout.read()
    }

    fn mtu_size(&self, _target: &str) -> usize {
        self.network.mtu
    }

    fn is_device_online(&self, target: &str) -> bool {
        self.network.is_online(target)
    }

    fn local_identity(&self) -> SyncResult<String> {
        Ok(self.device.clone())
    }
}

//! Peer fixtures and helpers.
//!
//! Provides in-process peers that sync over a shared virtual network on a
//! real tokio-backed runtime.

use kvsync_engine::{
    CompletionCallback, GenericSyncer, OperationStatus, SyncRegistry, SyncRequest, SyncResult,
    SyncerConfig, TokioRuntime, VirtualNetwork,
};
use kvsync_protocol::{QuerySpec, SyncMode};
use kvsync_storage::{DbProperties, MemoryStorage, SyncStorage};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

/// Statuses reported to a completion callback.
pub type Statuses = BTreeMap<String, OperationStatus>;

/// A network of test peers sharing one runtime and one sync id registry.
pub struct TestNetwork {
    /// The runtime every peer schedules on.
    pub runtime: Arc<TokioRuntime>,
    /// The virtual network connecting the peers.
    pub network: Arc<VirtualNetwork>,
    registry: Arc<SyncRegistry>,
    config: SyncerConfig,
}

impl TestNetwork {
    /// Creates a network with the default syncer configuration.
    pub fn new() -> Self {
        Self::with_config(SyncerConfig::default())
    }

    /// Creates a network whose peers use `config`.
    pub fn with_config(config: SyncerConfig) -> Self {
        init_test_logging();
        let runtime = Arc::new(TokioRuntime::new().expect("Failed to start runtime"));
        let network = VirtualNetwork::new(runtime.clone());
        Self {
            runtime,
            network,
            registry: Arc::new(SyncRegistry::new()),
            config,
        }
    }

    /// Adds an initialized peer with an empty store.
    pub fn peer(&self, device: &str) -> TestPeer {
        self.peer_with_storage(device, MemoryStorage::new("kvsync-test"))
    }

    /// Adds an initialized peer backed by `storage`.
    pub fn peer_with_storage(&self, device: &str, storage: MemoryStorage) -> TestPeer {
        let peer = self.uninitialized_peer(device, storage);
        peer.syncer
            .initialize(Some(peer.storage.clone() as Arc<dyn SyncStorage>), true)
            .expect("Failed to initialize syncer");
        peer
    }

    /// Adds a peer whose syncer has not been initialized.
    pub fn uninitialized_peer(&self, device: &str, storage: MemoryStorage) -> TestPeer {
        let storage = Arc::new(storage);
        let syncer = GenericSyncer::with_registry(
            self.network.join(device),
            self.runtime.clone(),
            self.config.clone(),
            Arc::clone(&self.registry),
        );
        TestPeer {
            device: device.to_string(),
            storage,
            syncer,
        }
    }

    /// Takes a device on or off the network.
    pub fn set_online(&self, device: &str, online: bool) {
        self.network.set_online(device, online);
    }
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One device: its store and its syncer.
pub struct TestPeer {
    /// Device identity on the network.
    pub device: String,
    /// The peer's store.
    pub storage: Arc<MemoryStorage>,
    /// The peer's syncer.
    pub syncer: Arc<GenericSyncer>,
}

impl TestPeer {
    /// Runs a blocking sync and returns the per-device statuses.
    pub fn sync_and_wait(&self, devices: &[&str], mode: SyncMode) -> SyncResult<Statuses> {
        self.run_blocking(SyncRequest::new(devices.iter().copied(), mode))
    }

    /// Runs a blocking query-restricted sync.
    pub fn query_sync_and_wait(
        &self,
        devices: &[&str],
        mode: SyncMode,
        query: QuerySpec,
    ) -> SyncResult<Statuses> {
        self.run_blocking(SyncRequest::new(devices.iter().copied(), mode).with_query(query))
    }

    fn run_blocking(&self, request: SyncRequest) -> SyncResult<Statuses> {
        let (slot, callback) = status_slot();
        self.syncer
            .sync(request.with_wait(true).with_on_complete(callback))?;
        let statuses = slot.lock().take().unwrap_or_default();
        Ok(statuses)
    }

    /// Starts a non-blocking sync; the returned slot fills on completion.
    pub fn sync_async(
        &self,
        devices: &[&str],
        mode: SyncMode,
    ) -> SyncResult<(u32, Arc<Mutex<Option<Statuses>>>)> {
        let (slot, callback) = status_slot();
        let id = self.syncer.sync(
            SyncRequest::new(devices.iter().copied(), mode).with_on_complete(callback),
        )?;
        Ok((id, slot))
    }
}

fn status_slot() -> (Arc<Mutex<Option<Statuses>>>, CompletionCallback) {
    let slot = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&slot);
    let callback: CompletionCallback = Box::new(move |statuses: &Statuses| {
        *sink.lock() = Some(statuses.clone());
    });
    (slot, callback)
}

/// Creates a store with the given records already written.
pub fn populated_storage(records: &[(&[u8], &[u8])]) -> MemoryStorage {
    let storage = MemoryStorage::new("kvsync-test");
    for (key, value) in records {
        storage.put(key, value);
    }
    storage
}

/// Creates a store with explicit properties.
pub fn storage_with_properties(properties: DbProperties) -> MemoryStorage {
    MemoryStorage::with_properties(properties)
}

/// Polls `condition` until it holds or `timeout` elapses. Returns whether
/// it held.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Installs a test-friendly tracing subscriber once per process.
///
/// Honors `RUST_LOG`; silent by default.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

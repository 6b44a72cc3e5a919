//! End-to-end sync between in-process peers.

use kvsync_engine::{
    CloseReason, Metadata, OperationStatus, PermissionFlags, Runtime, SyncError, SyncRequest,
    SyncerConfig,
};
use kvsync_protocol::{QuerySpec, SyncMode};
use kvsync_storage::{SecurityLabel, SecurityOption, SyncStorage};
use kvsync_testkit::prelude::*;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

fn peer_water_mark(peer: &TestPeer, device: &str) -> u64 {
    let metadata = Metadata::new(peer.storage.clone() as Arc<dyn SyncStorage>, 16);
    metadata.initialize().unwrap();
    metadata.get_peer_water_mark(device)
}

#[test]
fn push_delivers_records_and_advances_water_mark() {
    let net = TestNetwork::new();
    let a = net.peer("a");
    let b = net.peer("b");
    a.storage.put(b"k1", b"v1");
    a.storage.put(b"k2", b"v2");

    let statuses = a.sync_and_wait(&["b"], SyncMode::Push).unwrap();
    assert_eq!(statuses["b"], OperationStatus::FinishedAll);
    assert_eq!(b.storage.get(b"k1"), Some(b"v1".to_vec()));
    assert_eq!(b.storage.get(b"k2"), Some(b"v2".to_vec()));
    assert!(peer_water_mark(&a, "b") > 0);
}

#[test]
fn pull_fetches_peer_records() {
    let net = TestNetwork::new();
    let a = net.peer("a");
    let b = net.peer_with_storage("b", populated_storage(&[(b"remote", b"value")]));

    let statuses = a.sync_and_wait(&["b"], SyncMode::Pull).unwrap();
    assert_eq!(statuses["b"], OperationStatus::FinishedAll);
    assert_eq!(a.storage.get(b"remote"), Some(b"value".to_vec()));
    assert!(b.storage.get(b"remote").is_some());
}

#[test]
fn push_and_pull_exchanges_both_ways() {
    let net = TestNetwork::new();
    let a = net.peer_with_storage("a", populated_storage(&[(b"from-a", b"1")]));
    let b = net.peer_with_storage("b", populated_storage(&[(b"from-b", b"2")]));

    let statuses = a.sync_and_wait(&["b"], SyncMode::PushAndPull).unwrap();
    assert_eq!(statuses["b"], OperationStatus::FinishedAll);
    assert_eq!(a.storage.get(b"from-b"), Some(b"2".to_vec()));
    assert_eq!(b.storage.get(b"from-a"), Some(b"1".to_vec()));
}

#[test]
fn second_push_sends_only_new_records() {
    let net = TestNetwork::new();
    let a = net.peer("a");
    let b = net.peer("b");
    a.storage.put(b"k1", b"v1");
    a.sync_and_wait(&["b"], SyncMode::Push).unwrap();
    let first = peer_water_mark(&a, "b");

    a.storage.put(b"k2", b"v2");
    let statuses = a.sync_and_wait(&["b"], SyncMode::Push).unwrap();
    assert_eq!(statuses["b"], OperationStatus::FinishedAll);
    assert!(peer_water_mark(&a, "b") > first);
    assert_eq!(b.storage.get(b"k2"), Some(b"v2".to_vec()));
}

#[test]
fn deletes_propagate() {
    let net = TestNetwork::new();
    let a = net.peer("a");
    let b = net.peer("b");
    a.storage.put(b"gone", b"soon");
    a.sync_and_wait(&["b"], SyncMode::Push).unwrap();
    assert!(b.storage.get(b"gone").is_some());

    a.storage.delete(b"gone");
    a.sync_and_wait(&["b"], SyncMode::Push).unwrap();
    assert!(b.storage.get(b"gone").is_none());
}

#[test]
fn unreachable_device_fails_alone() {
    let net = TestNetwork::new();
    let a = net.peer("a");
    let b = net.peer("b");
    a.storage.put(b"k", b"v");

    let statuses = a.sync_and_wait(&["b", "ghost"], SyncMode::Push).unwrap();
    assert_eq!(statuses["b"], OperationStatus::FinishedAll);
    assert_eq!(statuses["ghost"], OperationStatus::CommAbnormal);
    assert_eq!(b.storage.get(b"k"), Some(b"v".to_vec()));
}

#[test]
fn security_label_mismatch_is_refused() {
    let net = TestNetwork::new();
    let a = net.peer("a");
    a.storage
        .set_security_option(SecurityOption::new(SecurityLabel::S1, 0));
    let b = net.peer("b");
    b.storage
        .set_security_option(SecurityOption::new(SecurityLabel::S3, 0));
    a.storage.put(b"secret", b"v");

    let statuses = a.sync_and_wait(&["b"], SyncMode::Push).unwrap();
    assert_eq!(statuses["b"], OperationStatus::SecurityOptionCheckFailure);
    assert!(b.storage.get(b"secret").is_none());
}

#[test]
fn schema_mismatch_is_refused() {
    let net = TestNetwork::new();
    let a = net.peer("a");
    a.storage.set_schema("users-v1");
    let b = net.peer("b");
    b.storage.set_schema("users-v2");

    let statuses = a.sync_and_wait(&["b"], SyncMode::Push).unwrap();
    assert_eq!(statuses["b"], OperationStatus::SchemaIncompatible);
}

#[test]
fn permission_hook_blocks_sync() {
    let net = TestNetwork::new();
    let a = net.peer("a");
    let _b = net.peer("b");
    net.runtime
        .hooks()
        .set_permission_check(Some(Arc::new(|_: &str, _: PermissionFlags| false)));

    let statuses = a.sync_and_wait(&["b"], SyncMode::Push).unwrap();
    assert_eq!(statuses["b"], OperationStatus::PermissionCheckFailed);
}

#[test]
fn query_sync_sends_only_matching_records() {
    let net = TestNetwork::new();
    let a = net.peer_with_storage(
        "a",
        populated_storage(&[(b"user/1", b"alice"), (b"order/1", b"book")]),
    );
    let b = net.peer("b");

    let statuses = a
        .query_sync_and_wait(&["b"], SyncMode::Push, QuerySpec::new("users", b"user/".to_vec()))
        .unwrap();
    assert_eq!(statuses["b"], OperationStatus::FinishedAll);
    assert_eq!(b.storage.get(b"user/1"), Some(b"alice".to_vec()));
    assert!(b.storage.get(b"order/1").is_none());
}

#[test]
fn subscription_drives_pushes_until_unsubscribed() {
    let net = TestNetwork::new();
    let a = net.peer("a");
    let b = net.peer("b");
    let query = QuerySpec::new("users", b"user/".to_vec());

    let statuses = a
        .query_sync_and_wait(&["b"], SyncMode::SubscribeQuery, query.clone())
        .unwrap();
    assert_eq!(statuses["b"], OperationStatus::FinishedAll);

    b.storage.put(b"user/2", b"bob");
    b.storage.put(b"order/2", b"pen");
    let started = b.syncer.local_data_changed().unwrap();
    assert_eq!(started.len(), 1);
    assert!(wait_until(WAIT, || a.storage.get(b"user/2").is_some()));
    assert!(a.storage.get(b"order/2").is_none());

    let statuses = a
        .query_sync_and_wait(&["b"], SyncMode::UnsubscribeQuery, query)
        .unwrap();
    assert_eq!(statuses["b"], OperationStatus::FinishedAll);
    assert!(b.syncer.local_data_changed().unwrap().is_empty());
}

#[test]
fn remote_query_reads_peer_store() {
    let net = TestNetwork::new();
    let a = net.peer("a");
    let _b = net.peer_with_storage(
        "b",
        populated_storage(&[(b"user/1", b"alice"), (b"user/2", b"bob"), (b"order/1", b"x")]),
    );

    let items = a.syncer.remote_query("b", b"user/", 1).unwrap();
    let keys: Vec<&[u8]> = items.iter().map(|item| item.key.as_slice()).collect();
    assert_eq!(keys, vec![b"user/1".as_slice(), b"user/2".as_slice()]);

    assert_eq!(
        a.syncer.remote_query("nobody", b"user/", 1).unwrap_err(),
        SyncError::CommunicationAbnormal
    );
}

#[test]
fn peer_coming_online_gets_auto_push() {
    let net = TestNetwork::with_config(SyncerConfig::default().with_auto_sync_on_online(true));
    let a = net.peer("a");
    let b = net.peer("b");
    a.storage.put(b"k", b"v");

    net.set_online("b", false);
    net.set_online("b", true);
    assert!(wait_until(WAIT, || b.storage.get(b"k").is_some()));
}

#[test]
fn erase_peer_restarts_from_scratch() {
    let net = TestNetwork::new();
    let a = net.peer("a");
    let _b = net.peer("b");
    a.storage.put(b"k", b"v");
    a.sync_and_wait(&["b"], SyncMode::Push).unwrap();
    assert!(peer_water_mark(&a, "b") > 0);

    a.syncer.erase_peer("b").unwrap();
    assert_eq!(peer_water_mark(&a, "b"), 0);

    let statuses = a.sync_and_wait(&["b"], SyncMode::Push).unwrap();
    assert_eq!(statuses["b"], OperationStatus::FinishedAll);
    assert!(peer_water_mark(&a, "b") > 0);
}

#[test]
fn close_rejects_further_work() {
    let net = TestNetwork::new();
    let a = net.peer("a");
    let _b = net.peer("b");
    a.syncer.close(CloseReason::Closed).unwrap();

    assert_eq!(
        a.syncer
            .sync(SyncRequest::new(["b"], SyncMode::Push))
            .unwrap_err(),
        SyncError::NotInitialized
    );
    assert_eq!(
        a.syncer.close(CloseReason::Closed).unwrap_err(),
        SyncError::NotInitialized
    );
    assert!(a.syncer.get_timestamp().is_err());
}

#[test]
fn concurrent_requests_get_unique_ids() {
    let net = TestNetwork::new();
    let a = net.peer("a");
    let _b = net.peer("b");
    a.syncer.set_queued_sync_limit(10).unwrap();

    let config = StressConfig {
        threads: 4,
        requests_per_thread: 10,
        mode: SyncMode::Push,
    };
    let result = concurrent_syncs(&a, &["b"], &config);
    assert!(result.ids_unique());
    assert_eq!(result.failed, 0);
    assert_eq!(result.accepted.len() + result.busy, 40);
    assert!(wait_until(WAIT, || a.syncer.get_queued_sync_size() == 0));
}

#[test]
fn timestamps_increase() {
    let net = TestNetwork::new();
    let a = net.peer("a");
    let first = a.syncer.get_timestamp().unwrap();
    let second = a.syncer.get_timestamp().unwrap();
    assert!(second > first);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn push_converges_to_sender_contents(writes in writes_strategy(24)) {
        let net = TestNetwork::new();
        let a = net.peer("a");
        let b = net.peer("b");
        for (key, value) in &writes {
            match value {
                Some(value) => {
                    a.storage.put(key, value);
                }
                None => {
                    a.storage.delete(key);
                }
            }
        }

        let statuses = a.sync_and_wait(&["b"], SyncMode::Push).unwrap();
        prop_assert_eq!(statuses["b"], OperationStatus::FinishedAll);
        for (key, value) in expected_contents(&writes) {
            prop_assert_eq!(b.storage.get(&key), Some(value));
        }
        for (key, value) in &writes {
            if value.is_none() && !expected_contents(&writes).contains_key(key) {
                prop_assert!(b.storage.get(key).is_none());
            }
        }
    }
}

//! Property-based test generators using proptest.
//!
//! Provides strategies for generating store contents and sync requests.

use kvsync_protocol::SyncMode;
use proptest::prelude::*;

/// One generated write: a put, or a delete when `value` is `None`.
pub type WriteOp = (Vec<u8>, Option<Vec<u8>>);

/// Strategy for generating record keys.
pub fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::string::string_regex("[a-z]{1,3}/[a-z0-9]{1,8}")
        .expect("Invalid regex")
        .prop_map(String::into_bytes)
}

/// Strategy for generating record values.
pub fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..256)
}

/// Strategy for a sequence of writes; roughly one in five is a delete.
pub fn writes_strategy(max_len: usize) -> impl Strategy<Value = Vec<WriteOp>> {
    prop::collection::vec(
        (
            key_strategy(),
            prop_oneof![4 => value_strategy().prop_map(Some), 1 => Just(None)],
        ),
        1..max_len.max(2),
    )
}

/// Strategy for device identities.
pub fn device_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("device-[a-f0-9]{4,12}").expect("Invalid regex")
}

/// Strategy for modes an application may request without a query.
pub fn data_mode_strategy() -> impl Strategy<Value = SyncMode> {
    prop_oneof![
        Just(SyncMode::Push),
        Just(SyncMode::Pull),
        Just(SyncMode::PushAndPull),
    ]
}

/// Final live contents after applying `writes` in order.
pub fn expected_contents(writes: &[WriteOp]) -> std::collections::BTreeMap<Vec<u8>, Vec<u8>> {
    let mut contents = std::collections::BTreeMap::new();
    for (key, value) in writes {
        match value {
            Some(value) => {
                contents.insert(key.clone(), value.clone());
            }
            None => {
                contents.remove(key);
            }
        }
    }
    contents
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn keys_have_a_prefix(key in key_strategy()) {
            prop_assert!(key.contains(&b'/'));
        }

        #[test]
        fn last_write_wins(writes in writes_strategy(32)) {
            let contents = expected_contents(&writes);
            for (key, _) in &writes {
                let latest = writes
                    .iter()
                    .rev()
                    .find(|(k, _)| k == key)
                    .and_then(|(_, v)| v.as_ref());
                prop_assert_eq!(contents.get(key), latest);
            }
        }
    }
}

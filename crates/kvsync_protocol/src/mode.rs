//! Sync modes.

use serde::{Deserialize, Serialize};

/// Direction and semantics of one sync task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncMode {
    /// Send local changes to the peer.
    Push,
    /// Fetch the peer's changes.
    Pull,
    /// Push, then pull.
    PushAndPull,
    /// Register a query subscription on the peer.
    SubscribeQuery,
    /// Remove a query subscription from the peer.
    UnsubscribeQuery,
    /// Passive reply to a pull started by the peer.
    ResponsePull,
}

impl SyncMode {
    /// Converts to a numeric code.
    pub fn to_code(&self) -> u8 {
        match self {
            SyncMode::Push => 0,
            SyncMode::Pull => 1,
            SyncMode::PushAndPull => 2,
            SyncMode::SubscribeQuery => 3,
            SyncMode::UnsubscribeQuery => 4,
            SyncMode::ResponsePull => 5,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(SyncMode::Push),
            1 => Some(SyncMode::Pull),
            2 => Some(SyncMode::PushAndPull),
            3 => Some(SyncMode::SubscribeQuery),
            4 => Some(SyncMode::UnsubscribeQuery),
            5 => Some(SyncMode::ResponsePull),
            _ => None,
        }
    }

    /// Modes a caller may request; `ResponsePull` is engine-internal.
    pub fn is_requestable(&self) -> bool {
        !matches!(self, SyncMode::ResponsePull)
    }

    /// Modes counted as manual syncs against the queued-sync limit.
    pub fn is_manual(&self) -> bool {
        matches!(
            self,
            SyncMode::Push
                | SyncMode::Pull
                | SyncMode::PushAndPull
                | SyncMode::SubscribeQuery
                | SyncMode::UnsubscribeQuery
        )
    }

    /// Subscribe or unsubscribe.
    pub fn is_control(&self) -> bool {
        matches!(self, SyncMode::SubscribeQuery | SyncMode::UnsubscribeQuery)
    }

    /// Whether the task sends local data.
    pub fn sends_data(&self) -> bool {
        matches!(
            self,
            SyncMode::Push | SyncMode::PushAndPull | SyncMode::ResponsePull
        )
    }

    /// Whether the task expects data back from the peer.
    pub fn receives_data(&self) -> bool {
        matches!(self, SyncMode::Pull | SyncMode::PushAndPull)
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncMode::Push => "PUSH",
            SyncMode::Pull => "PULL",
            SyncMode::PushAndPull => "PUSH_AND_PULL",
            SyncMode::SubscribeQuery => "SUBSCRIBE_QUERY",
            SyncMode::UnsubscribeQuery => "UNSUBSCRIBE_QUERY",
            SyncMode::ResponsePull => "RESPONSE_PULL",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_codes() {
        for code in 0..6u8 {
            let mode = SyncMode::from_code(code).unwrap();
            assert_eq!(mode.to_code(), code);
        }
        assert_eq!(SyncMode::from_code(6), None);
    }

    #[test]
    fn response_pull_is_internal() {
        assert!(!SyncMode::ResponsePull.is_requestable());
        assert!(!SyncMode::ResponsePull.is_manual());
        assert!(SyncMode::Push.is_requestable());
        assert!(SyncMode::SubscribeQuery.is_manual());
    }

    #[test]
    fn direction_flags() {
        assert!(SyncMode::Push.sends_data());
        assert!(!SyncMode::Push.receives_data());
        assert!(!SyncMode::Pull.sends_data());
        assert!(SyncMode::Pull.receives_data());
        assert!(SyncMode::PushAndPull.sends_data() && SyncMode::PushAndPull.receives_data());
        assert!(SyncMode::UnsubscribeQuery.is_control());
    }
}

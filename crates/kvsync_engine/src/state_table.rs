//! Versioned state transition tables of the sync state machine.

use crate::error::{SyncError, SyncResult};
use kvsync_protocol::SOFTWARE_VERSION_RELEASE_3_0;
use std::collections::{HashMap, HashSet};

/// States of one peer's sync task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// No task running.
    Idle,
    /// Negotiating the clock offset.
    TimeSync,
    /// Negotiating version, schema and security.
    AbilitySync,
    /// Sending local data, or asking the peer for its data.
    InitiativeDataSync,
    /// Waiting for the peer to stream its data back.
    WaitForReceiveDataFinish,
    /// Answering a pull started by the peer.
    PassiveDataSync,
    /// Sending a subscribe/unsubscribe command.
    SyncControlCmd,
    /// Task ended; the next one is picked up.
    SyncTaskFinished,
    /// The watchdog gave up.
    SyncTimeout,
    /// The task failed.
    InnerError,
}

impl SyncState {
    /// States in which a task is in progress.
    pub fn is_working(&self) -> bool {
        matches!(
            self,
            SyncState::TimeSync
                | SyncState::AbilitySync
                | SyncState::InitiativeDataSync
                | SyncState::WaitForReceiveDataFinish
                | SyncState::PassiveDataSync
                | SyncState::SyncControlCmd
        )
    }

    const ALL: [SyncState; 10] = [
        SyncState::Idle,
        SyncState::TimeSync,
        SyncState::AbilitySync,
        SyncState::InitiativeDataSync,
        SyncState::WaitForReceiveDataFinish,
        SyncState::PassiveDataSync,
        SyncState::SyncControlCmd,
        SyncState::SyncTaskFinished,
        SyncState::SyncTimeout,
        SyncState::InnerError,
    ];
}

/// Events driving the sync state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncEvent {
    /// A target was picked up.
    StartSync,
    /// The clock offset is known.
    TimeSyncFinished,
    /// Abilities are compatible; start sending.
    AbilitySyncFinished,
    /// Abilities are compatible; answer the peer's pull.
    SwitchToProvideData,
    /// Abilities are compatible; send a control command.
    ControlCmd,
    /// Every local record was acknowledged.
    SendFinished,
    /// The peer will stream its records back.
    WaitRecvData,
    /// The peer's last record arrived.
    RecvFinished,
    /// The control command was acknowledged.
    ControlCmdFinished,
    /// The peer lost our abilities; negotiate again.
    NeedAbilitySync,
    /// Task bookkeeping done.
    AllTaskFinished,
    /// The watchdog gave up.
    TimeOut,
    /// The task failed.
    InnerErr,
    /// Matches any event without an explicit entry.
    AnyEvent,
}

/// Transition table for one protocol generation.
#[derive(Debug, Clone)]
pub(crate) struct StateTable {
    version: u32,
    transitions: HashMap<(SyncState, SyncEvent), SyncState>,
}

impl StateTable {
    fn new(version: u32, rows: &[(SyncState, SyncEvent, SyncState)]) -> Self {
        let mut transitions = HashMap::new();
        for &(from, event, to) in rows {
            transitions.insert((from, event), to);
        }
        for state in SyncState::ALL.iter().filter(|s| s.is_working()) {
            transitions.insert((*state, SyncEvent::TimeOut), SyncState::SyncTimeout);
            transitions.insert((*state, SyncEvent::InnerErr), SyncState::InnerError);
        }
        Self {
            version,
            transitions,
        }
    }

    pub(crate) fn version(&self) -> u32 {
        self.version
    }

    /// Next state for `event`, falling back to the state's `AnyEvent` entry.
    pub(crate) fn next(&self, state: SyncState, event: SyncEvent) -> Option<SyncState> {
        self.transitions
            .get(&(state, event))
            .or_else(|| self.transitions.get(&(state, SyncEvent::AnyEvent)))
            .copied()
    }

    fn has_exit(&self, state: SyncState) -> bool {
        self.transitions.keys().any(|(from, _)| *from == state)
    }

    /// Checks that the table has no dead ends: every state a transition can
    /// reach has an exit, every working state handles timeouts and errors,
    /// and the failure states always reach `SyncTaskFinished`.
    pub(crate) fn validate(&self) -> SyncResult<()> {
        let reachable: HashSet<SyncState> = self.transitions.values().copied().collect();
        for state in reachable {
            if state != SyncState::Idle && !self.has_exit(state) {
                return Err(SyncError::inner(format!(
                    "state table v{}: {state:?} is a dead end",
                    self.version
                )));
            }
        }
        for state in SyncState::ALL.iter().filter(|s| s.is_working()) {
            for event in [SyncEvent::TimeOut, SyncEvent::InnerErr] {
                if self.transitions.get(&(*state, event)).is_none() {
                    return Err(SyncError::inner(format!(
                        "state table v{}: {state:?} ignores {event:?}",
                        self.version
                    )));
                }
            }
        }
        for state in [SyncState::SyncTimeout, SyncState::InnerError] {
            if self.next(state, SyncEvent::AnyEvent) != Some(SyncState::SyncTaskFinished) {
                return Err(SyncError::inner(format!(
                    "state table v{}: {state:?} does not finish the task",
                    self.version
                )));
            }
        }
        if self.next(SyncState::SyncTaskFinished, SyncEvent::AllTaskFinished) != Some(SyncState::Idle)
        {
            return Err(SyncError::inner(format!(
                "state table v{}: finished tasks never return to idle",
                self.version
            )));
        }
        Ok(())
    }
}

/// All transition tables, newest first.
#[derive(Debug, Clone)]
pub(crate) struct StateTables {
    tables: Vec<StateTable>,
}

impl StateTables {
    /// Builds the tables and validates them.
    pub(crate) fn build() -> SyncResult<Self> {
        let tables = Self {
            tables: vec![v3_table(), v2_table()],
        };
        for table in &tables.tables {
            table.validate()?;
        }
        Ok(tables)
    }

    /// Newest table not newer than `remote_version`, or the oldest table.
    pub(crate) fn select(&self, remote_version: u32) -> &StateTable {
        self.tables
            .iter()
            .find(|t| t.version <= remote_version)
            .or_else(|| self.tables.last())
            .unwrap_or(&self.tables[0])
    }
}

fn common_rows() -> Vec<(SyncState, SyncEvent, SyncState)> {
    use SyncEvent as E;
    use SyncState as S;
    vec![
        (S::Idle, E::StartSync, S::TimeSync),
        (S::TimeSync, E::TimeSyncFinished, S::AbilitySync),
        (S::AbilitySync, E::AbilitySyncFinished, S::InitiativeDataSync),
        (S::AbilitySync, E::SwitchToProvideData, S::PassiveDataSync),
        (S::InitiativeDataSync, E::SendFinished, S::SyncTaskFinished),
        (S::InitiativeDataSync, E::WaitRecvData, S::WaitForReceiveDataFinish),
        (S::InitiativeDataSync, E::NeedAbilitySync, S::AbilitySync),
        (S::WaitForReceiveDataFinish, E::RecvFinished, S::SyncTaskFinished),
        (S::WaitForReceiveDataFinish, E::NeedAbilitySync, S::AbilitySync),
        (S::PassiveDataSync, E::SendFinished, S::SyncTaskFinished),
        (S::PassiveDataSync, E::NeedAbilitySync, S::AbilitySync),
        (S::SyncTaskFinished, E::AllTaskFinished, S::Idle),
        (S::SyncTimeout, E::AnyEvent, S::SyncTaskFinished),
        (S::InnerError, E::AnyEvent, S::SyncTaskFinished),
    ]
}

fn v3_table() -> StateTable {
    let mut rows = common_rows();
    rows.push((
        SyncState::AbilitySync,
        SyncEvent::ControlCmd,
        SyncState::SyncControlCmd,
    ));
    rows.push((
        SyncState::SyncControlCmd,
        SyncEvent::ControlCmdFinished,
        SyncState::SyncTaskFinished,
    ));
    StateTable::new(SOFTWARE_VERSION_RELEASE_3_0, &rows)
}

fn v2_table() -> StateTable {
    StateTable::new(kvsync_protocol::SOFTWARE_VERSION_RELEASE_2_0, &common_rows())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvsync_protocol::{SOFTWARE_VERSION_CURRENT, SOFTWARE_VERSION_RELEASE_1_0};

    #[test]
    fn shipped_tables_validate() {
        let tables = StateTables::build().unwrap();
        assert_eq!(tables.select(SOFTWARE_VERSION_CURRENT).version(), SOFTWARE_VERSION_RELEASE_3_0);
        assert_eq!(
            tables.select(SOFTWARE_VERSION_RELEASE_1_0).version(),
            kvsync_protocol::SOFTWARE_VERSION_RELEASE_2_0
        );
    }

    #[test]
    fn happy_path_push() {
        let tables = StateTables::build().unwrap();
        let table = tables.select(SOFTWARE_VERSION_CURRENT);
        let mut state = SyncState::Idle;
        for event in [
            SyncEvent::StartSync,
            SyncEvent::TimeSyncFinished,
            SyncEvent::AbilitySyncFinished,
            SyncEvent::SendFinished,
            SyncEvent::AllTaskFinished,
        ] {
            state = table.next(state, event).unwrap();
        }
        assert_eq!(state, SyncState::Idle);
    }

    #[test]
    fn control_commands_need_v3() {
        let tables = StateTables::build().unwrap();
        let v2 = tables.select(kvsync_protocol::SOFTWARE_VERSION_RELEASE_2_0);
        let v3 = tables.select(SOFTWARE_VERSION_RELEASE_3_0);
        assert_eq!(v2.next(SyncState::AbilitySync, SyncEvent::ControlCmd), None);
        assert_eq!(
            v3.next(SyncState::AbilitySync, SyncEvent::ControlCmd),
            Some(SyncState::SyncControlCmd)
        );
    }

    #[test]
    fn unmapped_pairs_are_none() {
        let tables = StateTables::build().unwrap();
        let table = tables.select(SOFTWARE_VERSION_CURRENT);
        assert_eq!(table.next(SyncState::Idle, SyncEvent::RecvFinished), None);
        assert_eq!(table.next(SyncState::TimeSync, SyncEvent::SendFinished), None);
    }

    #[test]
    fn failure_states_accept_any_event() {
        let tables = StateTables::build().unwrap();
        let table = tables.select(SOFTWARE_VERSION_CURRENT);
        for state in SyncState::ALL.iter().filter(|s| s.is_working()) {
            assert_eq!(table.next(*state, SyncEvent::TimeOut), Some(SyncState::SyncTimeout));
            assert_eq!(table.next(*state, SyncEvent::InnerErr), Some(SyncState::InnerError));
        }
        assert_eq!(
            table.next(SyncState::SyncTimeout, SyncEvent::StartSync),
            Some(SyncState::SyncTaskFinished)
        );
    }

    #[test]
    fn dead_end_is_rejected() {
        let table = StateTable::new(
            1,
            &[
                (SyncState::Idle, SyncEvent::StartSync, SyncState::TimeSync),
                (
                    SyncState::TimeSync,
                    SyncEvent::TimeSyncFinished,
                    SyncState::SyncTaskFinished,
                ),
                (SyncState::SyncTimeout, SyncEvent::AnyEvent, SyncState::SyncTaskFinished),
                (SyncState::InnerError, SyncEvent::AnyEvent, SyncState::SyncTaskFinished),
            ],
        );
        assert!(matches!(table.validate(), Err(SyncError::Inner(_))));
    }
}

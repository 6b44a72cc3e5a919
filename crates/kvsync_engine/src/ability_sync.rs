//! Version, schema and security negotiation.

use crate::error::{SyncError, SyncResult};
use kvsync_protocol::{
    AbilitySyncAck, AbilitySyncRequest, AckCode, DbAbility, SecurityClassification,
    SOFTWARE_VERSION_CURRENT, SOFTWARE_VERSION_RELEASE_3_0,
};
use kvsync_storage::{SecurityLabel, StorageError, SyncStorage};
use tracing::warn;

/// What this side knows about a peer's abilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AbilityState {
    pub(crate) known: bool,
    pub(crate) remote_software_version: u32,
    pub(crate) ability: DbAbility,
}

impl Default for AbilityState {
    fn default() -> Self {
        Self {
            known: false,
            remote_software_version: SOFTWARE_VERSION_CURRENT,
            ability: DbAbility::default(),
        }
    }
}

/// Reads the local security classification.
pub(crate) fn local_security(storage: &dyn SyncStorage) -> SecurityClassification {
    match storage.security_option() {
        Ok(option) => SecurityClassification::Option(option),
        Err(StorageError::NotSupported(_)) => SecurityClassification::NotSupported,
        Err(e) => {
            warn!(error = %e, "security option unavailable");
            SecurityClassification::Unavailable
        }
    }
}

fn is_unlabeled(security: &SecurityClassification) -> bool {
    match security {
        SecurityClassification::NotSupported => true,
        SecurityClassification::Option(option) => option.label == SecurityLabel::NotSet,
        SecurityClassification::Unavailable => false,
    }
}

/// Two classifications are compatible if either side has no label, or both
/// carry the same label and flag. An unreadable label is never compatible.
pub(crate) fn security_compatible(
    local: &SecurityClassification,
    remote: &SecurityClassification,
) -> bool {
    if is_unlabeled(remote) || is_unlabeled(local) {
        return true;
    }
    match (local, remote) {
        (SecurityClassification::Option(l), SecurityClassification::Option(r)) => l == r,
        _ => false,
    }
}

/// Schemaless stores sync with anything; otherwise schemas must match.
pub(crate) fn schema_compatible(local: &str, remote: &str) -> bool {
    local.is_empty() || remote.is_empty() || local == remote
}

pub(crate) fn build_request(storage: &dyn SyncStorage) -> SyncResult<AbilitySyncRequest> {
    Ok(AbilitySyncRequest::new(
        storage.schema(),
        local_security(storage),
        storage.db_create_time()?,
    ))
}

fn fill_local(storage: &dyn SyncStorage, mut ack: AbilitySyncAck) -> SyncResult<AbilitySyncAck> {
    ack.schema = storage.schema();
    ack.security = local_security(storage);
    ack.db_create_time = storage.db_create_time()?;
    Ok(ack)
}

/// Responder side: checks a request and builds the ack.
pub(crate) fn answer_request(
    storage: &dyn SyncStorage,
    request: &AbilitySyncRequest,
) -> SyncResult<AbilitySyncAck> {
    let code = if !security_compatible(&local_security(storage), &request.security) {
        AckCode::SecurityOptionMismatch
    } else if !schema_compatible(&storage.schema(), &request.schema) {
        AckCode::SchemaMismatch
    } else {
        AckCode::Ok
    };
    fill_local(storage, AbilitySyncAck::new(code))
}

/// Requester side: validates the responder's ack.
pub(crate) fn check_ack(storage: &dyn SyncStorage, ack: &AbilitySyncAck) -> SyncResult<()> {
    if !ack.code.is_ok() {
        return Err(SyncError::from_ack(ack.code));
    }
    if !ack.permit_sync {
        return Err(SyncError::SchemaIncompatible);
    }
    if ack.software_version >= SOFTWARE_VERSION_RELEASE_3_0
        && !security_compatible(&local_security(storage), &ack.security)
    {
        return Err(SyncError::SecurityOptionMismatch);
    }
    Ok(())
}

/// Ack-notify the requester sends once it accepted the responder's ack.
pub(crate) fn build_notify(storage: &dyn SyncStorage) -> SyncResult<AbilitySyncAck> {
    fill_local(storage, AbilitySyncAck::new(AckCode::Ok))
}

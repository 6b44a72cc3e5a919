//! Error types for the sync engine.

use crate::operation::OperationStatus;
use kvsync_protocol::{AckCode, ProtocolError};
use kvsync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A caller-supplied argument was rejected.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// The syncer has not been initialized.
    #[error("syncer not initialized")]
    NotInitialized,

    /// The syncer is closing or a limit was reached.
    #[error("syncer busy")]
    Busy,

    /// A resource could not be allocated.
    #[error("out of memory")]
    OutOfMemory,

    /// The permission hook refused the operation.
    #[error("permission denied")]
    PermissionDenied,

    /// Security labels of the two stores differ.
    #[error("security option mismatch")]
    SecurityOptionMismatch,

    /// Schemas of the two stores cannot be synced.
    #[error("schema incompatible")]
    SchemaIncompatible,

    /// The communicator could not reach the peer.
    #[error("communication abnormal")]
    CommunicationAbnormal,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Unexpected internal inconsistency.
    #[error("internal error: {0}")]
    Inner(String),

    /// No sync target is queued. Not a failure.
    #[error("no sync task")]
    NoSyncTask,

    /// The store is intentionally inactive. Not a failure.
    #[error("no need to activate")]
    NoNeedActive,

    /// The request was cancelled before it completed.
    #[error("cancelled")]
    Cancelled,

    /// The peer has no ability information for this store.
    #[error("ability sync required")]
    NeedAbilitySync,

    /// The feature is not supported by the peer.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Wire codec failure.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl SyncError {
    /// Creates an internal error.
    pub fn inner(message: impl Into<String>) -> Self {
        Self::Inner(message.into())
    }

    /// Creates an invalid-arguments error.
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::InvalidArgs(message.into())
    }

    /// Returns true for outcomes that are signals rather than failures.
    pub fn is_benign(&self) -> bool {
        matches!(self, SyncError::NoSyncTask | SyncError::NoNeedActive)
    }

    /// Returns true if the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Busy | SyncError::Timeout | SyncError::CommunicationAbnormal
        )
    }

    /// Returns true if the store's key has been revoked.
    pub fn is_key_revoked(&self) -> bool {
        matches!(self, SyncError::Storage(StorageError::KeyRevoked))
    }

    /// Terminal per-device status reported when a task fails with this error.
    pub fn operation_status(&self) -> OperationStatus {
        match self {
            SyncError::PermissionDenied => OperationStatus::PermissionCheckFailed,
            SyncError::SecurityOptionMismatch => OperationStatus::SecurityOptionCheckFailure,
            SyncError::SchemaIncompatible => OperationStatus::SchemaIncompatible,
            SyncError::CommunicationAbnormal => OperationStatus::CommAbnormal,
            SyncError::Timeout => OperationStatus::Timeout,
            SyncError::Busy => OperationStatus::BusyFailure,
            SyncError::NotSupported(_) => OperationStatus::NotSupport,
            SyncError::Storage(StorageError::KeyRevoked) => OperationStatus::EKeyRevokedFailure,
            _ => OperationStatus::Failed,
        }
    }

    /// Maps a failed ack from the peer to an error.
    pub fn from_ack(code: AckCode) -> Self {
        match code {
            AckCode::Ok => SyncError::inner("ok ack treated as failure"),
            AckCode::SecurityOptionMismatch => SyncError::SecurityOptionMismatch,
            AckCode::SchemaMismatch => SyncError::SchemaIncompatible,
            AckCode::PermissionDenied => SyncError::PermissionDenied,
            AckCode::Busy => SyncError::Busy,
            AckCode::NeedAbilitySync => SyncError::NeedAbilitySync,
            AckCode::InternalError => SyncError::inner("peer reported an internal error"),
        }
    }

    /// Ack code sent to the peer when handling its request fails with this error.
    pub fn ack_code(&self) -> AckCode {
        match self {
            SyncError::SecurityOptionMismatch => AckCode::SecurityOptionMismatch,
            SyncError::SchemaIncompatible => AckCode::SchemaMismatch,
            SyncError::PermissionDenied => AckCode::PermissionDenied,
            SyncError::Busy => AckCode::Busy,
            SyncError::NeedAbilitySync => AckCode::NeedAbilitySync,
            _ => AckCode::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_errors() {
        assert!(SyncError::NoSyncTask.is_benign());
        assert!(SyncError::NoNeedActive.is_benign());
        assert!(!SyncError::Busy.is_benign());
        assert!(!SyncError::inner("x").is_benign());
    }

    #[test]
    fn retryable_errors() {
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::CommunicationAbnormal.is_retryable());
        assert!(!SyncError::SecurityOptionMismatch.is_retryable());
    }

    #[test]
    fn key_revoked_maps_to_its_own_status() {
        let err = SyncError::from(StorageError::KeyRevoked);
        assert!(err.is_key_revoked());
        assert_eq!(err.operation_status(), OperationStatus::EKeyRevokedFailure);
    }

    #[test]
    fn ack_codes_map_both_ways() {
        for code in [
            AckCode::SecurityOptionMismatch,
            AckCode::SchemaMismatch,
            AckCode::PermissionDenied,
            AckCode::Busy,
            AckCode::NeedAbilitySync,
        ] {
            assert_eq!(SyncError::from_ack(code).ack_code(), code);
        }
        assert_eq!(
            SyncError::from_ack(AckCode::SecurityOptionMismatch).operation_status(),
            OperationStatus::SecurityOptionCheckFailure
        );
    }
}

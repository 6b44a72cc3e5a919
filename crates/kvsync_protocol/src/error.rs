//! Error types for the wire codec.

use thiserror::Error;

/// Result type for codec operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding messages.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Serialization failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// Bytes were not a valid message.
    #[error("decode error: {0}")]
    Decode(String),

    /// The peer speaks a newer wire format.
    #[error("unsupported wire version {remote} (local {local})")]
    UnsupportedVersion {
        /// Local wire version.
        local: u16,
        /// Version found in the frame.
        remote: u16,
    },
}

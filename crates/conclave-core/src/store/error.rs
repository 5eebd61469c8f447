//! Storage error types.

use thiserror::Error;

use super::RecordKind;

/// Errors that can occur during storage operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Underlying storage system failure (disk, database, network).
    #[error("storage I/O error: {0}")]
    Io(String),

    /// A persisted record exists but could not be decoded.
    ///
    /// Raised by callers that deserialize record bytes, not by stores
    /// themselves; stores treat values as opaque.
    #[error("corrupt {kind} record {id}: {reason}")]
    Corrupt {
        /// Namespace of the bad record.
        kind: RecordKind,
        /// Id of the bad record.
        id: String,
        /// Decoder's description of the failure.
        reason: String,
    },
}

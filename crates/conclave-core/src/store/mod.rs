//! Persisted record storage.
//!
//! Everything the client must remember across restarts flows through one
//! trait: pairwise sessions, pre-keys, sender keys, and identity mappings
//! are all opaque byte records filed under a [`RecordKind`] namespace.
//! Serialization happens above this layer; the store never inspects values.
//!
//! # Invariants
//!
//! - Atomic Batches: a [`WriteBatch`] applies completely or not at all.
//!   Mixed writes (a session record plus the mapping rows it depends on)
//!   must never be torn by a crash between operations.
//! - Namespace Isolation: ids only collide within the same kind.

mod error;
mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
pub use error::StoreError;
pub use memory::MemoryStore;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

/// Namespace for a persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Pairwise ratchet session, keyed by protocol address.
    Session,
    /// One-time pre-key, keyed by decimal id.
    PreKey,
    /// Group sender key, keyed by `{group}::{author address}`.
    SenderKey,
    /// LID/PN identity mapping row.
    LidMapping,
}

impl RecordKind {
    /// Stable namespace label, used by stores that prefix keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::PreKey => "pre-key",
            Self::SenderKey => "sender-key",
            Self::LidMapping => "lid-mapping",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single operation inside a [`WriteBatch`].
///
/// `value: None` deletes the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOp {
    /// Namespace the record lives in.
    pub kind: RecordKind,
    /// Record id within the namespace.
    pub id: String,
    /// New record bytes, or `None` to delete.
    pub value: Option<Vec<u8>>,
}

/// An ordered set of writes applied atomically.
///
/// Operations apply in insertion order, so a later op on the same id wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a write.
    pub fn set(&mut self, kind: RecordKind, id: impl Into<String>, value: Vec<u8>) -> &mut Self {
        self.ops.push(WriteOp { kind, id: id.into(), value: Some(value) });
        self
    }

    /// Queue a delete.
    pub fn delete(&mut self, kind: RecordKind, id: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp { kind, id: id.into(), value: None });
        self
    }

    /// Whether the batch contains no operations.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Queued operations, for store implementations.
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Consume the batch into its operations.
    #[must_use]
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Persisted storage for protocol records.
///
/// Implementations must be safe to share across tasks; the client wraps one
/// store in an `Arc` and hits it from concurrent decrypt paths.
///
/// # Invariants
///
/// - `put` is atomic: on error, no operation from the batch is visible
/// - `get` omits missing ids from the result rather than erroring
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Fetch records by id. Missing ids are absent from the returned map.
    async fn get(
        &self,
        kind: RecordKind,
        ids: &[String],
    ) -> Result<HashMap<String, Vec<u8>>, StoreError>;

    /// Apply a batch of writes atomically.
    async fn put(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// Fetch a single record.
    async fn get_one(&self, kind: RecordKind, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let ids = [id.to_string()];
        let mut found = self.get(kind, &ids).await?;
        Ok(found.remove(id))
    }
}

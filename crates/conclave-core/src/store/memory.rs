//! In-memory record store.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{RecordKind, RecordStore, StoreError, WriteBatch};

/// In-memory [`RecordStore`] backed by a hash map.
///
/// Clones share the same underlying map. Suitable for tests and for clients
/// that accept losing state on restart; everything else should persist.
///
/// # Panics
///
/// Operations panic if the internal mutex is poisoned.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<HashMap<(RecordKind, String), Vec<u8>>>>,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in a namespace, for test assertions.
    pub fn record_count(&self, kind: RecordKind) -> usize {
        let records = self.records.lock().expect("MemoryStore mutex poisoned");
        records.keys().filter(|(k, _)| *k == kind).count()
    }

    /// Whether a record exists, for test assertions.
    pub fn contains(&self, kind: RecordKind, id: &str) -> bool {
        let records = self.records.lock().expect("MemoryStore mutex poisoned");
        records.contains_key(&(kind, id.to_string()))
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(
        &self,
        kind: RecordKind,
        ids: &[String],
    ) -> Result<HashMap<String, Vec<u8>>, StoreError> {
        let records = self.records.lock().expect("MemoryStore mutex poisoned");

        let mut found = HashMap::new();
        for id in ids {
            if let Some(value) = records.get(&(kind, id.clone())) {
                found.insert(id.clone(), value.clone());
            }
        }

        Ok(found)
    }

    async fn put(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut records = self.records.lock().expect("MemoryStore mutex poisoned");

        // Holding the lock for the whole batch is what makes it atomic here.
        for op in batch.into_ops() {
            match op.value {
                Some(value) => {
                    records.insert((op.kind, op.id), value);
                },
                None => {
                    records.remove(&(op.kind, op.id));
                },
            }
        }

        Ok(())
    }
}

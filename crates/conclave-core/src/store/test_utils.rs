//! Instrumented store wrappers for tests.
//!
//! [`CountingStore`] proves that caches actually short-circuit reads;
//! [`FailingStore`] injects backend failures to exercise error paths.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{RecordKind, RecordStore, StoreError, WriteBatch};

/// Wrapper counting `get` and `put` calls on the inner store.
#[derive(Clone)]
pub struct CountingStore<S> {
    inner: Arc<S>,
    gets: Arc<AtomicUsize>,
    puts: Arc<AtomicUsize>,
}

impl<S> CountingStore<S> {
    /// Wrap a store.
    pub fn new(inner: S) -> Self {
        Self {
            inner: Arc::new(inner),
            gets: Arc::new(AtomicUsize::new(0)),
            puts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of `get` calls that reached the inner store.
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Number of `put` calls that reached the inner store.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Access the wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: RecordStore> RecordStore for CountingStore<S> {
    async fn get(
        &self,
        kind: RecordKind,
        ids: &[String],
    ) -> Result<HashMap<String, Vec<u8>>, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(kind, ids).await
    }

    async fn put(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(batch).await
    }
}

/// Wrapper that fails reads or writes on demand.
///
/// Failure injection is all-or-nothing per direction, which is enough to
/// drive the client's degraded-store paths without a chaos framework.
#[derive(Clone)]
pub struct FailingStore<S> {
    inner: Arc<S>,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl<S> FailingStore<S> {
    /// Wrap a store; both directions start healthy.
    pub fn new(inner: S) -> Self {
        Self {
            inner: Arc::new(inner),
            fail_reads: Arc::new(AtomicBool::new(false)),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make subsequent `get` calls fail (or recover).
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `put` calls fail (or recover).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Access the wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: RecordStore> RecordStore for FailingStore<S> {
    async fn get(
        &self,
        kind: RecordKind,
        ids: &[String],
    ) -> Result<HashMap<String, Vec<u8>>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Io("injected read failure".to_string()));
        }
        self.inner.get(kind, ids).await
    }

    async fn put(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io("injected write failure".to_string()));
        }
        self.inner.put(batch).await
    }
}

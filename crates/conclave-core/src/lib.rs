//! Runtime plumbing shared by every Conclave component.
//!
//! This crate carries no protocol semantics of its own. It provides the
//! substrate the client builds on:
//!
//! - [`env`]: the [`Environment`](env::Environment) abstraction over time and
//!   randomness, with a production implementation and a deterministic mock
//! - [`store`]: the persisted [`RecordStore`](store::RecordStore) trait with
//!   atomic write batches, plus an in-memory implementation
//! - [`cache`]: a bounded TTL cache with LRU eviction
//! - [`locks`]: striped async locks keyed by string
//! - [`mapping`]: the bidirectional LID/PN identity mapping store
//! - [`breaker`]: a circuit breaker guarding repeatedly failing operations
//! - [`backoff`]: bounded retry delays with jitter
//!
//! # Determinism
//!
//! Everything that touches time or randomness goes through an
//! [`Environment`](env::Environment), so tests drive a virtual clock and a
//! seeded RNG instead of sleeping and hoping.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod backoff;
pub mod breaker;
pub mod cache;
pub mod env;
pub mod locks;
pub mod mapping;
pub mod store;

pub use backoff::{BackoffError, DEFAULT_RETRY_DELAYS_MS, DEFAULT_RETRY_JITTER, RetryBackoff};
pub use breaker::{BreakerConfig, BreakerState, BreakerStats, CircuitBreaker};
pub use cache::TtlCache;
pub use env::{Environment, SystemEnv};
pub use locks::KeyedLocks;
pub use mapping::{LidResolver, MappingError, MappingPair, MappingStore};
pub use store::{MemoryStore, RecordKind, RecordStore, StoreError, WriteBatch};

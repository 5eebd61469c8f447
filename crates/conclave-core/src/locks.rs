//! Striped async locks keyed by string.
//!
//! Serializes work per protocol address without a lock registry to manage:
//! keys hash onto a fixed array of mutexes. Two different addresses may
//! share a stripe and serialize needlessly, which is harmless; the same
//! address always lands on the same stripe, which is the guarantee that
//! matters for session read-modify-write cycles.

use std::hash::{DefaultHasher, Hash, Hasher};

use tokio::sync::{Mutex, MutexGuard};

/// Number of stripes. Power of two, sized for a client's realistic
/// concurrency (dozens of in-flight decrypts, not thousands).
const STRIPE_COUNT: usize = 64;

/// Fixed-size array of async mutexes indexed by key hash.
pub struct KeyedLocks {
    stripes: [Mutex<()>; STRIPE_COUNT],
}

impl KeyedLocks {
    /// Fresh set of unlocked stripes.
    #[must_use]
    pub fn new() -> Self {
        Self { stripes: std::array::from_fn(|_| Mutex::new(())) }
    }

    /// Acquire the stripe for `key`, waiting if it is held.
    ///
    /// The returned guard releases on drop. Callers must not hold a guard
    /// while acquiring a second key; stripe collisions would deadlock.
    pub async fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        self.stripes[Self::stripe_index(key)].lock().await
    }

    fn stripe_index(key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % STRIPE_COUNT
    }
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self::new()
    }
}

//! Bounded TTL cache with LRU eviction.
//!
//! Used for hot-path lookups that must never grow without bound: identity
//! mappings and migration markers. Expiry is lazy; entries are dropped when
//! touched past their deadline or when capacity pressure purges them.
//!
//! The cache is deliberately not thread-safe. Owners wrap it in whatever
//! lock fits their concurrency story, and pass `now` in explicitly so tests
//! control the clock.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

struct Entry<V, I> {
    value: V,
    expires_at: I,
    last_used: u64,
}

/// Bounded cache where every entry expires `ttl` after insertion.
///
/// `I` is the instant type of the owning environment. Lookups refresh
/// recency but not expiry: an entry written once is gone after one TTL, no
/// matter how often it is read.
pub struct TtlCache<K, V, I> {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<K, Entry<V, I>>,
    seq: u64,
}

impl<K, V, I> TtlCache<K, V, I>
where
    K: Eq + Hash + Clone,
    I: Copy + Ord + std::ops::Add<Duration, Output = I>,
{
    /// Cache holding at most `capacity` live entries.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        debug_assert!(capacity > 0, "zero-capacity cache cannot hold anything");
        Self { capacity, ttl, entries: HashMap::new(), seq: 0 }
    }

    /// Look up a key, dropping it if expired.
    pub fn get(&mut self, key: &K, now: I) -> Option<&V> {
        if self.entries.get(key).is_some_and(|entry| entry.expires_at <= now) {
            self.entries.remove(key);
            return None;
        }

        self.seq += 1;
        let seq = self.seq;
        self.entries.get_mut(key).map(|entry| {
            entry.last_used = seq;
            &entry.value
        })
    }

    /// Whether a key is present and live.
    pub fn contains(&self, key: &K, now: I) -> bool {
        self.entries.get(key).is_some_and(|entry| entry.expires_at > now)
    }

    /// Insert a value, evicting if the cache is full.
    ///
    /// Overwriting an existing key restarts its TTL. When a new key would
    /// exceed capacity, expired entries are purged first; if none were
    /// expired, the least recently used entry goes.
    pub fn insert(&mut self, key: K, value: V, now: I) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.purge_expired(now);
            if self.entries.len() >= self.capacity {
                self.evict_lru();
            }
        }

        self.seq += 1;
        self.entries
            .insert(key, Entry { value, expires_at: now + self.ttl, last_used: self.seq });
    }

    /// Remove a key, returning its value if it was present (expired or not).
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    /// Drop every entry past its deadline.
    pub fn purge_expired(&mut self, now: I) {
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    /// Number of entries, counting any not-yet-purged expired ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_lru(&mut self) {
        let oldest =
            self.entries.iter().min_by_key(|(_, entry)| entry.last_used).map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

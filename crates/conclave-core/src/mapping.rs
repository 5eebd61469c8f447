//! Bidirectional LID/PN identity mapping.
//!
//! Peers are addressable under two namespaces: a phone-number identity (PN)
//! and an anonymized one (LID). The mapping between them arrives
//! opportunistically on inbound traffic or through an explicit directory
//! lookup, and both directions must stay queryable long after the stanza
//! that carried them.
//!
//! Layering is cache, then store, then (for PN to LID only) the remote
//! resolver. The reverse direction never goes remote: a LID whose PN the
//! client has not learned stays unresolved by design.
//!
//! # Invariants
//!
//! - Pair Integrity: forward and reverse rows for one pair are written in a
//!   single atomic batch, never separately.
//! - Best-Effort Durability: a learned pair always lands in the cache, even
//!   when persisting it fails. Persistence errors cost durability across
//!   restarts, never resolution within the running process.
//! - User Granularity: mappings relate user parts. Device numbers are
//!   reapplied per query from the input identifier.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use conclave_proto::{Jid, Server};
use thiserror::Error;

use crate::cache::TtlCache;
use crate::env::Environment;
use crate::store::{RecordKind, RecordStore, StoreError, WriteBatch};

/// Most mappings the cache holds before evicting.
pub const MAPPING_CACHE_CAPACITY: usize = 10_000;

/// How long a cached mapping stays valid.
pub const MAPPING_CACHE_TTL: Duration = Duration::from_secs(3 * 24 * 60 * 60);

/// Default ceiling on one remote directory lookup.
pub const DEFAULT_RESOLVER_TIMEOUT: Duration = Duration::from_secs(5);

/// One learned correspondence between the two namespaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingPair {
    /// LID-namespace identifier.
    pub lid: Jid,
    /// PN-namespace identifier.
    pub pn: Jid,
}

/// Mapping layer errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    /// Persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The remote directory lookup failed.
    #[error("directory lookup failed: {reason}")]
    Resolver {
        /// Transport's description of the failure.
        reason: String,
    },
}

/// Remote directory resolving LIDs for PN users.
///
/// Implemented by the client over its transport. Returned pairs may cover
/// any subset of the queried users; unknown users are simply absent.
#[async_trait]
pub trait LidResolver: Send + Sync {
    /// Look up LID identities for the given PN identifiers.
    async fn resolve(&self, pns: &[Jid]) -> Result<Vec<MappingPair>, MappingError>;
}

/// Cached, persisted, bidirectional LID/PN mapping store.
pub struct MappingStore<E: Environment, S> {
    env: E,
    store: Arc<S>,
    resolver: Option<Arc<dyn LidResolver>>,
    resolver_timeout: Duration,
    cache: Mutex<TtlCache<String, String, E::Instant>>,
}

impl<E: Environment, S: RecordStore> MappingStore<E, S> {
    /// Mapping store without a remote resolver; lookups stop at the store.
    pub fn new(env: E, store: Arc<S>) -> Self {
        let cache = TtlCache::new(MAPPING_CACHE_CAPACITY, MAPPING_CACHE_TTL);
        Self {
            env,
            store,
            resolver: None,
            resolver_timeout: DEFAULT_RESOLVER_TIMEOUT,
            cache: Mutex::new(cache),
        }
    }

    /// Attach a remote resolver for PN to LID misses.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn LidResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Override the remote lookup deadline.
    #[must_use]
    pub fn with_resolver_timeout(mut self, timeout: Duration) -> Self {
        self.resolver_timeout = timeout;
        self
    }

    /// Record a batch of learned pairs.
    ///
    /// Pairs whose sides are not one LID-shaped and one PN-shaped
    /// identifier are skipped with a warning; pairs already known with the
    /// same LID are skipped silently. Everything else lands in one atomic
    /// batch (forward and reverse rows together) and then in the cache.
    /// Store failures are logged and tolerated: the pairs stay resolvable
    /// from the cache for the life of the process, only durability is lost.
    pub async fn store_mappings(&self, pairs: &[MappingPair]) {
        let mut candidates = Vec::new();
        for pair in pairs {
            if !pair.lid.is_lid_shaped() || !pair.pn.is_pn_shaped() {
                tracing::warn!(lid = %pair.lid, pn = %pair.pn, "skipping malformed mapping pair");
                continue;
            }
            candidates.push(pair);
        }

        // Drop pairs the cache already knows with the same LID.
        {
            let mut cache = self.cache.lock().expect("MappingStore cache mutex poisoned");
            let now = self.env.now();
            candidates.retain(|pair| {
                cache.get(&format!("pn:{}", pair.pn.user), now) != Some(&pair.lid.user)
            });
        }

        if candidates.is_empty() {
            return;
        }

        // One store read filters out pairs persisted by an earlier run. A
        // failed probe treats every pair as new.
        let forward_ids: Vec<String> = candidates.iter().map(|p| p.pn.user.clone()).collect();
        let known = match self.store.get(RecordKind::LidMapping, &forward_ids).await {
            Ok(known) => known,
            Err(error) => {
                tracing::warn!(%error, "mapping dedup probe failed, assuming all pairs unknown");
                HashMap::new()
            },
        };
        candidates.retain(|pair| {
            known.get(&pair.pn.user).map(Vec::as_slice) != Some(pair.lid.user.as_bytes())
        });

        if candidates.is_empty() {
            return;
        }

        let mut batch = WriteBatch::new();
        for pair in &candidates {
            batch.set(RecordKind::LidMapping, pair.pn.user.clone(), pair.lid.user.clone().into_bytes());
            batch.set(
                RecordKind::LidMapping,
                format!("{}_reverse", pair.lid.user),
                pair.pn.user.clone().into_bytes(),
            );
        }
        if let Err(error) = self.store.put(batch).await {
            tracing::warn!(%error, "mapping persist failed, serving pairs from cache only");
        }

        {
            let mut cache = self.cache.lock().expect("MappingStore cache mutex poisoned");
            let now = self.env.now();
            for pair in &candidates {
                cache.insert(format!("pn:{}", pair.pn.user), pair.lid.user.clone(), now);
                cache.insert(format!("lid:{}", pair.lid.user), pair.pn.user.clone(), now);
            }
        }

        tracing::debug!(stored = candidates.len(), "recorded lid mappings");
    }

    /// LID identity for a PN identifier, with the PN's device reapplied.
    ///
    /// Checks cache, store, then the remote resolver (when attached).
    /// Returns `None` for non-PN input and for genuinely unknown users.
    pub async fn lid_for_pn(&self, pn: &Jid) -> Result<Option<Jid>, MappingError> {
        if !pn.is_pn_shaped() {
            return Ok(None);
        }

        let pairs = self.lids_for_pns(std::slice::from_ref(pn)).await?;
        Ok(pairs.into_iter().next().map(|pair| pair.lid))
    }

    /// LID identities for a batch of PN identifiers.
    ///
    /// Local layers first; the remaining misses go to the resolver in one
    /// query bounded by the resolver timeout. Resolver failures degrade to
    /// partial results rather than failing the batch.
    pub async fn lids_for_pns(&self, pns: &[Jid]) -> Result<Vec<MappingPair>, MappingError> {
        let mut resolved = Vec::new();
        let mut misses: Vec<&Jid> = Vec::new();

        {
            let mut cache = self.cache.lock().expect("MappingStore cache mutex poisoned");
            let now = self.env.now();
            for pn in pns {
                if !pn.is_pn_shaped() {
                    tracing::warn!(jid = %pn, "lid lookup for non-PN identifier");
                    continue;
                }
                match cache.get(&format!("pn:{}", pn.user), now) {
                    Some(lid_user) => {
                        resolved.push(MappingPair { lid: map_lid_onto(lid_user, pn), pn: pn.clone() });
                    },
                    None => misses.push(pn),
                }
            }
        }

        if misses.is_empty() {
            return Ok(resolved);
        }

        let ids: Vec<String> = misses.iter().map(|pn| pn.user.clone()).collect();
        let found = self.store.get(RecordKind::LidMapping, &ids).await?;

        let mut remote = Vec::new();
        for pn in misses {
            match found.get(&pn.user) {
                Some(bytes) => {
                    let lid_user = decode_user(RecordKind::LidMapping, &pn.user, bytes)?;
                    {
                        let mut cache =
                            self.cache.lock().expect("MappingStore cache mutex poisoned");
                        cache.insert(format!("pn:{}", pn.user), lid_user.clone(), self.env.now());
                    }
                    resolved.push(MappingPair { lid: map_lid_onto(&lid_user, pn), pn: pn.clone() });
                },
                None => remote.push(pn.clone()),
            }
        }

        if !remote.is_empty() {
            if let Some(pairs) = self.resolve_remote(&remote).await {
                self.store_mappings(&pairs).await;
                for pn in &remote {
                    if let Some(pair) = pairs.iter().find(|p| p.pn.same_user(pn)) {
                        resolved.push(MappingPair {
                            lid: map_lid_onto(&pair.lid.user, pn),
                            pn: pn.clone(),
                        });
                    }
                }
            }
        }

        Ok(resolved)
    }

    /// PN identity for a LID identifier, with the LID's device reapplied.
    ///
    /// Strictly local: cache then store. There is deliberately no remote
    /// fallback on this path.
    pub async fn pn_for_lid(&self, lid: &Jid) -> Result<Option<Jid>, MappingError> {
        if !lid.is_lid_shaped() {
            return Ok(None);
        }

        {
            let mut cache = self.cache.lock().expect("MappingStore cache mutex poisoned");
            if let Some(pn_user) = cache.get(&format!("lid:{}", lid.user), self.env.now()) {
                return Ok(Some(map_pn_onto(pn_user, lid)));
            }
        }

        let reverse_id = format!("{}_reverse", lid.user);
        let Some(bytes) = self.store.get_one(RecordKind::LidMapping, &reverse_id).await? else {
            return Ok(None);
        };
        let pn_user = decode_user(RecordKind::LidMapping, &reverse_id, &bytes)?;

        {
            let mut cache = self.cache.lock().expect("MappingStore cache mutex poisoned");
            cache.insert(format!("lid:{}", lid.user), pn_user.clone(), self.env.now());
        }

        Ok(Some(map_pn_onto(&pn_user, lid)))
    }

    /// Run the resolver with a deadline; failures become `None` plus a log.
    async fn resolve_remote(&self, pns: &[Jid]) -> Option<Vec<MappingPair>> {
        let resolver = self.resolver.as_ref()?;

        let outcome = tokio::select! {
            result = resolver.resolve(pns) => result,
            () = self.env.sleep(self.resolver_timeout) => {
                tracing::warn!(count = pns.len(), "directory lookup timed out");
                return None;
            },
        };

        match outcome {
            Ok(pairs) => Some(pairs),
            Err(error) => {
                tracing::warn!(%error, "directory lookup failed");
                None
            },
        }
    }
}

/// Apply a PN identifier's device to a freshly resolved LID user.
///
/// Device zero renders without a device segment in the LID namespace.
fn map_lid_onto(lid_user: &str, pn: &Jid) -> Jid {
    let server = if pn.server == Server::Hosted { Server::HostedLid } else { Server::Lid };
    let lid = Jid::new(lid_user, server);
    match pn.device_or_zero() {
        0 => lid,
        device => lid.with_device(device),
    }
}

/// Apply a LID identifier's device to a resolved PN user.
///
/// The PN side always carries an explicit device segment, zero included.
fn map_pn_onto(pn_user: &str, lid: &Jid) -> Jid {
    let server = if lid.server == Server::HostedLid { Server::Hosted } else { Server::Pn };
    Jid::new(pn_user, server).with_device(lid.device_or_zero())
}

/// Mapping rows are UTF-8 user strings; anything else is corrupt.
fn decode_user(kind: RecordKind, id: &str, bytes: &[u8]) -> Result<String, MappingError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| {
        MappingError::Store(StoreError::Corrupt {
            kind,
            id: id.to_string(),
            reason: "mapping row is not UTF-8".to_string(),
        })
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::env::test_utils::MockEnv;
    use crate::store::MemoryStore;
    use crate::store::test_utils::{CountingStore, FailingStore};

    fn pn(user: &str) -> Jid {
        Jid::new(user, Server::Pn)
    }

    fn lid(user: &str) -> Jid {
        Jid::new(user, Server::Lid)
    }

    fn pair(lid_user: &str, pn_user: &str) -> MappingPair {
        MappingPair { lid: lid(lid_user), pn: pn(pn_user) }
    }

    fn mapping_store(env: &MockEnv) -> MappingStore<MockEnv, MemoryStore> {
        MappingStore::new(env.clone(), Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn round_trips_both_directions() {
        let env = MockEnv::new();
        let store = mapping_store(&env);

        store.store_mappings(&[pair("9988", "123")]).await;

        assert_eq!(store.lid_for_pn(&pn("123")).await.unwrap(), Some(lid("9988")));
        assert_eq!(
            store.pn_for_lid(&lid("9988")).await.unwrap(),
            Some(pn("123").with_device(0))
        );
    }

    #[tokio::test]
    async fn device_mapping_is_asymmetric() {
        let env = MockEnv::new();
        let store = mapping_store(&env);
        store.store_mappings(&[pair("9988", "123")]).await;

        // PN device 5 carries over; PN device 0 renders deviceless.
        let with_device = store.lid_for_pn(&pn("123").with_device(5)).await.unwrap().unwrap();
        assert_eq!(with_device, lid("9988").with_device(5));
        let deviceless = store.lid_for_pn(&pn("123")).await.unwrap().unwrap();
        assert_eq!(deviceless.device, None);

        // The PN side always gets an explicit device, zero included.
        let zero = store.pn_for_lid(&lid("9988")).await.unwrap().unwrap();
        assert_eq!(zero.device, Some(0));
        let five = store.pn_for_lid(&lid("9988").with_device(5)).await.unwrap().unwrap();
        assert_eq!(five.device, Some(5));
    }

    #[tokio::test]
    async fn hosted_namespaces_map_to_hosted_counterparts() {
        let env = MockEnv::new();
        let store = mapping_store(&env);
        store
            .store_mappings(&[MappingPair {
                lid: Jid::new("9988", Server::HostedLid),
                pn: Jid::new("123", Server::Hosted),
            }])
            .await;

        let mapped_lid =
            store.lid_for_pn(&Jid::new("123", Server::Hosted)).await.unwrap().unwrap();
        assert_eq!(mapped_lid.server, Server::HostedLid);

        let mapped_pn =
            store.pn_for_lid(&Jid::new("9988", Server::HostedLid)).await.unwrap().unwrap();
        assert_eq!(mapped_pn.server, Server::Hosted);
    }

    #[tokio::test]
    async fn malformed_pairs_are_skipped_but_valid_ones_land() {
        let env = MockEnv::new();
        let store = mapping_store(&env);

        let swapped = MappingPair { lid: pn("123"), pn: lid("9988") };
        store.store_mappings(&[swapped, pair("7766", "456")]).await;

        assert_eq!(store.lid_for_pn(&pn("123")).await.unwrap(), None);
        assert_eq!(store.lid_for_pn(&pn("456")).await.unwrap(), Some(lid("7766")));
    }

    #[tokio::test]
    async fn non_pn_input_resolves_to_none() {
        let env = MockEnv::new();
        let store = mapping_store(&env);

        assert_eq!(store.lid_for_pn(&lid("9988")).await.unwrap(), None);
        assert_eq!(store.pn_for_lid(&pn("123")).await.unwrap(), None);
        assert_eq!(store.lid_for_pn(&Jid::new("g1", Server::Group)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn cache_short_circuits_store_reads() {
        let env = MockEnv::new();
        let counting = Arc::new(CountingStore::new(MemoryStore::new()));
        let store = MappingStore::new(env.clone(), Arc::clone(&counting));

        store.store_mappings(&[pair("9988", "123")]).await;
        let after_write = counting.get_count();

        store.lid_for_pn(&pn("123")).await.unwrap();
        store.lid_for_pn(&pn("123")).await.unwrap();
        store.pn_for_lid(&lid("9988")).await.unwrap();

        assert_eq!(counting.get_count(), after_write);
    }

    #[tokio::test]
    async fn expired_cache_falls_back_to_store() {
        let env = MockEnv::new();
        let counting = Arc::new(CountingStore::new(MemoryStore::new()));
        let store = MappingStore::new(env.clone(), Arc::clone(&counting));

        store.store_mappings(&[pair("9988", "123")]).await;
        let after_write = counting.get_count();

        env.advance(MAPPING_CACHE_TTL + Duration::from_secs(1));
        assert_eq!(store.lid_for_pn(&pn("123")).await.unwrap(), Some(lid("9988")));
        assert_eq!(counting.get_count(), after_write + 1);
    }

    #[tokio::test]
    async fn known_pairs_are_not_rewritten() {
        let env = MockEnv::new();
        let counting = Arc::new(CountingStore::new(MemoryStore::new()));
        let store = MappingStore::new(env.clone(), Arc::clone(&counting));

        store.store_mappings(&[pair("9988", "123")]).await;
        assert_eq!(counting.put_count(), 1);

        store.store_mappings(&[pair("9988", "123")]).await;
        assert_eq!(counting.put_count(), 1);
    }

    #[tokio::test]
    async fn remapped_user_overwrites_old_lid() {
        let env = MockEnv::new();
        let store = mapping_store(&env);

        store.store_mappings(&[pair("9988", "123")]).await;
        store.store_mappings(&[pair("5544", "123")]).await;

        assert_eq!(store.lid_for_pn(&pn("123")).await.unwrap(), Some(lid("5544")));
        // The old reverse row still resolves; only the forward row moved.
        assert_eq!(
            store.pn_for_lid(&lid("5544")).await.unwrap(),
            Some(pn("123").with_device(0))
        );
    }

    #[tokio::test]
    async fn failed_write_still_resolves_from_cache() {
        let env = MockEnv::new();
        let failing = Arc::new(FailingStore::new(MemoryStore::new()));
        let store = MappingStore::new(env.clone(), Arc::clone(&failing));

        failing.fail_writes(true);
        store.store_mappings(&[pair("9988", "123")]).await;

        // Durability was lost but in-process resolution keeps working.
        failing.fail_writes(false);
        assert!(!failing.inner().contains(RecordKind::LidMapping, "123"));
        assert_eq!(store.lid_for_pn(&pn("123")).await.unwrap(), Some(lid("9988")));

        // The reverse direction was cached by the same call.
        assert_eq!(
            store.pn_for_lid(&lid("9988")).await.unwrap(),
            Some(pn("123").with_device(0))
        );
    }

    struct StaticResolver {
        pairs: Vec<MappingPair>,
    }

    #[async_trait]
    impl LidResolver for StaticResolver {
        async fn resolve(&self, pns: &[Jid]) -> Result<Vec<MappingPair>, MappingError> {
            Ok(self
                .pairs
                .iter()
                .filter(|pair| pns.iter().any(|pn| pn.same_user(&pair.pn)))
                .cloned()
                .collect())
        }
    }

    struct NeverResolver;

    #[async_trait]
    impl LidResolver for NeverResolver {
        async fn resolve(&self, _pns: &[Jid]) -> Result<Vec<MappingPair>, MappingError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn resolver_fills_local_misses_and_persists_them() {
        let env = MockEnv::new();
        let counting = Arc::new(CountingStore::new(MemoryStore::new()));
        let resolver = Arc::new(StaticResolver { pairs: vec![pair("9988", "123")] });
        let store =
            MappingStore::new(env.clone(), Arc::clone(&counting)).with_resolver(resolver);

        let pairs = store.lids_for_pns(&[pn("123"), pn("456")]).await.unwrap();

        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].lid, lid("9988"));
        // The resolved pair is now local; a second query needs no resolver.
        assert!(counting.inner().contains(RecordKind::LidMapping, "123"));
        assert_eq!(store.lid_for_pn(&pn("123")).await.unwrap(), Some(lid("9988")));
    }

    #[tokio::test]
    async fn hanging_resolver_degrades_to_partial_results() {
        let env = MockEnv::new();
        let store = MappingStore::new(env.clone(), Arc::new(MemoryStore::new()))
            .with_resolver(Arc::new(NeverResolver));

        store.store_mappings(&[pair("9988", "123")]).await;
        let pairs = store.lids_for_pns(&[pn("123"), pn("456")]).await.unwrap();

        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].pn, pn("123"));
    }
}

//! Session and sender-key records behind per-record locks.
//!
//! One [`SessionRepository`] owns every ratchet record a device holds:
//! pairwise [`Session`]s keyed by protocol address, and [`SenderKeyRecord`]s
//! keyed by `{group user}::{author address}`. Every mutation runs
//! load, step, persist under a per-record async lock, so two stanzas for the
//! same peer never interleave their ratchet steps.
//!
//! # Invariants
//!
//! - **Commit On Success**: a failed decrypt leaves the stored record exactly
//!   as it was; only a successful operation writes back.
//! - **Atomic Consumption**: establishing from a pkmsg persists the session
//!   and deletes the consumed one-time pre-key in one batch.
//! - **LID Preference**: decryption addresses resolve to the LID namespace
//!   whenever a mapping is known; lookup failures fall back to the nominal
//!   address rather than failing the message.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conclave_core::cache::TtlCache;
use conclave_core::env::Environment;
use conclave_core::locks::KeyedLocks;
use conclave_core::mapping::MappingStore;
use conclave_core::store::{RecordKind, RecordStore, StoreError, WriteBatch};
use conclave_crypto::{
    ChainMessage, GroupPayload, KeyPair, NONCE_RANDOM_SIZE, PreKey, PreKeyBundle, PreKeyEnvelope,
    SenderKeyDistribution, SenderKeyRecord, Session, SignedPreKey,
};
use conclave_proto::Jid;
use serde::de::DeserializeOwned;

use crate::codec;
use crate::creds::Credentials;
use crate::error::ClientError;
use crate::event::EncKind;

/// Completed PN-to-LID migrations remembered, keyed by `{from}>{to}`.
const MIGRATION_CACHE_CAPACITY: usize = 10_000;

/// How long a completed migration stays deduplicated.
const MIGRATION_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Output of a group encryption.
#[derive(Debug, Clone)]
pub struct GroupEncrypted {
    /// Encoded group ciphertext, shipped as an `skmsg` enc node.
    pub payload: Vec<u8>,
    /// Encoded sender-key distribution for members that lack the chain,
    /// snapshotted before the chain advanced so it covers this payload.
    pub distribution: Vec<u8>,
    /// Whether this call minted a new chain. A fresh key restarts
    /// distribution tracking: every member needs the snapshot again.
    pub fresh_key: bool,
}

/// Every ratchet record a device holds, with the locking and namespace
/// resolution around them.
pub struct SessionRepository<E: Environment, S> {
    env: E,
    store: Arc<S>,
    mapping: Arc<MappingStore<E, S>>,
    locks: KeyedLocks,
    /// Identity our outgoing group chains are authored under.
    me: Jid,
    registration_id: u32,
    identity: KeyPair,
    signed_pre_key: SignedPreKey,
    migrated: Mutex<TtlCache<String, (), E::Instant>>,
    /// Per group user, the protocol addresses holding our current sender key.
    distributed: Mutex<HashMap<String, HashSet<String>>>,
}

impl<E: Environment, S: RecordStore> SessionRepository<E, S> {
    /// Build a repository over a store, keeping a copy of the identity
    /// material in `creds`. Group chains are authored under the LID identity
    /// once one is assigned.
    pub fn new(
        env: E,
        store: Arc<S>,
        mapping: Arc<MappingStore<E, S>>,
        creds: &Credentials,
    ) -> Self {
        Self {
            env,
            store,
            mapping,
            locks: KeyedLocks::new(),
            me: creds.me_lid.clone().unwrap_or_else(|| creds.me_pn.clone()),
            registration_id: creds.registration_id,
            identity: creds.identity.clone(),
            signed_pre_key: creds.signed_pre_key.clone(),
            migrated: Mutex::new(TtlCache::new(MIGRATION_CACHE_CAPACITY, MIGRATION_CACHE_TTL)),
            distributed: Mutex::new(HashMap::new()),
        }
    }

    fn session_id(address: &Jid) -> String {
        address.protocol_address().to_string()
    }

    fn sender_key_id(group: &Jid, author: &Jid) -> String {
        format!("{}::{}", group.user, author.protocol_address())
    }

    /// Address whose session record should decrypt traffic from `jid`.
    ///
    /// PN identities resolve to their LID counterpart when a mapping is
    /// known. Lookup failures are logged and fall back to the nominal
    /// address; a missed preference never fails the message.
    pub async fn resolve_decryption_address(&self, jid: &Jid) -> Jid {
        if jid.is_lid_shaped() {
            return jid.clone();
        }
        match self.mapping.lid_for_pn(jid).await {
            Ok(Some(lid)) => lid,
            Ok(None) => jid.clone(),
            Err(error) => {
                tracing::warn!(%jid, %error, "mapping lookup failed, staying on nominal address");
                jid.clone()
            }
        }
    }

    /// Decrypt a pairwise ciphertext from `address`.
    ///
    /// `pkmsg` establishes a session from the embedded envelope unless one
    /// with the same base key already exists; `msg` requires an existing
    /// session. Group ciphertext goes through
    /// [`Self::decrypt_group_message`] instead.
    ///
    /// # Errors
    ///
    /// - [`ClientError::MissingSession`] for `msg` without a session record
    /// - [`ClientError::PreKeyUnavailable`] when a `pkmsg` references a
    ///   one-time or signed pre-key we no longer hold
    /// - [`ClientError::Crypto`] when the ratchet rejects the ciphertext
    pub async fn decrypt_message(
        &self,
        address: &Jid,
        kind: EncKind,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, ClientError> {
        match kind {
            EncKind::Pkmsg => self.decrypt_pkmsg(address, ciphertext).await,
            EncKind::Msg => self.decrypt_established(address, ciphertext).await,
            EncKind::Skmsg => {
                Err(ClientError::UnknownEncKind { kind: EncKind::Skmsg.as_wire().to_owned() })
            }
        }
    }

    async fn decrypt_pkmsg(&self, address: &Jid, ciphertext: &[u8]) -> Result<Vec<u8>, ClientError> {
        let envelope: PreKeyEnvelope = codec::decode(ciphertext)?;
        let id = Self::session_id(address);
        let _guard = self.locks.lock(&id).await;

        if let Some(mut session) = self.load_session(&id).await? {
            if session.matches_pkmsg(&envelope) {
                let plaintext = session.decrypt(&envelope.message)?;
                self.persist_session(&id, &session).await?;
                return Ok(plaintext);
            }
            tracing::debug!(address = %id, "pkmsg under a new base key, re-establishing");
        }

        if envelope.signed_pre_key_id != self.signed_pre_key.id {
            return Err(ClientError::PreKeyUnavailable { id: envelope.signed_pre_key_id });
        }

        let one_time = match envelope.pre_key_id {
            Some(pre_key_id) => {
                let record_id = pre_key_id.to_string();
                let Some(bytes) = self.store.get_one(RecordKind::PreKey, &record_id).await? else {
                    return Err(ClientError::PreKeyUnavailable { id: pre_key_id });
                };
                Some(decode_record::<PreKey>(RecordKind::PreKey, &record_id, &bytes)?)
            }
            None => None,
        };

        let mut session = Session::respond(
            &envelope,
            &self.identity,
            &self.signed_pre_key.key_pair,
            one_time.as_ref().map(|pre_key| &pre_key.key_pair),
        );
        let plaintext = session.decrypt(&envelope.message)?;

        let mut batch = WriteBatch::new();
        batch.set(RecordKind::Session, id, codec::encode(&session)?);
        if let Some(pre_key_id) = envelope.pre_key_id {
            batch.delete(RecordKind::PreKey, pre_key_id.to_string());
        }
        self.store.put(batch).await?;
        Ok(plaintext)
    }

    async fn decrypt_established(
        &self,
        address: &Jid,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, ClientError> {
        let message: ChainMessage = codec::decode(ciphertext)?;
        let id = Self::session_id(address);
        let _guard = self.locks.lock(&id).await;

        let Some(mut session) = self.load_session(&id).await? else {
            return Err(ClientError::MissingSession { address: id });
        };
        let plaintext = session.decrypt(&message)?;
        self.persist_session(&id, &session).await?;
        Ok(plaintext)
    }

    /// Encrypt a padded plaintext for one device.
    ///
    /// Unconfirmed sessions emit `pkmsg` envelopes carrying establishment
    /// material; confirmed sessions emit bare chain messages.
    ///
    /// # Errors
    ///
    /// - [`ClientError::MissingSession`] when no session exists; establish
    ///   one with [`Self::init_outgoing_session`] first
    pub async fn encrypt_message(
        &self,
        address: &Jid,
        plaintext: &[u8],
    ) -> Result<(EncKind, Vec<u8>), ClientError> {
        let id = Self::session_id(address);
        let _guard = self.locks.lock(&id).await;

        let Some(mut session) = self.load_session(&id).await? else {
            return Err(ClientError::MissingSession { address: id });
        };

        let mut random = [0u8; NONCE_RANDOM_SIZE];
        self.env.random_bytes(&mut random);
        let message = session.encrypt(plaintext, random)?;

        let encoded = match session.pending_pre_key() {
            Some(pending) => {
                let envelope = PreKeyEnvelope {
                    registration_id: self.registration_id,
                    pre_key_id: pending.pre_key_id,
                    signed_pre_key_id: pending.signed_pre_key_id,
                    base_key: pending.base_key,
                    identity_key: self.identity.public_bytes(),
                    message,
                };
                (EncKind::Pkmsg, codec::encode(&envelope)?)
            }
            None => (EncKind::Msg, codec::encode(&message)?),
        };

        self.persist_session(&id, &session).await?;
        Ok(encoded)
    }

    /// Establish an outgoing session from a peer's published bundle,
    /// replacing any session already stored for the address.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Crypto`] when the bundle's signature does not verify
    pub async fn init_outgoing_session(
        &self,
        address: &Jid,
        bundle: &PreKeyBundle,
    ) -> Result<(), ClientError> {
        let mut base_seed = [0u8; 32];
        self.env.random_bytes(&mut base_seed);
        let session = Session::initiate(&self.identity, bundle, base_seed)?;

        let id = Self::session_id(address);
        let _guard = self.locks.lock(&id).await;
        self.persist_session(&id, &session).await
    }

    /// Whether a session record exists for the address.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Store`] when the backend read fails
    pub async fn has_session(&self, address: &Jid) -> Result<bool, ClientError> {
        let id = Self::session_id(address);
        Ok(self.store.get_one(RecordKind::Session, &id).await?.is_some())
    }

    /// Delete the session records for every listed address in one batch.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Store`] when the backend write fails
    pub async fn delete_sessions(&self, addresses: &[Jid]) -> Result<(), ClientError> {
        if addresses.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        for address in addresses {
            batch.delete(RecordKind::Session, Self::session_id(address));
        }
        Ok(self.store.put(batch).await?)
    }

    /// Copy a PN session record onto its LID counterpart.
    ///
    /// Best-effort continuity when a peer moves namespaces: the record is
    /// copied as stored, never stepped. A destination that already holds a
    /// session keeps it. Completed migrations are remembered for an hour so
    /// repeated captures of the same pair skip the store probes.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Store`] when a backend read or write fails
    pub async fn migrate_session(&self, from: &Jid, to: &Jid) -> Result<(), ClientError> {
        if !from.is_pn_shaped() || !to.is_lid_shaped() {
            tracing::warn!(%from, %to, "session migration runs PN to LID only, skipping");
            return Ok(());
        }

        let from_id = Self::session_id(from);
        let to_id = Self::session_id(to);
        let migration = format!("{from_id}>{to_id}");
        {
            let mut migrated = self.migrated.lock().expect("migration cache mutex poisoned");
            if migrated.get(&migration, self.env.now()).is_some() {
                return Ok(());
            }
        }

        // Locks the destination only; the source is read as a snapshot.
        let _guard = self.locks.lock(&to_id).await;

        if self.store.get_one(RecordKind::Session, &to_id).await?.is_none() {
            let Some(record) = self.store.get_one(RecordKind::Session, &from_id).await? else {
                // Nothing to carry over, and nothing to remember: a session
                // may still appear under the PN address later.
                tracing::debug!(from = %from_id, "no session to migrate");
                return Ok(());
            };
            let mut batch = WriteBatch::new();
            batch.set(RecordKind::Session, to_id.clone(), record);
            self.store.put(batch).await?;
            tracing::info!(from = %from_id, to = %to_id, "migrated session to LID address");
        }

        let mut migrated = self.migrated.lock().expect("migration cache mutex poisoned");
        migrated.insert(migration, (), self.env.now());
        Ok(())
    }

    /// Encrypt a group payload under our sender key, minting a chain when
    /// none exists.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Crypto`] when the chain is exhausted
    /// - [`ClientError::Store`] when a backend read or write fails
    pub async fn encrypt_group_message(
        &self,
        group: &Jid,
        plaintext: &[u8],
    ) -> Result<GroupEncrypted, ClientError> {
        let id = Self::sender_key_id(group, &self.me);
        let _guard = self.locks.lock(&id).await;

        let stored = self.store.get_one(RecordKind::SenderKey, &id).await?;
        let (mut record, fresh_key) = match stored {
            Some(bytes) => {
                (decode_record::<SenderKeyRecord>(RecordKind::SenderKey, &id, &bytes)?, false)
            }
            None => {
                let mut key_id = [0u8; 4];
                self.env.random_bytes(&mut key_id);
                let mut seed = [0u8; 32];
                self.env.random_bytes(&mut seed);
                self.forget_distribution(group);
                (SenderKeyRecord::create(u32::from_be_bytes(key_id), seed), true)
            }
        };

        // Snapshot before encrypting, so members given this distribution can
        // read the payload it shipped with.
        let distribution = codec::encode(&record.distribution())?;
        let mut random = [0u8; NONCE_RANDOM_SIZE];
        self.env.random_bytes(&mut random);
        let payload = record.encrypt(plaintext, random)?;

        let mut batch = WriteBatch::new();
        batch.set(RecordKind::SenderKey, id, codec::encode(&record)?);
        self.store.put(batch).await?;

        Ok(GroupEncrypted { payload: codec::encode(&payload)?, distribution, fresh_key })
    }

    /// Decrypt a group payload under the author's sender key.
    ///
    /// # Errors
    ///
    /// - [`ClientError::NoSenderKey`] when no distribution from this author
    ///   has been processed for the group
    /// - [`ClientError::Crypto`] for rotated chains or damaged ciphertext
    pub async fn decrypt_group_message(
        &self,
        group: &Jid,
        author: &Jid,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, ClientError> {
        let payload: GroupPayload = codec::decode(ciphertext)?;
        let id = Self::sender_key_id(group, author);
        let _guard = self.locks.lock(&id).await;

        let Some(bytes) = self.store.get_one(RecordKind::SenderKey, &id).await? else {
            return Err(ClientError::NoSenderKey {
                group: group.to_string(),
                author: author.protocol_address().to_string(),
            });
        };
        let mut record: SenderKeyRecord = decode_record(RecordKind::SenderKey, &id, &bytes)?;
        let plaintext = record.decrypt(&payload)?;

        let mut batch = WriteBatch::new();
        batch.set(RecordKind::SenderKey, id, codec::encode(&record)?);
        self.store.put(batch).await?;
        Ok(plaintext)
    }

    /// Install an author's sender-key distribution for a group.
    ///
    /// Reprocessing the distribution of a chain we already follow is a
    /// no-op; an advanced chain is never rewound to its snapshot. A
    /// distribution with a different chain id replaces ours, which is how
    /// author rotations propagate.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Wire`] when the distribution bytes do not decode
    /// - [`ClientError::Store`] when a backend read or write fails
    pub async fn process_sender_key_distribution(
        &self,
        group: &Jid,
        author: &Jid,
        distribution: &[u8],
    ) -> Result<(), ClientError> {
        let distribution: SenderKeyDistribution = codec::decode(distribution)?;
        let id = Self::sender_key_id(group, author);
        let _guard = self.locks.lock(&id).await;

        if let Some(bytes) = self.store.get_one(RecordKind::SenderKey, &id).await? {
            let record: SenderKeyRecord = decode_record(RecordKind::SenderKey, &id, &bytes)?;
            if record.matches_distribution(&distribution) {
                tracing::debug!(record = %id, "sender key already installed");
                return Ok(());
            }
        }

        let record = SenderKeyRecord::from_distribution(&distribution);
        let mut batch = WriteBatch::new();
        batch.set(RecordKind::SenderKey, id, codec::encode(&record)?);
        self.store.put(batch).await?;
        Ok(())
    }

    /// Devices from `candidates` that still need our current sender key for
    /// the group.
    pub fn devices_needing_key(&self, group: &Jid, candidates: &[Jid]) -> Vec<Jid> {
        let distributed = self.distributed.lock().expect("distribution set mutex poisoned");
        let seen = distributed.get(&group.user);
        candidates
            .iter()
            .filter(|device| seen.is_none_or(|seen| !seen.contains(&Self::session_id(device))))
            .cloned()
            .collect()
    }

    /// Record that the listed devices received our current sender key.
    pub fn mark_distributed(&self, group: &Jid, devices: &[Jid]) {
        let mut distributed = self.distributed.lock().expect("distribution set mutex poisoned");
        let seen = distributed.entry(group.user.clone()).or_default();
        for device in devices {
            seen.insert(Self::session_id(device));
        }
    }

    fn forget_distribution(&self, group: &Jid) {
        let mut distributed = self.distributed.lock().expect("distribution set mutex poisoned");
        distributed.remove(&group.user);
    }

    async fn load_session(&self, id: &str) -> Result<Option<Session>, ClientError> {
        let Some(bytes) = self.store.get_one(RecordKind::Session, id).await? else {
            return Ok(None);
        };
        decode_record(RecordKind::Session, id, &bytes).map(Some)
    }

    async fn persist_session(&self, id: &str, session: &Session) -> Result<(), ClientError> {
        let mut batch = WriteBatch::new();
        batch.set(RecordKind::Session, id, codec::encode(session)?);
        Ok(self.store.put(batch).await?)
    }
}

/// Decode stored record bytes, reporting failures as corruption.
fn decode_record<T: DeserializeOwned>(
    kind: RecordKind,
    id: &str,
    bytes: &[u8],
) -> Result<T, ClientError> {
    ciborium::de::from_reader(bytes).map_err(|error| {
        ClientError::Store(StoreError::Corrupt {
            kind,
            id: id.to_string(),
            reason: error.to_string(),
        })
    })
}

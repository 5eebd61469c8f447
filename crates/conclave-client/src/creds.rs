//! Device credentials and the one-time pre-key supply.
//!
//! One [`Credentials`] value holds everything a device needs to establish
//! and accept sessions: its identifiers in both namespaces, the agreement
//! and signing identities, the current signed pre-key, and the counter the
//! one-time pre-key supply mints from.
//!
//! Minting produces the records and the [`WriteBatch`] that persists them
//! in one call, so a pre-key can never be handed out without also landing
//! in the store it must later be consumed from.

use conclave_core::env::Environment;
use conclave_core::store::{RecordKind, WriteBatch};
use conclave_crypto::{
    KeyPair, PreKey, PreKeyBundle, SignedPreKey, SigningKeyPair, generate_registration_id,
};
use conclave_proto::Jid;

use crate::codec;
use crate::error::ClientError;

/// Pre-keys minted per replenishment round.
pub const MIN_PREKEY_COUNT: u32 = 5;

/// Everything one device needs to run the encryption protocol.
pub struct Credentials {
    /// Our phone-number-namespace identifier.
    pub me_pn: Jid,
    /// Our anonymized identifier, once the server has assigned one.
    pub me_lid: Option<Jid>,
    /// Registration id published alongside our key material.
    pub registration_id: u32,
    /// Agreement identity key pair.
    pub identity: KeyPair,
    /// Signing identity key pair.
    pub signing: SigningKeyPair,
    /// Current signed pre-key.
    pub signed_pre_key: SignedPreKey,
    /// Signed device identity blob, echoed in retry receipts.
    pub device_identity: Vec<u8>,
    /// Next unused one-time pre-key id.
    pub next_pre_key_id: u32,
}

impl Credentials {
    /// Fresh credentials with all key material drawn from the environment.
    pub fn generate<E: Environment>(env: &E, me_pn: Jid) -> Self {
        let mut seed = [0u8; 32];

        env.random_bytes(&mut seed);
        let identity = KeyPair::from_seed(seed);
        env.random_bytes(&mut seed);
        let signing = SigningKeyPair::from_seed(seed);
        env.random_bytes(&mut seed);
        let signed_pre_key = SignedPreKey::create(1, KeyPair::from_seed(seed), &signing);

        let mut reg = [0u8; 2];
        env.random_bytes(&mut reg);

        let device_identity = signing.sign(&identity.public_bytes());

        Self {
            me_pn,
            me_lid: None,
            registration_id: generate_registration_id(reg),
            identity,
            signing,
            signed_pre_key,
            device_identity,
            next_pre_key_id: 1,
        }
    }

    /// Attach the server-assigned LID identifier.
    #[must_use]
    pub fn with_lid(mut self, me_lid: Jid) -> Self {
        self.me_lid = Some(me_lid);
        self
    }

    /// Mint `count` fresh one-time pre-keys.
    ///
    /// Bumps the id counter and returns the keys together with the batch
    /// that persists them (kind [`RecordKind::PreKey`], id = decimal key
    /// id). The caller applies the batch before publishing any of the
    /// public halves.
    pub fn mint_pre_keys<E: Environment>(
        &mut self,
        env: &E,
        count: u32,
    ) -> Result<(Vec<PreKey>, WriteBatch), ClientError> {
        let mut keys = Vec::with_capacity(count as usize);
        let mut batch = WriteBatch::new();

        for _ in 0..count {
            let id = self.next_pre_key_id;
            self.next_pre_key_id += 1;

            let mut seed = [0u8; 32];
            env.random_bytes(&mut seed);
            let pre_key = PreKey { id, key_pair: KeyPair::from_seed(seed) };

            batch.set(RecordKind::PreKey, id.to_string(), codec::encode(&pre_key)?);
            keys.push(pre_key);
        }

        Ok((keys, batch))
    }

    /// Our published bundle, as a peer fetching it from the directory
    /// would see it.
    pub fn pre_key_bundle(&self, one_time: Option<&PreKey>) -> PreKeyBundle {
        PreKeyBundle {
            registration_id: self.registration_id,
            identity_key: self.identity.public_bytes(),
            signing_key: self.signing.public_bytes(),
            signed_pre_key_id: self.signed_pre_key.id,
            signed_pre_key_public: self.signed_pre_key.key_pair.public_bytes(),
            signed_pre_key_signature: self.signed_pre_key.signature.clone(),
            pre_key_id: one_time.map(|key| key.id),
            pre_key_public: one_time.map(|key| key.key_pair.public_bytes()),
        }
    }
}

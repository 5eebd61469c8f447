//! Pairwise sessions: X3DH-style establishment plus per-direction chains.
//!
//! The initiator derives a shared secret from a peer's published pre-key
//! bundle and sends `pkmsg` envelopes (ciphertext plus the establishment
//! material) until the peer's first reply confirms the session; from then
//! on bare `msg` chain messages flow. The responder derives the mirrored
//! secret from the envelope and is confirmed immediately.
//!
//! # Invariants
//!
//! - Chain Direction: the initiator's send chain is the responder's receive
//!   chain and vice versa. Both sides derive both chains from the same HKDF
//!   output; only the assignment differs.
//!
//! - Failure Isolation: a failed decrypt leaves the session state untouched.
//!   Chains only commit once the AEAD accepts the ciphertext.
//!
//! - Replay Identity: re-processing a pkmsg that carries the base key of an
//!   existing session must reuse that session rather than re-derive it.
//!   [`Session::matches_pkmsg`] is the test.

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::keys::{KeyPair, PreKeyBundle, verify_signature};
use crate::ratchet::{ChainRatchet, NONCE_RANDOM_SIZE, open, seal};

/// HKDF info label for session chain derivation.
const SESSION_LABEL: &[u8] = b"conclavePairwiseV1";

/// Ratcheted ciphertext for an established session (wire kind `msg`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainMessage {
    /// Chain generation the message key was derived at.
    pub generation: u32,
    /// Caller-provided nonce randomness.
    pub random: [u8; NONCE_RANDOM_SIZE],
    /// AEAD ciphertext with tag.
    pub ciphertext: Vec<u8>,
}

/// Session-establishing ciphertext (wire kind `pkmsg`).
///
/// Carries the establishment material alongside an ordinary chain message,
/// so the first payload never costs an extra round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyEnvelope {
    /// Sender's registration id.
    pub registration_id: u32,
    /// One-time pre-key consumed, when the bundle offered one.
    pub pre_key_id: Option<u32>,
    /// Signed pre-key the agreement ran against.
    pub signed_pre_key_id: u32,
    /// Sender's ephemeral base key.
    pub base_key: [u8; 32],
    /// Sender's agreement identity key.
    pub identity_key: [u8; 32],
    /// The actual ciphertext.
    pub message: ChainMessage,
}

/// Establishment material retained while a session is unconfirmed, echoed
/// in every outgoing pkmsg envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPreKey {
    /// One-time pre-key id from the peer's bundle, if any.
    pub pre_key_id: Option<u32>,
    /// Signed pre-key id from the peer's bundle.
    pub signed_pre_key_id: u32,
    /// Our ephemeral base key, public half.
    pub base_key: [u8; 32],
}

/// A pairwise ratchet session, persisted as an opaque record.
#[derive(Clone, Serialize, Deserialize)]
pub struct Session {
    send: ChainRatchet,
    recv: ChainRatchet,
    their_identity: [u8; 32],
    base_key: [u8; 32],
    confirmed: bool,
    pending: Option<PendingPreKey>,
}

impl Session {
    /// Start a session as initiator from a peer's pre-key bundle.
    ///
    /// Verifies the signed pre-key signature, then derives chains from
    /// `DH(base, spk) ∥ DH(identity, spk) ∥ DH(base, peer identity)`
    /// plus `DH(base, one-time)` when the bundle offered a one-time key.
    /// The result is unconfirmed until the peer's first message decrypts.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::InvalidBundleSignature`] / `BadKeyMaterial` when the
    ///   bundle's signed pre-key does not verify
    pub fn initiate(
        our_identity: &KeyPair,
        bundle: &PreKeyBundle,
        base_seed: [u8; 32],
    ) -> Result<Self, CryptoError> {
        verify_signature(
            &bundle.signing_key,
            &bundle.signed_pre_key_public,
            &bundle.signed_pre_key_signature,
        )?;

        let base = KeyPair::from_seed(base_seed);

        let mut secrets = vec![
            base.agree(&bundle.signed_pre_key_public),
            our_identity.agree(&bundle.signed_pre_key_public),
            base.agree(&bundle.identity_key),
        ];
        if let Some(one_time) = &bundle.pre_key_public {
            secrets.push(base.agree(one_time));
        }

        let (chain_a, chain_b) = derive_chains(&mut secrets);

        Ok(Self {
            send: ChainRatchet::new(chain_a),
            recv: ChainRatchet::new(chain_b),
            their_identity: bundle.identity_key,
            base_key: base.public_bytes(),
            confirmed: false,
            pending: Some(PendingPreKey {
                pre_key_id: bundle.pre_key_id,
                signed_pre_key_id: bundle.signed_pre_key_id,
                base_key: base.public_bytes(),
            }),
        })
    }

    /// Accept a session as responder from an incoming pkmsg envelope.
    ///
    /// The caller resolves the referenced signed and one-time pre-keys; a
    /// missing one-time key must be rejected before calling this. The
    /// produced session is confirmed immediately — the envelope itself
    /// proves the initiator holds the chains.
    pub fn respond(
        envelope: &PreKeyEnvelope,
        our_identity: &KeyPair,
        signed_pre_key: &KeyPair,
        one_time_pre_key: Option<&KeyPair>,
    ) -> Self {
        let mut secrets = vec![
            signed_pre_key.agree(&envelope.base_key),
            signed_pre_key.agree(&envelope.identity_key),
            our_identity.agree(&envelope.base_key),
        ];
        if let Some(one_time) = one_time_pre_key {
            secrets.push(one_time.agree(&envelope.base_key));
        }

        let (chain_a, chain_b) = derive_chains(&mut secrets);

        // Mirrored assignment: the initiator sends on chain A.
        Self {
            send: ChainRatchet::new(chain_b),
            recv: ChainRatchet::new(chain_a),
            their_identity: envelope.identity_key,
            base_key: envelope.base_key,
            confirmed: true,
            pending: None,
        }
    }

    /// Encrypt on the send chain.
    ///
    /// While [`Session::pending_pre_key`] is `Some`, the caller wraps the
    /// result in a [`PreKeyEnvelope`]; afterwards it travels bare.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::GenerationOverflow`] when the send chain is exhausted
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        random: [u8; NONCE_RANDOM_SIZE],
    ) -> Result<ChainMessage, CryptoError> {
        let key = self.send.advance()?;
        let ciphertext = seal(&key, random, plaintext);
        Ok(ChainMessage { generation: key.generation(), random, ciphertext })
    }

    /// Decrypt from the receive chain.
    ///
    /// The chain only commits when the AEAD accepts the ciphertext, so a
    /// failure leaves the session exactly as it was. The first successful
    /// decrypt confirms an unconfirmed session.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::RatchetOutOfRange`] for messages behind the chain or
    ///   beyond the skip bound
    /// - [`CryptoError::DecryptionFailed`] on authentication failure
    pub fn decrypt(&mut self, message: &ChainMessage) -> Result<Vec<u8>, CryptoError> {
        let mut recv = self.recv.clone();
        let key = recv.advance_to(message.generation)?;
        let plaintext = open(&key, message.random, &message.ciphertext)?;

        self.recv = recv;
        if !self.confirmed {
            self.confirmed = true;
            self.pending = None;
        }

        Ok(plaintext)
    }

    /// Whether the peer has proven possession of the chains.
    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    /// Establishment material for pkmsg envelopes, while unconfirmed.
    pub fn pending_pre_key(&self) -> Option<&PendingPreKey> {
        self.pending.as_ref()
    }

    /// Base key this session was established under.
    pub fn base_key(&self) -> &[u8; 32] {
        &self.base_key
    }

    /// Peer's agreement identity key.
    pub fn their_identity(&self) -> &[u8; 32] {
        &self.their_identity
    }

    /// Whether a pkmsg envelope re-establishes this very session.
    pub fn matches_pkmsg(&self, envelope: &PreKeyEnvelope) -> bool {
        self.base_key == envelope.base_key
    }
}

/// Concatenate DH outputs, expand to two 32-byte chain seeds, and wipe the
/// inputs.
fn derive_chains(secrets: &mut Vec<[u8; 32]>) -> ([u8; 32], [u8; 32]) {
    let mut ikm = Vec::with_capacity(secrets.len() * 32);
    for secret in secrets.iter() {
        ikm.extend_from_slice(secret);
    }

    let hkdf = Hkdf::<Sha256>::new(None, &ikm);
    let mut okm = [0u8; 64];
    let Ok(()) = hkdf.expand(SESSION_LABEL, &mut okm) else {
        unreachable!("64 bytes is a valid HKDF-SHA256 output length");
    };

    let mut chain_a = [0u8; 32];
    let mut chain_b = [0u8; 32];
    chain_a.copy_from_slice(&okm[..32]);
    chain_b.copy_from_slice(&okm[32..]);

    okm.zeroize();
    ikm.zeroize();
    for secret in secrets.iter_mut() {
        secret.zeroize();
    }

    (chain_a, chain_b)
}

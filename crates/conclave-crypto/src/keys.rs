//! Key material: X25519 agreement keys, Ed25519 signing keys, pre-keys.
//!
//! Pre-keys are published to the directory ahead of time so peers can start
//! sessions while a device is offline. One-time pre-keys are consumed on
//! first use; the signed pre-key is long-lived and carries a signature by
//! the device's signing identity.
//!
//! All generation takes caller-provided seeds. Nothing here reads an RNG.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;

/// X25519 agreement key pair.
///
/// Stores raw bytes so session records serialize; the dalek types are
/// rebuilt per operation.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyPair {
    secret: [u8; 32],
    public: [u8; 32],
}

impl KeyPair {
    /// Derive a key pair from 32 seed bytes.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let secret = StaticSecret::from(seed);
        let public = PublicKey::from(&secret);
        Self { secret: seed, public: public.to_bytes() }
    }

    /// Public half, as raw bytes.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public
    }

    /// Diffie-Hellman agreement with a peer public key.
    pub fn agree(&self, their_public: &[u8; 32]) -> [u8; 32] {
        let secret = StaticSecret::from(self.secret);
        secret.diffie_hellman(&PublicKey::from(*their_public)).to_bytes()
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Ed25519 signing key pair for pre-key signatures and device identity.
#[derive(Clone, Serialize, Deserialize)]
pub struct SigningKeyPair {
    secret: [u8; 32],
    public: [u8; 32],
}

impl SigningKeyPair {
    /// Derive a signing key pair from 32 seed bytes.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        Self { secret: seed, public: signing.verifying_key().to_bytes() }
    }

    /// Public (verifying) half, as raw bytes.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public
    }

    /// Sign a message; 64-byte Ed25519 signature.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signing = SigningKey::from_bytes(&self.secret);
        signing.sign(message).to_bytes().to_vec()
    }
}

impl Drop for SigningKeyPair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Verify an Ed25519 signature against a raw verifying key.
///
/// # Errors
///
/// - [`CryptoError::BadKeyMaterial`] when the verifying key is not a valid
///   curve point or the signature is not 64 bytes
/// - [`CryptoError::InvalidBundleSignature`] when verification fails
pub fn verify_signature(
    verifying_key: &[u8; 32],
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(verifying_key).map_err(|_| CryptoError::BadKeyMaterial {
        reason: "verifying key is not a valid point".to_string(),
    })?;
    let signature = Signature::from_slice(signature).map_err(|_| CryptoError::BadKeyMaterial {
        reason: "signature is not 64 bytes".to_string(),
    })?;

    key.verify(message, &signature).map_err(|_| CryptoError::InvalidBundleSignature)
}

/// One-time pre-key, consumed when a peer establishes a session with it.
#[derive(Clone, Serialize, Deserialize)]
pub struct PreKey {
    /// Directory id the peer references in its pkmsg.
    pub id: u32,
    /// Agreement key pair.
    pub key_pair: KeyPair,
}

/// Long-lived pre-key signed by the device's signing identity.
#[derive(Clone, Serialize, Deserialize)]
pub struct SignedPreKey {
    /// Directory id.
    pub id: u32,
    /// Agreement key pair.
    pub key_pair: KeyPair,
    /// Ed25519 signature over the public half.
    pub signature: Vec<u8>,
}

impl SignedPreKey {
    /// Build and sign a pre-key with the device's signing identity.
    pub fn create(id: u32, key_pair: KeyPair, signing: &SigningKeyPair) -> Self {
        let signature = signing.sign(&key_pair.public_bytes());
        Self { id, key_pair, signature }
    }
}

/// A peer's published keys, fetched from the directory to start a session.
#[derive(Clone, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Peer's registration id.
    pub registration_id: u32,
    /// Peer's agreement identity key.
    pub identity_key: [u8; 32],
    /// Peer's signing identity (verifies the signed pre-key).
    pub signing_key: [u8; 32],
    /// Signed pre-key id.
    pub signed_pre_key_id: u32,
    /// Signed pre-key public half.
    pub signed_pre_key_public: [u8; 32],
    /// Signature over the signed pre-key public half.
    pub signed_pre_key_signature: Vec<u8>,
    /// One-time pre-key id, when the directory had one left.
    pub pre_key_id: Option<u32>,
    /// One-time pre-key public half.
    pub pre_key_public: Option<[u8; 32]>,
}

/// Derive a 14-bit registration id from two random bytes.
///
/// The mask keeps ids inside the range the wire format reserves for them.
pub fn generate_registration_id(random: [u8; 2]) -> u32 {
    u32::from(u16::from_be_bytes(random) & 0x3fff)
}

//! Forward-secure chain ratchet and single-use message keys.
//!
//! Both pairwise sessions (one chain per direction) and group sender keys
//! (one chain per author) advance the same HMAC-SHA256 ratchet. The chain
//! state is serializable because session records persist across restarts;
//! message keys never are.
//!
//! # Security Properties
//!
//! - Forward Secrecy: old chain keys are zeroized when advancing
//! - Key Uniqueness: each generation produces a unique message key
//! - Determinism: the same seed always produces the same key sequence

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Ratchet step input deriving the next chain key.
const CHAIN_STEP: &[u8] = &[0x02];

/// Ratchet step input deriving a message key.
const MESSAGE_SEED: &[u8] = &[0x01];

/// Maximum number of generations a receive chain may skip forward.
/// Bounds the work done for out-of-order or dropped messages.
pub const MAX_SKIP: u32 = 1000;

/// Size of the caller-provided random suffix in each nonce.
pub const NONCE_RANDOM_SIZE: usize = 8;

/// A message key derived from the ratchet.
///
/// Valid for exactly one [`seal`] or [`open`] call; dropped (and zeroized)
/// immediately after.
#[derive(Clone)]
pub struct MessageKey {
    key: [u8; 32],
    generation: u32,
}

impl MessageKey {
    /// 32-byte symmetric key for the AEAD.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Chain generation this key was derived at.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Forward-secure symmetric chain.
///
/// Each [`advance`](Self::advance):
/// 1. derives a message key from the current chain key,
/// 2. derives the next chain key,
/// 3. overwrites (zeroizes) the old chain key,
/// 4. increments the generation counter.
#[derive(Clone, Serialize, Deserialize)]
pub struct ChainRatchet {
    chain_key: [u8; 32],
    generation: u32,
}

impl ChainRatchet {
    /// Fresh chain starting at generation zero.
    pub fn new(seed: [u8; 32]) -> Self {
        Self { chain_key: seed, generation: 0 }
    }

    /// Chain resumed at an arbitrary position, as carried by a sender-key
    /// distribution message.
    pub fn resume(chain_key: [u8; 32], generation: u32) -> Self {
        Self { chain_key, generation }
    }

    /// Number of times this chain has advanced.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Current chain key, for building a distribution snapshot.
    ///
    /// Handing this out does not weaken forward secrecy for earlier
    /// messages: it only lets the holder derive keys from here on, which is
    /// exactly what a distribution message is for.
    pub fn chain_key(&self) -> &[u8; 32] {
        &self.chain_key
    }

    /// Advance one step and return the message key for the step just taken.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::GenerationOverflow`] when the counter is exhausted
    pub fn advance(&mut self) -> Result<MessageKey, CryptoError> {
        if self.generation == u32::MAX {
            return Err(CryptoError::GenerationOverflow { current: self.generation });
        }

        let message_key = self.step(MESSAGE_SEED);
        let next_chain_key = self.step(CHAIN_STEP);

        self.chain_key.zeroize();
        self.chain_key = next_chain_key;

        let current = self.generation;
        self.generation = self.generation.wrapping_add(1);

        Ok(MessageKey { key: message_key, generation: current })
    }

    /// Advance to exactly `target` and return that generation's key.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::RatchetOutOfRange`] when `target` is behind the chain
    ///   position (those keys are gone) or more than [`MAX_SKIP`] ahead
    pub fn advance_to(&mut self, target: u32) -> Result<MessageKey, CryptoError> {
        if target < self.generation {
            return Err(CryptoError::RatchetOutOfRange {
                current: self.generation,
                requested: target,
            });
        }

        // No underflow: target >= self.generation checked above.
        if target.wrapping_sub(self.generation) > MAX_SKIP {
            return Err(CryptoError::RatchetOutOfRange {
                current: self.generation,
                requested: target,
            });
        }

        let mut message_key = None;
        while self.generation <= target {
            message_key = Some(self.advance()?);
        }

        // The loop ran at least once: target >= generation at entry.
        message_key
            .ok_or(CryptoError::RatchetOutOfRange { current: self.generation, requested: target })
    }

    fn step(&self, label: &[u8]) -> [u8; 32] {
        let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(&self.chain_key) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(label);
        let result = mac.finalize().into_bytes();

        let mut key = [0u8; 32];
        key.copy_from_slice(&result);
        key
    }
}

impl Drop for ChainRatchet {
    fn drop(&mut self) {
        self.chain_key.zeroize();
    }
}

/// Encrypt with a single-use message key.
///
/// Nonce layout (24 bytes): `generation BE(4) ∥ random(8) ∥ zeros(12)`.
/// The generation binds the ciphertext to its chain position; uniqueness
/// comes from the key itself being single-use.
pub fn seal(message_key: &MessageKey, random: [u8; NONCE_RANDOM_SIZE], plaintext: &[u8]) -> Vec<u8> {
    let nonce = build_nonce(message_key.generation(), random);
    let cipher = XChaCha20Poly1305::new(message_key.key().into());

    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(&nonce), plaintext) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    ciphertext
}

/// Decrypt with a single-use message key.
///
/// # Errors
///
/// - [`CryptoError::DecryptionFailed`] on authentication failure (wrong key,
///   wrong generation, or tampering)
pub fn open(
    message_key: &MessageKey,
    random: [u8; NONCE_RANDOM_SIZE],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let nonce = build_nonce(message_key.generation(), random);
    let cipher = XChaCha20Poly1305::new(message_key.key().into());

    cipher.decrypt(XNonce::from_slice(&nonce), ciphertext).map_err(|_| {
        CryptoError::DecryptionFailed { reason: "authentication failed".to_string() }
    })
}

fn build_nonce(generation: u32, random: [u8; NONCE_RANDOM_SIZE]) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[0..4].copy_from_slice(&generation.to_be_bytes());
    nonce[4..4 + NONCE_RANDOM_SIZE].copy_from_slice(&random);
    nonce
}

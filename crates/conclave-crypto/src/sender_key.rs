//! Group fan-out keys: one sender chain shared with every member.
//!
//! A group author keeps a single [`SenderKeyRecord`] per group and mails its
//! [`SenderKeyDistribution`] to each member over their pairwise session.
//! Members resume the chain from the distribution and decrypt `skmsg`
//! payloads without further key agreement.
//!
//! A distribution captures the chain at the generation it was taken, so a
//! late joiner can read messages from that point forward but nothing
//! earlier.

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::ratchet::{ChainRatchet, NONCE_RANDOM_SIZE, open, seal};

/// Chain snapshot an author shares with group members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyDistribution {
    /// Identifies the chain; changes when the author rotates.
    pub key_id: u32,
    /// Generation the snapshot was taken at.
    pub generation: u32,
    /// Chain key at that generation.
    pub chain_key: [u8; 32],
}

/// Group ciphertext (wire kind `skmsg`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPayload {
    /// Chain the payload was encrypted under.
    pub key_id: u32,
    /// Chain generation of the message key.
    pub generation: u32,
    /// Caller-provided nonce randomness.
    pub random: [u8; NONCE_RANDOM_SIZE],
    /// AEAD ciphertext with tag.
    pub ciphertext: Vec<u8>,
}

/// One (group, author) sender chain, persisted as an opaque record.
///
/// The author's own record and every member's copy share this type; the
/// author encrypts on it, members only ever decrypt.
#[derive(Clone, Serialize, Deserialize)]
pub struct SenderKeyRecord {
    key_id: u32,
    chain: ChainRatchet,
}

impl SenderKeyRecord {
    /// Start a fresh chain, used by an author creating or rotating a key.
    pub fn create(key_id: u32, seed: [u8; 32]) -> Self {
        Self { key_id, chain: ChainRatchet::new(seed) }
    }

    /// Resume a peer's chain from a received distribution.
    pub fn from_distribution(distribution: &SenderKeyDistribution) -> Self {
        Self {
            key_id: distribution.key_id,
            chain: ChainRatchet::resume(distribution.chain_key, distribution.generation),
        }
    }

    /// Whether a distribution describes the chain this record already holds.
    pub fn matches_distribution(&self, distribution: &SenderKeyDistribution) -> bool {
        self.key_id == distribution.key_id
    }

    /// Snapshot the chain for mailing to a member.
    pub fn distribution(&self) -> SenderKeyDistribution {
        SenderKeyDistribution {
            key_id: self.key_id,
            generation: self.chain.generation(),
            chain_key: *self.chain.chain_key(),
        }
    }

    /// Chain identifier.
    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    /// Encrypt the next group message on this chain.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::GenerationOverflow`] when the chain is exhausted
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        random: [u8; NONCE_RANDOM_SIZE],
    ) -> Result<GroupPayload, CryptoError> {
        let key = self.chain.advance()?;
        let ciphertext = seal(&key, random, plaintext);
        Ok(GroupPayload {
            key_id: self.key_id,
            generation: key.generation(),
            random,
            ciphertext,
        })
    }

    /// Decrypt a group payload, committing the chain only on success.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::StaleSenderKey`] when the payload references a
    ///   different chain than this record holds
    /// - [`CryptoError::RatchetOutOfRange`] for payloads behind the chain or
    ///   beyond the skip bound
    /// - [`CryptoError::DecryptionFailed`] on authentication failure
    pub fn decrypt(&mut self, payload: &GroupPayload) -> Result<Vec<u8>, CryptoError> {
        if payload.key_id != self.key_id {
            return Err(CryptoError::StaleSenderKey { ours: self.key_id, theirs: payload.key_id });
        }

        let mut chain = self.chain.clone();
        let key = chain.advance_to(payload.generation)?;
        let plaintext = open(&key, payload.random, &payload.ciphertext)?;

        self.chain = chain;
        Ok(plaintext)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn members_decrypt_from_distribution() {
        let mut author = SenderKeyRecord::create(7, [0xa1; 32]);
        let mut member = SenderKeyRecord::from_distribution(&author.distribution());

        let p0 = author.encrypt(b"hello group", [1; 8]).unwrap();
        let p1 = author.encrypt(b"still here", [2; 8]).unwrap();

        assert_eq!(member.decrypt(&p0).unwrap(), b"hello group");
        assert_eq!(member.decrypt(&p1).unwrap(), b"still here");
    }

    #[test]
    fn late_joiner_cannot_read_backwards() {
        let mut author = SenderKeyRecord::create(7, [0xa2; 32]);
        let early = author.encrypt(b"before the join", [1; 8]).unwrap();

        // Snapshot taken after the first message.
        let mut member = SenderKeyRecord::from_distribution(&author.distribution());
        let late = author.encrypt(b"after the join", [2; 8]).unwrap();

        assert_eq!(member.decrypt(&late).unwrap(), b"after the join");
        assert!(matches!(
            member.decrypt(&early),
            Err(CryptoError::RatchetOutOfRange { .. })
        ));
    }

    #[test]
    fn rotated_chain_is_reported_stale() {
        let mut old_author = SenderKeyRecord::create(1, [0xa3; 32]);
        let mut member = SenderKeyRecord::from_distribution(&old_author.distribution());

        let mut rotated = SenderKeyRecord::create(2, [0xa4; 32]);
        let payload = rotated.encrypt(b"new chain", [3; 8]).unwrap();

        assert!(matches!(
            member.decrypt(&payload),
            Err(CryptoError::StaleSenderKey { ours: 1, theirs: 2 })
        ));
        assert!(!member.matches_distribution(&rotated.distribution()));

        // Old traffic still decrypts; the chain did not move.
        let old_payload = old_author.encrypt(b"old chain", [4; 8]).unwrap();
        assert_eq!(member.decrypt(&old_payload).unwrap(), b"old chain");
    }

    #[test]
    fn tampered_payload_does_not_advance_chain() {
        let mut author = SenderKeyRecord::create(9, [0xa5; 32]);
        let mut member = SenderKeyRecord::from_distribution(&author.distribution());

        let payload = author.encrypt(b"genuine", [5; 8]).unwrap();
        let mut tampered = payload.clone();
        tampered.ciphertext[0] ^= 0x80;

        assert!(member.decrypt(&tampered).is_err());
        assert_eq!(member.decrypt(&payload).unwrap(), b"genuine");
    }

    #[test]
    fn record_survives_serialization() {
        let mut author = SenderKeyRecord::create(3, [0xa6; 32]);
        let member = SenderKeyRecord::from_distribution(&author.distribution());

        let mut wire = Vec::new();
        ciborium::ser::into_writer(&member, &mut wire).unwrap();
        let mut restored: SenderKeyRecord = ciborium::de::from_reader(wire.as_slice()).unwrap();

        let payload = author.encrypt(b"post-restart", [6; 8]).unwrap();
        assert_eq!(restored.decrypt(&payload).unwrap(), b"post-restart");
        assert_eq!(member.key_id(), 3);
    }
}

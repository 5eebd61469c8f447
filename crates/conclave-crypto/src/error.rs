//! Error types for session and sender-key operations.

use thiserror::Error;

/// Errors from cryptographic session operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Receive chain cannot reach the requested generation: either the
    /// message is older than the chain position, or further ahead than the
    /// skip bound allows.
    #[error("ratchet cannot reach generation {requested} from {current}")]
    RatchetOutOfRange {
        /// Current chain generation.
        current: u32,
        /// Generation the message was encrypted at.
        requested: u32,
    },

    /// Chain generation counter would overflow.
    #[error("ratchet generation overflow at {current}")]
    GenerationOverflow {
        /// Current chain generation.
        current: u32,
    },

    /// AEAD rejected the ciphertext (wrong key or tampering).
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Reason for the failure.
        reason: String,
    },

    /// Signed pre-key signature did not verify against the signing identity.
    #[error("pre-key bundle signature invalid")]
    InvalidBundleSignature,

    /// Public key material was structurally invalid.
    #[error("bad key material: {reason}")]
    BadKeyMaterial {
        /// Reason the material was rejected.
        reason: String,
    },

    /// Group ciphertext references a different sender key than installed.
    #[error("stale sender key: record has id {ours}, message has id {theirs}")]
    StaleSenderKey {
        /// Key id of the installed record.
        ours: u32,
        /// Key id the message was encrypted under.
        theirs: u32,
    },
}

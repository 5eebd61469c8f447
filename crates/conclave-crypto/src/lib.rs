//! Conclave Cryptographic Core
//!
//! Pairwise sessions and group sender keys for the Conclave messaging core.
//! Pure state machines with deterministic outputs: callers provide every
//! random byte, which keeps tests reproducible and key handling auditable.
//!
//! # Key Lifecycle
//!
//! Pairwise sessions derive their chains from an X3DH-style agreement over a
//! peer's published pre-key bundle; group messages derive theirs from a
//! sender-key distribution message the author fans out once per key epoch.
//! Both feed the same forward-secure chain ratchet.
//!
//! ```text
//! Pre-key bundle / pkmsg              Sender-key distribution
//!          │                                    │
//!          ▼                                    ▼
//!  X3DH secret ──HKDF──► send + recv      sender chain
//!          chains             │                 │
//!          └───────► ChainRatchet ◄─────────────┘
//!                         │
//!                         ▼
//!            MessageKey (single use)
//!                         │
//!                         ▼
//!          XChaCha20-Poly1305 ──► ciphertext
//! ```
//!
//! # Security
//!
//! Forward Secrecy:
//! - Chain keys are zeroized the moment the next one is derived
//! - Message keys are used for exactly one seal or open, then dropped
//!
//! Establishment Authenticity:
//! - Signed pre-keys are verified against the peer's signing identity before
//!   any shared secret is derived
//! - The DH set binds both identities and the ephemeral base key, so neither
//!   side can be impersonated by replaying a bundle
//!
//! Message Authenticity:
//! - XChaCha20-Poly1305 rejects any tampered ciphertext
//! - The nonce binds the chain generation to the ciphertext
//!
//! What this crate does NOT do: storage, addressing, retries, and namespace
//! resolution live above it. It never performs I/O.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod error;
mod keys;
mod ratchet;
mod sender_key;
mod session;

pub use error::CryptoError;
pub use keys::{
    KeyPair, PreKey, PreKeyBundle, SignedPreKey, SigningKeyPair, generate_registration_id,
    verify_signature,
};
pub use ratchet::{ChainRatchet, MAX_SKIP, MessageKey, NONCE_RANDOM_SIZE, open, seal};
pub use sender_key::{GroupPayload, SenderKeyDistribution, SenderKeyRecord};
pub use session::{ChainMessage, PendingPreKey, PreKeyEnvelope, Session};

//! Error types for the client protocol core.
//!
//! Failures are typed by what went wrong, not by message text: the retry
//! orchestrator and the circuit breaker classify errors by matching on
//! variants, so a renamed log line can never change retry behavior.

use std::time::Duration;

use conclave_core::StoreError;
use conclave_crypto::CryptoError;
use conclave_proto::BodyError;
use thiserror::Error;

/// Errors from decryption, session management and the retry protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// An established-session message arrived with no session to decrypt it.
    #[error("no session for {address}")]
    MissingSession {
        /// Protocol address the session would be keyed under.
        address: String,
    },

    /// A group message arrived before the author's key distribution.
    #[error("no sender key for {author} in {group}")]
    NoSenderKey {
        /// Group the message was sent to.
        group: String,
        /// Author's protocol address.
        author: String,
    },

    /// A pkmsg referenced a one-time pre-key that is gone or never existed.
    #[error("pre-key {id} unavailable: used already or never filled")]
    PreKeyUnavailable {
        /// Referenced pre-key id.
        id: u32,
    },

    /// Ratchet or AEAD failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Inner message body failed to unpad or decode.
    #[error(transparent)]
    Body(#[from] BodyError),

    /// An `enc` node declared a content kind this client does not know.
    #[error("unknown enc kind {kind:?}")]
    UnknownEncKind {
        /// The wire value of the `type` attribute.
        kind: String,
    },

    /// The stanza is structurally invalid for its declared shape.
    #[error("malformed stanza: {reason}")]
    MalformedStanza {
        /// What was missing or contradictory.
        reason: String,
    },

    /// A ciphertext envelope failed to deserialize.
    #[error("bad wire envelope: {reason}")]
    Wire {
        /// Deserializer's description of the failure.
        reason: String,
    },

    /// The transport refused or failed a send.
    #[error("transport error: {reason}")]
    Transport {
        /// Transport's description of the failure.
        reason: String,
    },

    /// A query did not answer within its deadline.
    #[error("query timeout after {elapsed:?}")]
    QueryTimeout {
        /// How long we waited.
        elapsed: Duration,
    },
}

impl ClientError {
    /// Whether this failure indicates exhausted or missing pre-keys.
    ///
    /// The retry orchestrator replenishes the server-side pre-key supply
    /// before retrying these.
    pub fn is_pre_key_related(&self) -> bool {
        matches!(self, Self::PreKeyUnavailable { .. })
    }

    /// Whether the retry circuit breaker should count this failure.
    ///
    /// Session, key and infrastructure failures count: they are the
    /// systemic conditions the breaker exists to dampen. Malformed input
    /// does not: a peer sending garbage says nothing about our ability to
    /// execute retries.
    pub fn is_retry_relevant(&self) -> bool {
        match self {
            Self::MissingSession { .. }
            | Self::NoSenderKey { .. }
            | Self::PreKeyUnavailable { .. }
            | Self::Crypto(_)
            | Self::Store(_)
            | Self::Transport { .. }
            | Self::QueryTimeout { .. } => true,
            Self::Body(_) | Self::UnknownEncKind { .. } | Self::MalformedStanza { .. }
            | Self::Wire { .. } => false,
        }
    }
}

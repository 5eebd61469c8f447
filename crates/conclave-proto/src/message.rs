//! Inner message bodies and transport padding.
//!
//! Decrypted payloads are CBOR-encoded [`MessageBody`] values wrapped in
//! random-length transport padding. A single envelope may carry several
//! encrypted nodes that each contribute a partial body; siblings are folded
//! together with [`MessageBody::merge`].
//!
//! # Padding
//!
//! Before encryption, plaintext gains 1–16 trailing bytes, each equal to the
//! pad length; the length comes from the low nibble of one random byte. After
//! decryption, [`unpad`] reads the final byte and strips that many. Padding
//! hides exact body sizes from the transport without touching the AEAD layer.

use serde::{Deserialize, Serialize};

/// Errors from body encoding, decoding and unpadding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BodyError {
    /// Decrypted payload was empty before unpadding.
    #[error("empty payload, nothing to unpad")]
    EmptyPayload,

    /// Trailing pad byte is zero or larger than the payload.
    #[error("bad padding: pad byte {pad} with {len} payload bytes")]
    BadPadding {
        /// Claimed pad length.
        pad: u8,
        /// Total payload length.
        len: usize,
    },

    /// CBOR encoding failed.
    #[error("body encode failed: {0}")]
    Encode(String),

    /// CBOR decoding failed.
    #[error("body decode failed: {0}")]
    Decode(String),
}

/// Sender-key distribution envelope carried inside a message body.
///
/// The distribution bytes are opaque at this layer; the session repository
/// decodes and installs them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionEnvelope {
    /// Group the key belongs to, in JID text form.
    pub group: String,
    /// Encoded sender-key distribution message.
    pub distribution: Vec<u8>,
}

/// Decrypted inner message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    /// Plain text content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Copy of a message the sender's own alternate device sent. Unwrapped
    /// transparently by the pipeline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_sent: Option<Box<MessageBody>>,

    /// Sender-key distribution for a group the author just (re)keyed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_key_distribution: Option<DistributionEnvelope>,

    /// Protocol-internal control content, opaque to this layer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Vec<u8>>,
}

impl MessageBody {
    /// Body carrying only text, the common case in tests and fixtures.
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), ..Self::default() }
    }

    /// Encode to CBOR.
    ///
    /// # Errors
    ///
    /// - [`BodyError::Encode`] if serialization fails
    pub fn encode(&self) -> Result<Vec<u8>, BodyError> {
        let mut wire = Vec::new();
        ciborium::ser::into_writer(self, &mut wire).map_err(|e| BodyError::Encode(e.to_string()))?;
        Ok(wire)
    }

    /// Decode from CBOR.
    ///
    /// # Errors
    ///
    /// - [`BodyError::Decode`] if deserialization fails
    pub fn decode(bytes: &[u8]) -> Result<Self, BodyError> {
        ciborium::de::from_reader(bytes).map_err(|e| BodyError::Decode(e.to_string()))
    }

    /// Fold a sibling body into this one. Fields the sibling carries
    /// overwrite fields already present; absent fields leave them alone.
    pub fn merge(&mut self, other: MessageBody) {
        let MessageBody { text, device_sent, sender_key_distribution, protocol } = other;
        if text.is_some() {
            self.text = text;
        }
        if device_sent.is_some() {
            self.device_sent = device_sent;
        }
        if sender_key_distribution.is_some() {
            self.sender_key_distribution = sender_key_distribution;
        }
        if protocol.is_some() {
            self.protocol = protocol;
        }
    }

    /// Unwrap an alternate-device copy, or return the body unchanged.
    #[must_use]
    pub fn unwrap_device_sent(self) -> MessageBody {
        match self.device_sent {
            Some(inner) => *inner,
            None => self,
        }
    }
}

/// Append 1–16 bytes of transport padding in place.
///
/// The pad length is `(random_byte & 0x0f) + 1`; every pad byte equals the
/// pad length, so [`unpad`] can recover it from the final byte alone.
pub fn pad(plaintext: &mut Vec<u8>, random_byte: u8) {
    let pad_len = (random_byte & 0x0f) + 1;
    plaintext.extend(std::iter::repeat_n(pad_len, usize::from(pad_len)));
}

/// Strip transport padding, returning the unpadded prefix.
///
/// # Errors
///
/// - [`BodyError::EmptyPayload`] for empty input
/// - [`BodyError::BadPadding`] when the trailing pad byte is zero or exceeds
///   the payload length; both only occur on corrupt or foreign payloads
pub fn unpad(padded: &[u8]) -> Result<&[u8], BodyError> {
    let Some(&pad) = padded.last() else {
        return Err(BodyError::EmptyPayload);
    };

    let len = padded.len();
    if pad == 0 || usize::from(pad) > len {
        return Err(BodyError::BadPadding { pad, len });
    }

    // INVARIANT: 1 <= pad <= len, checked above.
    Ok(&padded[..len - usize::from(pad)])
}

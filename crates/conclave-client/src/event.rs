//! Inbound message results and the wire vocabulary they are built from.

use conclave_proto::{Jid, MessageBody};

use crate::error::ClientError;

/// Content kind of an `enc` node.
///
/// A closed enum: a wire value outside this set fails that node's
/// decryption loudly instead of silently skipping it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncKind {
    /// Session-establishing message carrying a pre-key envelope.
    Pkmsg,
    /// Message on an established pairwise session.
    Msg,
    /// Group message under a sender key.
    Skmsg,
}

impl EncKind {
    /// Parse the wire value of the `type` attribute.
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "pkmsg" => Some(Self::Pkmsg),
            "msg" => Some(Self::Msg),
            "skmsg" => Some(Self::Skmsg),
            _ => None,
        }
    }

    /// The wire value of the `type` attribute.
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::Pkmsg => "pkmsg",
            Self::Msg => "msg",
            Self::Skmsg => "skmsg",
        }
    }
}

impl std::fmt::Display for EncKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Addressing facts decoded from a message stanza, before decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Conversation the message belongs to, at user granularity.
    pub chat: Jid,
    /// Nominal author as the stanza named it. Namespace rewrites happen
    /// later, in the capture stage, never here.
    pub author: Jid,
    /// Whether one of our own devices sent it.
    pub from_me: bool,
    /// Stanza id, echoed in receipts.
    pub message_id: String,
    /// Origin timestamp in seconds, when the stanza carried one.
    pub timestamp: Option<u64>,
    /// Author's self-reported display name.
    pub push_name: Option<String>,
    /// Server-assigned message category.
    pub category: Option<String>,
}

impl DecodedFrame {
    /// Whether this is a peer-directed protocol message.
    ///
    /// Peer messages are device-to-device control traffic; decrypt failures
    /// on them are never retried.
    pub fn is_peer_category(&self) -> bool {
        self.category.as_deref() == Some("peer")
    }
}

/// Terminal outcome class for a message that produced no usable content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubKind {
    /// One or more ciphertext nodes failed to decrypt.
    DecryptFailure,
    /// The stanza carried nothing decryptable at all. Retrying is
    /// meaningless; there was no ciphertext to recover.
    NoContent,
}

/// Placeholder surfaced instead of content when decryption failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageStub {
    /// Failure class.
    pub kind: StubKind,
    /// Per-node failures, in stanza order.
    pub reasons: Vec<ClientError>,
}

impl MessageStub {
    /// Whether any failure indicates exhausted pre-keys.
    pub fn is_pre_key_related(&self) -> bool {
        self.reasons.iter().any(ClientError::is_pre_key_related)
    }
}

/// Result of processing one inbound message stanza.
///
/// Always delivered: a failed message carries a [`MessageStub`] rather than
/// disappearing. `content` and `stub` can coexist when some sibling nodes
/// decrypted and others did not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Decoded addressing facts.
    pub frame: DecodedFrame,
    /// Merged decrypted body, when at least one node decrypted.
    pub content: Option<MessageBody>,
    /// Failure placeholder, when any required node failed.
    pub stub: Option<MessageStub>,
    /// The stanza was a view-once placeholder with deliberately no payload.
    pub view_once: bool,
    /// Verified business name attached to the envelope.
    pub business_name: Option<String>,
    /// Highest retry count the sender declared on its `enc` nodes.
    pub retry_count: u32,
}

impl InboundMessage {
    /// Whether this message needs the retry protocol.
    pub fn is_failed(&self) -> bool {
        self.stub.is_some()
    }
}

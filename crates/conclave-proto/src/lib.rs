//! Conclave Wire Models
//!
//! Identifier and envelope types shared by every layer of the Conclave
//! messaging core. Pure data with deterministic codecs; no I/O and no
//! cryptography.
//!
//! # Components
//!
//! - [`Jid`]: dual-namespace peer identifier (`user[:device]@server`)
//! - [`ProtocolAddress`]: the `name.device` key session records live under
//! - [`Node`]: stanza tree (tag, string attributes, nested or binary content)
//! - [`MessageBody`]: decrypted inner message, CBOR on the wire
//! - [`pad`] / [`unpad`]: transport padding applied around encrypted bodies
//!
//! # Identifier model
//!
//! Every peer is addressable under two parallel namespaces: the phone-number
//! identity (PN, server `s.whatsapp.net`) and the anonymized local identity
//! (LID, server `lid`), each with a hosted variant for companion
//! infrastructure. Groups, broadcast lists and newsletters use their own
//! servers. Which namespace a message was addressed under decides which
//! session record decrypts it, so identifier handling is wire-exact here:
//! a device segment that is present-but-zero is not the same identifier
//! text as an absent one.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod jid;
mod message;
mod node;

pub use jid::{Jid, JidError, ProtocolAddress, Server};
pub use message::{BodyError, DistributionEnvelope, MessageBody, pad, unpad};
pub use node::{Node, NodeContent};

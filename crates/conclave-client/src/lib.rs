//! Conclave client core: inbound decrypt pipeline, session repository, and
//! the retry protocol.
//!
//! This crate turns raw `message` stanzas into decrypted payloads and keeps
//! the cryptographic state that makes that possible:
//!
//! - [`pipeline`]: stanza decode, addressing context, opportunistic identity
//!   capture, and per-node decryption
//! - [`repository`]: pairwise sessions and group sender keys over a record
//!   store, including cross-namespace session migration
//! - [`retry`]: bounded retry receipts with backoff, pre-key replenishment,
//!   and session recreation, guarded by a circuit breaker
//! - [`client`]: the assembled façade wiring all of the above to a
//!   [`Transport`]
//! - [`creds`]: device credentials and pre-key minting
//! - [`event`]: decoded frames, inbound messages, and typed failure stubs
//!
//! # Failure handling
//!
//! A message that cannot be decrypted is still delivered, as an
//! [`InboundMessage`] carrying a typed [`MessageStub`] instead of content.
//! Retryable failures additionally emit a retry receipt asking the sender to
//! re-encrypt; both paths are driven by [`ClientError`] variants rather than
//! string matching.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod client;
mod codec;
pub mod creds;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod repository;
pub mod retry;
pub mod transport;

pub use client::{Client, DirectoryResolver};
pub use creds::{Credentials, MIN_PREKEY_COUNT};
pub use error::ClientError;
pub use event::{DecodedFrame, EncKind, InboundMessage, MessageStub, StubKind};
pub use pipeline::{
    Addressing, AddressingMode, MessagePipeline, decode_frame, extract_addressing_context,
};
pub use repository::{GroupEncrypted, SessionRepository};
pub use retry::{
    CooldownPolicy, PRE_KEY_SETTLE_DELAY, RecreationPolicy, RetryConfig, RetryOrchestrator,
};
pub use transport::Transport;

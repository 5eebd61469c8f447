//! Inbound stanza processing: decode, addressing, capture, decrypt.
//!
//! Four stages, each independently testable:
//!
//! 1. **Decode** ([`decode_frame`]): classify the envelope and pull out the
//!    addressing facts. Structural problems are hard errors here; nothing
//!    later in the pipeline fails the whole message.
//! 2. **Addressing context** ([`extract_addressing_context`]): collect the
//!    alternate-namespace identifiers the envelope declared.
//! 3. **Mapping capture**: when a PN author arrives with a declared LID
//!    alternate and no mapping is known yet, learn the pair, migrate the
//!    session, and decrypt under the LID address from this message on.
//! 4. **Per-node decryption** ([`MessagePipeline::process`]): decrypt every
//!    `enc` child through the repository. A failing node surfaces as a typed
//!    stub on the delivered message while its siblings continue; a stanza is
//!    never silently dropped.

use std::sync::Arc;

use conclave_core::env::Environment;
use conclave_core::mapping::{MappingPair, MappingStore};
use conclave_core::store::RecordStore;
use conclave_proto::{DistributionEnvelope, Jid, MessageBody, Node, unpad};

use crate::creds::Credentials;
use crate::error::ClientError;
use crate::event::{DecodedFrame, EncKind, InboundMessage, MessageStub, StubKind};
use crate::repository::SessionRepository;

/// Which namespace the envelope was addressed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    /// Phone-number namespace.
    Pn,
    /// Anonymized local-identifier namespace.
    Lid,
}

/// Alternate-namespace identifiers a stanza declared alongside its
/// addressing, used by the capture stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addressing {
    /// Namespace the envelope was addressed under.
    pub mode: AddressingMode,
    /// The author's identifier in the other namespace, when declared.
    pub sender_alt: Option<Jid>,
    /// The recipient's identifier in the other namespace, when declared.
    pub recipient_alt: Option<Jid>,
}

/// Decode the addressing facts of a message stanza (stage 1).
///
/// Chats are classified by the `from` server: user chats carry the author in
/// `from`, groups and broadcasts carry it in `participant`, newsletters are
/// their own author. `chat` is normalized to user granularity; `author`
/// keeps its device and namespace exactly as the stanza named it.
///
/// # Errors
///
/// - [`ClientError::MalformedStanza`] when `from` or `id` is missing, a JID
///   fails to parse, a group or broadcast lacks `participant`, or a frame
///   not from us names a `recipient`
pub fn decode_frame(
    stanza: &Node,
    me_pn: &Jid,
    me_lid: Option<&Jid>,
) -> Result<DecodedFrame, ClientError> {
    let from = parse_jid_attr(stanza, "from")?;
    let Some(message_id) = stanza.attr("id") else {
        return Err(ClientError::MalformedStanza { reason: "missing id attr".to_owned() });
    };

    let (chat, author, from_me) = if from.is_group() || from.is_broadcast() {
        let participant = parse_jid_attr(stanza, "participant")?;
        let mine = is_self(&participant, me_pn, me_lid);
        (from.to_user(), participant, mine)
    } else if from.is_newsletter() {
        (from.to_user(), from.clone(), false)
    } else {
        let mine = is_self(&from, me_pn, me_lid);
        let chat = if mine {
            match stanza.attr("recipient") {
                Some(recipient) => parse_jid(recipient)?.to_user(),
                None => from.to_user(),
            }
        } else {
            if stanza.attr("recipient").is_some() {
                return Err(ClientError::MalformedStanza {
                    reason: "recipient attr on a frame not from us".to_owned(),
                });
            }
            from.to_user()
        };
        (chat, from.clone(), mine)
    };

    Ok(DecodedFrame {
        chat,
        author,
        from_me,
        message_id: message_id.to_owned(),
        timestamp: stanza.attr("t").and_then(|t| t.parse().ok()),
        push_name: stanza.attr("notify").map(str::to_owned),
        category: stanza.attr("category").map(str::to_owned),
    })
}

/// Extract the alternate-namespace addressing context (stage 2).
///
/// The mode comes from the `addressing_mode` attribute when present, else
/// from the shape of the author JID. Alternates that fail to parse are
/// dropped; the context is advisory and never fails a message.
pub fn extract_addressing_context(stanza: &Node, author: &Jid) -> Addressing {
    let mode = match stanza.attr("addressing_mode") {
        Some("lid") => AddressingMode::Lid,
        Some("pn") => AddressingMode::Pn,
        _ if author.is_lid_shaped() => AddressingMode::Lid,
        _ => AddressingMode::Pn,
    };

    let sender_attrs = match mode {
        AddressingMode::Lid => ["participant_pn", "sender_pn", "peer_recipient_pn"],
        AddressingMode::Pn => ["participant_lid", "sender_lid", "peer_recipient_lid"],
    };
    let sender_alt = sender_attrs
        .iter()
        .find_map(|name| stanza.attr(name))
        .and_then(|value| value.parse().ok());

    let recipient_attr = match mode {
        AddressingMode::Lid => "recipient_pn",
        AddressingMode::Pn => "recipient_lid",
    };
    let recipient_alt = stanza.attr(recipient_attr).and_then(|value| value.parse().ok());

    Addressing { mode, sender_alt, recipient_alt }
}

/// The decode/decrypt pipeline over one device's repository.
pub struct MessagePipeline<E: Environment, S> {
    repository: Arc<SessionRepository<E, S>>,
    mapping: Arc<MappingStore<E, S>>,
    me_pn: Jid,
    me_lid: Option<Jid>,
}

impl<E: Environment, S: RecordStore> MessagePipeline<E, S> {
    /// Build a pipeline over a repository and its mapping store.
    pub fn new(
        repository: Arc<SessionRepository<E, S>>,
        mapping: Arc<MappingStore<E, S>>,
        creds: &Credentials,
    ) -> Self {
        Self { repository, mapping, me_pn: creds.me_pn.clone(), me_lid: creds.me_lid.clone() }
    }

    /// Run the full pipeline on one message stanza.
    ///
    /// # Errors
    ///
    /// - [`ClientError::MalformedStanza`] when the envelope is structurally
    ///   invalid. Every failure past decode is delivered inside the
    ///   [`InboundMessage`] instead of erroring.
    pub async fn process(&self, stanza: &Node) -> Result<InboundMessage, ClientError> {
        let frame = decode_frame(stanza, &self.me_pn, self.me_lid.as_ref())?;
        let addressing = extract_addressing_context(stanza, &frame.author);

        let resolved = self.repository.resolve_decryption_address(&frame.author).await;
        let decryption_jid = self.capture_mapping(&frame, &addressing, resolved).await;

        let mut content: Option<MessageBody> = None;
        let mut reasons = Vec::new();
        let mut decryptables = 0usize;
        let mut view_once = false;
        let mut business_name = None;
        let mut retry_count = 0u32;

        for node in stanza.children() {
            match node.tag.as_str() {
                "verified_name" => {
                    business_name = node.attr("name").map(str::to_owned);
                }
                "unavailable" => {
                    if node.attr("type") == Some("view_once") {
                        view_once = true;
                    }
                }
                "plaintext" => {
                    let Some(bytes) = node.bytes() else { continue };
                    decryptables += 1;
                    match MessageBody::decode(bytes) {
                        Ok(body) => merge_into(&mut content, body),
                        Err(error) => reasons.push(ClientError::Body(error)),
                    }
                }
                "enc" => {
                    let Some(bytes) = node.bytes() else { continue };
                    decryptables += 1;

                    if let Some(count) = node.attr("count").and_then(|count| count.parse().ok()) {
                        retry_count = retry_count.max(count);
                    }

                    let Some(kind) = node.attr("type").and_then(EncKind::from_wire) else {
                        let kind = node.attr("type").unwrap_or_default().to_owned();
                        reasons.push(ClientError::UnknownEncKind { kind });
                        continue;
                    };

                    match self.decrypt_node(&frame, &decryption_jid, kind, bytes).await {
                        Ok(body) => merge_into(&mut content, body),
                        Err(error) => {
                            tracing::debug!(
                                id = %frame.message_id,
                                %kind,
                                %error,
                                "enc node failed to decrypt"
                            );
                            reasons.push(error);
                        }
                    }
                }
                _ => {}
            }
        }

        let stub = if reasons.is_empty() {
            (decryptables == 0 && !view_once)
                .then(|| MessageStub { kind: StubKind::NoContent, reasons: Vec::new() })
        } else {
            Some(MessageStub { kind: StubKind::DecryptFailure, reasons })
        };

        Ok(InboundMessage { frame, content, stub, view_once, business_name, retry_count })
    }

    /// Opportunistic mapping capture (stage 3).
    ///
    /// Runs when a PN author declared a LID alternate and resolution still
    /// returned the nominal address, meaning no mapping was known. Learns
    /// the pair, migrates the session, and hands back the LID as the
    /// decryption address. Every failure is logged and swallowed; capture
    /// never fails a message.
    async fn capture_mapping(
        &self,
        frame: &DecodedFrame,
        addressing: &Addressing,
        resolved: Jid,
    ) -> Jid {
        let Some(alt) = &addressing.sender_alt else {
            return resolved;
        };
        if !alt.is_lid_shaped()
            || !frame.author.is_pn_shaped()
            || !resolved.same_user(&frame.author)
        {
            return resolved;
        }

        let pair = MappingPair { lid: alt.to_user(), pn: frame.author.to_user() };
        self.mapping.store_mappings(std::slice::from_ref(&pair)).await;
        if let Err(error) = self.repository.migrate_session(&frame.author, alt).await {
            tracing::warn!(author = %frame.author, %error, "session migration after capture failed");
            return resolved;
        }
        tracing::debug!(pn = %pair.pn, lid = %pair.lid, "captured identity mapping");
        alt.clone()
    }

    async fn decrypt_node(
        &self,
        frame: &DecodedFrame,
        decryption_jid: &Jid,
        kind: EncKind,
        ciphertext: &[u8],
    ) -> Result<MessageBody, ClientError> {
        let plaintext = match kind {
            EncKind::Skmsg => {
                let group = if frame.chat.is_group() { &frame.chat } else { decryption_jid };
                self.repository.decrypt_group_message(group, decryption_jid, ciphertext).await?
            }
            EncKind::Pkmsg | EncKind::Msg => {
                self.repository.decrypt_message(decryption_jid, kind, ciphertext).await?
            }
        };

        let body = MessageBody::decode(unpad(&plaintext)?)?.unwrap_device_sent();
        if let Some(envelope) = &body.sender_key_distribution {
            self.install_distribution(decryption_jid, envelope).await;
        }
        Ok(body)
    }

    /// Install a sender-key distribution found inside a decrypted body.
    /// Failures are logged only; the body it rode in on already decrypted.
    async fn install_distribution(&self, author: &Jid, envelope: &DistributionEnvelope) {
        let group = match envelope.group.parse::<Jid>() {
            Ok(group) => group,
            Err(error) => {
                tracing::warn!(group = %envelope.group, %error, "bad group in distribution envelope");
                return;
            }
        };
        if let Err(error) = self
            .repository
            .process_sender_key_distribution(&group, author, &envelope.distribution)
            .await
        {
            tracing::warn!(%group, %author, %error, "sender-key distribution rejected");
        }
    }
}

fn is_self(jid: &Jid, me_pn: &Jid, me_lid: Option<&Jid>) -> bool {
    (jid.is_pn_shaped() && jid.same_user(me_pn))
        || me_lid.is_some_and(|lid| jid.is_lid_shaped() && jid.same_user(lid))
}

fn parse_jid(value: &str) -> Result<Jid, ClientError> {
    value.parse::<Jid>().map_err(|error| ClientError::MalformedStanza {
        reason: format!("bad jid {value:?}: {error}"),
    })
}

fn parse_jid_attr(stanza: &Node, name: &str) -> Result<Jid, ClientError> {
    let Some(value) = stanza.attr(name) else {
        return Err(ClientError::MalformedStanza { reason: format!("missing {name} attr") });
    };
    parse_jid(value)
}

fn merge_into(content: &mut Option<MessageBody>, body: MessageBody) {
    match content {
        Some(existing) => existing.merge(body),
        None => *content = Some(body),
    }
}

//! Client assembly.
//!
//! [`Client`] is the façade over the whole inbound and outbound path: it
//! owns the credential state, wires the mapping store to a transport-backed
//! directory resolver, runs inbound stanzas through the decrypt pipeline,
//! and routes failed decrypts into the retry orchestrator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use conclave_core::env::Environment;
use conclave_core::mapping::{LidResolver, MappingError, MappingPair, MappingStore};
use conclave_core::store::RecordStore;
use conclave_crypto::PreKeyBundle;
use conclave_proto::{Jid, MessageBody, Node, pad};

use crate::creds::Credentials;
use crate::error::ClientError;
use crate::event::{EncKind, InboundMessage, StubKind};
use crate::pipeline::MessagePipeline;
use crate::repository::{GroupEncrypted, SessionRepository};
use crate::retry::{RetryConfig, RetryOrchestrator};
use crate::transport::Transport;

/// Remote directory lookup over the transport.
///
/// One batched `usync` IQ asks the server for the LID identities of PN
/// users. Users the server does not know are simply absent from the reply;
/// the mapping store treats absence as a miss, never as an error.
pub struct DirectoryResolver<T> {
    transport: Arc<T>,
    sid: AtomicU64,
}

impl<T: Transport> DirectoryResolver<T> {
    /// Resolver issuing queries over the given transport.
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport, sid: AtomicU64::new(1) }
    }

    fn build_query(&self, pns: &[Jid]) -> Node {
        let sid = format!("conclave-{}", self.sid.fetch_add(1, Ordering::Relaxed));
        let mut list = Node::new("list");
        for pn in pns {
            list.push_child(Node::with_attrs("user", [("jid", pn.to_string())]));
        }

        let usync = Node::with_attrs(
            "usync",
            [
                ("sid", sid.as_str()),
                ("mode", "query"),
                ("context", "background"),
                ("last", "true"),
                ("index", "0"),
            ],
        )
        .child_entry(Node::new("query").child_entry(Node::new("lid")))
        .child_entry(list);

        Node::with_attrs("iq", [("to", "s.whatsapp.net"), ("type", "get"), ("xmlns", "usync")])
            .child_entry(usync)
    }

    fn parse_pairs(response: &Node) -> Vec<MappingPair> {
        let mut pairs = Vec::new();
        let users = response
            .child("usync")
            .and_then(|usync| usync.child("list"))
            .map(Node::children)
            .unwrap_or_default();

        for user in users {
            if user.tag != "user" {
                continue;
            }
            let Some(pn) = user.attr("jid").and_then(|raw| raw.parse::<Jid>().ok()) else {
                continue;
            };
            let Some(lid) = user
                .child("lid")
                .and_then(|node| node.attr("val"))
                .and_then(|raw| raw.parse::<Jid>().ok())
            else {
                continue;
            };
            pairs.push(MappingPair { lid, pn });
        }
        pairs
    }
}

#[async_trait]
impl<T: Transport> LidResolver for DirectoryResolver<T> {
    async fn resolve(&self, pns: &[Jid]) -> Result<Vec<MappingPair>, MappingError> {
        if pns.is_empty() {
            return Ok(Vec::new());
        }

        let query = self.build_query(pns);
        let response = self
            .transport
            .query(query)
            .await
            .map_err(|error| MappingError::Resolver { reason: error.to_string() })?;
        Ok(Self::parse_pairs(&response))
    }
}

/// Protocol client: one object owning credentials, stores, the decrypt
/// pipeline, and the retry orchestrator.
pub struct Client<E: Environment, S, T> {
    env: E,
    creds: Arc<Mutex<Credentials>>,
    store: Arc<S>,
    mapping: Arc<MappingStore<E, S>>,
    repository: Arc<SessionRepository<E, S>>,
    pipeline: MessagePipeline<E, S>,
    retry: Arc<RetryOrchestrator<E, S, T>>,
}

impl<E, S, T> Client<E, S, T>
where
    E: Environment,
    S: RecordStore,
    T: Transport,
{
    /// Assemble a client from credentials, a record store, and a transport.
    pub fn new(env: E, creds: Credentials, store: Arc<S>, transport: Arc<T>) -> Self {
        Self::with_config(env, creds, store, transport, RetryConfig::default())
    }

    /// Assemble with explicit retry tuning.
    pub fn with_config(
        env: E,
        creds: Credentials,
        store: Arc<S>,
        transport: Arc<T>,
        config: RetryConfig,
    ) -> Self {
        let resolver = Arc::new(DirectoryResolver::new(Arc::clone(&transport)));
        let mapping =
            Arc::new(MappingStore::new(env.clone(), Arc::clone(&store)).with_resolver(resolver));
        let repository = Arc::new(SessionRepository::new(
            env.clone(),
            Arc::clone(&store),
            Arc::clone(&mapping),
            &creds,
        ));
        let pipeline = MessagePipeline::new(Arc::clone(&repository), Arc::clone(&mapping), &creds);
        let creds = Arc::new(Mutex::new(creds));
        let retry = Arc::new(RetryOrchestrator::new(
            env.clone(),
            config,
            transport,
            Arc::clone(&repository),
            Arc::clone(&store),
            Arc::clone(&creds),
        ));
        Self { env, creds, store, mapping, repository, pipeline, retry }
    }

    /// Decode and decrypt one inbound `message` stanza.
    ///
    /// Decrypt failures surface in the returned message's stub. Retryable
    /// failures also spawn a cancellable retry receipt in the background;
    /// a successful decrypt cancels any receipt still pending for the same
    /// message.
    ///
    /// # Errors
    ///
    /// - [`ClientError::MalformedStanza`] when the stanza is not addressable
    pub async fn receive(&self, stanza: &Node) -> Result<InboundMessage, ClientError> {
        let message = self.pipeline.process(stanza).await?;

        match &message.stub {
            Some(stub) if stub.kind == StubKind::DecryptFailure => {
                if message.frame.is_peer_category() {
                    tracing::debug!(
                        id = %message.frame.message_id,
                        "peer decrypt failure, not retried"
                    );
                } else {
                    self.retry.spawn_retry(message.frame.clone(), stanza.clone(), stub.clone());
                }
            }
            _ => {
                if message.content.is_some() {
                    self.retry.notify_decrypted(&message.frame.message_id, &message.frame.author);
                }
            }
        }
        Ok(message)
    }

    /// Encode, pad, and encrypt a body for one device.
    ///
    /// # Errors
    ///
    /// - [`ClientError::MissingSession`] when no session exists for `to`
    /// - [`ClientError::Store`] when persistence fails
    pub async fn encrypt_message(
        &self,
        to: &Jid,
        body: &MessageBody,
    ) -> Result<(EncKind, Vec<u8>), ClientError> {
        let plaintext = self.padded_plaintext(body)?;
        self.repository.encrypt_message(to, &plaintext).await
    }

    /// Encode, pad, and encrypt a body under our sender key for a group.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Crypto`] when sealing fails
    /// - [`ClientError::Store`] when persistence fails
    pub async fn encrypt_group_message(
        &self,
        group: &Jid,
        body: &MessageBody,
    ) -> Result<GroupEncrypted, ClientError> {
        let plaintext = self.padded_plaintext(body)?;
        self.repository.encrypt_group_message(group, &plaintext).await
    }

    /// Establish an outgoing session from a fetched pre-key bundle.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Crypto`] when the bundle's signature is invalid
    /// - [`ClientError::Store`] when persistence fails
    pub async fn create_session(
        &self,
        address: &Jid,
        bundle: &PreKeyBundle,
    ) -> Result<(), ClientError> {
        self.repository.init_outgoing_session(address, bundle).await
    }

    /// Underlying session repository.
    pub fn repository(&self) -> &Arc<SessionRepository<E, S>> {
        &self.repository
    }

    /// Identity mapping store.
    pub fn mapping(&self) -> &Arc<MappingStore<E, S>> {
        &self.mapping
    }

    /// Retry orchestrator.
    pub fn retry(&self) -> &Arc<RetryOrchestrator<E, S, T>> {
        &self.retry
    }

    /// Shared credential state.
    pub fn credentials(&self) -> &Arc<Mutex<Credentials>> {
        &self.creds
    }

    /// Record store handle.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn padded_plaintext(&self, body: &MessageBody) -> Result<Vec<u8>, ClientError> {
        let mut plaintext = body.encode()?;
        let mut random = [0u8; 1];
        self.env.random_bytes(&mut random);
        pad(&mut plaintext, random[0]);
        Ok(plaintext)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use conclave_core::env::test_utils::MockEnv;
    use conclave_core::store::MemoryStore;
    use conclave_crypto::ChainMessage;
    use conclave_proto::Server;

    use super::*;
    use crate::transport::test_utils::MockTransport;

    fn pn(user: &str) -> Jid {
        Jid::new(user, Server::Pn)
    }

    fn lid(user: &str) -> Jid {
        Jid::new(user, Server::Lid)
    }

    struct Rig {
        transport: Arc<MockTransport>,
        client: Client<MockEnv, MemoryStore, MockTransport>,
    }

    fn rig(seed: u64) -> Rig {
        let env = MockEnv::with_seed(seed);
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MockTransport::new());
        let creds = Credentials::generate(&env, pn("15550009999"));
        let client = Client::new(env, creds, store, Arc::clone(&transport));
        Rig { transport, client }
    }

    fn stanza(from: &str, id: &str) -> Node {
        Node::with_attrs("message", [("from", from), ("id", id), ("t", "1700000000")])
    }

    #[tokio::test]
    async fn plaintext_frames_deliver_without_retry() {
        let rig = rig(1);
        let body = MessageBody { text: Some("hi".to_owned()), ..MessageBody::default() };
        let mut node = stanza("15550001111@s.whatsapp.net", "A1");
        node.push_child(Node::new("plaintext").bytes_content(body.encode().unwrap()));

        let message = rig.client.receive(&node).await.unwrap();
        assert_eq!(message.content.unwrap().text.as_deref(), Some("hi"));
        assert!(message.stub.is_none());
        assert_eq!(rig.transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn failed_decrypts_spawn_a_retry_receipt() {
        let rig = rig(2);
        let wire = crate::codec::encode(&ChainMessage {
            generation: 0,
            random: [0; 8],
            ciphertext: vec![1, 2, 3],
        })
        .unwrap();
        let mut node = stanza("15550001111@s.whatsapp.net", "B1");
        node.push_child(Node::with_attrs("enc", [("type", "msg")]).bytes_content(wire));

        let message = rig.client.receive(&node).await.unwrap();
        assert!(message.is_failed());

        // The receipt goes out on a background task.
        for _ in 0..50 {
            tokio::task::yield_now().await;
            if rig.transport.sent_count() > 0 {
                break;
            }
        }
        let sent = rig.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].tag, "receipt");
        assert_eq!(sent[0].attr("type"), Some("retry"));
        assert_eq!(sent[0].child("retry").unwrap().attr("count"), Some("1"));
    }

    #[tokio::test]
    async fn later_decrypt_cancels_the_pending_receipt() {
        let rig = rig(3);
        let wire = crate::codec::encode(&ChainMessage {
            generation: 0,
            random: [0; 8],
            ciphertext: vec![1, 2, 3],
        })
        .unwrap();
        let mut failing = stanza("15550001111@s.whatsapp.net", "C1");
        failing.push_child(Node::with_attrs("enc", [("type", "msg")]).bytes_content(wire));

        // Park the retry task inside the blocked send.
        rig.transport.block_sends(true);
        rig.client.receive(&failing).await.unwrap();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        // The same message then arrives decryptable via another path.
        let body = MessageBody { text: Some("again".to_owned()), ..MessageBody::default() };
        let mut recovered = stanza("15550001111@s.whatsapp.net", "C1");
        recovered.push_child(Node::new("plaintext").bytes_content(body.encode().unwrap()));
        rig.client.receive(&recovered).await.unwrap();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        assert_eq!(rig.transport.sent_count(), 0);
        let author = pn("15550001111");
        assert_eq!(rig.client.retry().retry_count("C1", &author), 0);
    }

    #[tokio::test]
    async fn peer_category_failures_are_not_retried() {
        let rig = rig(4);
        let wire = crate::codec::encode(&ChainMessage {
            generation: 0,
            random: [0; 8],
            ciphertext: vec![1, 2, 3],
        })
        .unwrap();
        let mut node = stanza("15550001111@s.whatsapp.net", "D1");
        node.set_attr("category", "peer");
        node.push_child(Node::with_attrs("enc", [("type", "msg")]).bytes_content(wire));

        let message = rig.client.receive(&node).await.unwrap();
        assert!(message.is_failed());
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(rig.transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn outbound_without_a_session_is_typed() {
        let rig = rig(5);
        let body = MessageBody { text: Some("out".to_owned()), ..MessageBody::default() };
        let result = rig.client.encrypt_message(&pn("15550001111"), &body).await;
        assert!(matches!(result, Err(ClientError::MissingSession { .. })));
    }

    #[tokio::test]
    async fn mapping_lookups_reach_the_directory() {
        let rig = rig(6);
        let response = Node::new("iq").child_entry(
            Node::new("usync").child_entry(
                Node::new("list").child_entry(
                    Node::with_attrs("user", [("jid", "15550001111@s.whatsapp.net")])
                        .child_entry(Node::with_attrs("lid", [("val", "909911223344556@lid")])),
                ),
            ),
        );
        rig.transport.push_response(response);

        let resolved = rig.client.mapping().lid_for_pn(&pn("15550001111")).await.unwrap();
        assert_eq!(resolved, Some(lid("909911223344556")));

        let queries = rig.transport.queries();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].attr("xmlns"), Some("usync"));
        let usync = queries[0].child("usync").unwrap();
        assert!(usync.child("query").unwrap().child("lid").is_some());
        let user = usync.child("list").unwrap().child("user").unwrap();
        assert_eq!(user.attr("jid"), Some("15550001111@s.whatsapp.net"));
    }

    #[test]
    fn usync_replies_without_lids_are_skipped() {
        let response = Node::new("iq").child_entry(
            Node::new("usync").child_entry(
                Node::new("list")
                    .child_entry(
                        Node::with_attrs("user", [("jid", "15550001111@s.whatsapp.net")])
                            .child_entry(Node::with_attrs("lid", [("val", "909911223344556@lid")])),
                    )
                    .child_entry(Node::with_attrs("user", [("jid", "15550002222@s.whatsapp.net")]))
                    .child_entry(Node::new("user")),
            ),
        );

        let pairs = DirectoryResolver::<MockTransport>::parse_pairs(&response);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].pn, pn("15550001111"));
        assert_eq!(pairs[0].lid, lid("909911223344556"));
    }
}

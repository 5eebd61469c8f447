//! Retry receipts for undecryptable messages.
//!
//! When the pipeline fails to decrypt a frame, the sender can be asked to
//! re-encrypt and resend by emitting a `<receipt type="retry">` stanza. This
//! module owns that exchange end to end: per-message attempt counters,
//! backoff between repeat receipts, pre-key replenishment when the failure
//! points at exhausted pre-keys, session teardown when a session looks
//! wedged, and a circuit breaker so a misbehaving peer cannot turn the
//! client into a receipt cannon.
//!
//! # Invariants
//!
//! - **Bounded**: at most `max_retries` receipts leave per (message, author)
//!   pair. The counter only advances after a receipt actually sends.
//! - **Advertise After Persist**: a receipt never carries a pre-key that is
//!   not already durable in the record store.
//! - **Gated, Not Counted**: attempts swallowed by an open breaker do not
//!   consume retry budget.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conclave_core::backoff::RetryBackoff;
use conclave_core::breaker::{BreakerConfig, CircuitBreaker};
use conclave_core::cache::TtlCache;
use conclave_core::env::Environment;
use conclave_core::store::RecordStore;
use conclave_crypto::{PreKey, SignedPreKey};
use conclave_proto::{Jid, Node};
use tokio::task::AbortHandle;

use crate::creds::{Credentials, MIN_PREKEY_COUNT};
use crate::error::ClientError;
use crate::event::{DecodedFrame, MessageStub};
use crate::repository::SessionRepository;
use crate::transport::Transport;

/// Pause after uploading fresh pre-keys so the directory has settled by the
/// time the peer refetches our bundle.
pub const PRE_KEY_SETTLE_DELAY: Duration = Duration::from_millis(250);

/// Wire tag for X25519 public keys in key bundles.
const CURVE_KEY_TYPE: u8 = 0x05;

/// How long a per-message retry counter is remembered.
const RETRY_COUNT_TTL: Duration = Duration::from_secs(60 * 60);

/// Distinct in-flight messages tracked before old counters are evicted.
const RETRY_COUNT_CAPACITY: usize = 4096;

/// Decides whether a wedged session should be torn down before the retry
/// receipt goes out. Deleting the session forces the peer to re-establish
/// with a fresh pre-key instead of re-encrypting to dead state.
pub trait RecreationPolicy: Send + Sync {
    /// Whether the session for `address` should be deleted on retry number
    /// `attempt`. `has_session` is false when no record exists, in which
    /// case "recreate" only means advertising keys in the receipt.
    fn should_recreate(&self, address: &Jid, has_session: bool, attempt: u32) -> bool;
}

/// Default policy: always recreate when no session exists, otherwise at
/// most once per cooldown window per address.
pub struct CooldownPolicy<E: Environment> {
    env: E,
    cooldown: Duration,
    last: Mutex<HashMap<String, E::Instant>>,
}

impl<E: Environment> CooldownPolicy<E> {
    /// Policy with the given per-address cooldown.
    pub fn new(env: E, cooldown: Duration) -> Self {
        Self { env, cooldown, last: Mutex::new(HashMap::new()) }
    }
}

impl<E: Environment> RecreationPolicy for CooldownPolicy<E> {
    fn should_recreate(&self, address: &Jid, has_session: bool, _attempt: u32) -> bool {
        if !has_session {
            return true;
        }

        let now = self.env.now();
        let mut last = self.last.lock().expect("recreation cooldown mutex poisoned");
        let key = address.protocol_address().to_string();
        match last.get(&key) {
            Some(&at) if now - at < self.cooldown => false,
            _ => {
                last.insert(key, now);
                true
            }
        }
    }
}

/// Tuning for the retry orchestrator.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Receipts emitted per (message, author) pair before giving up.
    pub max_retries: u32,
    /// Delay policy between repeat receipts.
    pub backoff: RetryBackoff,
    /// Per-address cooldown used by the default recreation policy.
    pub recreate_cooldown: Duration,
    /// Whether repeat attempts may tear down a session that keeps failing.
    pub auto_recreate: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: RetryBackoff::default(),
            recreate_cooldown: Duration::from_secs(60 * 60),
            auto_recreate: true,
        }
    }
}

/// Emits and tracks retry receipts for messages the pipeline could not
/// decrypt.
pub struct RetryOrchestrator<E: Environment, S, T> {
    env: E,
    config: RetryConfig,
    transport: Arc<T>,
    repository: Arc<SessionRepository<E, S>>,
    store: Arc<S>,
    creds: Arc<Mutex<Credentials>>,
    breaker: CircuitBreaker<E, ClientError>,
    policy: Arc<dyn RecreationPolicy>,
    counts: Mutex<TtlCache<String, u32, E::Instant>>,
    pending: Mutex<HashMap<String, AbortHandle>>,
}

impl<E, S, T> RetryOrchestrator<E, S, T>
where
    E: Environment,
    S: RecordStore,
    T: Transport,
{
    /// Build an orchestrator with the default cooldown recreation policy.
    pub fn new(
        env: E,
        config: RetryConfig,
        transport: Arc<T>,
        repository: Arc<SessionRepository<E, S>>,
        store: Arc<S>,
        creds: Arc<Mutex<Credentials>>,
    ) -> Self {
        let breaker = CircuitBreaker::with_classifier(
            env.clone(),
            BreakerConfig::default(),
            ClientError::is_retry_relevant,
        );
        let policy = Arc::new(CooldownPolicy::new(env.clone(), config.recreate_cooldown));
        Self {
            env,
            config,
            transport,
            repository,
            store,
            creds,
            breaker,
            policy,
            counts: Mutex::new(TtlCache::new(RETRY_COUNT_CAPACITY, RETRY_COUNT_TTL)),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Swap in a custom recreation policy.
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn RecreationPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Breaker guarding the retry path.
    pub fn breaker(&self) -> &CircuitBreaker<E, ClientError> {
        &self.breaker
    }

    /// Receipts already sent for a message, zero once forgotten.
    pub fn retry_count(&self, message_id: &str, participant: &Jid) -> u32 {
        let key = Self::retry_key(message_id, participant);
        let mut counts = self.counts.lock().expect("retry count mutex poisoned");
        counts.get(&key, self.env.now()).copied().unwrap_or(0)
    }

    /// Run the retry protocol for a failed message and report whether a
    /// receipt was emitted. Terminal attempts (budget spent), peer-category
    /// frames, and attempts gated by an open breaker all return `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Returns an error when the receipt could not be built or sent, or
    /// when session teardown hit the store. Errors feed the breaker.
    pub async fn handle_failure(
        &self,
        frame: &DecodedFrame,
        stanza: &Node,
        stub: &MessageStub,
    ) -> Result<bool, ClientError> {
        match self.run_retry(frame, stanza, stub).await {
            Ok(emitted) => {
                if emitted {
                    self.breaker.record_success();
                }
                Ok(emitted)
            }
            Err(error) => {
                self.breaker.record_failure(&error);
                Err(error)
            }
        }
    }

    /// Spawn the retry as a cancellable background task so receipts and
    /// their backoff never stall the inbound loop. A retry already pending
    /// for the same message and author is left alone.
    pub fn spawn_retry(self: &Arc<Self>, frame: DecodedFrame, stanza: Node, stub: MessageStub) {
        let key = Self::retry_key(&frame.message_id, &frame.author);
        let mut pending = self.pending.lock().expect("pending retry mutex poisoned");
        if pending.contains_key(&key) {
            tracing::debug!(%key, "retry already pending, not re-spawned");
            return;
        }

        let orchestrator = Arc::clone(self);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            if let Err(error) = orchestrator.handle_failure(&frame, &stanza, &stub).await {
                tracing::warn!(id = %frame.message_id, %error, "retry handling failed");
            }
            let mut pending = orchestrator.pending.lock().expect("pending retry mutex poisoned");
            pending.remove(&task_key);
        });
        pending.insert(key, handle.abort_handle());
    }

    /// The message decrypted through another path: cancel any pending retry
    /// task, forget its counter, and record the success with the breaker.
    pub fn notify_decrypted(&self, message_id: &str, participant: &Jid) {
        let key = Self::retry_key(message_id, participant);
        let handle = {
            let mut pending = self.pending.lock().expect("pending retry mutex poisoned");
            pending.remove(&key)
        };
        if let Some(handle) = handle {
            tracing::debug!(%key, "cancelling pending retry");
            handle.abort();
        }

        let mut counts = self.counts.lock().expect("retry count mutex poisoned");
        counts.remove(&key);
        drop(counts);
        self.breaker.record_success();
    }

    fn retry_key(message_id: &str, participant: &Jid) -> String {
        format!("{message_id}:{participant}")
    }

    async fn run_retry(
        &self,
        frame: &DecodedFrame,
        stanza: &Node,
        stub: &MessageStub,
    ) -> Result<bool, ClientError> {
        if frame.is_peer_category() {
            tracing::debug!(id = %frame.message_id, "peer message failed, not retried");
            return Ok(false);
        }

        let key = Self::retry_key(&frame.message_id, &frame.author);
        let count = {
            let mut counts = self.counts.lock().expect("retry count mutex poisoned");
            counts.get(&key, self.env.now()).copied().unwrap_or(0)
        };

        if count >= self.config.max_retries {
            tracing::warn!(id = %frame.message_id, count, "retry budget spent, giving up");
            let mut counts = self.counts.lock().expect("retry count mutex poisoned");
            counts.remove(&key);
            return Ok(false);
        }

        if !self.breaker.can_execute() {
            tracing::warn!(id = %frame.message_id, "retry breaker open, receipt suppressed");
            return Ok(false);
        }

        if stub.is_pre_key_related() {
            self.replenish_pre_keys().await;
        }

        if count > 0 {
            let delay = self.config.backoff.delay_for(count - 1, &self.env);
            tracing::debug!(id = %frame.message_id, ?delay, "backing off before repeat receipt");
            self.env.sleep(delay).await;
        }

        let attempt = count + 1;
        let mut recreated = false;
        if self.config.auto_recreate && count >= 1 {
            recreated = self.maybe_recreate(&frame.author, attempt).await?;
        }

        let include_keys = attempt > 1 || recreated;
        let receipt = self.build_receipt(frame, stanza, attempt, include_keys).await?;
        self.transport.send_node(receipt).await?;

        let mut counts = self.counts.lock().expect("retry count mutex poisoned");
        counts.insert(key, attempt, self.env.now());
        drop(counts);
        tracing::info!(id = %frame.message_id, attempt, include_keys, "retry receipt sent");
        Ok(true)
    }

    /// Tear down the author's session if the recreation policy agrees the
    /// repeated failures point at wedged state.
    async fn maybe_recreate(&self, author: &Jid, attempt: u32) -> Result<bool, ClientError> {
        let address = self.repository.resolve_decryption_address(author).await;
        let has_session = self.repository.has_session(&address).await?;
        if !self.policy.should_recreate(&address, has_session, attempt) {
            return Ok(false);
        }

        if has_session {
            tracing::info!(%address, attempt, "deleting session before retry receipt");
            self.repository.delete_sessions(std::slice::from_ref(&address)).await?;
        }
        Ok(true)
    }

    /// Mint and persist a fresh batch of one-time pre-keys, upload them, and
    /// wait out the settle delay. Failures are logged; the retry proceeds
    /// either way since the receipt is still worth sending.
    async fn replenish_pre_keys(&self) {
        let minted = {
            let mut creds = self.creds.lock().expect("credentials mutex poisoned");
            creds.mint_pre_keys(&self.env, MIN_PREKEY_COUNT)
        };
        match minted {
            Ok((pre_keys, batch)) => match self.store.put(batch).await {
                Ok(()) => {
                    tracing::info!(count = pre_keys.len(), "replenished one-time pre-keys");
                    self.upload_pre_keys(&pre_keys).await;
                }
                Err(error) => {
                    tracing::warn!(%error, "pre-key persistence failed, retry proceeds");
                }
            },
            Err(error) => {
                tracing::warn!(%error, "pre-key minting failed, retry proceeds");
            }
        }
        self.env.sleep(PRE_KEY_SETTLE_DELAY).await;
    }

    async fn upload_pre_keys(&self, pre_keys: &[PreKey]) {
        let (registration_id, identity, signed) = {
            let creds = self.creds.lock().expect("credentials mutex poisoned");
            (creds.registration_id, creds.identity.public_bytes(), creds.signed_pre_key.clone())
        };

        let mut list = Node::new("list");
        for pre_key in pre_keys {
            list.push_child(
                Node::new("key")
                    .attr_entry("id", pre_key.id.to_string())
                    .bytes_content(pre_key.key_pair.public_bytes().to_vec()),
            );
        }

        let upload = Node::with_attrs("iq", [("type", "set"), ("xmlns", "encrypt")])
            .child_entry(
                Node::new("registration").bytes_content(registration_id.to_be_bytes().to_vec()),
            )
            .child_entry(Node::new("identity").bytes_content(identity.to_vec()))
            .child_entry(list)
            .child_entry(signed_key_node(&signed));

        if let Err(error) = self.transport.query(upload).await {
            tracing::warn!(%error, "pre-key upload failed, retry proceeds");
        }
    }

    async fn build_receipt(
        &self,
        frame: &DecodedFrame,
        stanza: &Node,
        attempt: u32,
        include_keys: bool,
    ) -> Result<Node, ClientError> {
        let Some(to) = stanza.attr("from") else {
            return Err(ClientError::MalformedStanza { reason: "missing from attr".to_owned() });
        };

        let mut receipt = Node::new("receipt")
            .attr_entry("id", frame.message_id.clone())
            .attr_entry("to", to)
            .attr_entry("type", "retry");
        // Echo routing attrs verbatim so the server can address the sender.
        for attr in ["participant", "recipient"] {
            if let Some(value) = stanza.attr(attr) {
                receipt.set_attr(attr, value);
            }
        }

        receipt.push_child(
            Node::new("retry")
                .attr_entry("count", attempt.to_string())
                .attr_entry("id", frame.message_id.clone())
                .attr_entry("t", frame.timestamp.unwrap_or(0).to_string())
                .attr_entry("v", "1")
                .attr_entry("error", "0"),
        );

        let registration_id = {
            let creds = self.creds.lock().expect("credentials mutex poisoned");
            creds.registration_id
        };
        receipt.push_child(
            Node::new("registration").bytes_content(registration_id.to_be_bytes().to_vec()),
        );

        if include_keys {
            receipt.push_child(self.key_bundle_node().await?);
        }
        Ok(receipt)
    }

    /// Build the `keys` block carrying one fresh one-time pre-key. The key
    /// persists before the receipt leaves, so the peer can always consume
    /// what the receipt advertises.
    async fn key_bundle_node(&self) -> Result<Node, ClientError> {
        let (pre_key, batch, identity, signed, device_identity) = {
            let mut creds = self.creds.lock().expect("credentials mutex poisoned");
            let (mut pre_keys, batch) = creds.mint_pre_keys(&self.env, 1)?;
            let Some(pre_key) = pre_keys.pop() else {
                return Err(ClientError::Wire { reason: "minted zero pre-keys".to_owned() });
            };
            (
                pre_key,
                batch,
                creds.identity.public_bytes(),
                creds.signed_pre_key.clone(),
                creds.device_identity.clone(),
            )
        };
        self.store.put(batch).await?;

        Ok(Node::new("keys")
            .child_entry(Node::new("type").bytes_content(vec![CURVE_KEY_TYPE]))
            .child_entry(Node::new("identity").bytes_content(identity.to_vec()))
            .child_entry(
                Node::new("skey")
                    .attr_entry("id", pre_key.id.to_string())
                    .bytes_content(pre_key.key_pair.public_bytes().to_vec()),
            )
            .child_entry(signed_key_node(&signed))
            .child_entry(Node::new("device-identity").bytes_content(device_identity)))
    }
}

fn signed_key_node(signed: &SignedPreKey) -> Node {
    Node::new("skey")
        .attr_entry("id", signed.id.to_string())
        .attr_entry("sig", hex::encode(&signed.signature))
        .bytes_content(signed.key_pair.public_bytes().to_vec())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use conclave_core::env::test_utils::MockEnv;
    use conclave_core::mapping::MappingStore;
    use conclave_core::store::test_utils::FailingStore;
    use conclave_core::store::{MemoryStore, RecordKind, RecordStore, WriteBatch};
    use conclave_proto::Server;

    use super::*;
    use crate::event::StubKind;
    use crate::transport::test_utils::MockTransport;

    fn pn(user: &str) -> Jid {
        Jid::new(user, Server::Pn)
    }

    struct Rig {
        env: MockEnv,
        store: Arc<MemoryStore>,
        transport: Arc<MockTransport>,
        orchestrator: Arc<RetryOrchestrator<MockEnv, MemoryStore, MockTransport>>,
    }

    fn rig(seed: u64) -> Rig {
        let env = MockEnv::with_seed(seed);
        let store = Arc::new(MemoryStore::new());
        let mapping = Arc::new(MappingStore::new(env.clone(), Arc::clone(&store)));
        let creds = Credentials::generate(&env, pn("15550009999"));
        let repository =
            Arc::new(SessionRepository::new(env.clone(), Arc::clone(&store), mapping, &creds));
        let transport = Arc::new(MockTransport::new());
        let orchestrator = Arc::new(RetryOrchestrator::new(
            env.clone(),
            RetryConfig::default(),
            Arc::clone(&transport),
            repository,
            Arc::clone(&store),
            Arc::new(Mutex::new(creds)),
        ));
        Rig { env, store, transport, orchestrator }
    }

    fn frame(id: &str) -> DecodedFrame {
        DecodedFrame {
            chat: pn("15550001111"),
            author: pn("15550001111").with_device(2),
            from_me: false,
            message_id: id.to_owned(),
            timestamp: Some(1_700_000_000),
            push_name: None,
            category: None,
        }
    }

    fn stanza_for(frame: &DecodedFrame) -> Node {
        Node::with_attrs(
            "message",
            [("from", "15550001111:2@s.whatsapp.net"), ("id", frame.message_id.as_str())],
        )
    }

    fn failure_stub() -> MessageStub {
        MessageStub {
            kind: StubKind::DecryptFailure,
            reasons: vec![ClientError::MissingSession { address: "15550001111.2".to_owned() }],
        }
    }

    fn pre_key_stub() -> MessageStub {
        MessageStub {
            kind: StubKind::DecryptFailure,
            reasons: vec![ClientError::PreKeyUnavailable { id: 7 }],
        }
    }

    #[tokio::test]
    async fn first_receipt_carries_no_keys() {
        let rig = rig(1);
        let frame = frame("R1");
        let stanza = stanza_for(&frame);

        let emitted =
            rig.orchestrator.handle_failure(&frame, &stanza, &failure_stub()).await.unwrap();
        assert!(emitted);

        let sent = rig.transport.sent();
        assert_eq!(sent.len(), 1);
        let receipt = &sent[0];
        assert_eq!(receipt.tag, "receipt");
        assert_eq!(receipt.attr("to"), Some("15550001111:2@s.whatsapp.net"));
        assert_eq!(receipt.attr("type"), Some("retry"));

        let retry = receipt.child("retry").unwrap();
        assert_eq!(retry.attr("count"), Some("1"));
        assert_eq!(retry.attr("id"), Some("R1"));
        assert_eq!(retry.attr("t"), Some("1700000000"));
        assert_eq!(retry.attr("v"), Some("1"));
        assert_eq!(retry.attr("error"), Some("0"));

        let registration = receipt.child("registration").unwrap();
        assert_eq!(registration.bytes().unwrap().len(), 4);
        assert!(receipt.child("keys").is_none());
        assert_eq!(rig.orchestrator.retry_count("R1", &frame.author), 1);
    }

    #[tokio::test]
    async fn repeat_receipt_includes_the_key_bundle() {
        let rig = rig(2);
        let frame = frame("R2");
        let stanza = stanza_for(&frame);

        rig.orchestrator.handle_failure(&frame, &stanza, &failure_stub()).await.unwrap();
        rig.orchestrator.handle_failure(&frame, &stanza, &failure_stub()).await.unwrap();

        let sent = rig.transport.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].child("keys").is_none());

        let keys = sent[1].child("keys").unwrap();
        assert_eq!(keys.child("type").unwrap().bytes(), Some(&[0x05][..]));
        assert_eq!(keys.child("identity").unwrap().bytes().unwrap().len(), 32);
        assert!(keys.child("device-identity").is_some());

        let skeys: Vec<_> = keys.children().iter().filter(|node| node.tag == "skey").collect();
        assert_eq!(skeys.len(), 2);
        let one_time = skeys[0];
        assert!(one_time.attr("sig").is_none());
        assert!(skeys[1].attr("sig").is_some());

        // The advertised one-time pre-key is already consumable.
        let id = one_time.attr("id").unwrap();
        assert!(rig.store.get_one(RecordKind::PreKey, id).await.unwrap().is_some());
        assert_eq!(rig.orchestrator.retry_count("R2", &frame.author), 2);
    }

    #[tokio::test]
    async fn repeat_receipts_wait_out_the_backoff() {
        let rig = rig(3);
        let frame = frame("R3");
        let stanza = stanza_for(&frame);

        rig.orchestrator.handle_failure(&frame, &stanza, &failure_stub()).await.unwrap();
        let before = rig.env.now();
        rig.orchestrator.handle_failure(&frame, &stanza, &failure_stub()).await.unwrap();

        // The second receipt waited at least the first backoff entry.
        assert!(rig.env.now() - before >= Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn budget_exhaustion_stops_receipts_and_clears_state() {
        let rig = rig(4);
        let frame = frame("R4");
        let stanza = stanza_for(&frame);

        for _ in 0..5 {
            let emitted =
                rig.orchestrator.handle_failure(&frame, &stanza, &failure_stub()).await.unwrap();
            assert!(emitted);
        }
        assert_eq!(rig.transport.sent_count(), 5);

        // The sixth attempt is terminal: no receipt, counter forgotten.
        let emitted =
            rig.orchestrator.handle_failure(&frame, &stanza, &failure_stub()).await.unwrap();
        assert!(!emitted);
        assert_eq!(rig.transport.sent_count(), 5);
        assert_eq!(rig.orchestrator.retry_count("R4", &frame.author), 0);
    }

    #[tokio::test]
    async fn open_breaker_gates_receipts_without_counting() {
        let rig = rig(5);
        let frame = frame("R5");
        let stanza = stanza_for(&frame);

        rig.transport.fail_sends(true);
        for _ in 0..5 {
            let result = rig.orchestrator.handle_failure(&frame, &stanza, &failure_stub()).await;
            assert!(result.is_err());
        }

        // Five transport failures tripped the breaker. The next attempt is
        // suppressed and leaves the counter untouched.
        rig.transport.fail_sends(false);
        let emitted =
            rig.orchestrator.handle_failure(&frame, &stanza, &failure_stub()).await.unwrap();
        assert!(!emitted);
        assert_eq!(rig.transport.sent_count(), 0);
        assert_eq!(rig.orchestrator.retry_count("R5", &frame.author), 0);
    }

    #[tokio::test]
    async fn pre_key_failures_trigger_replenishment() {
        let rig = rig(6);
        let frame = frame("R6");
        let stanza = stanza_for(&frame);

        let before = rig.env.now();
        rig.transport.push_response(Node::new("iq"));
        rig.orchestrator.handle_failure(&frame, &stanza, &pre_key_stub()).await.unwrap();

        // A full replenishment batch landed in the store.
        for id in 1..=MIN_PREKEY_COUNT {
            assert!(
                rig.store.get_one(RecordKind::PreKey, &id.to_string()).await.unwrap().is_some(),
                "pre-key {id} missing"
            );
        }
        // The upload went out and the settle delay elapsed.
        assert_eq!(rig.transport.queries().len(), 1);
        assert!(rig.env.now() - before >= PRE_KEY_SETTLE_DELAY);
    }

    #[tokio::test]
    async fn replenishment_failure_does_not_abort_the_retry() {
        let env = MockEnv::with_seed(7);
        let store = Arc::new(FailingStore::new(MemoryStore::new()));
        let mapping = Arc::new(MappingStore::new(env.clone(), Arc::clone(&store)));
        let creds = Credentials::generate(&env, pn("15550009999"));
        let repository =
            Arc::new(SessionRepository::new(env.clone(), Arc::clone(&store), mapping, &creds));
        let transport = Arc::new(MockTransport::new());
        let orchestrator = Arc::new(RetryOrchestrator::new(
            env,
            RetryConfig::default(),
            Arc::clone(&transport),
            repository,
            Arc::clone(&store),
            Arc::new(Mutex::new(creds)),
        ));

        store.fail_writes(true);
        let frame = frame("R7");
        let stanza = stanza_for(&frame);
        let emitted = orchestrator.handle_failure(&frame, &stanza, &pre_key_stub()).await.unwrap();
        assert!(emitted);
        assert_eq!(transport.sent_count(), 1);
        assert!(transport.sent()[0].child("keys").is_none());
    }

    #[tokio::test]
    async fn peer_messages_are_never_retried() {
        let rig = rig(8);
        let mut frame = frame("R8");
        frame.category = Some("peer".to_owned());
        let stanza = stanza_for(&frame);

        let emitted =
            rig.orchestrator.handle_failure(&frame, &stanza, &failure_stub()).await.unwrap();
        assert!(!emitted);
        assert_eq!(rig.transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn repeat_attempts_recreate_the_session_once_per_cooldown() {
        let rig = rig(9);
        let frame = frame("R9");
        let stanza = stanza_for(&frame);
        let session_id = frame.author.protocol_address().to_string();

        let plant = |bytes: Vec<u8>| {
            let mut batch = WriteBatch::new();
            batch.set(RecordKind::Session, session_id.clone(), bytes);
            batch
        };
        rig.store.put(plant(vec![1])).await.unwrap();

        // The first attempt never tears anything down.
        rig.orchestrator.handle_failure(&frame, &stanza, &failure_stub()).await.unwrap();
        assert!(rig.store.get_one(RecordKind::Session, &session_id).await.unwrap().is_some());

        // The second attempt deletes the session and advertises keys.
        rig.orchestrator.handle_failure(&frame, &stanza, &failure_stub()).await.unwrap();
        assert!(rig.store.get_one(RecordKind::Session, &session_id).await.unwrap().is_none());
        assert!(rig.transport.sent()[1].child("keys").is_some());

        // Replanted within the cooldown window: the next attempt leaves it.
        rig.store.put(plant(vec![2])).await.unwrap();
        rig.orchestrator.handle_failure(&frame, &stanza, &failure_stub()).await.unwrap();
        assert!(rig.store.get_one(RecordKind::Session, &session_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn notify_decrypted_cancels_the_pending_retry() {
        let rig = rig(10);
        let frame = frame("R10");
        let stanza = stanza_for(&frame);

        // Park the spawned task inside the blocked transport send.
        rig.transport.block_sends(true);
        rig.orchestrator.spawn_retry(frame.clone(), stanza, failure_stub());
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        rig.orchestrator.notify_decrypted("R10", &frame.author);
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        assert_eq!(rig.transport.sent_count(), 0);
        assert_eq!(rig.orchestrator.retry_count("R10", &frame.author), 0);
        assert!(rig.orchestrator.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_spawns_are_ignored_while_pending() {
        let rig = rig(11);
        let frame = frame("R11");
        let stanza = stanza_for(&frame);

        rig.transport.block_sends(true);
        rig.orchestrator.spawn_retry(frame.clone(), stanza.clone(), failure_stub());
        rig.orchestrator.spawn_retry(frame.clone(), stanza, failure_stub());
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        assert_eq!(rig.orchestrator.pending.lock().unwrap().len(), 1);
        rig.orchestrator.notify_decrypted("R11", &frame.author);
    }

    #[tokio::test]
    async fn spawned_retries_clean_up_after_themselves() {
        let rig = rig(12);
        let frame = frame("R12");
        let stanza = stanza_for(&frame);

        rig.orchestrator.spawn_retry(frame.clone(), stanza, failure_stub());
        for _ in 0..50 {
            tokio::task::yield_now().await;
            if rig.orchestrator.pending.lock().unwrap().is_empty() {
                break;
            }
        }

        assert!(rig.orchestrator.pending.lock().unwrap().is_empty());
        assert_eq!(rig.transport.sent_count(), 1);
        assert_eq!(rig.orchestrator.retry_count("R12", &frame.author), 1);
    }

    #[test]
    fn cooldown_policy_throttles_per_address() {
        let env = MockEnv::new();
        let policy = CooldownPolicy::new(env.clone(), Duration::from_secs(3600));
        let address = pn("15550001111");

        // Missing sessions always recreate.
        assert!(policy.should_recreate(&address, false, 2));
        assert!(policy.should_recreate(&address, false, 3));

        // Established sessions are throttled per address.
        assert!(policy.should_recreate(&address, true, 2));
        assert!(!policy.should_recreate(&address, true, 3));
        env.advance(Duration::from_secs(3600));
        assert!(policy.should_recreate(&address, true, 4));

        assert!(policy.should_recreate(&pn("15550002222"), true, 2));
    }
}

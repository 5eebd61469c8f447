//! Transport seam between the protocol core and the socket layer.
//!
//! The core never touches a socket. Everything it emits goes through
//! [`Transport`]: fire-and-forget stanza sends and correlated queries.
//! The production implementation lives with the connection code; tests use
//! [`test_utils::MockTransport`].

use async_trait::async_trait;
use conclave_proto::Node;

use crate::error::ClientError;

/// Stanza-level I/O the protocol core consumes.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Emit a stanza without waiting for a reply.
    async fn send_node(&self, node: Node) -> Result<(), ClientError>;

    /// Send a query stanza and await its correlated response.
    async fn query(&self, node: Node) -> Result<Node, ClientError>;
}

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    //! Recording transport for tests.

    #![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use conclave_proto::Node;

    use crate::error::ClientError;
    use crate::transport::Transport;

    /// In-memory transport that records traffic and serves canned replies.
    #[derive(Default)]
    pub struct MockTransport {
        sent: Mutex<Vec<Node>>,
        queries: Mutex<Vec<Node>>,
        responses: Mutex<VecDeque<Node>>,
        fail_sends: AtomicBool,
        block_sends: AtomicBool,
    }

    impl MockTransport {
        /// Transport that accepts everything and answers nothing.
        pub fn new() -> Self {
            Self::default()
        }

        /// Everything sent through [`Transport::send_node`] so far.
        pub fn sent(&self) -> Vec<Node> {
            self.sent.lock().expect("MockTransport mutex poisoned").clone()
        }

        /// Number of stanzas sent so far.
        pub fn sent_count(&self) -> usize {
            self.sent.lock().expect("MockTransport mutex poisoned").len()
        }

        /// Every query stanza issued so far.
        pub fn queries(&self) -> Vec<Node> {
            self.queries.lock().expect("MockTransport mutex poisoned").clone()
        }

        /// Queue a response for the next unanswered query, FIFO.
        pub fn push_response(&self, node: Node) {
            self.responses.lock().expect("MockTransport mutex poisoned").push_back(node);
        }

        /// Make subsequent sends fail with a transport error.
        pub fn fail_sends(&self, fail: bool) {
            self.fail_sends.store(fail, Ordering::SeqCst);
        }

        /// Make subsequent sends hang forever, for cancellation tests.
        pub fn block_sends(&self, block: bool) {
            self.block_sends.store(block, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send_node(&self, node: Node) -> Result<(), ClientError> {
            if self.block_sends.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(ClientError::Transport { reason: "injected send failure".to_string() });
            }
            self.sent.lock().expect("MockTransport mutex poisoned").push(node);
            Ok(())
        }

        async fn query(&self, node: Node) -> Result<Node, ClientError> {
            self.queries.lock().expect("MockTransport mutex poisoned").push(node);
            self.responses
                .lock()
                .expect("MockTransport mutex poisoned")
                .pop_front()
                .ok_or_else(|| ClientError::Transport { reason: "no canned response".to_string() })
        }
    }

}

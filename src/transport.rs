//! Transport seam: the narrow contract the core consumes from the P2P
//! messaging layer, plus a loopback implementation for tests and
//! single-process deployments.
//!
//! The core registers one handler per inbound topic and sends
//! topic-tagged [`Envelope`]s to peers; acknowledgement deadlines and the
//! actual wire encoding belong to the transport.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use crate::messages::Envelope;
use crate::types::{SchedulerError, SchedulerResult, WorkerId};

/// Handler invoked for each inbound envelope on a registered topic.
/// The first argument is the sending peer.
pub type Handler =
    Arc<dyn Fn(WorkerId, Envelope) -> BoxFuture<'static, SchedulerResult<()>> + Send + Sync>;

/// Contract consumed from the P2P messaging layer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver an envelope to `peer`, resolving once the peer acknowledges
    /// or the transport's ack deadline elapses.
    async fn send(&self, peer: &WorkerId, envelope: Envelope) -> SchedulerResult<()>;

    /// Register the handler for an inbound topic. Registering a topic twice
    /// replaces the previous handler.
    async fn register_handler(&self, topic: &str, handler: Handler);

    /// Whether a live connection to `peer` exists.
    async fn is_connected(&self, peer: &WorkerId) -> bool;

    /// Establish a connection to `peer`.
    async fn connect(&self, peer: &WorkerId) -> SchedulerResult<()>;
}

/// In-process transport: peers are mailboxes registered by the test
/// harness, and inbound delivery is a direct handler invocation.
#[derive(Default)]
pub struct LoopbackTransport {
    handlers: RwLock<HashMap<String, Handler>>,
    peers: RwLock<HashMap<WorkerId, async_channel::Sender<Envelope>>>,
}

impl LoopbackTransport {
    /// Create an empty loopback transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a peer mailbox; envelopes sent to `peer` land on the
    /// returned receiver.
    pub async fn attach_peer<I: Into<WorkerId>>(&self, peer: I) -> async_channel::Receiver<Envelope> {
        let (tx, rx) = async_channel::unbounded();
        self.peers.write().await.insert(peer.into(), tx);
        rx
    }

    /// Drop a peer mailbox; subsequent sends to `peer` fail.
    pub async fn detach_peer(&self, peer: &WorkerId) {
        self.peers.write().await.remove(peer);
    }

    /// Deliver an inbound envelope from `from` to the registered handler.
    pub async fn deliver(&self, from: &WorkerId, envelope: Envelope) -> SchedulerResult<()> {
        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&envelope.topic).cloned()
        };
        match handler {
            Some(handler) => handler(from.clone(), envelope).await,
            None => {
                warn!(topic = %envelope.topic, "no handler registered for inbound topic");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, peer: &WorkerId, envelope: Envelope) -> SchedulerResult<()> {
        let tx = {
            let peers = self.peers.read().await;
            peers.get(peer).cloned()
        };
        let tx = tx.ok_or_else(|| SchedulerError::DispatchFailed {
            worker_id: peer.clone(),
            reason: "peer not connected".to_string(),
        })?;
        tx.send(envelope)
            .await
            .map_err(|_| SchedulerError::DispatchFailed {
                worker_id: peer.clone(),
                reason: "peer mailbox closed".to_string(),
            })
    }

    async fn register_handler(&self, topic: &str, handler: Handler) {
        self.handlers.write().await.insert(topic.to_string(), handler);
    }

    async fn is_connected(&self, peer: &WorkerId) -> bool {
        self.peers.read().await.contains_key(peer)
    }

    async fn connect(&self, _peer: &WorkerId) -> SchedulerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::topics;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn send_reaches_attached_peer() {
        let transport = LoopbackTransport::new();
        let inbox = transport.attach_peer("w1").await;

        let envelope = Envelope {
            topic: topics::TASK_ASSIGNMENT.to_string(),
            payload: serde_json::json!({"probe": true}),
        };
        transport.send(&"w1".to_string(), envelope).await.unwrap();
        let received = inbox.recv().await.unwrap();
        assert_eq!(received.topic, topics::TASK_ASSIGNMENT);
    }

    #[tokio::test]
    async fn send_to_unknown_peer_fails() {
        let transport = LoopbackTransport::new();
        let envelope = Envelope {
            topic: topics::TASK_ASSIGNMENT.to_string(),
            payload: serde_json::Value::Null,
        };
        let result = transport.send(&"ghost".to_string(), envelope).await;
        assert!(matches!(
            result,
            Err(SchedulerError::DispatchFailed { .. })
        ));
    }

    #[tokio::test]
    async fn deliver_invokes_registered_handler() {
        let transport = LoopbackTransport::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let handler_hits = Arc::clone(&hits);
        transport
            .register_handler(
                topics::WORKER_HEARTBEAT,
                Arc::new(move |_from, _env| {
                    let hits = Arc::clone(&handler_hits);
                    Box::pin(async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                }),
            )
            .await;

        let envelope = Envelope {
            topic: topics::WORKER_HEARTBEAT.to_string(),
            payload: serde_json::Value::Null,
        };
        transport.deliver(&"w1".to_string(), envelope).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}

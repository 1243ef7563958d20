//! In-memory networks for tests and simulations.
//!
//! [`SimNetwork`] is a shared broker connecting any number of [`SimNode`]
//! transports through a replayed message log: every subscriber receives
//! every message ever broadcast (the sender's own included), regardless
//! of when it subscribed. That matches the at-least-once overlay
//! contract, with deduplication left to the engine. [`UnreliableNetwork`]
//! wraps any transport with randomized, possibly reordering latency.

pub mod unreliable;

pub use unreliable::{Parameters, UnreliableNetwork};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use pnyx_model::{Message, RecoveryRequest, RecoveryResponse};
use pnyx_net::mesh::check_recovery_responses;
use pnyx_net::{
    envelope, MessageFilter, Network, NetworkError, RecoveryHandler, RecoveryManager,
};

const SUBSCRIBER_QUEUE: usize = 1024;

/// Shared broker: an append-only message log replayed to every
/// subscriber, plus the registry of recovery handlers.
#[derive(Clone)]
pub struct SimNetwork {
    log: Arc<RwLock<Vec<Message>>>,
    log_len: Arc<watch::Sender<usize>>,
    handlers: Arc<RwLock<HashMap<usize, RecoveryHandler>>>,
    next_id: Arc<AtomicUsize>,
}

impl SimNetwork {
    pub fn new() -> Self {
        let (log_len, _) = watch::channel(0);
        SimNetwork {
            log: Arc::new(RwLock::new(Vec::new())),
            log_len: Arc::new(log_len),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Attach a new node transport to the broker.
    pub fn node(&self, recovery_quorum: usize) -> SimNode {
        SimNode {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            network: self.clone(),
            recovery_quorum,
            token: CancellationToken::new(),
        }
    }

    fn append(&self, message: Message) {
        let len = {
            let mut log = self.log.write().expect("sim log lock poisoned");
            log.push(message);
            log.len()
        };
        self.log_len.send_replace(len);
    }

    fn entry(&self, index: usize) -> Option<Message> {
        let log = self.log.read().expect("sim log lock poisoned");
        log.get(index).cloned()
    }
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's view of the [`SimNetwork`].
#[derive(Clone)]
pub struct SimNode {
    id: usize,
    network: SimNetwork,
    recovery_quorum: usize,
    token: CancellationToken,
}

#[async_trait]
impl Network for SimNode {
    async fn broadcast(&self, message: Message) -> Result<(), NetworkError> {
        // Round-trip through the envelope so simulations exercise the
        // same codec as real transports.
        let packet = envelope::pack(&message)?;
        let message = envelope::unpack(&packet)?;

        self.network.append(message);
        Ok(())
    }

    async fn accept(
        &self,
        token: CancellationToken,
        filter: MessageFilter,
    ) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let network = self.network.clone();
        let mut log_len = self.network.log_len.subscribe();
        let node_token = self.token.clone();

        tokio::spawn(async move {
            let mut index = 0;
            loop {
                // Deliver everything appended so far, replaying history
                // for late subscribers.
                while let Some(message) = network.entry(index) {
                    index += 1;
                    if filter(&message) && tx.send(message).await.is_err() {
                        return;
                    }
                }

                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = node_token.cancelled() => return,
                    changed = log_len.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        rx
    }

    fn recovery(&self) -> Option<Arc<dyn RecoveryManager>> {
        if self.recovery_quorum == 0 {
            return None;
        }
        Some(Arc::new(self.clone()))
    }

    async fn close(&self) {
        self.token.cancel();
        self.network
            .handlers
            .write()
            .expect("sim handler lock poisoned")
            .remove(&self.id);
    }
}

#[async_trait]
impl RecoveryManager for SimNode {
    async fn request_recovery(&self, key: &str) -> Result<RecoveryResponse, NetworkError> {
        let handlers: Vec<RecoveryHandler> = {
            let registry = self
                .network
                .handlers
                .read()
                .expect("sim handler lock poisoned");
            registry
                .iter()
                .filter(|(id, _)| **id != self.id)
                .map(|(_, handler)| handler.clone())
                .collect()
        };

        if handlers.len() < self.recovery_quorum {
            return Err(NetworkError::NotEnoughPeers {
                got: handlers.len(),
                want: self.recovery_quorum,
            });
        }

        let request = RecoveryRequest {
            key: key.to_string(),
        };

        // Pick a random quorum, like a real overlay would.
        let mut indices: Vec<usize> = (0..handlers.len()).collect();
        {
            use rand::seq::SliceRandom;
            indices.shuffle(&mut rand::thread_rng());
        }

        let mut responses = Vec::with_capacity(self.recovery_quorum);
        for index in indices.into_iter().take(self.recovery_quorum) {
            responses.push(handlers[index](&request)?);
        }

        check_recovery_responses(key, &responses)
    }

    fn accept_recovery(&self, token: CancellationToken, handler: RecoveryHandler) {
        self.network
            .handlers
            .write()
            .expect("sim handler lock poisoned")
            .insert(self.id, handler);

        let handlers = self.network.handlers.clone();
        let id = self.id;
        tokio::spawn(async move {
            token.cancelled().await;
            handlers
                .write()
                .expect("sim handler lock poisoned")
                .remove(&id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnyx_model::Version;
    use std::time::Duration;

    fn any_filter() -> MessageFilter {
        Arc::new(|_| true)
    }

    #[tokio::test]
    async fn all_nodes_receive_broadcasts_including_sender() {
        let network = SimNetwork::new();
        let a = network.node(0);
        let b = network.node(0);

        let token = CancellationToken::new();
        let mut rx_a = a.accept(token.child_token(), any_filter()).await;
        let mut rx_b = b.accept(token.child_token(), any_filter()).await;

        let message = Message::RecoveryRequest(RecoveryRequest { key: "k".into() });
        a.broadcast(message.clone()).await.unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got, message);
        }
    }

    #[tokio::test]
    async fn late_subscriber_replays_history() {
        let network = SimNetwork::new();
        let a = network.node(0);
        let b = network.node(0);

        let message = Message::RecoveryRequest(RecoveryRequest { key: "k".into() });
        a.broadcast(message.clone()).await.unwrap();

        // b subscribes only after the broadcast and still sees it.
        let token = CancellationToken::new();
        let mut rx_b = b.accept(token.child_token(), any_filter()).await;
        let got = tokio::time::timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, message);
    }

    #[tokio::test]
    async fn filter_restricts_delivery() {
        let network = SimNetwork::new();
        let node = network.node(0);

        let token = CancellationToken::new();
        let mut rx = node
            .accept(
                token.child_token(),
                Arc::new(|m| matches!(m, Message::RecoveryResponse(_))),
            )
            .await;

        node.broadcast(Message::RecoveryRequest(RecoveryRequest { key: "k".into() }))
            .await
            .unwrap();
        let response = Message::RecoveryResponse(RecoveryResponse {
            key: "k".into(),
            version: Version::of(b"v"),
            data: b"v".to_vec(),
        });
        node.broadcast(response.clone()).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, response);
    }

    #[tokio::test]
    async fn recovery_requires_quorum() {
        let network = SimNetwork::new();
        let node = network.node(3);
        let manager = node.recovery().unwrap();

        let err = manager.request_recovery("k").await.unwrap_err();
        assert!(matches!(err, NetworkError::NotEnoughPeers { got: 0, want: 3 }));
    }

    #[tokio::test]
    async fn recovery_agreement_and_divergence() {
        let network = SimNetwork::new();
        let requester = network.node(2);

        let healthy = |request: &RecoveryRequest| -> Result<RecoveryResponse, NetworkError> {
            Ok(RecoveryResponse {
                key: request.key.clone(),
                version: Version::of(b"agreed"),
                data: b"agreed".to_vec(),
            })
        };

        for _ in 0..2 {
            let peer = network.node(0);
            peer.accept_recovery(CancellationToken::new(), Arc::new(healthy));
        }

        let manager = requester.recovery().unwrap();
        let response = manager.request_recovery("k").await.unwrap();
        assert_eq!(response.data, b"agreed");

        // A divergent peer breaks the agreement check.
        let divergent = network.node(0);
        divergent.accept_recovery(
            CancellationToken::new(),
            Arc::new(|request: &RecoveryRequest| {
                Ok(RecoveryResponse {
                    key: request.key.clone(),
                    version: Version::of(b"divergent"),
                    data: b"divergent".to_vec(),
                })
            }),
        );

        let requester = network.node(3);
        let manager = requester.recovery().unwrap();
        let err = manager.request_recovery("k").await.unwrap_err();
        let text = err.to_string();
        assert!(
            text.contains("version mismatch") || text.contains("data mismatch"),
            "unexpected error: {text}"
        );
    }
}

//! TCP full-mesh transport for static consortium deployments.
//!
//! Every node dials every configured peer and keeps the connection alive
//! with a reconnect loop. Streams are length-delimited; the first frame
//! names the protocol (gossip or recovery), subsequent frames carry
//! enveloped consensus messages. Broadcast also loops back locally so a
//! node observes its own traffic, like any other gossip substrate.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::seq::SliceRandom;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use pnyx_model::{Message, RecoveryRequest, RecoveryResponse};

use crate::{
    envelope, MessageFilter, Network, NetworkError, RecoveryHandler, RecoveryManager,
    RECOVERY_PROTOCOL_ID,
};

/// Protocol id of gossip streams.
pub const GOSSIP_PROTOCOL_ID: &str = "/p2p/pnyxdb_gossip";

const OUTBOUND_QUEUE: usize = 256;
const SUBSCRIBER_QUEUE: usize = 256;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Static mesh parameters.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub listen: SocketAddr,
    pub peers: Vec<SocketAddr>,
    /// Number of agreeing peers required by a recovery pull.
    pub recovery_quorum: usize,
}

struct Subscriber {
    token: CancellationToken,
    filter: MessageFilter,
    tx: mpsc::Sender<Message>,
}

struct MeshInner {
    config: MeshConfig,
    subscribers: Mutex<Vec<Subscriber>>,
    outbound: Mutex<Vec<mpsc::Sender<Vec<u8>>>>,
    recovery_handler: std::sync::RwLock<Option<RecoveryHandler>>,
    token: CancellationToken,
}

/// TCP mesh implementation of [`Network`] and [`RecoveryManager`].
#[derive(Clone)]
pub struct TcpMesh {
    inner: Arc<MeshInner>,
    local_addr: SocketAddr,
}

fn framed(stream: TcpStream) -> Framed<TcpStream, LengthDelimitedCodec> {
    let mut codec = LengthDelimitedCodec::new();
    codec.set_max_frame_length(envelope::MAX_BODY_LEN as usize + 16);
    Framed::new(stream, codec)
}

impl TcpMesh {
    /// Bind the listener and start dialing the configured peers.
    pub async fn start(config: MeshConfig) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(config.listen).await?;
        let local_addr = listener.local_addr()?;

        let peers = config.peers.clone();
        let mesh = TcpMesh {
            inner: Arc::new(MeshInner {
                config,
                subscribers: Mutex::new(Vec::new()),
                outbound: Mutex::new(Vec::new()),
                recovery_handler: std::sync::RwLock::new(None),
                token: CancellationToken::new(),
            }),
            local_addr,
        };

        let accept_inner = mesh.inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_inner.token.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, remote)) = accepted else { continue };
                        let inner = accept_inner.clone();
                        tokio::spawn(async move {
                            if let Err(e) = inner.handle_inbound(stream).await {
                                tracing::debug!(peer = %remote, error = %e, "inbound stream ended");
                            }
                        });
                    }
                }
            }
        });

        for peer in peers {
            mesh.connect_peer(peer).await;
        }

        Ok(mesh)
    }

    /// Address the listener actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Maintain an outbound gossip connection to one peer.
    pub async fn connect_peer(&self, peer: SocketAddr) {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
        self.inner.outbound.lock().await.push(tx);

        let token = self.inner.token.clone();
        tokio::spawn(async move {
            loop {
                if token.is_cancelled() {
                    return;
                }

                let stream = tokio::select! {
                    _ = token.cancelled() => return,
                    conn = TcpStream::connect(peer) => match conn {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::debug!(peer = %peer, error = %e, "dial failed, retrying");
                            tokio::time::sleep(RECONNECT_DELAY).await;
                            continue;
                        }
                    },
                };

                let mut framed = framed(stream);
                if framed
                    .send(GOSSIP_PROTOCOL_ID.as_bytes().to_vec().into())
                    .await
                    .is_err()
                {
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
                tracing::debug!(peer = %peer, "gossip stream established");

                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        packet = rx.recv() => {
                            let Some(packet) = packet else { return };
                            if framed.send(packet.into()).await.is_err() {
                                // Connection lost; packets queued meanwhile
                                // are dropped by the bounded channel.
                                break;
                            }
                        }
                    }
                }

                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });
    }
}

impl MeshInner {
    async fn handle_inbound(
        self: Arc<Self>,
        stream: TcpStream,
    ) -> Result<(), NetworkError> {
        let mut framed = framed(stream);

        let protocol = tokio::select! {
            _ = self.token.cancelled() => return Ok(()),
            frame = framed.next() => frame.ok_or(NetworkError::Closed)??,
        };

        match protocol.as_ref() {
            p if p == GOSSIP_PROTOCOL_ID.as_bytes() => loop {
                let frame = tokio::select! {
                    _ = self.token.cancelled() => return Ok(()),
                    frame = framed.next() => match frame {
                        Some(frame) => frame?,
                        None => return Ok(()),
                    },
                };

                match envelope::unpack(&frame) {
                    Ok(message) => self.dispatch(message).await,
                    Err(e) => tracing::warn!(error = %e, "dropping malformed packet"),
                }
            },
            p if p == RECOVERY_PROTOCOL_ID.as_bytes() => {
                let frame = match framed.next().await {
                    Some(frame) => frame?,
                    None => return Ok(()),
                };

                let Message::RecoveryRequest(request) = envelope::unpack(&frame)? else {
                    return Err(NetworkError::Recovery("invalid request type".into()));
                };

                let handler = self
                    .recovery_handler
                    .read()
                    .expect("recovery handler lock poisoned")
                    .clone();
                let Some(handler) = handler else {
                    return Err(NetworkError::Recovery("no handler installed".into()));
                };

                let response = handler(&request)?;
                let packet = envelope::pack(&Message::RecoveryResponse(response))?;
                framed.send(packet.into()).await?;
                Ok(())
            }
            other => Err(NetworkError::Connect(format!(
                "unknown protocol id {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    /// Deliver a message to every live subscriber whose filter accepts it.
    async fn dispatch(&self, message: Message) {
        let mut subscribers = self.subscribers.lock().await;
        let mut kept = Vec::with_capacity(subscribers.len());
        for sub in subscribers.drain(..) {
            if sub.token.is_cancelled() {
                continue;
            }
            if (sub.filter)(&message) {
                if sub.tx.send(message.clone()).await.is_err() {
                    continue;
                }
            }
            kept.push(sub);
        }
        *subscribers = kept;
    }
}

#[async_trait]
impl Network for TcpMesh {
    async fn broadcast(&self, message: Message) -> Result<(), NetworkError> {
        let packet = envelope::pack(&message)?;

        // Local loopback first, then fan out.
        self.inner.dispatch(message).await;

        let outbound = self.inner.outbound.lock().await;
        for tx in outbound.iter() {
            // Best-effort: a saturated queue (peer down) drops the packet.
            let _ = tx.try_send(packet.clone());
        }
        Ok(())
    }

    async fn accept(
        &self,
        token: CancellationToken,
        filter: MessageFilter,
    ) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        self.inner.subscribers.lock().await.push(Subscriber {
            token,
            filter,
            tx,
        });
        rx
    }

    fn recovery(&self) -> Option<Arc<dyn RecoveryManager>> {
        Some(Arc::new(self.clone()))
    }

    async fn close(&self) {
        self.inner.token.cancel();
    }
}

#[async_trait]
impl RecoveryManager for TcpMesh {
    async fn request_recovery(&self, key: &str) -> Result<RecoveryResponse, NetworkError> {
        let quorum = self.inner.config.recovery_quorum;
        let peers = &self.inner.config.peers;
        if quorum == 0 {
            return Err(NetworkError::Recovery("recovery disabled".into()));
        }
        if peers.len() < quorum {
            return Err(NetworkError::NotEnoughPeers {
                got: peers.len(),
                want: quorum,
            });
        }

        let chosen: Vec<SocketAddr> = peers
            .choose_multiple(&mut rand::thread_rng(), quorum)
            .copied()
            .collect();

        let request = envelope::pack(&Message::RecoveryRequest(RecoveryRequest {
            key: key.to_string(),
        }))?;

        let pulls = chosen.into_iter().map(|peer| {
            let request = request.clone();
            async move {
                let stream = TcpStream::connect(peer)
                    .await
                    .map_err(|e| NetworkError::Connect(e.to_string()))?;
                let mut framed = framed(stream);
                framed
                    .send(RECOVERY_PROTOCOL_ID.as_bytes().to_vec().into())
                    .await?;
                framed.send(request.into()).await?;

                let frame = framed.next().await.ok_or(NetworkError::Closed)??;
                match envelope::unpack(&frame)? {
                    Message::RecoveryResponse(response) => Ok(response),
                    _ => Err(NetworkError::Recovery("invalid response type".into())),
                }
            }
        });

        let responses: Vec<RecoveryResponse> = futures_util::future::join_all(pulls)
            .await
            .into_iter()
            .collect::<Result<_, NetworkError>>()?;

        check_recovery_responses(key, &responses)
    }

    fn accept_recovery(&self, token: CancellationToken, handler: RecoveryHandler) {
        *self
            .inner
            .recovery_handler
            .write()
            .expect("recovery handler lock poisoned") = Some(handler);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            inner
                .recovery_handler
                .write()
                .expect("recovery handler lock poisoned")
                .take();
        });
    }
}

/// All peers must agree on key, version, and data for a recovery to apply.
pub fn check_recovery_responses(
    key: &str,
    responses: &[RecoveryResponse],
) -> Result<RecoveryResponse, NetworkError> {
    let Some(first) = responses.first() else {
        return Err(NetworkError::Recovery("no responses".into()));
    };

    for response in responses {
        if response.key != key {
            return Err(NetworkError::Recovery("key mismatch".into()));
        }
        if first.version.matches(&response.version).is_err() {
            return Err(NetworkError::Recovery("version mismatch".into()));
        }
        if first.data != response.data {
            return Err(NetworkError::Recovery("data mismatch".into()));
        }
    }

    Ok(first.clone())
}

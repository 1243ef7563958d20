//! PnyxDB peer overlay.
//!
//! - **Contract**: [`Network`] (best-effort broadcast + filtered
//!   subscription) and the optional [`RecoveryManager`] extension for
//!   per-peer key recovery.
//! - **Envelope**: tagged, length-prefixed packets for the consensus
//!   messages.
//! - **Mesh**: a TCP full-mesh transport for static consortium
//!   deployments.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pnyx_model::{Message, RecoveryRequest, RecoveryResponse};

pub mod envelope;
pub mod mesh;

pub use envelope::{pack, unpack, EnvelopeError, MAX_BODY_LEN};
pub use mesh::{MeshConfig, TcpMesh};

/// Protocol id of the per-peer recovery stream.
pub const RECOVERY_PROTOCOL_ID: &str = "/p2p/pnyxdb_recovery";

/// Typed filter applied to incoming messages before delivery.
pub type MessageFilter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Callback answering recovery requests from peers.
pub type RecoveryHandler =
    Arc<dyn Fn(&RecoveryRequest) -> Result<RecoveryResponse, NetworkError> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("network is closed")]
    Closed,

    #[error("connection error: {0}")]
    Connect(String),

    #[error("not enough peers to recover, got {got} but expected {want}")]
    NotEnoughPeers { got: usize, want: usize },

    #[error("recovery error: {0}")]
    Recovery(String),
}

/// The transport contract the consensus engine relies on: fire-and-forget
/// broadcast and at-least-once filtered delivery. Messages may arrive in
/// any order and more than once; the engine deduplicates.
#[async_trait]
pub trait Network: Send + Sync {
    /// Best-effort broadcast to the peer set (self included).
    async fn broadcast(&self, message: Message) -> Result<(), NetworkError>;

    /// Subscribe with a typed filter. The stream closes when the token is
    /// cancelled or the network shuts down.
    async fn accept(&self, token: CancellationToken, filter: MessageFilter)
        -> mpsc::Receiver<Message>;

    /// Recovery extension, when the transport supports it.
    fn recovery(&self) -> Option<Arc<dyn RecoveryManager>> {
        None
    }

    /// Tear the transport down.
    async fn close(&self);
}

/// Optional per-peer recovery support (after a crash or partition).
#[async_trait]
pub trait RecoveryManager: Send + Sync {
    /// Ask a quorum of peers for the record of `key`; all answers must
    /// agree on version and data.
    async fn request_recovery(&self, key: &str) -> Result<RecoveryResponse, NetworkError>;

    /// Install the handler answering peers' recovery requests.
    fn accept_recovery(&self, token: CancellationToken, handler: RecoveryHandler);
}

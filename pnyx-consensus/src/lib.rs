//! PnyxDB consensus core.
//!
//! A node accepts client queries, disseminates them over the peer
//! overlay, collects endorsements from consortium members, and commits
//! queries that gather the configured quorum. Conflicting pending
//! queries are resolved by the BBC veto sub-protocol, which lets honest
//! nodes drop a query once a conflicting one has committed.
//!
//! Entry points:
//! - [`Engine`] orchestrates message handling, the endorsement decision,
//!   commits, checkpoints, and recovery;
//! - [`VetoEngine`] implements the [`BbcEngine`] binary consensus;
//! - [`QueryStore`] holds the pending-query dependency graph.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use pnyx_model::Proof;

pub mod bbc;
pub mod engine;
pub mod operations;
pub mod persistence;
pub mod query_store;
mod sign;

pub use bbc::VetoEngine;
pub use engine::{Engine, EngineOptions};
pub use persistence::PersistenceError;
pub use query_store::{QueryInfo, QueryState, QueryStore};

/// Binary Byzantine consensus over one identifier.
#[async_trait]
pub trait BbcEngine: Send + Sync {
    /// Run one instance with this node's choice and optional proofs.
    /// Resolves to the common decision; a `false` decision carries the
    /// falsifier's proofs.
    async fn execute(
        &self,
        token: CancellationToken,
        id: &str,
        choice: bool,
        proofs: Vec<Proof>,
    ) -> Result<(bool, Vec<Proof>), BbcError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BbcError {
    #[error("binary consensus interrupted")]
    Interrupted,

    #[error("keyring: {0}")]
    KeyRing(#[from] pnyx_keyring::KeyRingError),

    #[error("network: {0}")]
    Network(#[from] pnyx_net::NetworkError),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("keyring: {0}")]
    KeyRing(#[from] pnyx_keyring::KeyRingError),

    #[error("network: {0}")]
    Network(#[from] pnyx_net::NetworkError),

    #[error("store: {0}")]
    Store(#[from] pnyx_storage::StoreError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("engine is already running")]
    AlreadyRunning,
}

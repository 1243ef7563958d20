//! Client-facing API for PnyxDB.
//!
//! Four methods over a length-delimited TCP protocol with borsh bodies:
//! `Get` and `Members`/`Contains` read the local store, `Submit` turns a
//! [`Transaction`] into a signed query and hands it to the engine.

use std::collections::BTreeMap;

use uuid::Uuid;

use pnyx_model::{uuid_borsh, Operation, Timestamp, Version};

pub mod client;
pub mod server;

pub use client::ApiClient;
pub use server::ApiServer;

/// A client's transaction request: what to change, under which policy,
/// by when, and the optimistic-concurrency preconditions.
#[derive(
    Debug, Clone, PartialEq,
    serde::Serialize, serde::Deserialize,
    borsh::BorshSerialize, borsh::BorshDeserialize,
)]
pub struct Transaction {
    pub policy: String,
    /// Absolute expiry instant.
    pub deadline: Timestamp,
    pub requirements: BTreeMap<String, Version>,
    pub operations: Vec<Operation>,
}

/// Acknowledgment of a submitted transaction.
#[derive(
    Debug, Clone, PartialEq, Eq,
    serde::Serialize, serde::Deserialize,
    borsh::BorshSerialize, borsh::BorshDeserialize,
)]
pub struct Receipt {
    #[borsh(
        serialize_with = "uuid_borsh::serialize",
        deserialize_with = "uuid_borsh::deserialize"
    )]
    pub uuid: Uuid,
}

/// One API call.
#[derive(
    Debug, Clone, PartialEq,
    serde::Serialize, serde::Deserialize,
    borsh::BorshSerialize, borsh::BorshDeserialize,
)]
pub enum Request {
    Get { key: String },
    Members { key: String },
    Contains { key: String, value: Vec<u8> },
    Submit(Transaction),
}

/// One API answer.
#[derive(
    Debug, Clone, PartialEq,
    serde::Serialize, serde::Deserialize,
    borsh::BorshSerialize, borsh::BorshDeserialize,
)]
pub enum Response {
    Value {
        version: Version,
        data: Vec<u8>,
    },
    Values {
        version: Version,
        elements: Vec<Vec<u8>>,
    },
    Boolean(bool),
    Receipt(Receipt),
    Error(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("store: {0}")]
    Store(#[from] pnyx_storage::StoreError),

    #[error("engine: {0}")]
    Engine(#[from] pnyx_consensus::EngineError),

    #[error("value is not a set: {0}")]
    NotASet(#[from] pnyx_consensus::operations::OperationError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(borsh::io::Error),

    #[error("connection closed")]
    Closed,

    #[error("remote error: {0}")]
    Remote(String),

    #[error("unexpected response type")]
    UnexpectedResponse,
}

//! Consensus wire messages.
//!
//! Every message travelling on the peer overlay is one of the variants of
//! [`Message`]; the envelope codec tags each variant with a stable one-byte
//! identifier.

use uuid::Uuid;

use crate::endorsement::Endorsement;
use crate::query::Query;
use crate::types::{Digest, Version};
use crate::{crypto, uuid_borsh};

/// Unsigned hint broadcast to start a checkpoint over a set of queries.
#[derive(
    Debug, Clone, PartialEq,
    serde::Serialize, serde::Deserialize,
    borsh::BorshSerialize, borsh::BorshDeserialize,
)]
pub struct StartCheckpoint {
    #[borsh(
        serialize_with = "uuid_borsh::vec::serialize",
        deserialize_with = "uuid_borsh::vec::deserialize"
    )]
    pub queries: Vec<Uuid>,
}

/// Request for the current record of one key, sent over the recovery stream.
#[derive(
    Debug, Clone, PartialEq, Eq,
    serde::Serialize, serde::Deserialize,
    borsh::BorshSerialize, borsh::BorshDeserialize,
)]
pub struct RecoveryRequest {
    pub key: String,
}

/// One peer's answer to a [`RecoveryRequest`].
#[derive(
    Debug, Clone, PartialEq,
    serde::Serialize, serde::Deserialize,
    borsh::BorshSerialize, borsh::BorshDeserialize,
)]
pub struct RecoveryResponse {
    pub key: String,
    pub version: Version,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Evidence attached to a binary-consensus veto.
#[derive(
    Debug, Clone, PartialEq,
    serde::Serialize, serde::Deserialize,
    borsh::BorshSerialize, borsh::BorshDeserialize,
)]
pub enum Proof {
    Query(Query),
    Endorsement(Endorsement),
}

/// A participant's vote in one binary-consensus instance.
#[derive(
    Debug, Clone, PartialEq,
    serde::Serialize, serde::Deserialize,
    borsh::BorshSerialize, borsh::BorshDeserialize,
)]
pub struct Choice {
    /// Identifier of the consensus instance.
    pub identifier: String,
    pub emitter: String,
    pub choice: bool,
    /// Evidence for a `false` choice.
    pub proofs: Vec<Proof>,
    /// Ed25519 signature over the unsigned hash; empty until signed.
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl Choice {
    /// Fixed-size hash of the unsigned form of the choice.
    pub fn unsigned_hash(&self) -> Digest {
        let mut unsigned = self.clone();
        unsigned.signature.clear();
        let raw = borsh::to_vec(&unsigned).expect("borsh serialization cannot fail");
        crypto::digest(&raw)
    }
}

/// Any message carried by the peer overlay.
#[derive(
    Debug, Clone, PartialEq,
    serde::Serialize, serde::Deserialize,
    borsh::BorshSerialize, borsh::BorshDeserialize,
)]
pub enum Message {
    Query(Query),
    Endorsement(Endorsement),
    StartCheckpoint(StartCheckpoint),
    RecoveryRequest(RecoveryRequest),
    RecoveryResponse(RecoveryResponse),
    Choice(Choice),
}

impl Message {
    /// Stable one-byte wire tag for this message type.
    pub fn wire_tag(&self) -> u8 {
        match self {
            Message::Query(_) => 1,
            Message::Endorsement(_) => 2,
            Message::StartCheckpoint(_) => 3,
            Message::RecoveryRequest(_) => 7,
            Message::RecoveryResponse(_) => 8,
            Message::Choice(_) => 10,
        }
    }
}

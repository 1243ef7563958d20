//! Endorsement: a member's conditional approval of a query.

use uuid::Uuid;

use crate::types::Digest;
use crate::{crypto, uuid_borsh};

/// Approval of one query by one consortium member.
///
/// The endorsement becomes invalid if any query listed in `conditions`
/// becomes applicable; this is how conflict preference is encoded.
#[derive(
    Debug, Clone, PartialEq,
    serde::Serialize, serde::Deserialize,
    borsh::BorshSerialize, borsh::BorshDeserialize,
)]
pub struct Endorsement {
    /// Uuid of the endorsed query.
    #[borsh(
        serialize_with = "uuid_borsh::serialize",
        deserialize_with = "uuid_borsh::deserialize"
    )]
    pub uuid: Uuid,

    /// Identity of the endorsing node.
    pub emitter: String,

    /// Queries whose applicability invalidates this endorsement.
    #[borsh(
        serialize_with = "uuid_borsh::vec::serialize",
        deserialize_with = "uuid_borsh::vec::deserialize"
    )]
    pub conditions: Vec<Uuid>,

    /// Ed25519 signature over the unsigned hash; empty until signed.
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl Endorsement {
    /// Fixed-size hash of the unsigned form of the endorsement.
    pub fn unsigned_hash(&self) -> Digest {
        let mut unsigned = self.clone();
        unsigned.signature.clear();
        let raw = borsh::to_vec(&unsigned).expect("borsh serialization cannot fail");
        crypto::digest(&raw)
    }
}

//! Query: the atomic transaction unit submitted to the consortium.
//!
//! A `Query` is immutable after signing. Its canonical hash is the SHA-512
//! of its borsh serialization with the signature field cleared.

use std::collections::BTreeMap;
use std::time::Duration;

use uuid::Uuid;

use crate::operation::{ConflictError, Operation};
use crate::time::Timestamp;
use crate::types::{Digest, Version};
use crate::{crypto, uuid_borsh};

/// Policy assigned to queries that do not request a specific one.
pub const DEFAULT_POLICY: &str = "none";

/// A set of operations proposed for commitment, together with its
/// precondition (`requirements`) and expiry (`deadline`).
#[derive(
    Debug, Clone, PartialEq,
    serde::Serialize, serde::Deserialize,
    borsh::BorshSerialize, borsh::BorshDeserialize,
)]
pub struct Query {
    #[borsh(
        serialize_with = "uuid_borsh::serialize",
        deserialize_with = "uuid_borsh::deserialize"
    )]
    pub uuid: Uuid,

    /// Identity of the submitting node; filled on submission.
    pub emitter: String,

    /// Conflict scope. Queries with different policies never conflict.
    pub policy: String,

    /// Absolute instant after which the query may no longer be endorsed.
    pub deadline: Timestamp,

    /// Preconditions: each key must currently store the given version.
    pub requirements: BTreeMap<String, Version>,

    /// Ordered mutations to apply on commit.
    pub operations: Vec<Operation>,

    /// Ed25519 signature over the unsigned hash; empty until signed.
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl Query {
    /// Instantiate a new empty query with a fresh v4 uuid.
    pub fn new() -> Self {
        Query {
            uuid: Uuid::new_v4(),
            emitter: String::new(),
            policy: DEFAULT_POLICY.to_string(),
            deadline: Timestamp::ZERO,
            requirements: BTreeMap::new(),
            operations: Vec::new(),
            signature: Vec::new(),
        }
    }

    /// Returns an error if two queries are conflicting.
    ///
    /// Queries conflict when they share a policy and any pair of their
    /// operations on a common key is not parallelizable.
    pub fn check_conflict(&self, other: &Query) -> Result<(), ConflictError> {
        if self.policy != other.policy {
            return Ok(());
        }

        for op in &self.operations {
            for op2 in &other.operations {
                op.check_conflict(op2)?;
            }
        }

        Ok(())
    }

    /// Update the deadline to `d` from the current time.
    pub fn set_timeout(&mut self, d: Duration) {
        self.deadline = Timestamp::after(d);
    }

    /// True once the deadline is reached.
    pub fn expired(&self) -> bool {
        self.expired_since(Duration::ZERO)
    }

    /// True once the deadline has been reached for at least `d`.
    pub fn expired_since(&self, d: Duration) -> bool {
        self.deadline.elapsed_since(d)
    }

    /// Fixed-size hash of the unsigned form of the query.
    pub fn unsigned_hash(&self) -> Digest {
        let mut unsigned = self.clone();
        unsigned.signature.clear();
        let raw = borsh::to_vec(&unsigned).expect("borsh serialization cannot fail");
        crypto::digest(&raw)
    }
}

impl Default for Query {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Opcode;

    fn query_with(policy: &str, ops: &[(&str, Opcode, &[u8])]) -> Query {
        let mut q = Query::new();
        q.policy = policy.into();
        q.operations = ops
            .iter()
            .map(|(key, op, data)| Operation {
                key: (*key).into(),
                op: *op,
                data: data.to_vec(),
            })
            .collect();
        q
    }

    #[test]
    fn fresh_query_is_expired() {
        let q = Query::new();
        assert!(q.expired());

        let mut q2 = Query::new();
        q2.set_timeout(Duration::from_secs(30));
        assert!(!q2.expired());
    }

    #[test]
    fn conflict_requires_same_policy() {
        let a = query_with("p1", &[("k", Opcode::Set, b"x")]);
        let b = query_with("p2", &[("k", Opcode::Set, b"y")]);
        assert!(a.check_conflict(&b).is_ok());

        let c = query_with("p1", &[("k", Opcode::Set, b"y")]);
        assert!(a.check_conflict(&c).is_err());
    }

    #[test]
    fn conflict_symmetry() {
        let cases = [
            query_with("none", &[("a", Opcode::Concat, b"1")]),
            query_with("none", &[("a", Opcode::Set, b"1"), ("b", Opcode::Add, b"2")]),
            query_with("none", &[("b", Opcode::Add, b"3")]),
            query_with("other", &[("a", Opcode::Concat, b"1")]),
        ];
        for q1 in &cases {
            for q2 in &cases {
                assert_eq!(
                    q1.check_conflict(q2).is_ok(),
                    q2.check_conflict(q1).is_ok(),
                );
            }
        }
    }

    #[test]
    fn hash_ignores_signature() {
        let mut q = query_with("none", &[("k", Opcode::Set, b"42")]);
        let h1 = q.unsigned_hash();
        q.signature = vec![0xaa; 64];
        assert_eq!(h1, q.unsigned_hash());

        q.policy = "changed".into();
        assert_ne!(h1, q.unsigned_hash());
    }
}

//! Core data model for PnyxDB.
//!
//! Strong byte types, wall-clock timestamps, the transaction model
//! (queries, operations, endorsements), consensus messages, and the
//! cryptographic helpers they share.

pub mod crypto;
pub mod endorsement;
pub mod message;
pub mod operation;
pub mod query;
pub mod time;
pub mod types;
pub mod uuid_borsh;

pub use endorsement::Endorsement;
pub use message::{Choice, Message, Proof, RecoveryRequest, RecoveryResponse, StartCheckpoint};
pub use operation::{ConflictError, Opcode, Operation};
pub use query::Query;
pub use time::Timestamp;
pub use types::{Digest, Version, VersionMismatch, VERSION_BYTES};

pub use uuid::Uuid;

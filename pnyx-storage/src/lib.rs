//! Versioned key/value storage for PnyxDB.
//!
//! The consensus engine talks to storage through the [`Store`] trait:
//! a flat map from string keys to raw values, each value paired with its
//! 64-byte content version. Individual operations are thread-safe;
//! engine-side compound read-modify-write sequences additionally hold the
//! coarse [`Store::lock`] guard.

use std::collections::BTreeMap;
use std::sync::MutexGuard;

use pnyx_model::{Version, VERSION_BYTES};

pub mod disk;
pub mod memory;

pub use disk::DiskStore;
pub use memory::MemoryStore;

/// One write of a [`Store::set_batch`] call.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub version: Version,
}

/// Storage driver errors. `NotFound` is a distinct, matchable variant so
/// that callers can treat missing keys differently from I/O failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("corrupted record for key {0}")]
    Corrupted(String),

    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True when the error only signals a missing key.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// The storage contract the consensus engine relies on.
pub trait Store: Send + Sync {
    /// Current value and version for a key. Missing keys yield
    /// [`StoreError::NotFound`]; callers map that to [`Version::NONE`].
    fn get(&self, key: &str) -> Result<(Vec<u8>, Version), StoreError>;

    /// Atomic single-key write.
    fn set(&self, key: &str, value: &[u8], version: &Version) -> Result<(), StoreError>;

    /// Atomic multi-key write: either all writes are observable or none.
    fn set_batch(&self, entries: &[BatchEntry]) -> Result<(), StoreError>;

    /// Map of every stored key to its version.
    fn list(&self) -> Result<BTreeMap<String, Version>, StoreError>;

    /// Coarse mutual exclusion for compound read-modify-write sequences.
    fn lock(&self) -> MutexGuard<'_, ()>;

    /// Flush and release the driver.
    fn close(&self) -> Result<(), StoreError>;
}

/// Serialize a record: 64 bytes of version followed by the raw value.
pub fn encode_record(version: &Version, value: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(VERSION_BYTES + value.len());
    record.extend_from_slice(version.as_bytes());
    record.extend_from_slice(value);
    record
}

/// Split a record back into its version and raw value.
pub fn decode_record(key: &str, record: &[u8]) -> Result<(Version, Vec<u8>), StoreError> {
    if record.len() < VERSION_BYTES {
        return Err(StoreError::Corrupted(key.to_string()));
    }

    let version = Version::try_from(&record[..VERSION_BYTES])
        .map_err(|_| StoreError::Corrupted(key.to_string()))?;
    Ok((version, record[VERSION_BYTES..].to_vec()))
}

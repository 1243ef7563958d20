//! Engine state snapshots.
//!
//! A dump is the 16-byte magic header followed by the query store's three
//! collections in a self-describing encoding. Applicability caches are
//! not persisted; a loaded store starts fully stale and recomputes them.

use std::collections::HashMap;
use std::io::{Read, Write};

use uuid::Uuid;

use pnyx_model::Endorsement;

use crate::engine::Engine;
use crate::query_store::{QueryInfo, QueryStore};

const DUMP_HEADER: &[u8; 16] = b" PNYXDB_DUMP_V1 ";

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("invalid dump header")]
    BadHeader,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Snapshot {
    queries: HashMap<Uuid, QueryInfo>,
    pending_dependencies: HashMap<Uuid, Vec<Uuid>>,
    pending_endorsements: Vec<Endorsement>,
}

impl QueryStore {
    /// Write the store's state, to be later restored with [`QueryStore::load`].
    pub fn dump<W: Write>(&self, mut writer: W) -> Result<(), PersistenceError> {
        writer.write_all(DUMP_HEADER)?;

        let snapshot = Snapshot {
            queries: self.queries.clone(),
            pending_dependencies: self.pending_dependencies.clone(),
            pending_endorsements: self.pending_endorsements.clone(),
        };
        serde_json::to_writer(&mut writer, &snapshot)?;
        Ok(())
    }

    /// Replace the store's contents from a dump. The quorum threshold is
    /// an engine parameter and is left untouched.
    pub fn load<R: Read>(&mut self, mut reader: R) -> Result<(), PersistenceError> {
        let mut header = [0u8; DUMP_HEADER.len()];
        reader.read_exact(&mut header)?;
        if &header != DUMP_HEADER {
            return Err(PersistenceError::BadHeader);
        }

        let snapshot: Snapshot = serde_json::from_reader(reader)?;
        self.queries = snapshot.queries;
        self.pending_dependencies = snapshot.pending_dependencies;
        self.pending_endorsements = snapshot.pending_endorsements;
        Ok(())
    }
}

impl Engine {
    /// Snapshot the engine's consensus state.
    pub fn dump<W: Write>(&self, writer: W) -> Result<(), PersistenceError> {
        self.qs
            .read()
            .expect("query store lock poisoned")
            .dump(writer)
    }

    /// Restore the engine's consensus state from a snapshot.
    pub fn load<R: Read>(&self, reader: R) -> Result<(), PersistenceError> {
        self.qs
            .write()
            .expect("query store lock poisoned")
            .load(reader)
    }
}

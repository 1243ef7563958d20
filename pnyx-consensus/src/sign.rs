//! Signing and verification of consensus messages.
//!
//! Messages are signed over the SHA-512 of their unsigned serialized
//! form. Query hashes are memoized in a bounded cache keyed by uuid so
//! re-encountered queries are not re-hashed.

use pnyx_model::{Endorsement, Query};

use crate::engine::Engine;
use crate::EngineError;

impl Engine {
    pub(crate) fn verify_query(&self, query: &Query) -> Result<(), EngineError> {
        let hash = {
            let mut hashes = self.hashes.lock().expect("engine lock poisoned");
            match hashes.get(&query.uuid) {
                Some(hash) => *hash,
                None => query.unsigned_hash(),
            }
        };

        self.keyring
            .verify(&query.emitter, hash.as_bytes(), &query.signature)?;

        self.hashes
            .lock()
            .expect("engine lock poisoned")
            .put(query.uuid, hash);
        Ok(())
    }

    pub(crate) fn sign_query(&self, query: &mut Query) -> Result<(), EngineError> {
        let hash = query.unsigned_hash();
        query.signature = self.keyring.sign(hash.as_bytes())?;
        Ok(())
    }

    pub(crate) fn verify_endorsement(&self, endorsement: &Endorsement) -> Result<(), EngineError> {
        let hash = endorsement.unsigned_hash();
        self.keyring
            .verify(&endorsement.emitter, hash.as_bytes(), &endorsement.signature)?;
        Ok(())
    }

    pub(crate) fn sign_endorsement(&self, endorsement: &mut Endorsement) -> Result<(), EngineError> {
        let hash = endorsement.unsigned_hash();
        endorsement.signature = self.keyring.sign(hash.as_bytes())?;
        Ok(())
    }
}

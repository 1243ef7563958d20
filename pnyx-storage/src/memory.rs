//! In-memory store. Used by tests and ephemeral nodes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, RwLock};

use pnyx_model::Version;

use crate::{BatchEntry, Store, StoreError};

/// Volatile [`Store`] backed by a hash map.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, (Version, Vec<u8>)>>,
    guard: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<(Vec<u8>, Version), StoreError> {
        let entries = self.entries.read().expect("store lock poisoned");
        match entries.get(key) {
            Some((version, value)) => Ok((value.clone(), *version)),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    fn set(&self, key: &str, value: &[u8], version: &Version) -> Result<(), StoreError> {
        let mut entries = self.entries.write().expect("store lock poisoned");
        entries.insert(key.to_string(), (*version, value.to_vec()));
        Ok(())
    }

    fn set_batch(&self, batch: &[BatchEntry]) -> Result<(), StoreError> {
        let mut entries = self.entries.write().expect("store lock poisoned");
        for entry in batch {
            entries.insert(entry.key.clone(), (entry.version, entry.value.clone()));
        }
        Ok(())
    }

    fn list(&self) -> Result<BTreeMap<String, Version>, StoreError> {
        let entries = self.entries.read().expect("store lock poisoned");
        Ok(entries
            .iter()
            .map(|(key, (version, _))| (key.clone(), *version))
            .collect())
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.guard.lock().expect("store lock poisoned")
    }

    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get("absent").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn set_get_round_trip() {
        let store = MemoryStore::new();
        let version = Version::of(b"42");
        store.set("myVar", b"42", &version).unwrap();

        let (value, v) = store.get("myVar").unwrap();
        assert_eq!(value, b"42");
        assert_eq!(v, version);
    }

    #[test]
    fn batch_visible_atomically() {
        let store = MemoryStore::new();
        let batch = vec![
            BatchEntry {
                key: "a".into(),
                value: b"1".to_vec(),
                version: Version::of(b"1"),
            },
            BatchEntry {
                key: "b".into(),
                value: b"2".to_vec(),
                version: Version::of(b"2"),
            },
        ];
        store.set_batch(&batch).unwrap();

        let listing = store.list().unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing["a"], Version::of(b"1"));
        assert_eq!(listing["b"], Version::of(b"2"));
    }
}

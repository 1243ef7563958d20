//! Single-file embedded store backed by redb.
//!
//! One table maps keys to records; a record is the 64-byte version
//! followed by the raw value bytes.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use redb::{Database, ReadableTable, TableDefinition};

use pnyx_model::Version;

use crate::{decode_record, encode_record, BatchEntry, Store, StoreError};

/// Data table: key → 64-byte version ‖ raw value
const TABLE_DATA: TableDefinition<&str, &[u8]> = TableDefinition::new("data");

/// Persistent [`Store`] in a single redb file.
pub struct DiskStore {
    db: Database,
    guard: Mutex<()>,
}

impl DiskStore {
    /// Open or create the database file at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::builder().create(path.as_ref())?;

        // Ensure the data table exists so reads never race its creation.
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(TABLE_DATA)?;
        }
        write_txn.commit()?;

        Ok(DiskStore {
            db,
            guard: Mutex::new(()),
        })
    }
}

impl Store for DiskStore {
    fn get(&self, key: &str) -> Result<(Vec<u8>, Version), StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TABLE_DATA)?;

        let Some(record) = table.get(key)? else {
            return Err(StoreError::NotFound(key.to_string()));
        };

        let (version, value) = decode_record(key, record.value())?;
        Ok((value, version))
    }

    fn set(&self, key: &str, value: &[u8], version: &Version) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TABLE_DATA)?;
            table.insert(key, encode_record(version, value).as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn set_batch(&self, batch: &[BatchEntry]) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TABLE_DATA)?;
            for entry in batch {
                table.insert(
                    entry.key.as_str(),
                    encode_record(&entry.version, &entry.value).as_slice(),
                )?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn list(&self) -> Result<BTreeMap<String, Version>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TABLE_DATA)?;

        let mut out = BTreeMap::new();
        for entry in table.iter()? {
            let (key, record) = entry?;
            let key = key.value().to_string();
            let (version, _) = decode_record(&key, record.value())?;
            out.insert(key, version);
        }
        Ok(out)
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.guard.lock().expect("store lock poisoned")
    }

    fn close(&self) -> Result<(), StoreError> {
        // redb flushes on commit and releases the file on drop.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, DiskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path().join("db")).unwrap();
        (dir, store)
    }

    #[test]
    fn missing_key_is_not_found() {
        let (_dir, store) = open_temp();
        assert!(store.get("absent").unwrap_err().is_not_found());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");

        let version = Version::of(b"payload");
        {
            let store = DiskStore::open(&path).unwrap();
            store.set("k", b"payload", &version).unwrap();
        }

        let store = DiskStore::open(&path).unwrap();
        let (value, v) = store.get("k").unwrap();
        assert_eq!(value, b"payload");
        assert_eq!(v, version);
    }

    #[test]
    fn batch_and_list() {
        let (_dir, store) = open_temp();
        let batch: Vec<BatchEntry> = (0..4)
            .map(|i| {
                let value = format!("value-{i}").into_bytes();
                BatchEntry {
                    key: format!("key-{i}"),
                    version: Version::of(&value),
                    value,
                }
            })
            .collect();
        store.set_batch(&batch).unwrap();

        let listing = store.list().unwrap();
        assert_eq!(listing.len(), 4);
        for entry in &batch {
            assert_eq!(listing[&entry.key], entry.version);
        }
    }
}

//! # redb-backed Content Store
//!
//! Link payloads and back-references in a redb embedded database.
//! Every mutation is one ACID write transaction, so `save` has nothing
//! left to flush.

use std::fmt;
use std::path::{Path, PathBuf};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use super::ContentStore;
use crate::types::{Addr, Checksum, ScError};

/// Table for contents: checksum bytes -> payload bytes
const CONTENTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("contents");

/// Table for back-references: (checksum bytes, packed addr) -> ()
/// The checksum prefix allows a range scan per checksum.
const BACKREFS: TableDefinition<(&[u8], u32), ()> = TableDefinition::new("backrefs");

fn io(e: impl fmt::Display) -> ScError {
    ScError::Io(e.to_string())
}

/// A disk-backed content store using redb.
pub struct RedbContentStore {
    db: Database,
    path: PathBuf,
}

impl fmt::Debug for RedbContentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedbContentStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RedbContentStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ScError> {
        let path = path.as_ref().to_path_buf();
        let db = Database::create(&path).map_err(io)?;
        {
            let write_txn = db.begin_write().map_err(io)?;
            let _ = write_txn.open_table(CONTENTS).map_err(io)?;
            let _ = write_txn.open_table(BACKREFS).map_err(io)?;
            write_txn.commit().map_err(io)?;
        }
        tracing::debug!(path = %path.display(), "redb content store opened");
        Ok(Self { db, path })
    }
}

impl ContentStore for RedbContentStore {
    fn store(&self, checksum: &Checksum, content: &[u8]) -> Result<(), ScError> {
        let key = checksum.as_bytes().as_slice();
        let write_txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = write_txn.open_table(CONTENTS).map_err(io)?;
            let exists = table.get(key).map_err(io)?.is_some();
            if !exists {
                table.insert(key, content).map_err(io)?;
            }
        }
        write_txn.commit().map_err(io)
    }

    fn fetch(&self, checksum: &Checksum) -> Result<Vec<u8>, ScError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(CONTENTS).map_err(io)?;
        table
            .get(checksum.as_bytes().as_slice())
            .map_err(io)?
            .map(|value| value.value().to_vec())
            .ok_or(ScError::NotFound)
    }

    fn add_backref(&self, addr: Addr, checksum: &Checksum) -> Result<(), ScError> {
        let write_txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = write_txn.open_table(BACKREFS).map_err(io)?;
            table
                .insert((checksum.as_bytes().as_slice(), addr.to_u32()), ())
                .map_err(io)?;
        }
        write_txn.commit().map_err(io)
    }

    fn remove_backref(&self, addr: Addr, checksum: &Checksum) -> Result<(), ScError> {
        let key = checksum.as_bytes().as_slice();
        let write_txn = self.db.begin_write().map_err(io)?;
        {
            let mut refs = write_txn.open_table(BACKREFS).map_err(io)?;
            let removed = refs.remove((key, addr.to_u32())).map_err(io)?.is_some();
            if !removed {
                return Err(ScError::NotFound);
            }
            let orphaned = refs
                .range((key, 0u32)..=(key, u32::MAX))
                .map_err(io)?
                .next()
                .is_none();
            if orphaned {
                let mut contents = write_txn.open_table(CONTENTS).map_err(io)?;
                contents.remove(key).map_err(io)?;
            }
        }
        write_txn.commit().map_err(io)
    }

    fn find_by_checksum(&self, checksum: &Checksum) -> Result<Vec<Addr>, ScError> {
        let key = checksum.as_bytes().as_slice();
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(BACKREFS).map_err(io)?;
        let mut found = Vec::new();
        for entry in table.range((key, 0u32)..=(key, u32::MAX)).map_err(io)? {
            let (k, _) = entry.map_err(io)?;
            let (_checksum, raw) = k.value();
            found.push(Addr::from_u32(raw));
        }
        Ok(found)
    }

    fn clear(&self) -> Result<(), ScError> {
        let write_txn = self.db.begin_write().map_err(io)?;
        write_txn.delete_table(CONTENTS).map_err(io)?;
        write_txn.delete_table(BACKREFS).map_err(io)?;
        let _ = write_txn.open_table(CONTENTS).map_err(io)?;
        let _ = write_txn.open_table(BACKREFS).map_err(io)?;
        write_txn.commit().map_err(io)
    }

    fn save(&self) -> Result<(), ScError> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn store_fetch_and_find() {
        let temp = tempdir().expect("temp dir");
        let store = RedbContentStore::open(temp.path().join("content.redb")).expect("open db");
        let payload = vec![42u8; 100];
        let checksum = Checksum::of(&payload);

        store.store(&checksum, &payload).expect("store");
        store.add_backref(Addr::new(1, 7), &checksum).expect("ref");
        store.add_backref(Addr::new(0, 3), &checksum).expect("ref");

        assert_eq!(store.fetch(&checksum).expect("fetch"), payload);
        assert_eq!(
            store.find_by_checksum(&checksum).expect("find"),
            vec![Addr::new(0, 3), Addr::new(1, 7)]
        );
        assert!(
            store
                .find_by_checksum(&Checksum::of(b"other"))
                .expect("find")
                .is_empty()
        );
    }

    #[test]
    fn last_backref_drops_content() {
        let temp = tempdir().expect("temp dir");
        let store = RedbContentStore::open(temp.path().join("content.redb")).expect("open db");
        let payload = vec![1u8; 33];
        let checksum = Checksum::of(&payload);
        store.store(&checksum, &payload).expect("store");
        store.add_backref(Addr::new(0, 1), &checksum).expect("ref");

        store.remove_backref(Addr::new(0, 1), &checksum).expect("unref");
        assert_eq!(store.fetch(&checksum), Err(ScError::NotFound));
        assert_eq!(
            store.remove_backref(Addr::new(0, 1), &checksum),
            Err(ScError::NotFound)
        );
    }

    #[test]
    fn contents_persist_after_reopen() {
        let temp = tempdir().expect("temp dir");
        let path = temp.path().join("content.redb");
        let payload = b"persisted content that is longer than thirty-two bytes".to_vec();
        let checksum = Checksum::of(&payload);
        {
            let store = RedbContentStore::open(&path).expect("open db");
            store.store(&checksum, &payload).expect("store");
            store.add_backref(Addr::new(4, 4), &checksum).expect("ref");
        }
        let store = RedbContentStore::open(&path).expect("reopen db");
        assert_eq!(store.fetch(&checksum).expect("fetch"), payload);
        assert_eq!(
            store.find_by_checksum(&checksum).expect("find"),
            vec![Addr::new(4, 4)]
        );
    }

    #[test]
    fn clear_empties_everything() {
        let temp = tempdir().expect("temp dir");
        let store = RedbContentStore::open(temp.path().join("content.redb")).expect("open db");
        let checksum = Checksum::of(&[5u8; 40]);
        store.store(&checksum, &[5u8; 40]).expect("store");
        store.add_backref(Addr::new(0, 2), &checksum).expect("ref");
        store.clear().expect("clear");
        assert_eq!(store.fetch(&checksum), Err(ScError::NotFound));
        assert!(store.find_by_checksum(&checksum).expect("find").is_empty());
    }
}

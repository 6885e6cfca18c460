//! # Content Stores
//!
//! Link payloads of 32 bytes or more live outside the element arena, in a
//! content-addressed store keyed by their BLAKE3 checksum. The store also
//! keeps back-references from each checksum to the links carrying it, which
//! is what `find_links_with_content` searches.
//!
//! Backends:
//! - [`MemoryContentStore`]: hash maps behind a `parking_lot::RwLock`,
//!   optionally snapshotted to a file on `save`.
//! - [`RedbContentStore`]: a redb database, durable on every write.

mod redb_store;

pub use redb_store::RedbContentStore;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::config::{ContentBackend, StorageConfig};
use crate::formats::persistence::{self, ContentEntry};
use crate::primitives::{CONTENT_DB_FILE_NAME, CONTENT_SNAPSHOT_FILE_NAME};
use crate::types::{Addr, Checksum, ScError};

/// Content-addressed payload store with link back-references.
pub trait ContentStore: Send + Sync + fmt::Debug {
    /// Store `content` under `checksum`. Storing the same checksum twice is a no-op.
    fn store(&self, checksum: &Checksum, content: &[u8]) -> Result<(), ScError>;

    /// Bytes stored under `checksum`, or `NotFound`.
    fn fetch(&self, checksum: &Checksum) -> Result<Vec<u8>, ScError>;

    /// Record that the link at `addr` carries `checksum`.
    fn add_backref(&self, addr: Addr, checksum: &Checksum) -> Result<(), ScError>;

    /// Forget that `addr` carries `checksum`. Content with no remaining
    /// back-reference is dropped.
    fn remove_backref(&self, addr: Addr, checksum: &Checksum) -> Result<(), ScError>;

    /// Every link address recorded for `checksum`, in address order.
    fn find_by_checksum(&self, checksum: &Checksum) -> Result<Vec<Addr>, ScError>;

    /// Drop all contents and back-references.
    fn clear(&self) -> Result<(), ScError>;

    /// Make the current state durable.
    fn save(&self) -> Result<(), ScError>;
}

/// Build the content store selected by `config`.
pub fn open_content_store(config: &StorageConfig) -> Result<Box<dyn ContentStore>, ScError> {
    let store: Box<dyn ContentStore> = match (config.content_backend, &config.repo_path) {
        (ContentBackend::Memory, None) => Box::new(MemoryContentStore::new()),
        (ContentBackend::Memory, Some(repo)) => Box::new(MemoryContentStore::open(
            repo.join(CONTENT_SNAPSHOT_FILE_NAME),
        )?),
        (ContentBackend::Redb, Some(repo)) => {
            Box::new(RedbContentStore::open(repo.join(CONTENT_DB_FILE_NAME))?)
        }
        (ContentBackend::Redb, None) => return Err(ScError::InvalidParams),
    };
    if config.clear {
        store.clear()?;
    }
    Ok(store)
}

// =============================================================================
// MEMORY BACKEND
// =============================================================================

#[derive(Debug, Default)]
struct Entry {
    content: Option<Vec<u8>>,
    backrefs: BTreeSet<Addr>,
}

/// In-memory content store.
#[derive(Default)]
pub struct MemoryContentStore {
    entries: RwLock<HashMap<Checksum, Entry>>,
    snapshot: Option<PathBuf>,
}

impl fmt::Debug for MemoryContentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryContentStore")
            .field("entries", &self.entries.read().len())
            .field("snapshot", &self.snapshot)
            .finish()
    }
}

impl MemoryContentStore {
    /// A store that lives only as long as the process.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store snapshotted to `path` on `save`, loaded from it if present.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ScError> {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(bytes) => persistence::content_from_bytes(&bytes)?
                .into_iter()
                .map(|entry| {
                    (
                        Checksum(entry.checksum),
                        Entry {
                            content: entry.content,
                            backrefs: entry.backrefs.into_iter().map(Addr::from_u32).collect(),
                        },
                    )
                })
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(ScError::Io(e.to_string())),
        };
        tracing::debug!(path = %path.display(), entries = entries.len(), "memory content store opened");
        Ok(Self {
            entries: RwLock::new(entries),
            snapshot: Some(path),
        })
    }

    fn write_snapshot(&self, path: &Path) -> Result<(), ScError> {
        let mut entries: Vec<ContentEntry> = self
            .entries
            .read()
            .iter()
            .map(|(checksum, entry)| ContentEntry {
                checksum: checksum.0,
                content: entry.content.clone(),
                backrefs: entry.backrefs.iter().map(|a| a.to_u32()).collect(),
            })
            .collect();
        entries.sort_by(|a, b| a.checksum.cmp(&b.checksum));
        persistence::write_atomic(path, &persistence::content_to_bytes(&entries)?)
    }
}

impl ContentStore for MemoryContentStore {
    fn store(&self, checksum: &Checksum, content: &[u8]) -> Result<(), ScError> {
        let mut entries = self.entries.write();
        let entry = entries.entry(*checksum).or_default();
        if entry.content.is_none() {
            entry.content = Some(content.to_vec());
        }
        Ok(())
    }

    fn fetch(&self, checksum: &Checksum) -> Result<Vec<u8>, ScError> {
        self.entries
            .read()
            .get(checksum)
            .and_then(|entry| entry.content.clone())
            .ok_or(ScError::NotFound)
    }

    fn add_backref(&self, addr: Addr, checksum: &Checksum) -> Result<(), ScError> {
        self.entries
            .write()
            .entry(*checksum)
            .or_default()
            .backrefs
            .insert(addr);
        Ok(())
    }

    fn remove_backref(&self, addr: Addr, checksum: &Checksum) -> Result<(), ScError> {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(checksum) else {
            return Err(ScError::NotFound);
        };
        if !entry.backrefs.remove(&addr) {
            return Err(ScError::NotFound);
        }
        if entry.backrefs.is_empty() {
            entries.remove(checksum);
        }
        Ok(())
    }

    fn find_by_checksum(&self, checksum: &Checksum) -> Result<Vec<Addr>, ScError> {
        Ok(self
            .entries
            .read()
            .get(checksum)
            .map(|entry| entry.backrefs.iter().copied().collect())
            .unwrap_or_default())
    }

    fn clear(&self) -> Result<(), ScError> {
        self.entries.write().clear();
        Ok(())
    }

    fn save(&self) -> Result<(), ScError> {
        match &self.snapshot {
            Some(path) => self.write_snapshot(path),
            None => Ok(()),
        }
    }
}

//! # Storage Configuration
//!
//! `StorageConfig` is deserializable so the application can read it straight
//! out of a TOML file; every field has a default.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::primitives::{DEFAULT_MAX_LOADED_SEGMENTS, MAX_SEGMENTS};
use crate::types::ScError;

/// Backend holding link payloads of 32 bytes or more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentBackend {
    #[default]
    Memory,
    Redb,
}

/// Startup parameters of a [`Storage`](crate::Storage).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Upper bound on segments; element creation fails once it is reached.
    pub max_loaded_segments: usize,
    /// Repository directory. `None` keeps everything in memory.
    pub repo_path: Option<PathBuf>,
    /// Start empty even if the repository holds data.
    pub clear: bool,
    pub content_backend: ContentBackend,
    /// Event worker threads; defaults to twice the available cores.
    pub event_workers: Option<usize>,
    /// Save segments and content when the storage shuts down.
    pub save_on_shutdown: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_loaded_segments: DEFAULT_MAX_LOADED_SEGMENTS,
            repo_path: None,
            clear: false,
            content_backend: ContentBackend::Memory,
            event_workers: None,
            save_on_shutdown: false,
        }
    }
}

impl StorageConfig {
    /// In-memory configuration with the given segment limit.
    #[must_use]
    pub fn in_memory(max_loaded_segments: usize) -> Self {
        Self {
            max_loaded_segments,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ScError> {
        if self.max_loaded_segments == 0 || self.max_loaded_segments > MAX_SEGMENTS {
            return Err(ScError::InvalidParams);
        }
        if self.event_workers == Some(0) {
            return Err(ScError::InvalidParams);
        }
        if self.content_backend == ContentBackend::Redb && self.repo_path.is_none() {
            return Err(ScError::InvalidParams);
        }
        if self.save_on_shutdown && self.repo_path.is_none() {
            return Err(ScError::InvalidParams);
        }
        Ok(())
    }

    /// Worker count for the event pool.
    #[must_use]
    pub fn event_worker_count(&self) -> usize {
        self.event_workers.unwrap_or_else(|| {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            cores * 2
        })
    }
}

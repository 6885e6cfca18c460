//! # Application Configuration
//!
//! An optional TOML file supplies the storage settings; command-line flags
//! override individual fields afterwards.
//!
//! ```toml
//! [storage]
//! repo_path = "./kb"
//! max_loaded_segments = 64
//! content_backend = "redb"
//! save_on_shutdown = true
//! ```

use std::path::{Path, PathBuf};

use scstore_core::StorageConfig;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Largest configuration file accepted (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub storage: StorageConfig,
}

impl AppConfig {
    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, AppError> {
        toml::from_str(text).map_err(|e| AppError::Config(e.to_string()))
    }

    /// Read and parse a TOML file.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let metadata = std::fs::metadata(path)
            .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(AppError::Config(format!(
                "{}: file size {} bytes exceeds maximum allowed {} bytes",
                path.display(),
                metadata.len(),
                MAX_CONFIG_FILE_SIZE
            )));
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    /// Apply command-line overrides and check the result.
    pub fn with_overrides(
        mut self,
        repo: Option<PathBuf>,
        max_segments: Option<usize>,
    ) -> Result<Self, AppError> {
        if let Some(repo) = repo {
            self.storage.repo_path = Some(repo);
        }
        if let Some(max) = max_segments {
            self.storage.max_loaded_segments = max;
        }
        self.storage
            .validate()
            .map_err(|e| AppError::Config(format!("invalid storage settings: {}", e)))?;
        Ok(self)
    }
}

//! # Application Errors

use scstore_core::ScError;
use thiserror::Error;

/// Failures of a CLI command.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Store(#[from] ScError),

    #[error("config error: {0}")]
    Config(String),

    /// Unreadable, oversized or missing input file.
    #[error("file error: {0}")]
    File(String),

    /// The graph document is malformed or refers to unknown elements.
    #[error("import error: {0}")]
    Import(String),
}

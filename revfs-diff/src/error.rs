//! Error types surfaced by the diff engine.

use std::path::PathBuf;

/// Result type for diff operations
pub type Result<T> = std::result::Result<T, DiffError>;

/// Errors that can occur while diffing files
#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    /// A diff input changed on disk while the diff was running.
    #[error("the file '{0}' changed unexpectedly during diff")]
    DatasourceModified(PathBuf),

    #[error("invalid diff option: {0}")]
    InvalidOption(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

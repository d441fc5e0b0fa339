//! Error types surfaced by the revision store.

use std::path::PathBuf;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, FsError>;

/// Errors that can occur while reading or mutating a repository
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// A malformed on-disk record.
    #[error("corrupt repository data: {0}")]
    Corrupt(String),

    #[error("no such revision {0}")]
    NoSuchRevision(u64),

    #[error("no such transaction '{0}'")]
    NoSuchTransaction(String),

    /// Reference to a node-revision that does not exist.
    #[error("dangling node-revision id '{0}'")]
    DanglingId(String),

    #[error("checksum mismatch while reading representation: expected {expected}, actual {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// The commit base is no longer the youngest revision.
    #[error("transaction out of date: based on r{base}, youngest is r{youngest}")]
    TxnOutOfDate { base: u64, youngest: u64 },

    #[error("unable to create transaction directory in '{0}'")]
    UniqueNamesExhausted(PathBuf),

    #[error("can't set text contents of a directory")]
    NotFile,

    /// Attempted to write through an id that is not part of a transaction.
    #[error("attempted to write to non-transaction")]
    NotMutable,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// Shorthand for a corruption error with a formatted message.
    pub fn corrupt(msg: impl Into<String>) -> Self {
        FsError::Corrupt(msg.into())
    }
}

//! revfs core library
//!
//! A versioned, filesystem-backed object store:
//! - Append-only revision files with content-addressed delta chains
//! - Node-revision headers and base-36 id arithmetic
//! - Hash-dump serialisation for props and directory contents
//! - Transactions with a staging area and atomic single-writer commits
//!
//! Readers are unbounded-parallel against published revisions; writers are
//! serialised by an advisory file lock for the duration of a commit. A
//! `FileSystem` handle carries a one-slot directory cache and must not be
//! shared across threads without external synchronisation.

pub mod changes;
pub mod commit;
pub mod dir;
pub mod error;
pub mod fs;
pub mod hashfile;
pub mod id;
pub mod key;
pub mod noderev;
pub mod paths;
pub mod rep;
pub mod svndiff;
pub mod txn;

pub use changes::{Change, ChangeKind, ChangedPaths, PathChange};
pub use dir::{DirEntries, DirEntry};
pub use error::{FsError, Result};
pub use fs::FileSystem;
pub use hashfile::HashMapOrdered;
pub use id::{Location, NodeRevId};
pub use noderev::{NodeKind, NodeRevision, RepLocation, Representation};
pub use paths::Layout;
pub use rep::{RepReader, RepWriter};
pub use txn::Transaction;

//! revfs diff engine
//!
//! A line-oriented file differ:
//! - Chunked paging over large files with identical prefix/suffix elision
//! - Whitespace and EOL-style normalisation options
//! - Token LCS with two-way and three-way (merge) chunk output
//! - Unified diff and conflict-marker merge rendering

pub mod datasource;
pub mod diff;
pub mod error;
pub mod lcs;
pub mod merge;
pub mod normalize;
pub mod options;
pub mod unified;

pub use diff::{diff3_files, diff_files, ChunkKind, Diff, DiffChunk, LineRange};
pub use error::{DiffError, Result};
pub use merge::{write_merge, ConflictStyle};
pub use options::{DiffOptions, IgnoreSpace};
pub use unified::write_unified;

//! Node-revision identifiers.
//!
//! An id is a triplet of node key, copy key, and a location: either the
//! permanent `r<rev>/<offset>` form pointing into a published revision
//! file, or the in-flight `t<txn-id>` form naming the owning transaction.
//! Temporary node/copy keys carry a `_` prefix and are renumbered at
//! commit.

use crate::error::{FsError, Result};
use std::fmt;

/// Where a node-revision lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    /// Immutable: byte offset into `revs/<rev>`.
    Revision { rev: u64, offset: u64 },
    /// Mutable: staged inside the named transaction.
    Txn(String),
}

/// Identifier of one node-revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRevId {
    node_id: String,
    copy_id: String,
    location: Location,
}

impl NodeRevId {
    pub fn new_rev(
        node_id: impl Into<String>,
        copy_id: impl Into<String>,
        rev: u64,
        offset: u64,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            copy_id: copy_id.into(),
            location: Location::Revision { rev, offset },
        }
    }

    pub fn new_txn(
        node_id: impl Into<String>,
        copy_id: impl Into<String>,
        txn_id: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            copy_id: copy_id.into(),
            location: Location::Txn(txn_id.into()),
        }
    }

    /// Parse the textual form `node.copy.r<rev>/<offset>` or
    /// `node.copy.t<txn-id>`.
    pub fn parse(s: &str) -> Result<Self> {
        let corrupt = || FsError::corrupt(format!("malformed node-rev id '{}'", s));

        let mut parts = s.splitn(3, '.');
        let node_id = parts.next().filter(|p| !p.is_empty()).ok_or_else(corrupt)?;
        let copy_id = parts.next().filter(|p| !p.is_empty()).ok_or_else(corrupt)?;
        let loc = parts.next().filter(|p| !p.is_empty()).ok_or_else(corrupt)?;

        let location = match loc.as_bytes()[0] {
            b'r' => {
                let rest = &loc[1..];
                let (rev, offset) = rest.split_once('/').ok_or_else(corrupt)?;
                Location::Revision {
                    rev: rev.parse().map_err(|_| corrupt())?,
                    offset: offset.parse().map_err(|_| corrupt())?,
                }
            }
            b't' => Location::Txn(loc[1..].to_string()),
            _ => return Err(corrupt()),
        };

        Ok(Self {
            node_id: node_id.to_string(),
            copy_id: copy_id.to_string(),
            location,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn copy_id(&self) -> &str {
        &self.copy_id
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    /// The owning transaction id, if this id is mutable.
    pub fn txn_id(&self) -> Option<&str> {
        match &self.location {
            Location::Txn(t) => Some(t),
            Location::Revision { .. } => None,
        }
    }

    /// The containing revision, if this id is immutable.
    pub fn rev(&self) -> Option<u64> {
        match self.location {
            Location::Revision { rev, .. } => Some(rev),
            Location::Txn(_) => None,
        }
    }

    /// Byte offset of the node-rev header within its revision file.
    pub fn offset(&self) -> Option<u64> {
        match self.location {
            Location::Revision { offset, .. } => Some(offset),
            Location::Txn(_) => None,
        }
    }

    pub fn is_txn(&self) -> bool {
        matches!(self.location, Location::Txn(_))
    }
}

impl fmt::Display for NodeRevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Location::Revision { rev, offset } => {
                write!(f, "{}.{}.r{}/{}", self.node_id, self.copy_id, rev, offset)
            }
            Location::Txn(txn_id) => write!(f, "{}.{}.t{}", self.node_id, self.copy_id, txn_id),
        }
    }
}

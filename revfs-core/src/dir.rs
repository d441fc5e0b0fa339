//! Directory contents.
//!
//! A directory's representation is a hash of `name -> "<kind> <id>"`
//! entries. Once a directory is mutated inside a transaction its entries
//! are materialised into a `node.<id>.children` staging file; later edits
//! are appended as incremental hash entries and replayed on read.

use crate::error::{FsError, Result};
use crate::hashfile::{self, HashMapOrdered};
use crate::id::NodeRevId;
use crate::noderev::{NodeKind, NodeRevision};
use crate::paths::Layout;
use crate::rep;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
    pub id: NodeRevId,
}

/// Entries of one directory, ordered by name.
pub type DirEntries = BTreeMap<String, DirEntry>;

/// Render an entry value in the directory hash format.
pub fn unparse_dir_entry(kind: NodeKind, id: &NodeRevId) -> String {
    format!("{} {}", kind.as_str(), id)
}

fn parse_dir_entry(name: &str, value: &str) -> Result<DirEntry> {
    let (kind, id) = value
        .split_once(' ')
        .ok_or_else(|| FsError::corrupt("directory entry corrupt"))?;
    Ok(DirEntry {
        name: name.to_string(),
        kind: NodeKind::parse(kind).map_err(|_| FsError::corrupt("directory entry corrupt"))?,
        id: NodeRevId::parse(id)?,
    })
}

/// Convert a raw hash into typed directory entries.
pub fn parse_dir_entries(hash: &HashMapOrdered) -> Result<DirEntries> {
    let mut entries = DirEntries::new();
    for (name, value) in hash {
        entries.insert(name.clone(), parse_dir_entry(name, value)?);
    }
    Ok(entries)
}

/// Convert typed entries back into the serialisable hash form.
pub fn unparse_dir_entries(entries: &DirEntries) -> HashMapOrdered {
    entries
        .iter()
        .map(|(name, e)| (name.clone(), unparse_dir_entry(e.kind, &e.id)))
        .collect()
}

/// Read the entries of the directory NODEREV.
///
/// A mutable rep reads the staged children file (base hash plus
/// incremental edits); an immutable rep streams its representation.
pub fn get_dir_contents(layout: &Layout, noderev: &NodeRevision) -> Result<DirEntries> {
    let Some(data_rep) = &noderev.data_rep else {
        return Ok(DirEntries::new());
    };

    let hash = if data_rep.is_mutable() {
        let file = File::open(layout.txn_node_children(&noderev.id))?;
        let mut reader = BufReader::new(file);
        let mut hash = hashfile::read_hash(&mut reader)?;
        hashfile::read_incremental(&mut reader, &mut hash)?;
        hash
    } else {
        rep::read_hash_rep(layout, data_rep)?
    };

    parse_dir_entries(&hash)
}

/// Single-slot cache of the most recently read directory. One per
/// filesystem handle; the handle must not be shared across threads
/// without external synchronisation.
#[derive(Debug, Default)]
pub struct DirCache {
    id: Option<NodeRevId>,
    entries: DirEntries,
}

impl DirCache {
    pub fn get(&self, id: &NodeRevId) -> Option<&DirEntries> {
        if self.id.as_ref() == Some(id) {
            Some(&self.entries)
        } else {
            None
        }
    }

    /// Replace the cached directory, evicting whatever was there.
    pub fn store(&mut self, id: NodeRevId, entries: DirEntries) {
        self.id = Some(id);
        self.entries = entries;
    }

    /// Apply an entry edit to the cached copy, keeping it coherent with an
    /// incremental write to the same directory.
    pub fn apply_edit(&mut self, id: &NodeRevId, name: &str, entry: Option<DirEntry>) {
        if self.id.as_ref() != Some(id) {
            return;
        }
        match entry {
            Some(entry) => {
                self.entries.insert(name.to_string(), entry);
            }
            None => {
                self.entries.remove(name);
            }
        }
    }

    /// The staged id of a cached directory changes when its node-rev is
    /// renumbered; drop the slot entirely.
    pub fn clear(&mut self) {
        self.id = None;
        self.entries.clear();
    }
}

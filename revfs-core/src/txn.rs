//! Transactions: the writable staging area that becomes the next revision.
//!
//! A transaction directory holds a prototype rev file, an append-only
//! changes log, a proplist, a next-ids counter and one staging file per
//! mutated node-revision. Node and copy ids allocated here are temporary
//! (`_`-prefixed) and renumbered at commit.

use crate::changes::{self, ChangeKind, ChangedPaths};
use crate::dir::{self, DirEntry};
use crate::error::{FsError, Result};
use crate::fs::FileSystem;
use crate::hashfile::{self, HashMapOrdered};
use crate::id::NodeRevId;
use crate::key;
use crate::noderev::{NodeKind, NodeRevision, Representation};
use crate::rep::RepWriter;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};

/// Handle on an open transaction.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: String,
    pub base_rev: u64,
}

impl Transaction {
    /// Id of the transaction's mutable root directory.
    pub fn root_id(&self) -> NodeRevId {
        NodeRevId::new_txn("0", "0", &self.id)
    }
}

impl FileSystem {
    /// Begin a transaction based on REV. Allocates a fresh `<rev>-<n>.txn`
    /// directory, clones the base root into it and seeds the bookkeeping
    /// files.
    pub fn create_txn(&self, base_rev: u64) -> Result<Transaction> {
        let txn_id = self.create_txn_dir(base_rev)?;

        // Clone the base revision's root as the mutable root node.
        let root_id = self.rev_get_root(base_rev)?;
        let mut root = self.get_node_revision(&root_id)?;
        root.predecessor_id = Some(root.id.clone());
        root.predecessor_count += 1;
        root.copyfrom = None;
        // For the transaction root the copyroot never changes.
        let new_root_id = NodeRevId::new_txn(root.id.node_id(), root.id.copy_id(), &txn_id);
        root.id = new_root_id.clone();
        self.put_node_revision(&new_root_id, &root)?;

        fs::write(self.layout().txn_proto_rev(&txn_id), "")?;
        fs::write(self.layout().txn_changes(&txn_id), "")?;
        self.write_next_ids(&txn_id, "0", "0")?;

        let mut props = Vec::new();
        hashfile::write_hash(&mut props, &HashMapOrdered::new())?;
        fs::write(self.layout().txn_props(&txn_id), props)?;

        tracing::debug!(txn = %txn_id, base = base_rev, "created transaction");

        Ok(Transaction {
            id: txn_id,
            base_rev,
        })
    }

    /// Allocate a unique `<rev>-<n>.txn` directory for a transaction
    /// based on REV.
    fn create_txn_dir(&self, rev: u64) -> Result<String> {
        for n in 1..=99_999u32 {
            let txn_id = format!("{}-{}", rev, n);
            match fs::create_dir_all(self.layout().txns_dir())
                .and_then(|_| fs::create_dir(self.layout().txn_dir(&txn_id)))
            {
                Ok(()) => return Ok(txn_id),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(FsError::UniqueNamesExhausted(self.layout().root().to_path_buf()))
    }

    /// Re-open an existing transaction by id.
    pub fn open_txn(&self, name: &str) -> Result<Transaction> {
        if !self.layout().txn_dir(name).is_dir() {
            return Err(FsError::NoSuchTransaction(name.to_string()));
        }
        let root = self.get_node_revision(&NodeRevId::new_txn("0", "0", name))?;
        let base_rev = root
            .predecessor_id
            .as_ref()
            .and_then(NodeRevId::rev)
            .ok_or_else(|| FsError::corrupt("transaction root has no base revision"))?;
        Ok(Transaction {
            id: name.to_string(),
            base_rev,
        })
    }

    /// Remove the transaction directory and everything staged in it.
    pub fn purge_txn(&self, txn_id: &str) -> Result<()> {
        tracing::debug!(txn = %txn_id, "purging transaction");
        fs::remove_dir_all(self.layout().txn_dir(txn_id))?;
        Ok(())
    }

    /// Names of all in-flight transactions.
    pub fn list_transactions(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.layout().txns_dir())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = name.strip_suffix(crate::paths::EXT_TXN) {
                names.push(id.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    // Transaction properties

    pub fn txn_proplist(&self, txn_id: &str) -> Result<HashMapOrdered> {
        let file = File::open(self.layout().txn_props(txn_id))?;
        hashfile::read_hash(&mut BufReader::new(file))
    }

    pub fn txn_prop(&self, txn_id: &str, name: &str) -> Result<Option<String>> {
        Ok(self.txn_proplist(txn_id)?.remove(name))
    }

    /// Set (or with None, delete) one transaction property.
    pub fn change_txn_prop(&self, txn_id: &str, name: &str, value: Option<&str>) -> Result<()> {
        let mut props = self.txn_proplist(txn_id)?;
        match value {
            Some(value) => {
                props.insert(name.to_string(), value.to_string());
            }
            None => {
                props.remove(name);
            }
        }
        let mut file = File::create(self.layout().txn_props(txn_id))?;
        hashfile::write_hash(&mut file, &props)
    }

    // Temporary id allocation

    pub(crate) fn read_next_ids(&self, txn_id: &str) -> Result<(String, String)> {
        let line = fs::read_to_string(self.layout().txn_next_ids(txn_id))?;
        let corrupt = || FsError::corrupt("next-ids file corrupt");
        let mut fields = line.split_ascii_whitespace();
        let node_id = fields.next().ok_or_else(corrupt)?.to_string();
        let copy_id = fields.next().ok_or_else(corrupt)?.to_string();
        Ok((node_id, copy_id))
    }

    pub(crate) fn write_next_ids(&self, txn_id: &str, node_id: &str, copy_id: &str) -> Result<()> {
        let mut file = File::create(self.layout().txn_next_ids(txn_id))?;
        writeln!(file, "{} {}", node_id, copy_id)?;
        Ok(())
    }

    /// Reserve the next temporary node id (`_<key>`) for this transaction.
    fn get_new_txn_node_id(&self, txn_id: &str) -> Result<String> {
        let (cur_node, cur_copy) = self.read_next_ids(txn_id)?;
        self.write_next_ids(txn_id, &key::next_key(&cur_node)?, &cur_copy)?;
        Ok(format!("_{}", cur_node))
    }

    /// Reserve the next temporary copy id (`_<key>`) for this transaction.
    pub fn reserve_copy_id(&self, txn_id: &str) -> Result<String> {
        let (cur_node, cur_copy) = self.read_next_ids(txn_id)?;
        self.write_next_ids(txn_id, &cur_node, &key::next_key(&cur_copy)?)?;
        Ok(format!("_{}", cur_copy))
    }

    /// Create a brand-new node in the transaction, assigning it a fresh
    /// temporary node id.
    pub fn create_node(
        &self,
        mut noderev: NodeRevision,
        copy_id: &str,
        txn_id: &str,
    ) -> Result<NodeRevId> {
        let node_id = self.get_new_txn_node_id(txn_id)?;
        let id = NodeRevId::new_txn(node_id, copy_id, txn_id);
        noderev.id = id.clone();
        self.put_node_revision(&id, &noderev)?;
        Ok(id)
    }

    /// Stage NEW_NODEREV as the successor of OLD_ID, keeping the node id
    /// and (unless overridden) the copy id.
    pub fn create_successor(
        &self,
        old_id: &NodeRevId,
        mut new_noderev: NodeRevision,
        copy_id: Option<&str>,
        txn_id: &str,
    ) -> Result<NodeRevId> {
        let copy_id = copy_id.unwrap_or_else(|| old_id.copy_id());
        let id = NodeRevId::new_txn(old_id.node_id(), copy_id, txn_id);
        new_noderev.id = id.clone();
        self.put_node_revision(&id, &new_noderev)?;
        Ok(id)
    }

    /// Drop a mutable node-revision and its staging files.
    pub fn delete_node_revision(&self, id: &NodeRevId) -> Result<()> {
        let noderev = self.get_node_revision(id)?;

        if noderev.prop_rep.as_ref().is_some_and(Representation::is_mutable) {
            fs::remove_file(self.layout().txn_node_props(id))?;
        }
        if noderev.has_mutable_dir_contents() {
            fs::remove_file(self.layout().txn_node_children(id))?;
        }
        fs::remove_file(self.layout().txn_node_rev(id))?;
        Ok(())
    }

    /// Set, replace or (with None) delete the entry NAME in the mutable
    /// directory PARENT. The first mutation materialises the directory's
    /// entries into a staging file; later mutations append incrementally.
    pub fn set_entry(
        &self,
        txn_id: &str,
        parent: &mut NodeRevision,
        name: &str,
        entry: Option<(NodeRevId, NodeKind)>,
    ) -> Result<()> {
        if parent.kind != NodeKind::Dir {
            return Err(FsError::corrupt("set_entry on a non-directory node"));
        }

        let children_path = self.layout().txn_node_children(&parent.id);
        let mut file = if parent.has_mutable_dir_contents() {
            // Already mutable: just append the incremental edit.
            OpenOptions::new().append(true).open(&children_path)?
        } else {
            // Dump the current contents into a mutable staging file first.
            let entries = self.rep_contents_dir(parent)?;
            let hash = dir::unparse_dir_entries(&entries);
            let mut file = File::create(&children_path)?;
            hashfile::write_hash(&mut file, &hash)?;

            parent.data_rep = Some(Representation::new_mutable(txn_id));
            self.put_node_revision(&parent.id.clone(), parent)?;
            file
        };

        match &entry {
            Some((id, kind)) => {
                let value = dir::unparse_dir_entry(*kind, id);
                hashfile::write_entry(&mut file, name, &value)?;
            }
            None => hashfile::write_delete(&mut file, name)?,
        }

        // Keep the cached copy coherent with the incremental write.
        self.dir_cache.borrow_mut().apply_edit(
            &parent.id,
            name,
            entry.map(|(id, kind)| DirEntry {
                name: name.to_string(),
                kind,
                id,
            }),
        );
        Ok(())
    }

    /// Replace the property list of a mutable node-revision.
    pub fn set_proplist(&self, noderev: &mut NodeRevision, proplist: &HashMapOrdered) -> Result<()> {
        if !noderev.id.is_txn() {
            return Err(FsError::NotMutable);
        }
        let mut file = File::create(self.layout().txn_node_props(&noderev.id))?;
        hashfile::write_hash(&mut file, proplist)?;

        if !noderev.prop_rep.as_ref().is_some_and(Representation::is_mutable) {
            let txn_id = noderev.id.txn_id().expect("checked above").to_string();
            noderev.prop_rep = Some(Representation::new_mutable(txn_id));
            self.put_node_revision(&noderev.id.clone(), noderev)?;
        }
        Ok(())
    }

    /// Pick the delta base for NODEREV: the ancestor at file-rev index
    /// `count & (count - 1)`, which yields an O(log n) skip-chain. A node
    /// with no predecessors deltas against the empty stream.
    pub fn choose_delta_base(&self, noderev: &NodeRevision) -> Result<Option<Representation>> {
        if noderev.predecessor_count == 0 {
            return Ok(None);
        }

        let mut count = noderev.predecessor_count & (noderev.predecessor_count - 1);
        let mut base = noderev.clone();
        while count < noderev.predecessor_count {
            let pred_id = base
                .predecessor_id
                .clone()
                .ok_or_else(|| FsError::corrupt("predecessor chain shorter than its count"))?;
            base = self.get_node_revision(&pred_id)?;
            count += 1;
        }
        Ok(base.data_rep)
    }

    /// Open a deltified content writer for a mutable file node-revision.
    /// The finished rep must be installed with [`FileSystem::finish_contents`].
    pub fn begin_contents(&self, noderev: &NodeRevision) -> Result<RepWriter> {
        if noderev.kind != NodeKind::File {
            return Err(FsError::NotFile);
        }
        let txn_id = noderev.id.txn_id().ok_or(FsError::NotMutable)?;
        let base = self.choose_delta_base(noderev)?;
        RepWriter::create(self.layout(), txn_id, base.as_ref())
    }

    /// Install the representation produced by a content writer.
    pub fn finish_contents(&self, writer: RepWriter, noderev: &mut NodeRevision) -> Result<()> {
        let rep = writer.close()?;
        noderev.data_rep = Some(rep);
        self.put_node_revision(&noderev.id.clone(), noderev)
    }

    /// Convenience wrapper: write DATA as the complete file contents.
    pub fn set_file_contents(&self, noderev: &mut NodeRevision, data: &[u8]) -> Result<()> {
        let mut writer = self.begin_contents(noderev)?;
        writer.write(data)?;
        self.finish_contents(writer, noderev)
    }

    /// Record a path mutation in the transaction's change log.
    #[allow(clippy::too_many_arguments)]
    pub fn add_change(
        &self,
        txn_id: &str,
        path: &str,
        noderev_id: &NodeRevId,
        kind: ChangeKind,
        text_mod: bool,
        prop_mod: bool,
        copyfrom: Option<(u64, String)>,
    ) -> Result<()> {
        changes::add_change(
            self.layout(),
            txn_id,
            path,
            noderev_id,
            kind,
            text_mod,
            prop_mod,
            copyfrom,
        )
    }

    /// Fold the raw change log of an open transaction.
    pub fn txn_changes_fetch(&self, txn_id: &str) -> Result<ChangedPaths> {
        changes::txn_changes_fetch(self.layout(), txn_id)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FileSystem;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, FileSystem) {
        let tmp = TempDir::new().unwrap();
        let fs_handle = FileSystem::create(tmp.path()).unwrap();
        (tmp, fs_handle)
    }

    #[test]
    fn test_create_and_open_txn() {
        let (_tmp, fs_handle) = fixture();
        let txn = fs_handle.create_txn(0).unwrap();
        assert_eq!(txn.id, "0-1");
        assert_eq!(txn.base_rev, 0);

        let reopened = fs_handle.open_txn(&txn.id).unwrap();
        assert_eq!(reopened.base_rev, 0);

        let root = fs_handle.get_node_revision(&txn.root_id()).unwrap();
        assert_eq!(root.predecessor_count, 1);
        assert_eq!(root.predecessor_id.unwrap().to_string(), "0.0.r0/17");
    }

    #[test]
    fn test_txn_ids_are_unique() {
        let (_tmp, fs_handle) = fixture();
        let a = fs_handle.create_txn(0).unwrap();
        let b = fs_handle.create_txn(0).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(
            fs_handle.list_transactions().unwrap(),
            vec![a.id.clone(), b.id.clone()]
        );
    }

    #[test]
    fn test_open_missing_txn() {
        let (_tmp, fs_handle) = fixture();
        assert!(matches!(
            fs_handle.open_txn("9-9"),
            Err(FsError::NoSuchTransaction(_))
        ));
    }

    #[test]
    fn test_purge_txn() {
        let (_tmp, fs_handle) = fixture();
        let txn = fs_handle.create_txn(0).unwrap();
        fs_handle.purge_txn(&txn.id).unwrap();
        assert!(fs_handle.list_transactions().unwrap().is_empty());
        assert!(fs_handle.open_txn(&txn.id).is_err());
    }

    #[test]
    fn test_txn_props() {
        let (_tmp, fs_handle) = fixture();
        let txn = fs_handle.create_txn(0).unwrap();

        assert!(fs_handle.txn_proplist(&txn.id).unwrap().is_empty());
        fs_handle
            .change_txn_prop(&txn.id, "svn:log", Some("message"))
            .unwrap();
        assert_eq!(
            fs_handle.txn_prop(&txn.id, "svn:log").unwrap().as_deref(),
            Some("message")
        );
        fs_handle.change_txn_prop(&txn.id, "svn:log", None).unwrap();
        assert!(fs_handle.txn_prop(&txn.id, "svn:log").unwrap().is_none());
    }

    #[test]
    fn test_temp_id_allocation() {
        let (_tmp, fs_handle) = fixture();
        let txn = fs_handle.create_txn(0).unwrap();

        let child = NodeRevision {
            id: txn.root_id(), // placeholder, replaced by create_node
            kind: NodeKind::File,
            predecessor_id: None,
            predecessor_count: 0,
            data_rep: None,
            prop_rep: None,
            created_path: "/f".into(),
            copyfrom: None,
            copyroot_rev: None,
            copyroot_path: "/f".into(),
        };
        let id1 = fs_handle.create_node(child.clone(), "0", &txn.id).unwrap();
        let id2 = fs_handle.create_node(child, "0", &txn.id).unwrap();
        assert_eq!(id1.node_id(), "_0");
        assert_eq!(id2.node_id(), "_1");

        let copy1 = fs_handle.reserve_copy_id(&txn.id).unwrap();
        let copy2 = fs_handle.reserve_copy_id(&txn.id).unwrap();
        assert_eq!(copy1, "_0");
        assert_eq!(copy2, "_1");
    }

    #[test]
    fn test_set_entry_and_read_back() {
        let (_tmp, fs_handle) = fixture();
        let txn = fs_handle.create_txn(0).unwrap();
        let mut root = fs_handle.get_node_revision(&txn.root_id()).unwrap();

        let file_id = NodeRevId::new_txn("_0", "0", &txn.id);
        fs_handle
            .set_entry(&txn.id, &mut root, "a.txt", Some((file_id.clone(), NodeKind::File)))
            .unwrap();
        assert!(root.has_mutable_dir_contents());

        let entries = fs_handle.rep_contents_dir(&root).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries["a.txt"].id, file_id);

        // Delete through the overlay.
        fs_handle.set_entry(&txn.id, &mut root, "a.txt", None).unwrap();
        let entries = fs_handle.rep_contents_dir(&root).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_set_file_contents_roundtrip() {
        let (_tmp, fs_handle) = fixture();
        let txn = fs_handle.create_txn(0).unwrap();

        let template = NodeRevision {
            id: txn.root_id(),
            kind: NodeKind::File,
            predecessor_id: None,
            predecessor_count: 0,
            data_rep: None,
            prop_rep: None,
            created_path: "/hello".into(),
            copyfrom: None,
            copyroot_rev: None,
            copyroot_path: "/hello".into(),
        };
        let id = fs_handle.create_node(template, "0", &txn.id).unwrap();
        let mut noderev = fs_handle.get_node_revision(&id).unwrap();
        fs_handle.set_file_contents(&mut noderev, b"hello\n").unwrap();

        let noderev = fs_handle.get_node_revision(&id).unwrap();
        assert_eq!(fs_handle.file_length(&noderev), 6);
        assert_eq!(fs_handle.file_contents(&noderev).unwrap().as_ref(), b"hello\n");
    }

    #[test]
    fn test_set_contents_rejects_directory() {
        let (_tmp, fs_handle) = fixture();
        let txn = fs_handle.create_txn(0).unwrap();
        let root = fs_handle.get_node_revision(&txn.root_id()).unwrap();
        assert!(matches!(
            fs_handle.begin_contents(&root),
            Err(FsError::NotFile)
        ));
    }

    #[test]
    fn test_set_proplist() {
        let (_tmp, fs_handle) = fixture();
        let txn = fs_handle.create_txn(0).unwrap();
        let mut root = fs_handle.get_node_revision(&txn.root_id()).unwrap();

        let mut props = HashMapOrdered::new();
        props.insert("color".into(), "teal".into());
        fs_handle.set_proplist(&mut root, &props).unwrap();

        let reread = fs_handle.get_node_revision(&txn.root_id()).unwrap();
        assert!(reread.prop_rep.as_ref().unwrap().is_mutable());
        assert_eq!(fs_handle.get_proplist(&reread).unwrap(), props);
        assert_eq!(
            fs_handle.node_prop(&reread, "color").unwrap().as_deref(),
            Some("teal")
        );
    }

    #[test]
    fn test_delete_node_revision() {
        let (_tmp, fs_handle) = fixture();
        let txn = fs_handle.create_txn(0).unwrap();

        let template = NodeRevision {
            id: txn.root_id(),
            kind: NodeKind::File,
            predecessor_id: None,
            predecessor_count: 0,
            data_rep: None,
            prop_rep: None,
            created_path: "/f".into(),
            copyfrom: None,
            copyroot_rev: None,
            copyroot_path: "/f".into(),
        };
        let id = fs_handle.create_node(template, "0", &txn.id).unwrap();
        fs_handle.delete_node_revision(&id).unwrap();
        assert!(matches!(
            fs_handle.get_node_revision(&id),
            Err(FsError::DanglingId(_))
        ));
    }
}

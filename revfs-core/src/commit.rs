//! The commit coordinator.
//!
//! Commits are serialised by an advisory lock on `write-lock`. Under the
//! lock the transaction's staging area is streamed into the prototype rev
//! file (renumbering temporary ids along the way), the folded change log
//! and trailer are appended, and the finished file is renamed into
//! `revs/N`. `current` is replaced last, via temp file + rename, so a
//! reader that observes revision N always finds `revs/N` in place.

use crate::changes::{self, ChangeKind};
use crate::dir;
use crate::error::{FsError, Result};
use crate::fs::{move_into_place, write_via_temp, FileSystem};
use crate::id::NodeRevId;
use crate::key;
use crate::noderev::{NodeKind, RepLocation, Representation};
use crate::rep;
use crate::txn::Transaction;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};

/// Holds the exclusive commit lock; released on drop.
struct WriteLock {
    file: File,
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Renumber a temporary `_`-suffix key against the reserved starting key.
fn renumber_id(id_part: &str, start: &str) -> Result<String> {
    match id_part.strip_prefix('_') {
        Some(offset) => key::add_keys(start, offset),
        None => Ok(id_part.to_string()),
    }
}

impl FileSystem {
    /// Block until this process holds the repository write lock.
    fn get_write_lock(&self) -> Result<WriteLock> {
        let path = self.layout().lock_file();
        // Repositories created by older tools may lack the lock file.
        if !path.exists() {
            fs::write(&path, "")?;
        }
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.lock_exclusive()?;
        Ok(WriteLock { file })
    }

    /// Publish TXN as the next revision and return its number.
    pub fn commit(&self, txn: &Transaction) -> Result<u64> {
        let _lock = self.get_write_lock()?;

        let (old_rev, start_node_id, start_copy_id) = self.read_current()?;
        if txn.base_rev != old_rev {
            return Err(FsError::TxnOutOfDate {
                base: txn.base_rev,
                youngest: old_rev,
            });
        }
        let new_rev = old_rev + 1;

        let proto_path = self.layout().txn_proto_rev(&txn.id);
        let mut proto = OpenOptions::new().write(true).open(&proto_path)?;
        proto.seek(SeekFrom::End(0))?;

        // Stream every mutable node-rev into the prototype file, children
        // before parents, fixing up ids and representation locations.
        let new_root_id = self
            .write_final_rev(&mut proto, new_rev, &txn.root_id(), &start_node_id, &start_copy_id)?
            .ok_or_else(|| FsError::corrupt("transaction has no mutable root"))?;

        let changes_offset = self.write_final_changed_path_info(&mut proto, &txn.id)?;

        let root_offset = new_root_id.offset().expect("final root id is permanent");
        write!(proto, "\n{} {}\n", root_offset, changes_offset)?;
        proto.sync_all()?;
        drop(proto);

        // Rename the finished rev file and revprops into place, matching
        // permissions to the previous revision file.
        let perms_reference = self.layout().rev(old_rev);
        move_into_place(&proto_path, &self.layout().rev(new_rev), &perms_reference)?;
        move_into_place(
            &self.layout().txn_props(&txn.id),
            &self.layout().revprops(new_rev),
            &perms_reference,
        )?;

        self.write_final_current(&txn.id, new_rev, &start_node_id, &start_copy_id)?;

        self.purge_txn(&txn.id)?;
        self.dir_cache.borrow_mut().clear();

        tracing::info!(rev = new_rev, txn = %txn.id, "committed revision");
        Ok(new_rev)
    }

    /// Copy the node-revision ID from the staging area into the permanent
    /// rev file, post-order over directories. Returns the permanent id, or
    /// None if ID was already immutable.
    fn write_final_rev(
        &self,
        file: &mut File,
        new_rev: u64,
        id: &NodeRevId,
        start_node_id: &str,
        start_copy_id: &str,
    ) -> Result<Option<NodeRevId>> {
        if !id.is_txn() {
            return Ok(None);
        }

        let mut noderev = self.get_node_revision(id)?;

        if noderev.kind == NodeKind::Dir {
            // Write out all the children first.
            let mut entries = self.rep_contents_dir(&noderev)?;
            for entry in entries.values_mut() {
                let child_id = entry.id.clone();
                if let Some(new_id) =
                    self.write_final_rev(file, new_rev, &child_id, start_node_id, start_copy_id)?
                {
                    if new_id.rev() == Some(new_rev) {
                        entry.id = new_id;
                    }
                }
            }

            if noderev.data_rep.as_ref().is_some_and(Representation::is_mutable) {
                // Serialise the id-fixed directory as a PLAIN hash rep.
                let hash = dir::unparse_dir_entries(&entries);
                let offset = file.stream_position()?;
                let (size, md5) = rep::write_hash_rep(file, &hash)?;
                noderev.data_rep = Some(Representation {
                    location: RepLocation::Revision(new_rev),
                    offset,
                    size,
                    expanded_size: size,
                    md5,
                });
            }
        } else if let Some(data_rep) = &mut noderev.data_rep {
            // File contents already live in the prototype file; the rep
            // just needs to point at the new revision.
            if data_rep.is_mutable() {
                data_rep.location = RepLocation::Revision(new_rev);
            }
        }

        if noderev.prop_rep.as_ref().is_some_and(Representation::is_mutable) {
            let proplist = self.get_proplist(&noderev)?;
            let offset = file.stream_position()?;
            let (size, md5) = rep::write_hash_rep(file, &proplist)?;
            noderev.prop_rep = Some(Representation {
                location: RepLocation::Revision(new_rev),
                offset,
                size,
                expanded_size: size,
                md5,
            });
        }

        // Convert the temporary id into a permanent revision one.
        let my_offset = file.stream_position()?;
        let node_id = renumber_id(id.node_id(), start_node_id)?;
        let copy_id = renumber_id(id.copy_id(), start_copy_id)?;

        if noderev.copyroot_rev.is_none() {
            noderev.copyroot_rev = Some(new_rev);
        }

        let new_id = NodeRevId::new_rev(node_id, copy_id, new_rev, my_offset);
        noderev.id = new_id.clone();

        noderev.write_to(file)?;

        // Rewrite the staging file so the changed-path pass can map the
        // temporary id to the permanent one.
        self.put_node_revision(id, &noderev)?;

        Ok(Some(new_id))
    }

    /// Fold the transaction's change log and append it to the prototype
    /// file, substituting permanent ids. Returns the section's offset.
    fn write_final_changed_path_info(&self, file: &mut File, txn_id: &str) -> Result<u64> {
        let offset = file.stream_position()?;
        let changed = self.txn_changes_fetch(txn_id)?;

        for (path, change) in &changed {
            let mut id = change.noderev_id.clone();
            // A deleted mutable node has no permanent id; the stale
            // temporary id is never dereferenced.
            if change.kind != ChangeKind::Delete && id.is_txn() {
                id = self.get_node_revision(&id)?.id;
            }
            changes::write_change_entry(
                file,
                path,
                Some(&id),
                change.kind,
                change.text_mod,
                change.prop_mod,
                change.copyfrom.as_ref(),
            )?;
        }

        Ok(offset)
    }

    /// Atomically replace `current`, publishing the new youngest revision
    /// and the next free node/copy ids.
    fn write_final_current(
        &self,
        txn_id: &str,
        new_rev: u64,
        start_node_id: &str,
        start_copy_id: &str,
    ) -> Result<()> {
        let (txn_node_id, txn_copy_id) = self.read_next_ids(txn_id)?;
        let node_id = key::add_keys(start_node_id, &txn_node_id)?;
        let copy_id = key::add_keys(start_copy_id, &txn_copy_id)?;

        let contents = format!("{} {} {}\n", new_rev, node_id, copy_id);
        write_via_temp(&self.layout().current(), contents.as_bytes())
    }
}

//! Repository handle and read-side operations.
//!
//! A `FileSystem` owns the path layout, the cached UUID and the one-slot
//! directory cache. Writers go through the transaction and commit modules;
//! everything here either reads published state or performs the small
//! atomic file replacements shared with the commit path.

use crate::dir::{self, DirEntries};
use crate::error::{FsError, Result};
use crate::hashfile::{self, HashMapOrdered};
use crate::id::NodeRevId;
use crate::noderev::NodeRevision;
use crate::paths::Layout;
use crate::rep;
use bytes::Bytes;
use std::cell::RefCell;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Contents of `revs/0`: an empty root directory and its trailer.
const REVISION_ZERO: &str = "PLAIN\nEND\nENDREP\n\
id: 0.0.r0/17\n\
type: dir\n\
count: 0\n\
text: 0 0 4 4 2d2977d1c96f487abe4a1e202dd03b4e\n\
cpath: /\n\
\n\n17 107\n";

/// An open repository.
pub struct FileSystem {
    layout: Layout,
    uuid: String,
    pub(crate) dir_cache: RefCell<dir::DirCache>,
}

impl FileSystem {
    /// Open an existing repository.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let layout = Layout::new(path.as_ref());
        // The `current` file is the one piece of state an open repository
        // must have.
        if !layout.current().exists() {
            return Err(FsError::corrupt(format!(
                "'{}' is not a repository",
                path.as_ref().display()
            )));
        }
        let uuid = fs::read_to_string(layout.uuid())?.trim_end().to_string();
        Ok(Self {
            layout,
            uuid,
            dir_cache: RefCell::new(dir::DirCache::default()),
        })
    }

    /// Create a new repository at PATH, with revision zero holding an
    /// empty root directory.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let layout = Layout::new(path.as_ref());
        fs::create_dir_all(layout.revs_dir())?;
        fs::create_dir_all(layout.revprops_dir())?;
        fs::create_dir_all(layout.txns_dir())?;

        fs::write(layout.current(), "0 1 1\n")?;
        fs::write(layout.lock_file(), "")?;
        fs::write(layout.rev(0), REVISION_ZERO)?;

        let mut revprops = Vec::new();
        hashfile::write_hash(&mut revprops, &HashMapOrdered::new())?;
        fs::write(layout.revprops(0), revprops)?;

        let uuid = uuid::Uuid::new_v4().to_string();
        fs::write(layout.uuid(), format!("{}\n", uuid))?;

        tracing::info!(path = %path.as_ref().display(), %uuid, "created repository");

        Ok(Self {
            layout,
            uuid,
            dir_cache: RefCell::new(dir::DirCache::default()),
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Overwrite the repository UUID; a fresh one is generated when none
    /// is given.
    pub fn set_uuid(&mut self, uuid: Option<String>) -> Result<String> {
        let uuid = uuid.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        fs::write(self.layout.uuid(), format!("{}\n", uuid))?;
        self.uuid = uuid.clone();
        Ok(uuid)
    }

    /// Youngest revision recorded in `current`.
    pub fn youngest_rev(&self) -> Result<u64> {
        Ok(self.read_current()?.0)
    }

    /// Parse `current`: youngest revision plus the next node and copy ids.
    pub fn read_current(&self) -> Result<(u64, String, String)> {
        let line = fs::read_to_string(self.layout.current())?;
        let corrupt = || FsError::corrupt("corrupt current file");
        let mut fields = line.split_ascii_whitespace();
        let rev = fields.next().ok_or_else(corrupt)?.parse().map_err(|_| corrupt())?;
        let node_id = fields.next().ok_or_else(corrupt)?.to_string();
        let copy_id = fields.next().ok_or_else(corrupt)?.to_string();
        Ok((rev, node_id, copy_id))
    }

    fn open_rev_file(&self, rev: u64) -> Result<BufReader<File>> {
        match File::open(self.layout.rev(rev)) {
            Ok(file) => Ok(BufReader::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FsError::NoSuchRevision(rev))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Locate the trailer of an open revision file: the offsets of the
    /// root node-rev and of the changed-paths section.
    fn root_changes_offset(file: &mut BufReader<File>) -> Result<(u64, u64)> {
        // The trailer line is never longer than 64 bytes.
        let len = file.seek(SeekFrom::End(0))?;
        let window = len.min(64);
        file.seek(SeekFrom::End(-(window as i64)))?;
        let mut buf = vec![0u8; window as usize];
        file.read_exact(&mut buf)?;

        if buf.last() != Some(&b'\n') {
            return Err(FsError::corrupt("revision file lacks trailing newline"));
        }
        let line_start = buf[..buf.len() - 1]
            .iter()
            .rposition(|&b| b == b'\n')
            .map(|i| i + 1)
            .ok_or_else(|| {
                FsError::corrupt("final line in revision file longer than 64 characters")
            })?;

        let line = std::str::from_utf8(&buf[line_start..buf.len() - 1])
            .map_err(|_| FsError::corrupt("revision file trailer is not ASCII"))?;
        let corrupt = || FsError::corrupt("final line in revision file missing space");
        let (root, changes) = line.split_once(' ').ok_or_else(corrupt)?;
        Ok((
            root.parse().map_err(|_| corrupt())?,
            changes.parse().map_err(|_| corrupt())?,
        ))
    }

    /// Id of the root directory of REV.
    pub fn rev_get_root(&self, rev: u64) -> Result<NodeRevId> {
        let mut file = self.open_rev_file(rev)?;
        let (root_offset, _) = Self::root_changes_offset(&mut file)?;
        file.seek(SeekFrom::Start(root_offset))?;
        let noderev = NodeRevision::read_from(&mut file)?;
        Ok(noderev.id)
    }

    /// Fetch a node-revision by id, from a revision file or from the
    /// transaction staging area.
    pub fn get_node_revision(&self, id: &NodeRevId) -> Result<NodeRevision> {
        if id.is_txn() {
            let path = self.layout.txn_node_rev(id);
            let file = match File::open(path) {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(FsError::DanglingId(id.to_string()))
                }
                Err(e) => return Err(e.into()),
            };
            NodeRevision::read_from(&mut BufReader::new(file))
        } else {
            let rev = id.rev().expect("non-txn id has a revision");
            let offset = id.offset().expect("non-txn id has an offset");
            let mut file = match self.open_rev_file(rev) {
                Ok(f) => f,
                Err(FsError::NoSuchRevision(_)) => {
                    return Err(FsError::DanglingId(id.to_string()))
                }
                Err(e) => return Err(e),
            };
            file.seek(SeekFrom::Start(offset))?;
            NodeRevision::read_from(&mut file)
        }
    }

    /// Write a mutable node-revision back to its staging file.
    pub fn put_node_revision(&self, id: &NodeRevId, noderev: &NodeRevision) -> Result<()> {
        if !id.is_txn() {
            return Err(FsError::NotMutable);
        }
        let mut file = File::create(self.layout.txn_node_rev(id))?;
        noderev.write_to(&mut file)
    }

    /// Full expanded file contents of NODEREV.
    pub fn file_contents(&self, noderev: &NodeRevision) -> Result<Bytes> {
        let bytes = rep::read_rep_contents(&self.layout, noderev.data_rep.as_ref())?;
        Ok(Bytes::from(bytes))
    }

    /// Expanded length of the file's contents.
    pub fn file_length(&self, noderev: &NodeRevision) -> u64 {
        noderev
            .data_rep
            .as_ref()
            .map(|rep| rep.expanded_size)
            .unwrap_or(0)
    }

    /// Stored MD5 digest of the file's contents.
    pub fn file_checksum(&self, noderev: &NodeRevision) -> [u8; 16] {
        noderev
            .data_rep
            .as_ref()
            .map(|rep| rep.md5)
            .unwrap_or([0; 16])
    }

    /// Entries of the directory NODEREV, served from the one-slot cache
    /// when the same directory is read twice in a row.
    pub fn rep_contents_dir(&self, noderev: &NodeRevision) -> Result<DirEntries> {
        if let Some(entries) = self.dir_cache.borrow().get(&noderev.id) {
            return Ok(entries.clone());
        }
        let entries = dir::get_dir_contents(&self.layout, noderev)?;
        self.dir_cache
            .borrow_mut()
            .store(noderev.id.clone(), entries.clone());
        Ok(entries)
    }

    /// Property list of NODEREV, from the staging file when mutable.
    pub fn get_proplist(&self, noderev: &NodeRevision) -> Result<HashMapOrdered> {
        match &noderev.prop_rep {
            Some(rep) if rep.is_mutable() => {
                let file = File::open(self.layout.txn_node_props(&noderev.id))?;
                hashfile::read_hash(&mut BufReader::new(file))
            }
            Some(rep) => rep::read_hash_rep(&self.layout, rep),
            None => Ok(HashMapOrdered::new()),
        }
    }

    /// One property of NODEREV.
    pub fn node_prop(&self, noderev: &NodeRevision, name: &str) -> Result<Option<String>> {
        Ok(self.get_proplist(noderev)?.remove(name))
    }

    /// Proplist of a published revision.
    pub fn revision_proplist(&self, rev: u64) -> Result<HashMapOrdered> {
        let file = match File::open(self.layout.revprops(rev)) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FsError::NoSuchRevision(rev))
            }
            Err(e) => return Err(e.into()),
        };
        hashfile::read_hash(&mut BufReader::new(file))
    }

    /// Replace a revision's proplist via temp file + rename. The rev file
    /// serves as the permissions reference since the revprops file may not
    /// exist yet.
    pub fn set_revision_proplist(&self, rev: u64, proplist: &HashMapOrdered) -> Result<()> {
        if !self.layout.rev(rev).exists() {
            return Err(FsError::NoSuchRevision(rev));
        }
        let final_path = self.layout.revprops(rev);
        let tmp_path = final_path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            hashfile::write_hash(&mut file, proplist)?;
            file.sync_all()?;
        }
        move_into_place(&tmp_path, &final_path, &self.layout.rev(rev))
    }

    /// Folded changed-paths section of a published revision.
    pub fn paths_changed(&self, rev: u64) -> Result<crate::changes::ChangedPaths> {
        let mut file = self.open_rev_file(rev)?;
        let (_, changes_offset) = Self::root_changes_offset(&mut file)?;
        file.seek(SeekFrom::Start(changes_offset))?;
        crate::changes::fetch_all_changes(&mut file, true)
    }

    /// Copy the published state of this repository to DST.
    pub fn hotcopy(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
        let src_layout = Layout::new(src.as_ref());
        let dst_layout = Layout::new(dst.as_ref());

        fs::create_dir_all(dst_layout.root())?;
        fs::copy(src_layout.current(), dst_layout.current())?;
        fs::copy(src_layout.uuid(), dst_layout.uuid())?;
        fs::write(dst_layout.lock_file(), "")?;

        let src_fs = Self::open(src.as_ref())?;
        let youngest = src_fs.youngest_rev()?;

        fs::create_dir_all(dst_layout.revs_dir())?;
        fs::create_dir_all(dst_layout.revprops_dir())?;
        for rev in 0..=youngest {
            fs::copy(src_layout.rev(rev), dst_layout.rev(rev))?;
            fs::copy(src_layout.revprops(rev), dst_layout.revprops(rev))?;
        }

        // In-progress transactions are not copied.
        fs::create_dir_all(dst_layout.txns_dir())?;
        Ok(())
    }
}

/// Move OLD into place at NEW, matching permissions to PERMS_REFERENCE.
/// Falls back to copy + fsync + unlink when the rename crosses devices.
pub(crate) fn move_into_place(old: &Path, new: &Path, perms_reference: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let perms = fs::metadata(perms_reference)?.permissions();
        fs::set_permissions(old, perms)?;
    }
    #[cfg(not(unix))]
    let _ = perms_reference;

    match fs::rename(old, new) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::CrossesDevices => {
            fs::copy(old, new)?;
            File::open(new)?.sync_all()?;
            fs::remove_file(old)?;
        }
        Err(e) => return Err(e.into()),
    }

    // A rename is only durable once the directory entry itself is synced.
    if let Some(dir) = new.parent() {
        if let Ok(dir_file) = File::open(dir) {
            let _ = dir_file.sync_all();
        }
    }
    Ok(())
}

/// Write CONTENTS to PATH via a temp file and atomic rename, using PATH
/// itself as the permissions reference when it already exists.
pub(crate) fn write_via_temp(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    let reference = if path.exists() { path } else { &tmp_path };
    move_into_place(&tmp_path, path, reference)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noderev::NodeKind;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_open() {
        let tmp = TempDir::new().unwrap();
        let fs_handle = FileSystem::create(tmp.path()).unwrap();
        assert_eq!(fs_handle.uuid().len(), 36);
        assert_eq!(fs_handle.youngest_rev().unwrap(), 0);

        let reopened = FileSystem::open(tmp.path()).unwrap();
        assert_eq!(reopened.uuid(), fs_handle.uuid());
        assert_eq!(reopened.read_current().unwrap(), (0, "1".into(), "1".into()));
    }

    #[test]
    fn test_open_missing_repository() {
        let tmp = TempDir::new().unwrap();
        assert!(FileSystem::open(tmp.path()).is_err());
    }

    #[test]
    fn test_revision_zero_root() {
        let tmp = TempDir::new().unwrap();
        let fs_handle = FileSystem::create(tmp.path()).unwrap();

        let root_id = fs_handle.rev_get_root(0).unwrap();
        assert_eq!(root_id.to_string(), "0.0.r0/17");

        let root = fs_handle.get_node_revision(&root_id).unwrap();
        assert_eq!(root.kind, NodeKind::Dir);
        assert_eq!(root.created_path, "/");
        assert_eq!(root.predecessor_count, 0);

        let entries = fs_handle.rep_contents_dir(&root).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_no_such_revision() {
        let tmp = TempDir::new().unwrap();
        let fs_handle = FileSystem::create(tmp.path()).unwrap();
        assert!(matches!(
            fs_handle.rev_get_root(99),
            Err(FsError::NoSuchRevision(99))
        ));
        assert!(matches!(
            fs_handle.revision_proplist(99),
            Err(FsError::NoSuchRevision(99))
        ));
    }

    #[test]
    fn test_set_uuid() {
        let tmp = TempDir::new().unwrap();
        let mut fs_handle = FileSystem::create(tmp.path()).unwrap();
        let fixed = "11111111-2222-3333-4444-555555555555".to_string();
        fs_handle.set_uuid(Some(fixed.clone())).unwrap();
        assert_eq!(fs_handle.uuid(), fixed);

        let generated = fs_handle.set_uuid(None).unwrap();
        assert_ne!(generated, fixed);
        assert_eq!(FileSystem::open(tmp.path()).unwrap().uuid(), generated);
    }

    #[test]
    fn test_revision_proplist_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let fs_handle = FileSystem::create(tmp.path()).unwrap();

        let mut props = HashMapOrdered::new();
        props.insert("svn:log".into(), "initial import\n".into());
        props.insert("svn:author".into(), "alice".into());
        fs_handle.set_revision_proplist(0, &props).unwrap();
        assert_eq!(fs_handle.revision_proplist(0).unwrap(), props);
    }

    #[test]
    fn test_hotcopy() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        let fs_handle = FileSystem::create(&src).unwrap();
        let uuid = fs_handle.uuid().to_string();

        FileSystem::hotcopy(&src, &dst).unwrap();
        let copy = FileSystem::open(&dst).unwrap();
        assert_eq!(copy.uuid(), uuid);
        assert_eq!(copy.youngest_rev().unwrap(), 0);
        assert!(copy.rev_get_root(0).is_ok());
    }

    #[test]
    fn test_paths_changed_of_rev_zero_is_empty() {
        let tmp = TempDir::new().unwrap();
        let fs_handle = FileSystem::create(tmp.path()).unwrap();
        assert!(fs_handle.paths_changed(0).unwrap().is_empty());
    }
}

//! Path layout of an on-disk repository.
//!
//! Every logical entity (revision, transaction, staged node) maps to a
//! deterministic location under the repository root.

use crate::id::NodeRevId;
use std::path::{Path, PathBuf};

/// Name of the file recording the youngest revision and next ids.
pub const PATH_CURRENT: &str = "current";
/// Name of the repository UUID file.
pub const PATH_UUID: &str = "uuid";
/// Name of the commit serialisation lock file.
pub const PATH_LOCK_FILE: &str = "write-lock";
/// Directory of published revision files.
pub const PATH_REVS_DIR: &str = "revs";
/// Directory of revision property files.
pub const PATH_REVPROPS_DIR: &str = "revprops";
/// Directory of in-flight transactions.
pub const PATH_TXNS_DIR: &str = "transactions";

/// Files inside a transaction directory.
pub const PATH_REV: &str = "rev";
pub const PATH_CHANGES: &str = "changes";
pub const PATH_TXN_PROPS: &str = "props";
pub const PATH_NEXT_IDS: &str = "next-ids";

/// Extension of a transaction directory.
pub const EXT_TXN: &str = ".txn";
/// Extension for staged directory contents.
pub const EXT_CHILDREN: &str = ".children";
/// Extension for staged node properties.
pub const EXT_PROPS: &str = ".props";

/// Resolves filesystem locations for a repository rooted at a fixed path.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn current(&self) -> PathBuf {
        self.root.join(PATH_CURRENT)
    }

    pub fn uuid(&self) -> PathBuf {
        self.root.join(PATH_UUID)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join(PATH_LOCK_FILE)
    }

    pub fn revs_dir(&self) -> PathBuf {
        self.root.join(PATH_REVS_DIR)
    }

    pub fn rev(&self, rev: u64) -> PathBuf {
        self.revs_dir().join(rev.to_string())
    }

    pub fn revprops_dir(&self) -> PathBuf {
        self.root.join(PATH_REVPROPS_DIR)
    }

    pub fn revprops(&self, rev: u64) -> PathBuf {
        self.revprops_dir().join(rev.to_string())
    }

    pub fn txns_dir(&self) -> PathBuf {
        self.root.join(PATH_TXNS_DIR)
    }

    pub fn txn_dir(&self, txn_id: &str) -> PathBuf {
        self.txns_dir().join(format!("{}{}", txn_id, EXT_TXN))
    }

    /// The prototype rev file a transaction appends representations to.
    pub fn txn_proto_rev(&self, txn_id: &str) -> PathBuf {
        self.txn_dir(txn_id).join(PATH_REV)
    }

    pub fn txn_changes(&self, txn_id: &str) -> PathBuf {
        self.txn_dir(txn_id).join(PATH_CHANGES)
    }

    pub fn txn_props(&self, txn_id: &str) -> PathBuf {
        self.txn_dir(txn_id).join(PATH_TXN_PROPS)
    }

    pub fn txn_next_ids(&self, txn_id: &str) -> PathBuf {
        self.txn_dir(txn_id).join(PATH_NEXT_IDS)
    }

    /// Staging file holding the mutable node-revision for ID.
    pub fn txn_node_rev(&self, id: &NodeRevId) -> PathBuf {
        let txn_id = id.txn_id().expect("node-rev path requires a txn id");
        self.txn_dir(txn_id)
            .join(format!("node.{}.{}", id.node_id(), id.copy_id()))
    }

    pub fn txn_node_props(&self, id: &NodeRevId) -> PathBuf {
        let mut p = self.txn_node_rev(id).into_os_string();
        p.push(EXT_PROPS);
        PathBuf::from(p)
    }

    pub fn txn_node_children(&self, id: &NodeRevId) -> PathBuf {
        let mut p = self.txn_node_rev(id).into_os_string();
        p.push(EXT_CHILDREN);
        PathBuf::from(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::NodeRevId;

    #[test]
    fn test_fixed_paths() {
        let layout = Layout::new("/repo");
        assert_eq!(layout.current(), PathBuf::from("/repo/current"));
        assert_eq!(layout.rev(42), PathBuf::from("/repo/revs/42"));
        assert_eq!(layout.revprops(42), PathBuf::from("/repo/revprops/42"));
        assert_eq!(layout.txn_dir("0-1"), PathBuf::from("/repo/transactions/0-1.txn"));
        assert_eq!(
            layout.txn_proto_rev("0-1"),
            PathBuf::from("/repo/transactions/0-1.txn/rev")
        );
    }

    #[test]
    fn test_txn_node_paths() {
        let layout = Layout::new("/repo");
        let id = NodeRevId::parse("_3._1.t2-1").unwrap();
        assert_eq!(
            layout.txn_node_rev(&id),
            PathBuf::from("/repo/transactions/2-1.txn/node._3._1")
        );
        assert_eq!(
            layout.txn_node_children(&id),
            PathBuf::from("/repo/transactions/2-1.txn/node._3._1.children")
        );
        assert_eq!(
            layout.txn_node_props(&id),
            PathBuf::from("/repo/transactions/2-1.txn/node._3._1.props")
        );
    }
}

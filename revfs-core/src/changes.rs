//! The per-transaction change log and its folding rules.
//!
//! Every edit appends two lines to the transaction's `changes` file: the
//! change itself and a copyfrom line (possibly empty). At publish time the
//! raw entries are folded into one summary change per path; the published
//! changed-paths section at the end of a revision file uses the same
//! two-line format and is read back with `prefolded` set.

use crate::error::{FsError, Result};
use crate::id::NodeRevId;
use crate::paths::Layout;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufRead, Write};

const ACTION_MODIFY: &str = "modify";
const ACTION_ADD: &str = "add";
const ACTION_DELETE: &str = "delete";
const ACTION_REPLACE: &str = "replace";
const ACTION_RESET: &str = "reset";

const FLAG_TRUE: &str = "true";
const FLAG_FALSE: &str = "false";

/// Kind of a path change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Modify,
    Add,
    Delete,
    Replace,
    /// Wipe any accumulated change for the path.
    Reset,
}

impl ChangeKind {
    fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Modify => ACTION_MODIFY,
            ChangeKind::Add => ACTION_ADD,
            ChangeKind::Delete => ACTION_DELETE,
            ChangeKind::Replace => ACTION_REPLACE,
            ChangeKind::Reset => ACTION_RESET,
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            ACTION_MODIFY => Ok(ChangeKind::Modify),
            ACTION_ADD => Ok(ChangeKind::Add),
            ACTION_DELETE => Ok(ChangeKind::Delete),
            ACTION_REPLACE => Ok(ChangeKind::Replace),
            ACTION_RESET => Ok(ChangeKind::Reset),
            _ => Err(FsError::corrupt("invalid change kind in rev file")),
        }
    }
}

/// One raw change-log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub path: String,
    /// None only for `reset` entries.
    pub noderev_id: Option<NodeRevId>,
    pub kind: ChangeKind,
    pub text_mod: bool,
    pub prop_mod: bool,
    pub copyfrom: Option<(u64, String)>,
}

/// The folded summary change for one path.
#[derive(Debug, Clone, PartialEq)]
pub struct PathChange {
    pub noderev_id: NodeRevId,
    pub kind: ChangeKind,
    pub text_mod: bool,
    pub prop_mod: bool,
    pub copyfrom: Option<(u64, String)>,
}

/// Folded changes keyed by path.
pub type ChangedPaths = BTreeMap<String, PathChange>;

fn parse_flag(s: &str, what: &str) -> Result<bool> {
    match s {
        FLAG_TRUE => Ok(true),
        FLAG_FALSE => Ok(false),
        _ => Err(FsError::corrupt(format!("invalid {} flag in rev-file", what))),
    }
}

/// Write one change entry (two lines) to WRITER.
pub fn write_change_entry<W: Write>(
    writer: &mut W,
    path: &str,
    noderev_id: Option<&NodeRevId>,
    kind: ChangeKind,
    text_mod: bool,
    prop_mod: bool,
    copyfrom: Option<&(u64, String)>,
) -> Result<()> {
    let idstr = match noderev_id {
        Some(id) => id.to_string(),
        None => ACTION_RESET.to_string(),
    };
    writeln!(
        writer,
        "{} {} {} {} {}",
        idstr,
        kind.as_str(),
        if text_mod { FLAG_TRUE } else { FLAG_FALSE },
        if prop_mod { FLAG_TRUE } else { FLAG_FALSE },
        path
    )?;
    match copyfrom {
        Some((rev, from_path)) => writeln!(writer, "{} {}", rev, from_path)?,
        None => writeln!(writer)?,
    }
    Ok(())
}

/// Read the next change entry, or None at end of the record.
pub fn read_change<R: BufRead>(reader: &mut R) -> Result<Option<Change>> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if line.ends_with('\n') {
        line.pop();
    }
    // A blank line or EOF terminates the changes record.
    if n == 0 || line.is_empty() {
        return Ok(None);
    }

    let corrupt = || FsError::corrupt("invalid changes line in rev-file");

    let mut fields = line.splitn(5, ' ');
    let idstr = fields.next().ok_or_else(corrupt)?;
    let noderev_id = if idstr == ACTION_RESET {
        None
    } else {
        Some(NodeRevId::parse(idstr)?)
    };
    let kind = ChangeKind::parse(fields.next().ok_or_else(corrupt)?)?;
    let text_mod = parse_flag(fields.next().ok_or_else(corrupt)?, "text-mod")?;
    let prop_mod = parse_flag(fields.next().ok_or_else(corrupt)?, "prop-mod")?;
    let path = fields.next().ok_or_else(corrupt)?.to_string();

    let mut copyfrom_line = String::new();
    reader.read_line(&mut copyfrom_line)?;
    if copyfrom_line.ends_with('\n') {
        copyfrom_line.pop();
    }
    let copyfrom = if copyfrom_line.is_empty() {
        None
    } else {
        let (rev, from_path) = copyfrom_line.split_once(' ').ok_or_else(corrupt)?;
        Some((rev.parse().map_err(|_| corrupt())?, from_path.to_string()))
    };

    Ok(Some(Change {
        path,
        noderev_id,
        kind,
        text_mod,
        prop_mod,
        copyfrom,
    }))
}

/// Append one change entry to the transaction's changes file.
#[allow(clippy::too_many_arguments)]
pub fn add_change(
    layout: &Layout,
    txn_id: &str,
    path: &str,
    noderev_id: &NodeRevId,
    kind: ChangeKind,
    text_mod: bool,
    prop_mod: bool,
    copyfrom: Option<(u64, String)>,
) -> Result<()> {
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(layout.txn_changes(txn_id))?;
    write_change_entry(
        &mut file,
        path,
        Some(noderev_id),
        kind,
        text_mod,
        prop_mod,
        copyfrom.as_ref(),
    )
}

/// True if CHILD is a strict descendant of PARENT.
fn is_child(parent: &str, child: &str) -> bool {
    if parent == child {
        return false;
    }
    if parent == "/" {
        return child.starts_with('/');
    }
    child.len() > parent.len()
        && child.starts_with(parent)
        && child.as_bytes()[parent.len()] == b'/'
}

/// Merge CHANGE into CHANGED, collapsing multiple changes per path.
fn fold_change(changed: &mut ChangedPaths, change: &Change) -> Result<()> {
    // Only `reset` may omit the node revision ID.
    if change.noderev_id.is_none() && change.kind != ChangeKind::Reset {
        return Err(FsError::corrupt("missing required node revision ID"));
    }

    let Some(old) = changed.get_mut(&change.path) else {
        if let (Some(id), kind) = (&change.noderev_id, change.kind) {
            if kind != ChangeKind::Reset {
                changed.insert(
                    change.path.clone(),
                    PathChange {
                        noderev_id: id.clone(),
                        kind,
                        text_mod: change.text_mod,
                        prop_mod: change.prop_mod,
                        copyfrom: change.copyfrom.clone(),
                    },
                );
            }
        }
        return Ok(());
    };

    // The same node revision must carry through unless the prior entry
    // deleted the path.
    if let Some(id) = &change.noderev_id {
        if *id != old.noderev_id && old.kind != ChangeKind::Delete {
            return Err(FsError::corrupt(
                "invalid change ordering: new node revision ID without delete",
            ));
        }
    }

    // Only an add, replace or reset may follow a deletion.
    if old.kind == ChangeKind::Delete
        && !matches!(
            change.kind,
            ChangeKind::Add | ChangeKind::Replace | ChangeKind::Reset
        )
    {
        return Err(FsError::corrupt(
            "invalid change ordering: non-add change on deleted path",
        ));
    }

    match change.kind {
        ChangeKind::Reset => {
            changed.remove(&change.path);
        }
        ChangeKind::Delete => {
            if old.kind == ChangeKind::Add {
                // Added and deleted within the transaction: not a change.
                changed.remove(&change.path);
            } else {
                old.kind = ChangeKind::Delete;
                old.text_mod = change.text_mod;
                old.prop_mod = change.prop_mod;
                old.copyfrom = None;
            }
        }
        ChangeKind::Add | ChangeKind::Replace => {
            // An add here follows a delete, so it becomes a replace.
            old.kind = ChangeKind::Replace;
            old.noderev_id = change.noderev_id.clone().expect("checked above");
            old.text_mod = change.text_mod;
            old.prop_mod = change.prop_mod;
            old.copyfrom = change.copyfrom.clone();
        }
        ChangeKind::Modify => {
            old.text_mod |= change.text_mod;
            old.prop_mod |= change.prop_mod;
        }
    }

    Ok(())
}

/// Fold every change entry readable from READER. When PREFOLDED is false
/// (a raw transaction log), a delete or replace also prunes accumulated
/// entries for strict descendants of the path.
pub fn fetch_all_changes<R: BufRead>(reader: &mut R, prefolded: bool) -> Result<ChangedPaths> {
    let mut changed = ChangedPaths::new();

    while let Some(change) = read_change(reader)? {
        fold_change(&mut changed, &change)?;

        if matches!(change.kind, ChangeKind::Delete | ChangeKind::Replace) && !prefolded {
            let doomed: Vec<String> = changed
                .keys()
                .filter(|p| is_child(&change.path, p))
                .cloned()
                .collect();
            for path in doomed {
                changed.remove(&path);
            }
        }
    }

    Ok(changed)
}

/// Fold the raw change log of TXN_ID.
pub fn txn_changes_fetch(layout: &Layout, txn_id: &str) -> Result<ChangedPaths> {
    let file = std::fs::File::open(layout.txn_changes(txn_id))?;
    fetch_all_changes(&mut std::io::BufReader::new(file), false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn change(path: &str, id: &str, kind: ChangeKind) -> Change {
        Change {
            path: path.into(),
            noderev_id: Some(NodeRevId::parse(id).unwrap()),
            kind,
            text_mod: true,
            prop_mod: false,
            copyfrom: None,
        }
    }

    fn fold(changes: &[Change]) -> Result<ChangedPaths> {
        let mut buf = Vec::new();
        for c in changes {
            write_change_entry(
                &mut buf,
                &c.path,
                c.noderev_id.as_ref(),
                c.kind,
                c.text_mod,
                c.prop_mod,
                c.copyfrom.as_ref(),
            )
            .unwrap();
        }
        fetch_all_changes(&mut Cursor::new(buf), false)
    }

    #[test]
    fn test_entry_roundtrip() {
        let mut buf = Vec::new();
        let id = NodeRevId::parse("_1._0.t0-1").unwrap();
        write_change_entry(
            &mut buf,
            "/trunk/a",
            Some(&id),
            ChangeKind::Add,
            true,
            false,
            Some(&(3, "/branches/b/a".to_string())),
        )
        .unwrap();

        let mut cursor = Cursor::new(buf);
        let parsed = read_change(&mut cursor).unwrap().unwrap();
        assert_eq!(parsed.path, "/trunk/a");
        assert_eq!(parsed.noderev_id, Some(id));
        assert_eq!(parsed.kind, ChangeKind::Add);
        assert!(parsed.text_mod);
        assert!(!parsed.prop_mod);
        assert_eq!(parsed.copyfrom, Some((3, "/branches/b/a".into())));
        assert!(read_change(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_path_with_spaces() {
        let mut buf = Vec::new();
        let id = NodeRevId::parse("1.0.r2/9").unwrap();
        write_change_entry(&mut buf, "/a b c", Some(&id), ChangeKind::Modify, false, true, None)
            .unwrap();
        let parsed = read_change(&mut Cursor::new(buf)).unwrap().unwrap();
        assert_eq!(parsed.path, "/a b c");
    }

    #[test]
    fn test_fold_add_delete_cancels() {
        let folded = fold(&[
            change("/X", "_1._0.t0-1", ChangeKind::Add),
            change("/X", "_1._0.t0-1", ChangeKind::Delete),
        ])
        .unwrap();
        assert!(folded.is_empty());
    }

    #[test]
    fn test_fold_add_delete_add_is_single_add() {
        let folded = fold(&[
            change("/X", "_1._0.t0-1", ChangeKind::Add),
            change("/X", "_1._0.t0-1", ChangeKind::Delete),
            change("/X", "_2._0.t0-1", ChangeKind::Add),
        ])
        .unwrap();
        assert_eq!(folded.len(), 1);
        assert_eq!(folded["/X"].kind, ChangeKind::Add);
        assert_eq!(folded["/X"].noderev_id.to_string(), "_2._0.t0-1");
    }

    #[test]
    fn test_fold_delete_then_add_is_replace() {
        let folded = fold(&[
            change("/X", "1.0.r1/0", ChangeKind::Modify),
            change("/X", "1.0.r1/0", ChangeKind::Delete),
            change("/X", "_2._0.t0-1", ChangeKind::Add),
        ])
        .unwrap();
        assert_eq!(folded["/X"].kind, ChangeKind::Replace);
    }

    #[test]
    fn test_fold_modify_ors_flags() {
        let mut a = change("/X", "1.0.r1/0", ChangeKind::Modify);
        a.text_mod = true;
        a.prop_mod = false;
        let mut b = change("/X", "1.0.r1/0", ChangeKind::Modify);
        b.text_mod = false;
        b.prop_mod = true;
        let folded = fold(&[a, b]).unwrap();
        assert!(folded["/X"].text_mod);
        assert!(folded["/X"].prop_mod);
    }

    #[test]
    fn test_fold_reset_removes_entry() {
        let reset = Change {
            path: "/X".into(),
            noderev_id: None,
            kind: ChangeKind::Reset,
            text_mod: false,
            prop_mod: false,
            copyfrom: None,
        };
        let folded = fold(&[change("/X", "1.0.r1/0", ChangeKind::Modify), reset]).unwrap();
        assert!(folded.is_empty());
    }

    #[test]
    fn test_fold_delete_prunes_descendants() {
        let folded = fold(&[
            change("/d/a", "1.0.r1/0", ChangeKind::Modify),
            change("/d/b", "2.0.r1/9", ChangeKind::Modify),
            change("/other", "3.0.r1/20", ChangeKind::Modify),
            change("/d", "4.0.r1/44", ChangeKind::Delete),
        ])
        .unwrap();
        assert_eq!(folded.len(), 2);
        assert!(folded.contains_key("/d"));
        assert!(folded.contains_key("/other"));
    }

    #[test]
    fn test_fold_rejects_new_id_without_delete() {
        let err = fold(&[
            change("/X", "1.0.r1/0", ChangeKind::Modify),
            change("/X", "2.0.r1/10", ChangeKind::Modify),
        ])
        .unwrap_err();
        assert!(matches!(err, FsError::Corrupt(_)));
    }

    #[test]
    fn test_fold_rejects_modify_after_delete() {
        let err = fold(&[
            change("/X", "1.0.r1/0", ChangeKind::Delete),
            change("/X", "1.0.r1/0", ChangeKind::Modify),
        ])
        .unwrap_err();
        assert!(matches!(err, FsError::Corrupt(_)));
    }

    #[test]
    fn test_fold_rejects_null_id_on_non_reset() {
        let bad = Change {
            path: "/X".into(),
            noderev_id: None,
            kind: ChangeKind::Modify,
            text_mod: false,
            prop_mod: false,
            copyfrom: None,
        };
        assert!(fold(&[bad]).is_err());
    }

    #[test]
    fn test_prefolded_keeps_descendants() {
        let mut buf = Vec::new();
        for c in [
            change("/d", "4.0.r1/44", ChangeKind::Delete),
            change("/d/a", "1.0.r1/0", ChangeKind::Modify),
        ] {
            write_change_entry(
                &mut buf,
                &c.path,
                c.noderev_id.as_ref(),
                c.kind,
                c.text_mod,
                c.prop_mod,
                None,
            )
            .unwrap();
        }
        let folded = fetch_all_changes(&mut Cursor::new(buf), true).unwrap();
        assert_eq!(folded.len(), 2);
    }

    #[test]
    fn test_is_child() {
        assert!(is_child("/", "/a"));
        assert!(is_child("/a", "/a/b"));
        assert!(!is_child("/a", "/a"));
        assert!(!is_child("/a", "/ab"));
        assert!(!is_child("/a/b", "/a"));
    }
}

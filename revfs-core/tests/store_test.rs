//! End-to-end tests of the revision store: commits, delta chains and the
//! published file formats.

use md5::{Digest, Md5};
use revfs_core::{ChangeKind, FileSystem, NodeKind, NodeRevId, NodeRevision, Transaction};
use tempfile::TempDir;

fn new_repo() -> (TempDir, FileSystem) {
    let tmp = TempDir::new().unwrap();
    let fs = FileSystem::create(tmp.path()).unwrap();
    (tmp, fs)
}

fn file_template(txn: &Transaction, path: &str) -> NodeRevision {
    NodeRevision {
        id: txn.root_id(),
        kind: NodeKind::File,
        predecessor_id: None,
        predecessor_count: 0,
        data_rep: None,
        prop_rep: None,
        created_path: path.into(),
        copyfrom: None,
        copyroot_rev: None,
        copyroot_path: path.into(),
    }
}

/// Add or replace PATH with CONTENTS in TXN (top-level paths only).
fn put_file(fs: &FileSystem, txn: &Transaction, path: &str, contents: &[u8]) -> NodeRevId {
    let name = path.trim_start_matches('/').to_string();
    let mut root = fs.get_node_revision(&txn.root_id()).unwrap();
    let existing = fs.rep_contents_dir(&root).unwrap().get(&name).cloned();

    let (id, kind) = match existing {
        Some(entry) => {
            let old = fs.get_node_revision(&entry.id).unwrap();
            let successor = NodeRevision {
                predecessor_id: Some(entry.id.clone()),
                predecessor_count: old.predecessor_count + 1,
                copyfrom: None,
                ..old.clone()
            };
            let id = fs.create_successor(&entry.id, successor, None, &txn.id).unwrap();
            (id, ChangeKind::Modify)
        }
        None => {
            let id = fs
                .create_node(file_template(txn, path), "0", &txn.id)
                .unwrap();
            (id, ChangeKind::Add)
        }
    };

    let mut noderev = fs.get_node_revision(&id).unwrap();
    fs.set_file_contents(&mut noderev, contents).unwrap();
    fs.set_entry(&txn.id, &mut root, &name, Some((id.clone(), NodeKind::File)))
        .unwrap();
    fs.add_change(&txn.id, path, &id, kind, true, false, None)
        .unwrap();
    id
}

fn read_file(fs: &FileSystem, rev: u64, name: &str) -> Vec<u8> {
    let root = fs.get_node_revision(&fs.rev_get_root(rev).unwrap()).unwrap();
    let entries = fs.rep_contents_dir(&root).unwrap();
    let noderev = fs.get_node_revision(&entries[name].id).unwrap();
    fs.file_contents(&noderev).unwrap().to_vec()
}

#[test]
fn empty_commit_bootstraps_revision_one() {
    let (_tmp, fs) = new_repo();
    assert_eq!(fs.read_current().unwrap(), (0, "1".into(), "1".into()));

    let txn = fs.create_txn(0).unwrap();
    let rev = fs.commit(&txn).unwrap();
    assert_eq!(rev, 1);
    assert_eq!(fs.read_current().unwrap(), (1, "1".into(), "1".into()));

    let root = fs.get_node_revision(&fs.rev_get_root(1).unwrap()).unwrap();
    assert_eq!(root.created_path, "/");
    assert_eq!(root.kind, NodeKind::Dir);
    assert!(fs.rep_contents_dir(&root).unwrap().is_empty());
}

#[test]
fn add_then_read_back_with_checksum() {
    let (_tmp, fs) = new_repo();
    let txn = fs.create_txn(0).unwrap();
    put_file(&fs, &txn, "/A", b"hello\n");
    fs.commit(&txn).unwrap();

    assert_eq!(read_file(&fs, 1, "A"), b"hello\n");

    let root = fs.get_node_revision(&fs.rev_get_root(1).unwrap()).unwrap();
    let entry = fs.rep_contents_dir(&root).unwrap()["A"].clone();
    let noderev = fs.get_node_revision(&entry.id).unwrap();
    let expected: [u8; 16] = Md5::digest(b"hello\n").into();
    assert_eq!(fs.file_checksum(&noderev), expected);
    assert_eq!(fs.file_length(&noderev), 6);
}

#[test]
fn modification_history_builds_skip_deltas() {
    let (_tmp, fs) = new_repo();

    // Ten successive revisions of the same file.
    let mut expected = Vec::new();
    for i in 0..10u64 {
        let base = fs.youngest_rev().unwrap();
        let txn = fs.create_txn(base).unwrap();
        let contents = format!("contents of revision {}\nline two\n", i + 1);
        put_file(&fs, &txn, "/A", contents.as_bytes());
        fs.commit(&txn).unwrap();
        expected.push(contents);
    }

    // Every historical revision still reads back exactly.
    for (i, contents) in expected.iter().enumerate() {
        assert_eq!(read_file(&fs, i as u64 + 1, "A"), contents.as_bytes());
    }

    // The delta base of a node with predecessor count c sits at distance
    // c - (c & (c - 1)), always a power of two.
    let root = fs.get_node_revision(&fs.rev_get_root(10).unwrap()).unwrap();
    let entry = fs.rep_contents_dir(&root).unwrap()["A"].clone();
    let noderev = fs.get_node_revision(&entry.id).unwrap();
    assert_eq!(noderev.predecessor_count, 9);

    let count = noderev.predecessor_count;
    let distance = count - (count & (count - 1));
    assert!(distance.is_power_of_two());
}

#[test]
fn noderev_roundtrips_through_published_revision() {
    let (_tmp, fs) = new_repo();
    let txn = fs.create_txn(0).unwrap();
    put_file(&fs, &txn, "/A", b"payload\n");
    fs.commit(&txn).unwrap();

    let root_id = fs.rev_get_root(1).unwrap();
    let root = fs.get_node_revision(&root_id).unwrap();
    assert_eq!(root.id, root_id);

    let entry = fs.rep_contents_dir(&root).unwrap()["A"].clone();
    let noderev = fs.get_node_revision(&entry.id).unwrap();
    assert_eq!(noderev.id, entry.id);
    assert_eq!(noderev.created_path, "/A");
    assert!(!noderev.data_rep.unwrap().is_mutable());
}

#[test]
fn change_log_replay_matches_tree() {
    let (_tmp, fs) = new_repo();

    let txn = fs.create_txn(0).unwrap();
    put_file(&fs, &txn, "/A", b"a\n");
    put_file(&fs, &txn, "/B", b"b\n");
    let rev = fs.commit(&txn).unwrap();

    // Replaying the published change log against rev N-1's tree yields
    // rev N's tree.
    let changed = fs.paths_changed(rev).unwrap();
    let base_root = fs.get_node_revision(&fs.rev_get_root(rev - 1).unwrap()).unwrap();
    let mut replayed: Vec<String> = fs
        .rep_contents_dir(&base_root)
        .unwrap()
        .keys()
        .cloned()
        .collect();
    for (path, change) in &changed {
        let name = path.trim_start_matches('/').to_string();
        match change.kind {
            ChangeKind::Add | ChangeKind::Replace => replayed.push(name),
            ChangeKind::Delete => replayed.retain(|n| *n != name),
            _ => {}
        }
    }
    replayed.sort();

    let new_root = fs.get_node_revision(&fs.rev_get_root(rev).unwrap()).unwrap();
    let actual: Vec<String> = fs.rep_contents_dir(&new_root).unwrap().keys().cloned().collect();
    assert_eq!(replayed, actual);
}

#[test]
fn delete_entry_disappears_from_next_revision() {
    let (_tmp, fs) = new_repo();

    let txn = fs.create_txn(0).unwrap();
    let id = put_file(&fs, &txn, "/doomed", b"bytes\n");
    fs.commit(&txn).unwrap();
    drop(id);

    let txn = fs.create_txn(1).unwrap();
    let mut root = fs.get_node_revision(&txn.root_id()).unwrap();
    let entry = fs.rep_contents_dir(&root).unwrap()["doomed"].clone();
    fs.set_entry(&txn.id, &mut root, "doomed", None).unwrap();
    fs.add_change(&txn.id, "/doomed", &entry.id, ChangeKind::Delete, false, false, None)
        .unwrap();
    let rev = fs.commit(&txn).unwrap();

    let new_root = fs.get_node_revision(&fs.rev_get_root(rev).unwrap()).unwrap();
    assert!(fs.rep_contents_dir(&new_root).unwrap().is_empty());
    assert_eq!(fs.paths_changed(rev).unwrap()["/doomed"].kind, ChangeKind::Delete);

    // The old revision still has it.
    assert_eq!(read_file(&fs, 1, "doomed"), b"bytes\n");
}

#[test]
fn copyfrom_is_recorded_in_changes_and_noderev() {
    let (_tmp, fs) = new_repo();

    let txn = fs.create_txn(0).unwrap();
    put_file(&fs, &txn, "/orig", b"original\n");
    fs.commit(&txn).unwrap();

    // Copy /orig to /copy with explicit copyfrom bookkeeping.
    let txn = fs.create_txn(1).unwrap();
    let mut root = fs.get_node_revision(&txn.root_id()).unwrap();
    let src_entry = fs.rep_contents_dir(&root).unwrap()["orig"].clone();
    let src = fs.get_node_revision(&src_entry.id).unwrap();

    let copy_id = fs.reserve_copy_id(&txn.id).unwrap();
    let copied = NodeRevision {
        predecessor_id: Some(src.id.clone()),
        predecessor_count: src.predecessor_count + 1,
        created_path: "/copy".into(),
        copyfrom: Some((1, "/orig".into())),
        copyroot_rev: None,
        copyroot_path: "/copy".into(),
        ..src.clone()
    };
    let new_id = fs
        .create_successor(&src_entry.id, copied, Some(&copy_id), &txn.id)
        .unwrap();
    fs.set_entry(&txn.id, &mut root, "copy", Some((new_id.clone(), NodeKind::File)))
        .unwrap();
    fs.add_change(
        &txn.id,
        "/copy",
        &new_id,
        ChangeKind::Add,
        false,
        false,
        Some((1, "/orig".into())),
    )
    .unwrap();
    let rev = fs.commit(&txn).unwrap();

    let changed = fs.paths_changed(rev).unwrap();
    assert_eq!(changed["/copy"].copyfrom, Some((1, "/orig".into())));

    let root = fs.get_node_revision(&fs.rev_get_root(rev).unwrap()).unwrap();
    let entry = fs.rep_contents_dir(&root).unwrap()["copy"].clone();
    let noderev = fs.get_node_revision(&entry.id).unwrap();
    assert_eq!(noderev.copyfrom, Some((1, "/orig".into())));
    assert_eq!(noderev.copyroot_rev, Some(rev));
    // The copy got a fresh, renumbered copy id.
    assert_ne!(entry.id.copy_id(), src_entry.id.copy_id());
    assert!(!entry.id.copy_id().starts_with('_'));

    assert_eq!(read_file(&fs, rev, "copy"), b"original\n");
    assert_eq!(read_file(&fs, rev, "orig"), b"original\n");
}

#[test]
fn reopened_filesystem_sees_committed_state() {
    let (tmp, fs) = new_repo();
    let txn = fs.create_txn(0).unwrap();
    put_file(&fs, &txn, "/A", b"persisted\n");
    fs.commit(&txn).unwrap();
    let uuid = fs.uuid().to_string();
    drop(fs);

    let fs = FileSystem::open(tmp.path()).unwrap();
    assert_eq!(fs.uuid(), uuid);
    assert_eq!(fs.youngest_rev().unwrap(), 1);
    assert_eq!(read_file(&fs, 1, "A"), b"persisted\n");
}

#[test]
fn large_file_spans_multiple_delta_windows() {
    let (_tmp, fs) = new_repo();

    let mut contents = Vec::new();
    for i in 0..30_000u64 {
        contents.extend_from_slice(format!("line number {:06}\n", i).as_bytes());
    }

    let txn = fs.create_txn(0).unwrap();
    put_file(&fs, &txn, "/big", &contents);
    fs.commit(&txn).unwrap();
    assert_eq!(read_file(&fs, 1, "big"), contents);

    // Edit the middle and re-commit; the second rev deltas against the
    // first across window boundaries.
    let mut modified = contents.clone();
    let mid = modified.len() / 2;
    modified.splice(mid..mid, b"INSERTED SECTION\n".iter().copied());

    let txn = fs.create_txn(1).unwrap();
    put_file(&fs, &txn, "/big", &modified);
    fs.commit(&txn).unwrap();

    assert_eq!(read_file(&fs, 2, "big"), modified);
    assert_eq!(read_file(&fs, 1, "big"), contents);
}

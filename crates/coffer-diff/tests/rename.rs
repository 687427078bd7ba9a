use bstr::BString;
use coffer_diff::{
    detect_renames, diff_snapshots, diff_trees, ChangeKind, RenameConfig, Snapshot,
    SnapshotEntry, MAX_SCORE,
};
use coffer_hash::ObjectId;
use coffer_object::{FileMode, Tree, TreeEntry};
use coffer_store::{MemoryStore, ObjectStore};

fn write_tree(store: &MemoryStore, entries: &[(&str, FileMode, ObjectId)]) -> ObjectId {
    let tree = Tree {
        entries: entries
            .iter()
            .map(|(name, mode, oid)| TreeEntry {
                mode: *mode,
                name: (*name).into(),
                oid: *oid,
            })
            .collect(),
    };
    store.write_tree(&tree).unwrap()
}

#[test]
fn exact_rename_is_collapsed() {
    let store = MemoryStore::new();
    let blob = store.write_blob(b"unchanged content\n").unwrap();
    let old = write_tree(&store, &[("old.txt", FileMode::Regular, blob)]);
    let new = write_tree(&store, &[("new.txt", FileMode::Regular, blob)]);

    let changes = diff_trees(&store, Some(&old), Some(&new)).unwrap();
    let outcome = detect_renames(&store, changes, &RenameConfig::default()).unwrap();

    assert_eq!(outcome.renames, 1);
    assert_eq!(outcome.changes.len(), 1);
    let r = &outcome.changes[0];
    assert_eq!(r.kind, ChangeKind::Renamed);
    assert_eq!(r.old_path.as_ref().unwrap(), &BString::from("old.txt"));
    assert_eq!(r.new_path.as_ref().unwrap(), &BString::from("new.txt"));
    assert_eq!(r.score, Some(MAX_SCORE));
}

#[test]
fn mostly_copied_file_scores_as_a_rename() {
    let store = MemoryStore::new();
    // 100 bytes in ten 10-byte lines.
    let mut original = Vec::new();
    for i in 0..10 {
        original.extend_from_slice(format!("line-{i:03}.\n").as_bytes());
    }
    assert_eq!(original.len(), 100);
    // Keep 95 of those bytes, append 5 new ones.
    let mut edited = original[..95].to_vec();
    edited.extend_from_slice(b"tail\n");
    assert_eq!(edited.len(), 100);

    let old_blob = store.write_blob(&original).unwrap();
    let new_blob = store.write_blob(&edited).unwrap();
    let old = write_tree(&store, &[("old.txt", FileMode::Regular, old_blob)]);
    let new = write_tree(&store, &[("new.txt", FileMode::Regular, new_blob)]);

    let changes = diff_trees(&store, Some(&old), Some(&new)).unwrap();
    let outcome = detect_renames(&store, changes, &RenameConfig::default()).unwrap();

    assert_eq!(outcome.changes.len(), 1, "one rename, not delete plus add");
    let r = &outcome.changes[0];
    assert_eq!(r.kind, ChangeKind::Renamed);
    assert_eq!(r.old_path.as_ref().unwrap(), &BString::from("old.txt"));
    assert_eq!(r.new_path.as_ref().unwrap(), &BString::from("new.txt"));
    assert!(r.score.unwrap() >= MAX_SCORE / 2, "score {:?}", r.score);
}

#[test]
fn exact_match_goes_to_one_destination_only() {
    let store = MemoryStore::new();
    let blob = store.write_blob(b"shared bytes\n").unwrap();
    let old = write_tree(&store, &[("src", FileMode::Tree, {
        write_tree(&store, &[("util.rs", FileMode::Regular, blob)])
    })]);
    let lib = write_tree(&store, &[("util.rs", FileMode::Regular, blob)]);
    let zeta = write_tree(&store, &[("other.rs", FileMode::Regular, blob)]);
    let new = write_tree(
        &store,
        &[("lib", FileMode::Tree, lib), ("zeta", FileMode::Tree, zeta)],
    );

    let changes = diff_trees(&store, Some(&old), Some(&new)).unwrap();
    let outcome = detect_renames(&store, changes, &RenameConfig::default()).unwrap();

    // The basename match wins the single source; the other copy of the
    // content stays a plain addition.
    let mut kinds: Vec<_> = outcome
        .changes
        .iter()
        .map(|c| (c.kind, c.path().clone()))
        .collect();
    kinds.sort_by(|a, b| a.1.cmp(&b.1));
    assert_eq!(
        kinds,
        vec![
            (ChangeKind::Renamed, BString::from("lib/util.rs")),
            (ChangeKind::Added, BString::from("zeta/other.rs")),
        ]
    );
}

#[test]
fn copy_detection_pairs_a_surviving_source() {
    let store = MemoryStore::new();
    let v1 = store.write_blob(b"original text\n").unwrap();
    let v2 = store.write_blob(b"edited text\n").unwrap();
    let old = write_tree(&store, &[("a.txt", FileMode::Regular, v1)]);
    let new = write_tree(
        &store,
        &[
            ("a.txt", FileMode::Regular, v2),
            ("b.txt", FileMode::Regular, v1),
        ],
    );

    let changes = diff_trees(&store, Some(&old), Some(&new)).unwrap();
    let config = RenameConfig {
        detect_copies: true,
        ..RenameConfig::default()
    };
    let outcome = detect_renames(&store, changes, &config).unwrap();

    let mut summary: Vec<_> = outcome
        .changes
        .iter()
        .map(|c| (c.kind, c.path().clone()))
        .collect();
    summary.sort_by(|a, b| a.1.cmp(&b.1));
    assert_eq!(
        summary,
        vec![
            (ChangeKind::Modified, BString::from("a.txt")),
            (ChangeKind::Copied, BString::from("b.txt")),
        ]
    );
    let copied = outcome
        .changes
        .iter()
        .find(|c| c.kind == ChangeKind::Copied)
        .unwrap();
    assert_eq!(copied.old_path.as_ref().unwrap(), &BString::from("a.txt"));
    assert_eq!(copied.score, Some(MAX_SCORE));
}

#[test]
fn without_copy_mode_the_modified_source_is_not_reused() {
    let store = MemoryStore::new();
    let v1 = store.write_blob(b"original text\n").unwrap();
    let v2 = store.write_blob(b"edited text\n").unwrap();
    let old = write_tree(&store, &[("a.txt", FileMode::Regular, v1)]);
    let new = write_tree(
        &store,
        &[
            ("a.txt", FileMode::Regular, v2),
            ("b.txt", FileMode::Regular, v1),
        ],
    );

    let changes = diff_trees(&store, Some(&old), Some(&new)).unwrap();
    let outcome = detect_renames(&store, changes, &RenameConfig::default()).unwrap();
    assert_eq!(outcome.renames, 0);
    assert!(outcome
        .changes
        .iter()
        .any(|c| c.kind == ChangeKind::Added && c.path() == &BString::from("b.txt")));
}

#[test]
fn candidate_limit_skips_the_fuzzy_pass() {
    let store = MemoryStore::new();
    let mut old_entries = Vec::new();
    let mut new_entries = Vec::new();
    for i in 0..3 {
        let src = store
            .write_blob(format!("file {i} body body body\n").as_bytes())
            .unwrap();
        let dst = store
            .write_blob(format!("file {i} body body body edited\n").as_bytes())
            .unwrap();
        old_entries.push((format!("src-{i}.txt"), src));
        new_entries.push((format!("dst-{i}.txt"), dst));
    }
    let old_refs: Vec<_> = old_entries
        .iter()
        .map(|(n, o)| (n.as_str(), FileMode::Regular, *o))
        .collect();
    let new_refs: Vec<_> = new_entries
        .iter()
        .map(|(n, o)| (n.as_str(), FileMode::Regular, *o))
        .collect();
    let old = write_tree(&store, &old_refs);
    let new = write_tree(&store, &new_refs);

    let changes = diff_trees(&store, Some(&old), Some(&new)).unwrap();
    let config = RenameConfig {
        limit: 2,
        ..RenameConfig::default()
    };
    let outcome = detect_renames(&store, changes, &config).unwrap();

    assert_eq!(outcome.renames, 0);
    assert_eq!(outcome.needed_limit, Some(3));
    assert_eq!(outcome.changes.len(), 6, "all records left untouched");
}

#[test]
fn exact_only_mode_ignores_similar_content() {
    let store = MemoryStore::new();
    let src = store.write_blob(b"alpha\nbeta\ngamma\n").unwrap();
    let dst = store.write_blob(b"alpha\nbeta\ngamma\ndelta\n").unwrap();
    let old = write_tree(&store, &[("a", FileMode::Regular, src)]);
    let new = write_tree(&store, &[("b", FileMode::Regular, dst)]);

    let changes = diff_trees(&store, Some(&old), Some(&new)).unwrap();
    let config = RenameConfig {
        minimum_score: MAX_SCORE,
        ..RenameConfig::default()
    };
    let outcome = detect_renames(&store, changes, &config).unwrap();
    assert_eq!(outcome.renames, 0);
    assert_eq!(outcome.changes.len(), 2);
}

#[test]
fn symlink_rename_requires_matching_mode() {
    let store = MemoryStore::new();
    let target = store.write_blob(b"target/path").unwrap();
    let old = Snapshot {
        entries: vec![SnapshotEntry {
            path: "link".into(),
            mode: FileMode::Symlink,
            oid: target,
        }],
        unmerged: Vec::new(),
    };
    let new = Snapshot {
        entries: vec![SnapshotEntry {
            path: "file".into(),
            mode: FileMode::Regular,
            oid: target,
        }],
        unmerged: Vec::new(),
    };

    let changes = diff_snapshots(&old, &new);
    let outcome = detect_renames(&store, changes, &RenameConfig::default()).unwrap();
    assert_eq!(outcome.renames, 0);
    assert_eq!(outcome.changes.len(), 2);
}

#[test]
fn symlink_rename_with_same_mode_matches_exactly() {
    let store = MemoryStore::new();
    let target = store.write_blob(b"target/path").unwrap();
    let entry = |path: &str| SnapshotEntry {
        path: path.into(),
        mode: FileMode::Symlink,
        oid: target,
    };
    let old = Snapshot {
        entries: vec![entry("link-old")],
        unmerged: Vec::new(),
    };
    let new = Snapshot {
        entries: vec![entry("link-new")],
        unmerged: Vec::new(),
    };

    let changes = diff_snapshots(&old, &new);
    let outcome = detect_renames(&store, changes, &RenameConfig::default()).unwrap();
    assert_eq!(outcome.renames, 1);
    assert_eq!(outcome.changes[0].kind, ChangeKind::Renamed);
}

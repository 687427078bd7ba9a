//! End-to-end staging table tests: on-disk round trips, working-tree
//! refresh (including the racy-timestamp window), and tree building.

use std::fs;
use std::time::{Duration, UNIX_EPOCH};

use bstr::BString;
use coffer_hash::ObjectId;
use coffer_index::{
    AddFlags, CacheNode, CacheTree, ChangeFlags, EntryFlags, EntryState, Index, IndexEntry,
    ResolveUndo, ResolveUndoEntry, Stage, StatConfig, StatData,
};
use coffer_object::{FileMode, ObjectType};
use coffer_store::{hash_object, MemoryStore, ObjectStore};
use proptest::prelude::*;

fn blob_entry(path: &str, content: &[u8]) -> IndexEntry {
    let oid = hash_object(ObjectType::Blob, content).unwrap();
    IndexEntry {
        path: path.into(),
        oid,
        mode: FileMode::Regular,
        stage: Stage::Normal,
        stat: StatData {
            ctime_secs: 1_000,
            mtime_secs: 1_000,
            size: content.len() as u32,
            ..Default::default()
        },
        flags: EntryFlags::empty(),
    }
}

/// Entry mirroring a real working-tree file, stat cache included.
fn worktree_entry(dir: &std::path::Path, path: &str, content: &[u8]) -> IndexEntry {
    let full = dir.join(path);
    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&full, content).unwrap();
    let meta = fs::symlink_metadata(&full).unwrap();
    IndexEntry {
        path: path.into(),
        oid: hash_object(ObjectType::Blob, content).unwrap(),
        mode: FileMode::Regular,
        stage: Stage::Normal,
        stat: StatData::from_metadata(&meta),
        flags: EntryFlags::empty(),
    }
}

#[test]
fn round_trip_preserves_entries_and_extensions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index");

    let mut index = Index::new();
    for (p, content) in [("a.txt", b"alpha".as_slice()), ("sub/b.txt", b"beta")] {
        index.add_entry(blob_entry(p, content), AddFlags::empty()).unwrap();
    }
    index.set_cache_tree(Some(CacheTree {
        root: CacheNode {
            name: "".into(),
            covered: -1,
            oid: None,
            children: vec![],
        },
    }));
    index.set_resolve_undo(Some(ResolveUndo {
        entries: vec![ResolveUndoEntry {
            path: "a.txt".into(),
            modes: [Some(FileMode::Regular), Some(FileMode::Regular), None],
            oids: [Some(ObjectId::EMPTY_BLOB), Some(ObjectId::EMPTY_BLOB), None],
        }],
    }));

    index.write_to(&path).unwrap();
    assert!(!index.is_dirty());
    assert_eq!(index.version(), 2);

    let loaded = Index::read_from(&path).unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(
        loaded.get("a.txt".into(), Stage::Normal).unwrap().oid,
        index.get("a.txt".into(), Stage::Normal).unwrap().oid
    );
    assert!(loaded.cache_tree().is_some());
    assert_eq!(loaded.resolve_undo().unwrap().entries.len(), 1);
}

#[test]
fn unmodified_index_reserializes_byte_identically() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("index.1");
    let second = dir.path().join("index.2");

    let mut index = Index::new();
    for p in ["a", "b/c", "b/d", "long/nested/path/file.txt"] {
        index.add_entry(blob_entry(p, p.as_bytes()), AddFlags::empty()).unwrap();
    }
    index.write_to(&first).unwrap();

    let mut loaded = Index::read_from(&first).unwrap();
    loaded.write_to(&second).unwrap();

    assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
}

#[test]
fn extended_flags_force_version_three() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index");

    let mut index = Index::new();
    let mut e = blob_entry("later.txt", b"");
    e.flags.insert(EntryFlags::INTENT_TO_ADD);
    index.add_entry(e, AddFlags::empty()).unwrap();
    index
        .add_entry(blob_entry("plain.txt", b"x"), AddFlags::empty())
        .unwrap();
    index.write_to(&path).unwrap();
    assert_eq!(index.version(), 3);

    let loaded = Index::read_from(&path).unwrap();
    assert_eq!(loaded.version(), 3);
    let e = loaded.get("later.txt".into(), Stage::Normal).unwrap();
    assert!(e.flags.contains(EntryFlags::INTENT_TO_ADD));
    let plain = loaded.get("plain.txt".into(), Stage::Normal).unwrap();
    assert!(!plain.flags.contains(EntryFlags::INTENT_TO_ADD));
}

#[test]
fn refresh_reports_modified_and_missing() {
    let work = tempfile::tempdir().unwrap();
    let mut index = Index::new();
    index
        .add_entry(worktree_entry(work.path(), "same.txt", b"stable"), AddFlags::empty())
        .unwrap();
    index
        .add_entry(worktree_entry(work.path(), "grow.txt", b"ab"), AddFlags::empty())
        .unwrap();
    index
        .add_entry(worktree_entry(work.path(), "gone.txt", b"bye"), AddFlags::empty())
        .unwrap();

    fs::write(work.path().join("grow.txt"), b"abcdef").unwrap();
    fs::remove_file(work.path().join("gone.txt")).unwrap();

    let mut report = index.refresh(work.path(), &StatConfig::default()).unwrap();
    report.sort_by(|a, b| a.0.cmp(&b.0));

    assert_eq!(report.len(), 2);
    assert_eq!(report[0].0, "gone.txt");
    assert_eq!(report[0].1, EntryState::Missing);
    assert_eq!(report[1].0, "grow.txt");
    match report[1].1 {
        EntryState::Modified(flags) => assert!(flags.contains(ChangeFlags::DATA_CHANGED)),
        other => panic!("expected modified, got {other:?}"),
    }

    let same = index.get("same.txt".into(), Stage::Normal).unwrap();
    assert!(same.flags.contains(EntryFlags::UPTODATE));
}

#[test]
fn refresh_reports_unmerged_entries() {
    let work = tempfile::tempdir().unwrap();
    let mut index = Index::new();
    let mut e = blob_entry("conflict.txt", b"ours");
    e.stage = Stage::Ours;
    index.add_entry(e, AddFlags::empty()).unwrap();

    let report = index.refresh(work.path(), &StatConfig::default()).unwrap();
    assert_eq!(report, vec![(BString::from("conflict.txt"), EntryState::Unmerged)]);
}

/// Reproduce the same-tick race: content rewritten with identical size
/// and an mtime equal to the index's own mtime. The stat comparison
/// sees nothing; only the racy path may catch it.
#[test]
fn racy_entry_is_caught_in_both_modes() {
    let work = tempfile::tempdir().unwrap();
    let index_path = work.path().join("index");

    let mut index = Index::new();
    index
        .add_entry(worktree_entry(work.path(), "f", b"old!"), AddFlags::empty())
        .unwrap();
    index.write_to(&index_path).unwrap();
    let ts = index.timestamp().unwrap();

    // Same size, new content, mtime pinned to the index mtime.
    fs::write(work.path().join("f"), b"new!").unwrap();
    let pinned = UNIX_EPOCH + Duration::new(ts.0 as u64, ts.1);
    let file = fs::File::options()
        .write(true)
        .open(work.path().join("f"))
        .unwrap();
    file.set_modified(pinned).unwrap();
    drop(file);

    // Pin the cached stat to the same tick, as if staging had happened
    // just before the second write.
    let meta = fs::symlink_metadata(work.path().join("f")).unwrap();
    let mut entry = index.get("f".into(), Stage::Normal).unwrap().clone();
    entry.stat = StatData::from_metadata(&meta);
    entry.oid = hash_object(ObjectType::Blob, b"old!").unwrap();
    index.add_entry(entry, AddFlags::empty()).unwrap();

    let strict = StatConfig {
        racy_is_dirty: true,
        ..Default::default()
    };
    let report = index.refresh(work.path(), &strict).unwrap();
    assert_eq!(report.len(), 1, "strict mode must flag the racy entry");
    assert!(matches!(report[0].1, EntryState::Modified(_)));

    let report = index.refresh(work.path(), &StatConfig::default()).unwrap();
    assert_eq!(report.len(), 1, "content re-check must see the new bytes");
    match report[0].1 {
        EntryState::Modified(flags) => assert!(flags.contains(ChangeFlags::DATA_CHANGED)),
        other => panic!("expected modified, got {other:?}"),
    }
}

#[test]
fn racy_entry_with_unchanged_content_stays_clean() {
    let work = tempfile::tempdir().unwrap();
    let index_path = work.path().join("index");

    let mut index = Index::new();
    index
        .add_entry(worktree_entry(work.path(), "f", b"same"), AddFlags::empty())
        .unwrap();
    index.write_to(&index_path).unwrap();
    let ts = index.timestamp().unwrap();

    let pinned = UNIX_EPOCH + Duration::new(ts.0 as u64, ts.1);
    let file = fs::File::options()
        .write(true)
        .open(work.path().join("f"))
        .unwrap();
    file.set_modified(pinned).unwrap();
    drop(file);

    let meta = fs::symlink_metadata(work.path().join("f")).unwrap();
    let mut entry = index.get("f".into(), Stage::Normal).unwrap().clone();
    entry.stat = StatData::from_metadata(&meta);
    index.add_entry(entry, AddFlags::empty()).unwrap();

    let report = index.refresh(work.path(), &StatConfig::default()).unwrap();
    assert!(report.is_empty(), "matching content must not be flagged");
}

/// A smudged entry carries a zeroed cached size over an unchanged file.
/// Refresh must rehash instead of trusting the size mismatch, then
/// repair the stat cache so the next refresh stays on the cheap path.
#[test]
fn smudged_entry_recovers_when_content_matches() {
    let work = tempfile::tempdir().unwrap();
    let mut index = Index::new();
    let mut entry = worktree_entry(work.path(), "f", b"data");
    entry.stat.size = 0;
    index.add_entry(entry, AddFlags::empty()).unwrap();

    let report = index.refresh(work.path(), &StatConfig::default()).unwrap();
    assert!(report.is_empty(), "unchanged content must come back clean");

    let e = index.get("f".into(), Stage::Normal).unwrap();
    assert_eq!(e.stat.size, 4, "stat cache must be repaired");
    assert!(e.flags.contains(EntryFlags::UPTODATE));
}

#[test]
fn smudged_entry_with_changed_content_is_modified() {
    let work = tempfile::tempdir().unwrap();
    let mut index = Index::new();
    let mut entry = worktree_entry(work.path(), "f", b"old!");
    entry.stat.size = 0;
    index.add_entry(entry, AddFlags::empty()).unwrap();

    fs::write(work.path().join("f"), b"new!").unwrap();

    let report = index.refresh(work.path(), &StatConfig::default()).unwrap();
    assert_eq!(report.len(), 1);
    match report[0].1 {
        EntryState::Modified(flags) => assert!(flags.contains(ChangeFlags::DATA_CHANGED)),
        other => panic!("expected modified, got {other:?}"),
    }
}

/// Adding the first file of a directory the cache tree has never seen
/// must still invalidate the root's cached id.
#[test]
fn adding_a_file_in_an_untracked_directory_invalidates_the_cache_tree() {
    let mut index = Index::new();
    index.set_cache_tree(Some(CacheTree {
        root: CacheNode {
            name: "".into(),
            covered: 0,
            oid: Some(ObjectId::EMPTY_BLOB),
            children: vec![],
        },
    }));

    index
        .add_entry(blob_entry("newdir/file", b"x"), AddFlags::empty())
        .unwrap();

    assert!(index.cache_tree().unwrap().root_oid().is_none());
}

#[test]
fn preload_marks_matching_entries() {
    let work = tempfile::tempdir().unwrap();
    let mut index = Index::new();
    // Enough entries to clear the per-thread workload threshold.
    for i in 0..1100 {
        let name = format!("f{i:04}");
        index
            .add_entry(worktree_entry(work.path(), &name, b"x"), AddFlags::empty())
            .unwrap();
    }
    fs::write(work.path().join("f0000"), b"xyz").unwrap();

    index.preload(work.path(), &StatConfig::default());

    let marked = index
        .iter()
        .filter(|e| e.flags.contains(EntryFlags::UPTODATE))
        .count();
    assert_eq!(marked, 1099);
    let touched = index.get("f0000".into(), Stage::Normal).unwrap();
    assert!(!touched.flags.contains(EntryFlags::UPTODATE));
}

#[test]
fn write_tree_builds_nested_hierarchy() {
    let store = MemoryStore::new();
    let mut index = Index::new();
    for (p, content) in [
        ("README", b"top".as_slice()),
        ("src/lib.rs", b"code"),
        ("src/util/mod.rs", b"more"),
    ] {
        index.add_entry(blob_entry(p, content), AddFlags::empty()).unwrap();
    }

    let root = index.write_tree(&store).unwrap();
    let tree = store.read_tree(&root).unwrap();
    assert_eq!(tree.len(), 2);
    assert_eq!(tree.entries[0].name, "README");
    assert_eq!(tree.entries[1].name, "src");
    assert!(tree.entries[1].mode.is_tree());

    let src = store.read_tree(&tree.entries[1].oid).unwrap();
    assert_eq!(src.len(), 2);
    assert_eq!(src.entries[0].name, "lib.rs");
    assert_eq!(src.entries[1].name, "util");

    let util = store.read_tree(&src.entries[1].oid).unwrap();
    assert_eq!(util.len(), 1);
    assert_eq!(util.entries[0].name, "mod.rs");
}

#[test]
fn write_tree_rejects_unmerged_entries() {
    let store = MemoryStore::new();
    let mut index = Index::new();
    let mut e = blob_entry("f", b"ours");
    e.stage = Stage::Ours;
    index.add_entry(e, AddFlags::empty()).unwrap();
    assert!(index.write_tree(&store).is_err());
}

proptest! {
    /// The sorted (path, stage) invariant survives any interleaving of
    /// adds and removals, and binary search stays consistent with it.
    #[test]
    fn ordering_invariant_under_random_ops(
        ops in prop::collection::vec(
            (
                "[abc]{1,2}(/[abc]{1,2}){0,2}",
                0u8..4,
                prop::bool::ANY,
            ),
            1..60,
        )
    ) {
        let mut index = Index::new();
        for (path, stage, is_add) in ops {
            let stage = Stage::from_u8(stage).unwrap();
            if is_add {
                let mut e = blob_entry(&path, path.as_bytes());
                e.stage = stage;
                // Directory/file clashes are legitimate rejections.
                let _ = index.add_entry(e, AddFlags::empty());
            } else {
                index.remove_path(path.as_str().into());
            }

            let entries = index.entries();
            for pair in entries.windows(2) {
                let key0 = (pair[0].path.clone(), pair[0].stage.as_u8());
                let key1 = (pair[1].path.clone(), pair[1].stage.as_u8());
                prop_assert!(key0 < key1, "entries out of order: {key0:?} {key1:?}");
            }
            for (i, e) in entries.iter().enumerate() {
                prop_assert_eq!(index.entry_pos(e.path.as_ref(), e.stage), Ok(i));
            }
        }
    }
}

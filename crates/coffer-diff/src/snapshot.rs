//! Path snapshots: the flattened (path, mode, id) sequences the differ
//! walks.
//!
//! Both sources produce entries sorted by full path bytes. The staging
//! table keeps that order natively; a recursive tree flatten preserves it
//! because tree-entry ordering compares a directory name as if it ended in
//! `/`, which is exactly how the directory's children will compare once
//! their paths are joined.

use bstr::{BString, ByteVec};
use coffer_hash::ObjectId;
use coffer_index::{Index, Stage};
use coffer_object::FileMode;
use coffer_store::ObjectStore;

use crate::DiffError;

/// One leaf of a snapshot: a blob, symlink, or commit link. Directories
/// are flattened away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub path: BString,
    pub mode: FileMode,
    pub oid: ObjectId,
}

/// A sorted sequence of leaves plus the conflicted paths that have no
/// resolved leaf to show.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub entries: Vec<SnapshotEntry>,
    /// Paths present only as conflict stages, sorted, deduplicated.
    pub unmerged: Vec<BString>,
}

impl Snapshot {
    /// Flatten a tree object recursively. `None` stands for the empty tree.
    pub fn from_tree(
        store: &dyn ObjectStore,
        root: Option<&ObjectId>,
    ) -> Result<Self, DiffError> {
        let mut entries = Vec::new();
        if let Some(oid) = root {
            flatten(store, oid, &BString::default(), &mut entries)?;
        }
        Ok(Snapshot {
            entries,
            unmerged: Vec::new(),
        })
    }

    /// Take the resolved (stage 0) entries of the staging table; paths that
    /// only exist as conflict stages are reported as unmerged.
    pub fn from_index(index: &Index) -> Self {
        let mut entries = Vec::new();
        let mut unmerged: Vec<BString> = Vec::new();
        for entry in index.iter() {
            if entry.stage == Stage::Normal {
                entries.push(SnapshotEntry {
                    path: entry.path.clone(),
                    mode: entry.mode,
                    oid: entry.oid,
                });
            } else if unmerged.last().map(|p| p != &entry.path).unwrap_or(true) {
                unmerged.push(entry.path.clone());
            }
        }
        Snapshot { entries, unmerged }
    }
}

fn flatten(
    store: &dyn ObjectStore,
    oid: &ObjectId,
    prefix: &BString,
    out: &mut Vec<SnapshotEntry>,
) -> Result<(), DiffError> {
    let tree = store.read_tree(oid)?;
    for entry in tree.iter() {
        let mut path = prefix.clone();
        if !path.is_empty() {
            path.push_byte(b'/');
        }
        path.extend_from_slice(&entry.name);
        if entry.mode.is_tree() {
            flatten(store, &entry.oid, &path, out)?;
        } else {
            out.push(SnapshotEntry {
                path,
                mode: entry.mode,
                oid: entry.oid,
            });
        }
    }
    Ok(())
}

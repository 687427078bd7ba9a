//! Structural diff: a merge walk over two sorted snapshots.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use bstr::BString;
use coffer_object::FileMode;

use crate::snapshot::{Snapshot, SnapshotEntry};
use crate::{ChangeKind, FileChange};

/// Compare two snapshots, emitting one record per differing path.
///
/// Unmodified paths are dropped. A path carrying conflict stages on either
/// side yields a single [`ChangeKind::Unmerged`] record and suppresses any
/// added/deleted/modified record it would otherwise produce. Output is
/// sorted by path.
pub fn diff_snapshots(old: &Snapshot, new: &Snapshot) -> Vec<FileChange> {
    let unmerged: BTreeSet<BString> = old
        .unmerged
        .iter()
        .chain(new.unmerged.iter())
        .cloned()
        .collect();

    let mut changes = Vec::new();
    let mut oi = 0;
    let mut ni = 0;
    loop {
        let change = match (old.entries.get(oi), new.entries.get(ni)) {
            (Some(o), Some(n)) => match o.path.cmp(&n.path) {
                Ordering::Less => {
                    oi += 1;
                    FileChange::deleted(o.path.clone(), o.mode, o.oid)
                }
                Ordering::Greater => {
                    ni += 1;
                    FileChange::added(n.path.clone(), n.mode, n.oid)
                }
                Ordering::Equal => {
                    oi += 1;
                    ni += 1;
                    match changed_pair(o, n) {
                        Some(change) => change,
                        None => continue,
                    }
                }
            },
            (Some(o), None) => {
                oi += 1;
                FileChange::deleted(o.path.clone(), o.mode, o.oid)
            }
            (None, Some(n)) => {
                ni += 1;
                FileChange::added(n.path.clone(), n.mode, n.oid)
            }
            (None, None) => break,
        };
        if !unmerged.contains(change.path()) {
            changes.push(change);
        }
    }

    if unmerged.is_empty() {
        return changes;
    }
    merge_unmerged(changes, &unmerged)
}

/// A modified or type-changed record for a path present on both sides,
/// `None` when nothing changed.
fn changed_pair(o: &SnapshotEntry, n: &SnapshotEntry) -> Option<FileChange> {
    if o.oid == n.oid && o.mode == n.mode {
        return None;
    }
    let kind = if mode_class_equal(o.mode, n.mode) {
        ChangeKind::Modified
    } else {
        ChangeKind::TypeChanged
    };
    Some(FileChange {
        kind,
        old_path: Some(o.path.clone()),
        new_path: Some(n.path.clone()),
        old_mode: Some(o.mode),
        new_mode: Some(n.mode),
        old_oid: Some(o.oid),
        new_oid: Some(n.oid),
        score: None,
    })
}

/// Whether two modes store the same class of content (the executable bit
/// alone is not a type change).
fn mode_class_equal(a: FileMode, b: FileMode) -> bool {
    a.is_blob() == b.is_blob()
        && a.is_symlink() == b.is_symlink()
        && a.is_commitlink() == b.is_commitlink()
}

/// Weave the unmerged records into the path-sorted change list.
fn merge_unmerged(changes: Vec<FileChange>, unmerged: &BTreeSet<BString>) -> Vec<FileChange> {
    let mut out = Vec::with_capacity(changes.len() + unmerged.len());
    let mut pending = unmerged.iter().peekable();
    for change in changes {
        while let Some(path) = pending.peek() {
            if **path < *change.path() {
                out.push(FileChange::unmerged((*path).clone()));
                pending.next();
            } else {
                break;
            }
        }
        out.push(change);
    }
    for path in pending {
        out.push(FileChange::unmerged(path.clone()));
    }
    out
}

//! Snapshot diffing for the coffer storage engine.
//!
//! A diff runs in two phases. The structural phase merge-walks two sorted
//! path snapshots (flattened trees or the staging table) and emits one
//! [`FileChange`] per path that differs. The rename phase then post-processes
//! that list, collapsing delete/add pairs whose content is identical or
//! sufficiently similar into single rename or copy records.

mod diff;
mod rename;
mod similarity;
mod snapshot;

use bstr::BString;
use coffer_hash::ObjectId;
use coffer_object::FileMode;
use coffer_store::ObjectStore;

pub use diff::diff_snapshots;
pub use error::DiffError;
pub use rename::{detect_renames, RenameConfig, RenameOutcome, DEFAULT_RENAME_SCORE, MAX_SCORE};
pub use snapshot::{Snapshot, SnapshotEntry};

mod error {
    use coffer_store::StoreError;

    #[derive(Debug, thiserror::Error)]
    pub enum DiffError {
        #[error(transparent)]
        Store(#[from] StoreError),
    }
}

/// What happened to a path between the two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Deleted,
    Modified,
    /// Mode class changed (e.g. a regular file became a symlink).
    TypeChanged,
    Renamed,
    Copied,
    /// The path carries unresolved conflict stages in the index.
    Unmerged,
}

impl ChangeKind {
    /// Single-letter status code.
    pub fn as_char(&self) -> char {
        match self {
            Self::Added => 'A',
            Self::Deleted => 'D',
            Self::Modified => 'M',
            Self::TypeChanged => 'T',
            Self::Renamed => 'R',
            Self::Copied => 'C',
            Self::Unmerged => 'U',
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// One per-path change record.
///
/// `old_*` fields describe the pre-image side, `new_*` the post-image side;
/// a side that does not exist (the old side of an addition, the new side of
/// a deletion) is `None` throughout.
///
/// `score` is a similarity score on the [`MAX_SCORE`] scale for rename and
/// copy records. On a `Deleted` record it marks a broken pair left behind by
/// an upstream break pass: the deletion is the severed half of a rewrite and
/// rename detection may re-claim it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub kind: ChangeKind,
    pub old_path: Option<BString>,
    pub new_path: Option<BString>,
    pub old_mode: Option<FileMode>,
    pub new_mode: Option<FileMode>,
    pub old_oid: Option<ObjectId>,
    pub new_oid: Option<ObjectId>,
    pub score: Option<u16>,
}

impl FileChange {
    pub fn added(path: BString, mode: FileMode, oid: ObjectId) -> Self {
        FileChange {
            kind: ChangeKind::Added,
            old_path: None,
            new_path: Some(path),
            old_mode: None,
            new_mode: Some(mode),
            old_oid: None,
            new_oid: Some(oid),
            score: None,
        }
    }

    pub fn deleted(path: BString, mode: FileMode, oid: ObjectId) -> Self {
        FileChange {
            kind: ChangeKind::Deleted,
            old_path: Some(path),
            new_path: None,
            old_mode: Some(mode),
            new_mode: None,
            old_oid: Some(oid),
            new_oid: None,
            score: None,
        }
    }

    pub fn unmerged(path: BString) -> Self {
        FileChange {
            kind: ChangeKind::Unmerged,
            old_path: Some(path.clone()),
            new_path: Some(path),
            old_mode: None,
            new_mode: None,
            old_oid: None,
            new_oid: None,
            score: None,
        }
    }

    /// The path a human would report for this change (the post-image side
    /// when it exists).
    pub fn path(&self) -> &BString {
        match (&self.new_path, &self.old_path) {
            (Some(p), _) => p,
            (None, Some(p)) => p,
            (None, None) => unreachable!("change record with no path"),
        }
    }
}

/// Structural diff of two trees. Either side may be `None` for the empty
/// tree.
pub fn diff_trees(
    store: &dyn ObjectStore,
    old_tree: Option<&ObjectId>,
    new_tree: Option<&ObjectId>,
) -> Result<Vec<FileChange>, DiffError> {
    let old = Snapshot::from_tree(store, old_tree)?;
    let new = Snapshot::from_tree(store, new_tree)?;
    Ok(diff_snapshots(&old, &new))
}

/// Structural diff of a tree (pre-image) against the staging table
/// (post-image). Conflicted paths surface as [`ChangeKind::Unmerged`].
pub fn diff_tree_index(
    store: &dyn ObjectStore,
    old_tree: Option<&ObjectId>,
    index: &coffer_index::Index,
) -> Result<Vec<FileChange>, DiffError> {
    let old = Snapshot::from_tree(store, old_tree)?;
    let new = Snapshot::from_index(index);
    Ok(diff_snapshots(&old, &new))
}

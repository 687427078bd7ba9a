//! Staging table for the coffer storage engine.
//!
//! The index is the authoritative record of what the next snapshot will
//! contain: a sorted array of path entries, each carrying a content id,
//! a file mode, a merge stage, and a cached stat snapshot used to detect
//! working-tree modification without rehashing. It persists as a single
//! binary file with a trailing checksum, written atomically through a
//! lock file.

pub mod entry;
pub mod extensions;
mod preload;
mod read;
mod refresh;
mod write;

use std::collections::HashSet;
use std::path::Path;

use bitflags::bitflags;
use bstr::{BStr, BString, ByteSlice};
use coffer_hash::ObjectId;
use coffer_object::{df_name_compare, FileMode};
use coffer_store::ObjectStore;

pub use entry::{EntryFlags, IndexEntry, Stage, StatData};
pub use error::IndexError;
pub use extensions::tree::{CacheNode, CacheTree};
pub use extensions::{RawExtension, ResolveUndo, ResolveUndoEntry};
pub use refresh::{ChangeFlags, EntryState, StatConfig};

mod error {
    use bstr::BString;

    #[derive(Debug, thiserror::Error)]
    pub enum IndexError {
        #[error("invalid index header: {0}")]
        InvalidHeader(String),

        #[error("unsupported index version: {0}")]
        UnsupportedVersion(u32),

        #[error("index checksum mismatch")]
        ChecksumMismatch,

        #[error("invalid index entry at offset {offset}: {reason}")]
        InvalidEntry { offset: usize, reason: String },

        #[error("invalid extension '{sig}': {reason}")]
        InvalidExtension { sig: String, reason: String },

        #[error("invalid path: {0}")]
        InvalidPath(BString),

        #[error("entry already exists: {0}")]
        EntryExists(BString),

        #[error("'{path}' clashes with a tracked file or directory")]
        Conflict { path: BString },

        #[error("unmerged entry: {0}")]
        Unmerged(BString),

        #[error(transparent)]
        Lock(#[from] coffer_utils::LockError),

        #[error(transparent)]
        Hash(#[from] coffer_hash::HashError),

        #[error(transparent)]
        Store(#[from] coffer_store::StoreError),

        #[error(transparent)]
        Io(#[from] std::io::Error),
    }
}

bitflags! {
    /// Options for [`Index::add_entry`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AddFlags: u32 {
        /// Fail instead of replacing an existing (path, stage) entry.
        const NEW_ONLY = 1 << 0;
        /// Resolve file/directory clashes by evicting the conflicting
        /// entries instead of rejecting the insert.
        const OK_TO_REPLACE = 1 << 1;
        /// Skip the file/directory clash checks entirely. Only safe when
        /// the caller has pre-validated the whole entry set, e.g. when
        /// populating from a tree.
        const SKIP_CONFLICT_CHECK = 1 << 2;
        /// Append without searching for a position. The caller promises
        /// entries arrive in sorted order.
        const JUST_APPEND = 1 << 3;
    }
}

/// The staging table: sorted entries plus extension data and the
/// timestamp of the last on-disk synchronization.
pub struct Index {
    /// On-disk format version (2 or 3).
    version: u32,
    /// Entries sorted by (path bytes, stage).
    entries: Vec<IndexEntry>,
    /// Paths present at any stage, for sort-independent existence checks.
    names: HashSet<BString>,
    /// Mtime of the index file at last load/write. Entries whose own
    /// mtime is at or past this point are "racy" and cannot be trusted
    /// on stat data alone.
    timestamp: Option<(u32, u32)>,
    cache_tree: Option<CacheTree>,
    resolve_undo: Option<ResolveUndo>,
    /// Unrecognized optional extensions, preserved for round-trip.
    unknown_extensions: Vec<RawExtension>,
    dirty: bool,
}

impl Index {
    pub fn new() -> Self {
        Self {
            version: 2,
            entries: Vec::new(),
            names: HashSet::new(),
            timestamp: None,
            cache_tree: None,
            resolve_undo: None,
            unknown_extensions: Vec::new(),
            dirty: false,
        }
    }

    /// Read the index file at `path` (memory-mapped).
    pub fn read_from(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let file = std::fs::File::open(path.as_ref())?;
        let meta = file.metadata()?;
        let data = unsafe { memmap2::Mmap::map(&file) }?;
        let mut index = read::parse_index(&data)?;
        let st = StatData::from_metadata(&meta);
        index.timestamp = Some((st.mtime_secs, st.mtime_nsecs));
        Ok(index)
    }

    /// Write the index to `path` atomically through a lock file. The
    /// index timestamp is updated from the written file, so subsequent
    /// racy-entry decisions are made against the new mtime.
    pub fn write_to(&mut self, path: impl AsRef<Path>) -> Result<(), IndexError> {
        write::write_index(self, path.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Mtime of the backing file at last load/write, if any.
    pub fn timestamp(&self) -> Option<(u32, u32)> {
        self.timestamp
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Binary search by (path, stage): `Ok(pos)` for an exact hit,
    /// `Err(pos)` with the insertion point otherwise.
    pub fn entry_pos(&self, path: &BStr, stage: Stage) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| {
            e.path
                .as_slice()
                .cmp(path.as_bytes())
                .then(e.stage.as_u8().cmp(&stage.as_u8()))
        })
    }

    pub fn get(&self, path: &BStr, stage: Stage) -> Option<&IndexEntry> {
        self.entry_pos(path, stage).ok().map(|i| &self.entries[i])
    }

    /// Whether any entry (at any stage) records this exact path.
    pub fn has_path(&self, path: &BStr) -> bool {
        self.names.contains(path)
    }

    /// Whether any entry for `path` sits at a conflict stage.
    pub fn has_conflict(&self, path: &BStr) -> bool {
        let start = self.first_for_path(path);
        self.entries[start..]
            .iter()
            .take_while(|e| e.path.as_slice() == path.as_bytes())
            .any(|e| e.stage != Stage::Normal)
    }

    /// First position whose path is `>= path`, ignoring stages.
    fn first_for_path(&self, path: &BStr) -> usize {
        self.entries
            .partition_point(|e| e.path.as_slice() < path.as_bytes())
    }

    /// Insert or replace an entry, preserving every table invariant.
    ///
    /// In order: path validation, cache-tree invalidation, exact-slot
    /// replace, collapse of conflict stages under a resolved entry, and
    /// the two file/directory clash checks. With
    /// [`AddFlags::OK_TO_REPLACE`] a clash evicts the older entries and
    /// the insertion point is recomputed, since eviction shifts the
    /// array.
    pub fn add_entry(&mut self, entry: IndexEntry, flags: AddFlags) -> Result<(), IndexError> {
        verify_path(entry.path.as_ref(), entry.mode)?;

        if let Some(tree) = &mut self.cache_tree {
            tree.invalidate(entry.path.as_ref());
        }

        if flags.contains(AddFlags::JUST_APPEND) {
            self.names.insert(entry.path.clone());
            self.entries.push(entry);
            self.dirty = true;
            return Ok(());
        }

        let mut pos = match self.entry_pos(entry.path.as_ref(), entry.stage) {
            Ok(i) => {
                if flags.contains(AddFlags::NEW_ONLY) {
                    return Err(IndexError::EntryExists(entry.path));
                }
                self.entries[i] = entry;
                self.dirty = true;
                return Ok(());
            }
            Err(i) => i,
        };

        // A resolved entry supersedes conflict stages recorded for the
        // same path.
        if entry.stage == Stage::Normal && self.names.contains(entry.path.as_bstr()) {
            let start = self.first_for_path(entry.path.as_ref());
            while start < self.entries.len() && self.entries[start].path == entry.path {
                self.remove_at(start);
            }
            pos = match self.entry_pos(entry.path.as_ref(), entry.stage) {
                Ok(i) | Err(i) => i,
            };
        }

        if !flags.contains(AddFlags::SKIP_CONFLICT_CHECK) {
            let ok_to_replace = flags.contains(AddFlags::OK_TO_REPLACE);
            let clashes = self.find_clashes(entry.path.as_ref(), pos, ok_to_replace)?;
            if !clashes.is_empty() {
                for i in clashes {
                    self.entries[i].flags.insert(EntryFlags::REMOVE);
                }
                self.remove_marked();
                pos = match self.entry_pos(entry.path.as_ref(), entry.stage) {
                    Ok(i) | Err(i) => i,
                };
            }
        }

        self.names.insert(entry.path.clone());
        self.entries.insert(pos, entry);
        self.dirty = true;
        Ok(())
    }

    /// Positions of entries that clash with inserting `path` as a file.
    /// With `ok_to_replace` unset, the first clash is an error instead.
    fn find_clashes(
        &self,
        path: &BStr,
        pos: usize,
        ok_to_replace: bool,
    ) -> Result<Vec<usize>, IndexError> {
        let mut clashes = Vec::new();

        // Forward scan: an entry named `path/...` means a tracked
        // directory already occupies this name. Entries sharing the
        // leading bytes cluster right after the insertion point, and
        // `df_name_compare` reports Equal exactly when the candidate
        // file and the tracked directory collide.
        for (i, e) in self.entries.iter().enumerate().skip(pos) {
            if e.path.len() <= path.len() {
                break;
            }
            if &e.path[..path.len()] != path.as_bytes() {
                break;
            }
            if df_name_compare(path.as_bytes(), true, &e.path, false) == std::cmp::Ordering::Equal {
                if !ok_to_replace {
                    return Err(IndexError::Conflict {
                        path: path.to_owned(),
                    });
                }
                clashes.push(i);
            }
        }

        // Backward walk: each directory prefix of `path` must not be
        // tracked as a file.
        let bytes = path.as_bytes();
        let mut end = bytes.len();
        while let Some(slash) = bytes[..end].iter().rposition(|&b| b == b'/') {
            let prefix = BStr::new(&bytes[..slash]);
            if self.names.contains(prefix) {
                if !ok_to_replace {
                    return Err(IndexError::Conflict {
                        path: path.to_owned(),
                    });
                }
                let start = self.first_for_path(prefix);
                let mut i = start;
                while i < self.entries.len() && self.entries[i].path.as_slice() == prefix.as_bytes()
                {
                    clashes.push(i);
                    i += 1;
                }
            }
            end = slash;
        }

        Ok(clashes)
    }

    /// Remove the entry at `pos`, preserving order (the sorted invariant
    /// is load-bearing, so this shifts rather than swaps).
    pub fn remove_at(&mut self, pos: usize) -> IndexEntry {
        let entry = self.entries.remove(pos);
        if let Some(tree) = &mut self.cache_tree {
            tree.invalidate(entry.path.as_ref());
        }
        let start = self.first_for_path(entry.path.as_ref());
        let still_present = self
            .entries
            .get(start)
            .is_some_and(|e| e.path == entry.path);
        if !still_present {
            self.names.remove(entry.path.as_bstr());
        }
        self.dirty = true;
        entry
    }

    /// Drop every entry carrying [`EntryFlags::REMOVE`] in one
    /// compaction pass. Returns how many were dropped.
    pub fn remove_marked(&mut self) -> usize {
        let before = self.entries.len();
        let mut evicted = Vec::new();
        self.entries.retain(|e| {
            if e.flags.contains(EntryFlags::REMOVE) {
                evicted.push(e.path.clone());
                false
            } else {
                true
            }
        });
        let removed = before - self.entries.len();
        if removed > 0 {
            if let Some(tree) = &mut self.cache_tree {
                for path in &evicted {
                    tree.invalidate(path.as_ref());
                }
            }
            self.names = self.entries.iter().map(|e| e.path.clone()).collect();
            self.dirty = true;
        }
        removed
    }

    /// Remove all stages of `path`. Returns whether anything was
    /// removed.
    pub fn remove_path(&mut self, path: &BStr) -> bool {
        let start = self.first_for_path(path);
        let mut n = 0;
        while start + n < self.entries.len()
            && self.entries[start + n].path.as_slice() == path.as_bytes()
        {
            n += 1;
        }
        if n == 0 {
            return false;
        }
        self.entries.drain(start..start + n);
        self.names.remove(path);
        if let Some(tree) = &mut self.cache_tree {
            tree.invalidate(path);
        }
        self.dirty = true;
        true
    }

    /// Re-validate every resolved entry against the working tree rooted
    /// at `worktree`. Entries changed only in metadata-noise categories
    /// are refreshed in place; the returned list holds everything that
    /// is not clean.
    pub fn refresh(
        &mut self,
        worktree: &Path,
        config: &StatConfig,
    ) -> Result<Vec<(BString, EntryState)>, IndexError> {
        refresh::refresh_index(self, worktree, config)
    }

    /// Warm the [`EntryFlags::UPTODATE`] marks in parallel ahead of a
    /// real refresh. Purely an optimization; small indexes are skipped.
    pub fn preload(&mut self, worktree: &Path, config: &StatConfig) {
        preload::preload_index(self, worktree, config);
    }

    /// Build the tree-object hierarchy for the resolved entries and
    /// return the root tree id. Fails on unmerged entries.
    pub fn write_tree(&self, store: &dyn ObjectStore) -> Result<ObjectId, IndexError> {
        write::write_tree_from_index(self, store)
    }

    pub fn cache_tree(&self) -> Option<&CacheTree> {
        self.cache_tree.as_ref()
    }

    pub fn set_cache_tree(&mut self, tree: Option<CacheTree>) {
        self.cache_tree = tree;
        self.dirty = true;
    }

    pub fn resolve_undo(&self) -> Option<&ResolveUndo> {
        self.resolve_undo.as_ref()
    }

    pub fn set_resolve_undo(&mut self, reuc: Option<ResolveUndo>) {
        self.resolve_undo = reuc;
        self.dirty = true;
    }
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a candidate index path: relative, normalized, and not
/// reaching into the reserved `.coffer` metadata directory. Directory
/// modes are rejected outright; directories exist in the index only
/// implicitly, as path prefixes.
pub fn verify_path(path: &BStr, mode: FileMode) -> Result<(), IndexError> {
    let bytes = path.as_bytes();
    if bytes.is_empty()
        || bytes[0] == b'/'
        || bytes.last() == Some(&b'/')
        || bytes.contains(&0)
        || mode == FileMode::Tree
    {
        return Err(IndexError::InvalidPath(path.to_owned()));
    }
    for component in bytes.split(|&b| b == b'/') {
        let reserved = matches!(component, b"" | b"." | b"..")
            || component.eq_ignore_ascii_case(b".coffer");
        if reserved {
            return Err(IndexError::InvalidPath(path.to_owned()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str) -> IndexEntry {
        IndexEntry::from_tree(path.into(), FileMode::Regular, ObjectId::NULL, Stage::Normal)
    }

    #[test]
    fn verify_path_rejects_traversal_and_reserved_names() {
        for bad in [
            "", "/abs", "trail/", "a//b", "./x", "a/./b", "../x", "a/../b", ".coffer/config",
            "a/.CoFFeR/b", ".", "..",
        ] {
            assert!(
                verify_path(bad.into(), FileMode::Regular).is_err(),
                "{bad:?} should be rejected"
            );
        }
        for good in ["a", "a/b", "a.b/c.d", ".cofferx", "coffer/.git-ish"] {
            assert!(
                verify_path(good.into(), FileMode::Regular).is_ok(),
                "{good:?} should be accepted"
            );
        }
    }

    #[test]
    fn verify_path_rejects_directory_mode() {
        assert!(verify_path("dir".into(), FileMode::Tree).is_err());
        assert!(verify_path("sub".into(), FileMode::Commitlink).is_ok());
    }

    #[test]
    fn entries_stay_sorted() {
        let mut index = Index::new();
        for p in ["zz", "a/b", "m", "a/a", "a.c"] {
            index.add_entry(entry(p), AddFlags::empty()).unwrap();
        }
        let paths: Vec<_> = index.iter().map(|e| e.path.clone()).collect();
        assert_eq!(paths, ["a.c", "a/a", "a/b", "m", "zz"]);
    }

    #[test]
    fn exact_replace_and_new_only() {
        let mut index = Index::new();
        index.add_entry(entry("f"), AddFlags::empty()).unwrap();
        let mut e = entry("f");
        e.oid = coffer_hash::ObjectId::EMPTY_BLOB;
        index.add_entry(e.clone(), AddFlags::empty()).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("f".into(), Stage::Normal).unwrap().oid, e.oid);

        assert!(matches!(
            index.add_entry(entry("f"), AddFlags::NEW_ONLY),
            Err(IndexError::EntryExists(_))
        ));
    }

    #[test]
    fn resolved_entry_collapses_conflict_stages() {
        let mut index = Index::new();
        for stage in [Stage::Base, Stage::Ours, Stage::Theirs] {
            let e = IndexEntry::from_tree("f".into(), FileMode::Regular, ObjectId::NULL, stage);
            index.add_entry(e, AddFlags::empty()).unwrap();
        }
        assert_eq!(index.len(), 3);
        assert!(index.has_conflict("f".into()));

        index.add_entry(entry("f"), AddFlags::empty()).unwrap();
        assert_eq!(index.len(), 1);
        assert!(!index.has_conflict("f".into()));
        assert_eq!(
            index.get("f".into(), Stage::Normal).unwrap().stage,
            Stage::Normal
        );
    }

    #[test]
    fn file_over_directory_is_rejected() {
        let mut index = Index::new();
        index.add_entry(entry("a/b"), AddFlags::empty()).unwrap();
        assert!(matches!(
            index.add_entry(entry("a"), AddFlags::empty()),
            Err(IndexError::Conflict { .. })
        ));
        // The near-miss "a.c" does not clash with "a/b".
        index.add_entry(entry("a.c"), AddFlags::empty()).unwrap();
    }

    #[test]
    fn directory_over_file_is_rejected() {
        let mut index = Index::new();
        index.add_entry(entry("a"), AddFlags::empty()).unwrap();
        assert!(matches!(
            index.add_entry(entry("a/b"), AddFlags::empty()),
            Err(IndexError::Conflict { .. })
        ));
    }

    #[test]
    fn ok_to_replace_evicts_both_directions() {
        let mut index = Index::new();
        index.add_entry(entry("a/b"), AddFlags::empty()).unwrap();
        index.add_entry(entry("a/c"), AddFlags::empty()).unwrap();
        index.add_entry(entry("a"), AddFlags::OK_TO_REPLACE).unwrap();
        let paths: Vec<_> = index.iter().map(|e| e.path.clone()).collect();
        assert_eq!(paths, ["a"]);

        index
            .add_entry(entry("a/b"), AddFlags::OK_TO_REPLACE)
            .unwrap();
        let paths: Vec<_> = index.iter().map(|e| e.path.clone()).collect();
        assert_eq!(paths, ["a/b"]);
    }

    #[test]
    fn remove_path_drops_every_stage() {
        let mut index = Index::new();
        for stage in [Stage::Base, Stage::Ours] {
            let e = IndexEntry::from_tree("f".into(), FileMode::Regular, ObjectId::NULL, stage);
            index.add_entry(e, AddFlags::empty()).unwrap();
        }
        index.add_entry(entry("g"), AddFlags::empty()).unwrap();
        assert!(index.remove_path("f".into()));
        assert!(!index.remove_path("f".into()));
        assert_eq!(index.len(), 1);
        assert!(!index.has_path("f".into()));
        assert!(index.has_path("g".into()));
    }

    #[test]
    fn remove_marked_compacts_in_one_pass() {
        let mut index = Index::new();
        for p in ["a", "b", "c", "d", "e"] {
            index.add_entry(entry(p), AddFlags::empty()).unwrap();
        }
        for (i, e) in index.entries.iter_mut().enumerate() {
            if i % 2 == 0 {
                e.flags.insert(EntryFlags::REMOVE);
            }
        }
        assert_eq!(index.remove_marked(), 3);
        let paths: Vec<_> = index.iter().map(|e| e.path.clone()).collect();
        assert_eq!(paths, ["b", "d"]);
        assert!(!index.has_path("a".into()));
    }

    #[test]
    fn entry_pos_reports_insertion_points() {
        let mut index = Index::new();
        for p in ["b", "d"] {
            index.add_entry(entry(p), AddFlags::empty()).unwrap();
        }
        assert_eq!(index.entry_pos("a".into(), Stage::Normal), Err(0));
        assert_eq!(index.entry_pos("b".into(), Stage::Normal), Ok(0));
        assert_eq!(index.entry_pos("c".into(), Stage::Normal), Err(1));
        assert_eq!(index.entry_pos("d".into(), Stage::Normal), Ok(1));
        assert_eq!(index.entry_pos("e".into(), Stage::Normal), Err(2));
    }
}

//! Index entry types: IndexEntry, StatData, EntryFlags.

use bitflags::bitflags;
use bstr::BString;
use coffer_hash::ObjectId;
use coffer_object::FileMode;

use crate::IndexError;

/// A single staged path record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Path relative to the working tree root.
    pub path: BString,
    /// Content id of the staged blob.
    pub oid: ObjectId,
    /// File mode.
    pub mode: FileMode,
    /// Merge stage (0 = resolved, 1-3 = conflict sides).
    pub stage: Stage,
    /// Filesystem metadata snapshot from when the content was staged.
    pub stat: StatData,
    /// Entry flags.
    pub flags: EntryFlags,
}

impl IndexEntry {
    /// A bare entry with no stat cache, as produced from tree content
    /// rather than a working-tree file.
    pub fn from_tree(path: BString, mode: FileMode, oid: ObjectId, stage: Stage) -> Self {
        Self {
            path,
            oid,
            mode,
            stage,
            stat: StatData::default(),
            flags: EntryFlags::empty(),
        }
    }
}

/// Cached filesystem metadata, used to answer "is the working copy
/// unchanged" without rehashing content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatData {
    pub ctime_secs: u32,
    pub ctime_nsecs: u32,
    pub mtime_secs: u32,
    pub mtime_nsecs: u32,
    pub dev: u32,
    pub ino: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
}

impl StatData {
    #[cfg(unix)]
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            ctime_secs: meta.ctime() as u32,
            ctime_nsecs: meta.ctime_nsec() as u32,
            mtime_secs: meta.mtime() as u32,
            mtime_nsecs: meta.mtime_nsec() as u32,
            dev: meta.dev() as u32,
            ino: meta.ino() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.len() as u32,
        }
    }

    #[cfg(not(unix))]
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::time::UNIX_EPOCH;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .unwrap_or_default();
        Self {
            ctime_secs: mtime.as_secs() as u32,
            ctime_nsecs: mtime.subsec_nanos(),
            mtime_secs: mtime.as_secs() as u32,
            mtime_nsecs: mtime.subsec_nanos(),
            dev: 0,
            ino: 0,
            uid: 0,
            gid: 0,
            size: meta.len() as u32,
        }
    }
}

bitflags! {
    /// Per-entry flags. The upper group is in-memory bookkeeping and is
    /// never serialized.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u32 {
        /// Assume the working copy matches; refresh skips the entry.
        const ASSUME_VALID = 1 << 0;
        /// Placeholder for a path whose content has not been staged yet.
        const INTENT_TO_ADD = 1 << 1;
        /// The entry should not be materialized in the working tree.
        const SKIP_WORKTREE = 1 << 2;

        /// Marked for removal by the next [`remove_marked`] pass.
        ///
        /// [`remove_marked`]: crate::Index::remove_marked
        const REMOVE = 1 << 16;
        /// Known to match the working copy (set by refresh/preload).
        const UPTODATE = 1 << 17;
    }
}

impl EntryFlags {
    /// Whether any flag that needs the version-3 extended flags word on
    /// disk is set.
    pub fn has_extended(&self) -> bool {
        self.intersects(Self::INTENT_TO_ADD | Self::SKIP_WORKTREE)
    }
}

/// Merge stage of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Resolved entry (stage 0).
    Normal,
    /// Common ancestor side of a conflict (stage 1).
    Base,
    /// Our side of a conflict (stage 2).
    Ours,
    /// Their side of a conflict (stage 3).
    Theirs,
}

impl Stage {
    pub fn as_u8(&self) -> u8 {
        match self {
            Stage::Normal => 0,
            Stage::Base => 1,
            Stage::Ours => 2,
            Stage::Theirs => 3,
        }
    }

    pub fn from_u8(n: u8) -> Result<Self, IndexError> {
        match n {
            0 => Ok(Stage::Normal),
            1 => Ok(Stage::Base),
            2 => Ok(Stage::Ours),
            3 => Ok(Stage::Theirs),
            _ => Err(IndexError::InvalidEntry {
                offset: 0,
                reason: format!("invalid stage: {n}"),
            }),
        }
    }
}

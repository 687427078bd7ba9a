//! Stat-cache validation against the working tree.
//!
//! The cheap path compares cached stat data against a fresh `lstat`,
//! classifying differences into change categories. Content is rehashed
//! only when the stat comparison cannot be trusted: racy mtimes and
//! zero-size suspicion.

use std::fs;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use bstr::{BStr, BString};
use coffer_hash::ObjectId;
use coffer_object::{FileMode, ObjectType};

use crate::entry::{EntryFlags, IndexEntry, Stage, StatData};
use crate::{Index, IndexError};

bitflags! {
    /// Categories of difference between a cached entry and a fresh stat.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChangeFlags: u32 {
        const MODE_CHANGED = 1 << 0;
        const TYPE_CHANGED = 1 << 1;
        const DATA_CHANGED = 1 << 2;
        const MTIME_CHANGED = 1 << 3;
        const CTIME_CHANGED = 1 << 4;
        const OWNER_CHANGED = 1 << 5;
        const INODE_CHANGED = 1 << 6;
    }
}

impl ChangeFlags {
    /// Categories that indicate real content or mode divergence. The
    /// remainder is metadata noise that a refresh absorbs in place.
    pub fn is_content_change(&self) -> bool {
        self.intersects(Self::MODE_CHANGED | Self::TYPE_CHANGED | Self::DATA_CHANGED)
    }
}

/// Runtime knobs for stat comparison. Filesystems differ in what they
/// report faithfully, so none of this is baked into the on-disk format.
#[derive(Debug, Clone, Copy)]
pub struct StatConfig {
    /// Compare nanosecond fields (off for filesystems that truncate).
    pub trust_nsec: bool,
    /// Compare ctime (off when other tools rewrite inodes freely).
    pub trust_ctime: bool,
    /// Compare the executable bit (off for filesystems without one).
    pub trust_exec_bit: bool,
    /// Treat racy-but-stat-clean entries as modified instead of
    /// rehashing their content.
    pub racy_is_dirty: bool,
}

impl Default for StatConfig {
    fn default() -> Self {
        Self {
            trust_nsec: true,
            trust_ctime: true,
            trust_exec_bit: true,
            racy_is_dirty: false,
        }
    }
}

/// Outcome of refreshing one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// The working copy matches the staged content.
    UpToDate,
    /// The working copy diverged in the given categories.
    Modified(ChangeFlags),
    /// The working-tree file no longer exists. Distinct from a content
    /// mismatch; the entry itself is left alone.
    Missing,
    /// The entry sits at a conflict stage and cannot be validated.
    Unmerged,
}

/// An entry whose mtime is at or past the index's own mtime may have
/// been rewritten after it was staged but within the same clock tick,
/// which a stat comparison cannot see.
pub(crate) fn is_racy_timestamp(ts: (u32, u32), stat: &StatData, trust_nsec: bool) -> bool {
    if stat.mtime_secs != ts.0 {
        return stat.mtime_secs > ts.0;
    }
    if trust_nsec {
        stat.mtime_nsecs >= ts.1
    } else {
        true
    }
}

#[cfg(unix)]
pub(crate) fn worktree_path(root: &Path, path: &BStr) -> PathBuf {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;
    root.join(OsStr::from_bytes(path.as_ref()))
}

#[cfg(not(unix))]
pub(crate) fn worktree_path(root: &Path, path: &BStr) -> PathBuf {
    root.join(String::from_utf8_lossy(path.as_ref()).as_ref())
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

/// Mode class observed in the working tree.
pub(crate) fn worktree_mode(meta: &fs::Metadata) -> FileMode {
    let ft = meta.file_type();
    if ft.is_symlink() {
        FileMode::Symlink
    } else if ft.is_dir() {
        FileMode::Tree
    } else if is_executable(meta) {
        FileMode::Executable
    } else {
        FileMode::Regular
    }
}

/// Classify the difference between a cached entry and fresh stat data.
pub(crate) fn match_stat_basic(
    entry: &IndexEntry,
    fresh: &StatData,
    fresh_mode: FileMode,
    config: &StatConfig,
) -> ChangeFlags {
    let mut changed = ChangeFlags::empty();

    // A placeholder entry has no staged content to match against.
    if entry.flags.contains(EntryFlags::INTENT_TO_ADD) {
        return ChangeFlags::DATA_CHANGED | ChangeFlags::TYPE_CHANGED;
    }

    match entry.mode {
        FileMode::Regular | FileMode::Executable => match fresh_mode {
            FileMode::Regular | FileMode::Executable => {
                if config.trust_exec_bit && entry.mode != fresh_mode {
                    changed |= ChangeFlags::MODE_CHANGED;
                }
            }
            _ => changed |= ChangeFlags::TYPE_CHANGED,
        },
        FileMode::Symlink => {
            if fresh_mode != FileMode::Symlink {
                changed |= ChangeFlags::TYPE_CHANGED;
            }
        }
        // A nested checkout is represented by a directory; its content
        // cannot be validated by stat.
        FileMode::Commitlink => {
            if fresh_mode != FileMode::Tree {
                changed |= ChangeFlags::TYPE_CHANGED;
            }
            return changed;
        }
        _ => changed |= ChangeFlags::TYPE_CHANGED,
    }

    if entry.stat.mtime_secs != fresh.mtime_secs
        || (config.trust_nsec && entry.stat.mtime_nsecs != fresh.mtime_nsecs)
    {
        changed |= ChangeFlags::MTIME_CHANGED;
    }
    if config.trust_ctime
        && (entry.stat.ctime_secs != fresh.ctime_secs
            || (config.trust_nsec && entry.stat.ctime_nsecs != fresh.ctime_nsecs))
    {
        changed |= ChangeFlags::CTIME_CHANGED;
    }
    if entry.stat.uid != fresh.uid || entry.stat.gid != fresh.gid {
        changed |= ChangeFlags::OWNER_CHANGED;
    }
    if entry.stat.ino != fresh.ino || entry.stat.dev != fresh.dev {
        changed |= ChangeFlags::INODE_CHANGED;
    }
    if entry.stat.size != fresh.size {
        changed |= ChangeFlags::DATA_CHANGED;
    }

    // A zero cached size is suspicious: entries get smudged to zero at
    // write time when racy. Only a genuinely empty blob may stay clean.
    if entry.stat.size == 0 && entry.oid != ObjectId::EMPTY_BLOB && fresh.size == 0 {
        changed |= ChangeFlags::DATA_CHANGED;
    }

    changed
}

/// Rehash the working-copy content and compare with the staged id.
fn content_matches(entry: &IndexEntry, full: &Path, mode: FileMode) -> Result<bool, IndexError> {
    let data = match mode {
        FileMode::Symlink => link_target_bytes(full)?,
        _ => fs::read(full)?,
    };
    let oid = coffer_store::hash_object(ObjectType::Blob, &data)?;
    Ok(oid == entry.oid)
}

#[cfg(unix)]
fn link_target_bytes(full: &Path) -> Result<Vec<u8>, IndexError> {
    use std::os::unix::ffi::OsStrExt;
    Ok(fs::read_link(full)?.as_os_str().as_bytes().to_vec())
}

#[cfg(not(unix))]
fn link_target_bytes(full: &Path) -> Result<Vec<u8>, IndexError> {
    Ok(fs::read_link(full)?
        .to_string_lossy()
        .as_bytes()
        .to_vec())
}

/// Validate one entry against the working tree, absorbing metadata
/// noise into the stat cache. The caller is responsible for marking the
/// index dirty when the stat cache was touched.
pub(crate) fn refresh_entry(
    entry: &mut IndexEntry,
    root: &Path,
    timestamp: Option<(u32, u32)>,
    config: &StatConfig,
) -> Result<EntryState, IndexError> {
    if entry
        .flags
        .intersects(EntryFlags::ASSUME_VALID | EntryFlags::SKIP_WORKTREE)
    {
        return Ok(EntryState::UpToDate);
    }

    let full = worktree_path(root, entry.path.as_ref());
    let meta = match fs::symlink_metadata(&full) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(EntryState::Missing),
        Err(e) => return Err(e.into()),
    };
    let fresh = StatData::from_metadata(&meta);
    let fresh_mode = worktree_mode(&meta);

    let mut changed = match_stat_basic(entry, &fresh, fresh_mode, config);
    if changed.intersects(ChangeFlags::MODE_CHANGED | ChangeFlags::TYPE_CHANGED) {
        return Ok(EntryState::Modified(changed));
    }
    let mut verified = false;
    if changed.contains(ChangeFlags::DATA_CHANGED) {
        // A nonzero cached size makes the size comparison trustworthy.
        // A zero cached size is what the write-time smudge leaves
        // behind, so only rehashing can tell smudged-but-clean from a
        // real edit.
        if entry.stat.size != 0 || !content_matches(entry, &full, fresh_mode)? {
            return Ok(EntryState::Modified(changed));
        }
        changed.remove(ChangeFlags::DATA_CHANGED);
        verified = true;
    }

    // Stat-clean, but a racy mtime means the comparison proves nothing.
    let racy = timestamp.is_some_and(|ts| is_racy_timestamp(ts, &entry.stat, config.trust_nsec));
    if racy && !verified {
        if config.racy_is_dirty {
            return Ok(EntryState::Modified(changed | ChangeFlags::DATA_CHANGED));
        }
        if !content_matches(entry, &full, fresh_mode)? {
            return Ok(EntryState::Modified(changed | ChangeFlags::DATA_CHANGED));
        }
    }

    if !changed.is_empty() || verified {
        entry.stat = fresh;
    }
    entry.flags.insert(EntryFlags::UPTODATE);
    Ok(EntryState::UpToDate)
}

pub(crate) fn refresh_index(
    index: &mut Index,
    worktree: &Path,
    config: &StatConfig,
) -> Result<Vec<(BString, EntryState)>, IndexError> {
    let timestamp = index.timestamp;
    let mut out = Vec::new();
    let mut touched = false;

    for entry in &mut index.entries {
        if entry.stage != Stage::Normal {
            out.push((entry.path.clone(), EntryState::Unmerged));
            continue;
        }
        if entry.flags.contains(EntryFlags::UPTODATE) {
            continue;
        }
        let before = entry.stat;
        let state = refresh_entry(entry, worktree, timestamp, config)?;
        if entry.stat != before {
            touched = true;
        }
        if state != EntryState::UpToDate {
            out.push((entry.path.clone(), state));
        }
    }

    if touched {
        index.dirty = true;
    }
    Ok(out)
}

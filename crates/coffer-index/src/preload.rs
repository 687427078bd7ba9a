//! Parallel warm-up of the stat cache.
//!
//! Splits the entry array into disjoint contiguous slices and stats each
//! entry's working-tree file on a worker thread, marking clean entries
//! [`EntryFlags::UPTODATE`]. Workers never insert, remove, or reorder,
//! so no synchronization beyond the final join is needed. A later
//! serial refresh then skips everything already marked.

use std::fs;
use std::path::Path;

use crate::entry::{EntryFlags, IndexEntry, Stage, StatData};
use crate::refresh::{self, StatConfig};
use crate::Index;

/// Upper bound on worker threads.
const MAX_PARALLEL: usize = 20;

/// Minimum entries per thread; below twice this the whole exercise
/// costs more than it saves.
const THREAD_COST: usize = 500;

pub(crate) fn preload_index(index: &mut Index, worktree: &Path, config: &StatConfig) {
    let timestamp = index.timestamp;
    let n = index.entries.len();
    if n < THREAD_COST * 2 {
        return;
    }
    let threads = (n / THREAD_COST).min(MAX_PARALLEL);
    let chunk = n.div_ceil(threads);

    let entries = index.entries.as_mut_slice();
    let result = crossbeam::thread::scope(|s| {
        for slice in entries.chunks_mut(chunk) {
            s.spawn(move |_| {
                for entry in slice {
                    mark_if_uptodate(entry, worktree, timestamp, config);
                }
            });
        }
    });
    // Workers only stat and set flags; a panic there is a bug.
    if let Err(panic) = result {
        std::panic::resume_unwind(panic);
    }
}

fn mark_if_uptodate(
    entry: &mut IndexEntry,
    worktree: &Path,
    timestamp: Option<(u32, u32)>,
    config: &StatConfig,
) {
    if entry.stage != Stage::Normal
        || entry.flags.intersects(
            EntryFlags::ASSUME_VALID
                | EntryFlags::SKIP_WORKTREE
                | EntryFlags::INTENT_TO_ADD
                | EntryFlags::UPTODATE,
        )
    {
        return;
    }
    let full = refresh::worktree_path(worktree, entry.path.as_ref());
    let Ok(meta) = fs::symlink_metadata(&full) else {
        return;
    };
    let fresh = StatData::from_metadata(&meta);
    let fresh_mode = refresh::worktree_mode(&meta);
    if !refresh::match_stat_basic(entry, &fresh, fresh_mode, config).is_empty() {
        return;
    }
    let racy =
        timestamp.is_some_and(|ts| refresh::is_racy_timestamp(ts, &entry.stat, config.trust_nsec));
    if !racy {
        entry.flags.insert(EntryFlags::UPTODATE);
    }
}

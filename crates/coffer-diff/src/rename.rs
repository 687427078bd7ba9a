//! Rename and copy detection over a structural change list.
//!
//! Deleted records become rename *sources*, added records become
//! *destinations*. An exact pass matches identical content first, then a
//! fuzzy pass scores every remaining source/destination pair and a greedy
//! walk over the scores (best first) commits the pairs. Greedy assignment
//! is deliberate: it is not an optimal bipartite matching, and on ties the
//! outcome follows the sort order below.

use std::cmp::Ordering;
use std::collections::HashMap;

use bstr::BString;
use coffer_hash::ObjectId;
use coffer_object::{FileMode, ObjectType};
use coffer_store::ObjectStore;

use crate::similarity::count_changes;
use crate::{ChangeKind, DiffError, FileChange};

/// Full scale of the similarity score (an exact match).
pub const MAX_SCORE: u16 = 60000;

/// Default minimum score: 50% of the content must be copied.
pub const DEFAULT_RENAME_SCORE: u16 = 30000;

/// Top candidates retained per destination during the fuzzy pass.
const CANDIDATES_PER_DST: usize = 4;

/// Identical-content alternatives scanned per destination before settling.
const EXACT_ALTERNATIVES_CAP: usize = 100;

/// Hard ceiling on the candidate table sides; beyond it the fuzzy pass is
/// skipped outright.
const LIMIT_CEILING: usize = 32767;

#[derive(Debug, Clone)]
pub struct RenameConfig {
    /// Minimum similarity for a fuzzy rename. [`MAX_SCORE`] means exact
    /// matches only.
    pub minimum_score: u16,
    /// Also pair sources that stay present (or are already claimed),
    /// producing [`ChangeKind::Copied`] records.
    pub detect_copies: bool,
    /// Candidate-count cap per side; `0` means the built-in ceiling.
    pub limit: usize,
}

impl Default for RenameConfig {
    fn default() -> Self {
        RenameConfig {
            minimum_score: DEFAULT_RENAME_SCORE,
            detect_copies: false,
            limit: 0,
        }
    }
}

/// The rewritten change list plus bookkeeping about the detection run.
#[derive(Debug)]
pub struct RenameOutcome {
    pub changes: Vec<FileChange>,
    pub renames: usize,
    /// Set when the fuzzy pass was skipped because the candidate tables
    /// exceeded the limit; holds the limit that would have sufficed.
    pub needed_limit: Option<usize>,
}

struct Source {
    path: BString,
    mode: FileMode,
    oid: ObjectId,
    /// Break score carried over from an upstream break pass, reported as
    /// the pair score when a break is healed back into the same path.
    break_score: u16,
    /// How many pairs (or the surviving original) claim this path.
    used: u32,
}

struct Destination {
    path: BString,
    mode: FileMode,
    oid: ObjectId,
    pair: Option<FileChange>,
}

/// Collapse delete/add pairs in `changes` into rename/copy records.
pub fn detect_renames(
    store: &dyn ObjectStore,
    changes: Vec<FileChange>,
    config: &RenameConfig,
) -> Result<RenameOutcome, DiffError> {
    let minimum_score = if config.minimum_score == 0 {
        DEFAULT_RENAME_SCORE
    } else {
        config.minimum_score
    };

    let mut srcs: Vec<Source> = Vec::new();
    let mut dsts: Vec<Destination> = Vec::new();
    for change in &changes {
        match change.kind {
            ChangeKind::Unmerged => {}
            ChangeKind::Added => {
                if let (Some(path), Some(mode), Some(oid)) =
                    (&change.new_path, change.new_mode, change.new_oid)
                {
                    register_dst(&mut dsts, path.clone(), mode, oid);
                }
            }
            ChangeKind::Deleted => {
                // A broken delete (score present) whose break scored zero
                // means the source really stays; count ourselves as a user
                // so the path is not claimed away.
                let used = u32::from(change.score == Some(0));
                register_src(&mut srcs, source_of(change, used));
            }
            _ if config.detect_copies => {
                // The source survives on the new side; pre-claim it so any
                // match becomes a copy.
                register_src(&mut srcs, source_of(change, 1));
            }
            _ => {}
        }
    }

    let mut outcome = RenameOutcome {
        changes: Vec::new(),
        renames: 0,
        needed_limit: None,
    };

    if !srcs.is_empty() && !dsts.is_empty() {
        outcome.renames = find_exact_renames(&mut srcs, &mut dsts, config.detect_copies);

        if minimum_score < MAX_SCORE {
            let num_create = dsts.iter().filter(|d| d.pair.is_none()).count();
            let num_src = srcs.len();
            if num_create > 0 {
                let limit = match config.limit {
                    0 => LIMIT_CEILING,
                    n => n.min(LIMIT_CEILING),
                };
                if (num_create > limit && num_src > limit)
                    || num_create.saturating_mul(num_src) > limit * limit
                {
                    outcome.needed_limit = Some(num_create.max(num_src));
                } else {
                    outcome.renames += find_fuzzy_renames(
                        store,
                        &mut srcs,
                        &mut dsts,
                        minimum_score,
                        config.detect_copies,
                    )?;
                }
            }
        }
    }

    outcome.changes = rewrite_queue(changes, &srcs, &dsts);
    Ok(outcome)
}

fn source_of(change: &FileChange, used: u32) -> Source {
    Source {
        path: change.old_path.clone().unwrap_or_default(),
        mode: change.old_mode.unwrap_or(FileMode::Regular),
        oid: change.old_oid.unwrap_or(ObjectId::NULL),
        break_score: change.score.unwrap_or(0),
        used,
    }
}

fn register_src(srcs: &mut Vec<Source>, src: Source) {
    if let Err(pos) = srcs.binary_search_by(|s| s.path.cmp(&src.path)) {
        srcs.insert(pos, src);
    }
}

fn register_dst(dsts: &mut Vec<Destination>, path: BString, mode: FileMode, oid: ObjectId) {
    if let Err(pos) = dsts.binary_search_by(|d| d.path.cmp(&path)) {
        dsts.insert(
            pos,
            Destination {
                path,
                mode,
                oid,
                pair: None,
            },
        );
    }
}

fn find_dst(dsts: &[Destination], path: &BString) -> Option<usize> {
    dsts.binary_search_by(|d| d.path.cmp(path)).ok()
}

fn find_src(srcs: &[Source], path: &BString) -> Option<usize> {
    srcs.binary_search_by(|s| s.path.cmp(path)).ok()
}

/// Whether the text after the last `/` is the same on both paths.
fn basename_same(a: &[u8], b: &[u8]) -> bool {
    let mut i = a.len();
    let mut j = b.len();
    while i > 0 && j > 0 {
        i -= 1;
        j -= 1;
        if a[i] != b[j] {
            return false;
        }
        if a[i] == b'/' {
            return true;
        }
    }
    (i == 0 || a[i - 1] == b'/') && (j == 0 || b[j - 1] == b'/')
}

fn record_rename_pair(srcs: &mut [Source], dsts: &mut [Destination], si: usize, di: usize, score: u16) {
    let src = &mut srcs[si];
    let dst = &mut dsts[di];
    debug_assert!(dst.pair.is_none(), "destination already matched");

    // A source claimed before (it survives, or paired already) makes this
    // a copy rather than a rename.
    let kind = if src.used > 0 {
        ChangeKind::Copied
    } else {
        ChangeKind::Renamed
    };
    src.used += 1;

    let pair_score = if src.path == dst.path {
        src.break_score
    } else {
        score
    };
    dst.pair = Some(FileChange {
        kind,
        old_path: Some(src.path.clone()),
        new_path: Some(dst.path.clone()),
        old_mode: Some(src.mode),
        new_mode: Some(dst.mode),
        old_oid: Some(src.oid),
        new_oid: Some(dst.oid),
        score: Some(pair_score),
    });
}

/// Match identical content. Buckets by content id; ids are full digests,
/// so a bucket hit is already an exact content match, and directories can
/// never land in a bucket since snapshots carry only leaves.
fn find_exact_renames(srcs: &mut Vec<Source>, dsts: &mut Vec<Destination>, copies: bool) -> usize {
    #[derive(Default)]
    struct Bucket {
        srcs: Vec<usize>,
        dsts: Vec<usize>,
    }

    let mut buckets: HashMap<ObjectId, Bucket> = HashMap::new();
    for (i, src) in srcs.iter().enumerate() {
        buckets.entry(src.oid).or_default().srcs.push(i);
    }
    for (i, dst) in dsts.iter().enumerate() {
        buckets.entry(dst.oid).or_default().dsts.push(i);
    }

    let mut renames = 0;
    for bucket in buckets.values() {
        if bucket.srcs.is_empty() {
            continue;
        }
        for &di in &bucket.dsts {
            let mut best = None;
            let mut best_score = -1i32;
            let mut alternatives = EXACT_ALTERNATIVES_CAP;
            for &si in &bucket.srcs {
                let src = &srcs[si];
                let dst = &dsts[di];
                // Non-regular files only match mode for mode.
                if (!src.mode.is_regular() || !dst.mode.is_regular()) && src.mode != dst.mode {
                    continue;
                }
                let mut score = i32::from(src.used == 0);
                if src.used > 0 && !copies {
                    continue;
                }
                score += i32::from(basename_same(&src.path, &dst.path));
                if score > best_score {
                    best = Some(si);
                    best_score = score;
                    if score == 2 {
                        break;
                    }
                }
                alternatives -= 1;
                if alternatives == 0 {
                    break;
                }
            }
            if let Some(si) = best {
                record_rename_pair(srcs, dsts, si, di, MAX_SCORE);
                renames += 1;
            }
        }
    }
    renames
}

/// One retained (source, destination) similarity. `dst == usize::MAX`
/// marks an unused slot.
#[derive(Clone, Copy)]
struct Candidate {
    src: usize,
    dst: usize,
    score: u16,
    basename_match: bool,
}

const UNSET: Candidate = Candidate {
    src: 0,
    dst: usize::MAX,
    score: 0,
    basename_match: false,
};

/// Sort order for the global assignment: best first, unused slots last.
fn candidate_order(a: &Candidate, b: &Candidate) -> Ordering {
    match (a.dst == usize::MAX, b.dst == usize::MAX) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b
            .score
            .cmp(&a.score)
            .then(b.basename_match.cmp(&a.basename_match)),
    }
}

fn record_if_better(kept: &mut [Candidate; CANDIDATES_PER_DST], candidate: Candidate) {
    let mut worst = 0;
    for i in 1..CANDIDATES_PER_DST {
        if candidate_order(&kept[i], &kept[worst]) == Ordering::Greater {
            worst = i;
        }
    }
    if candidate_order(&kept[worst], &candidate) == Ordering::Greater {
        kept[worst] = candidate;
    }
}

fn find_fuzzy_renames(
    store: &dyn ObjectStore,
    srcs: &mut [Source],
    dsts: &mut [Destination],
    minimum_score: u16,
    copies: bool,
) -> Result<usize, DiffError> {
    let mut matrix: Vec<Candidate> = Vec::new();
    for (di, dst) in dsts.iter().enumerate() {
        if dst.pair.is_some() {
            continue;
        }
        let mut kept = [UNSET; CANDIDATES_PER_DST];
        for (si, src) in srcs.iter().enumerate() {
            let candidate = Candidate {
                src: si,
                dst: di,
                score: estimate_similarity(store, src, dst, minimum_score)?,
                basename_match: basename_same(&src.path, &dst.path),
            };
            record_if_better(&mut kept, candidate);
        }
        matrix.extend_from_slice(&kept);
    }

    matrix.sort_by(candidate_order);

    let mut renames = assign(srcs, dsts, &matrix, minimum_score, false);
    if copies {
        renames += assign(srcs, dsts, &matrix, minimum_score, true);
    }
    Ok(renames)
}

/// Greedy walk over the score-sorted matrix.
fn assign(
    srcs: &mut [Source],
    dsts: &mut [Destination],
    matrix: &[Candidate],
    minimum_score: u16,
    copies: bool,
) -> usize {
    let mut count = 0;
    for c in matrix {
        if c.dst == usize::MAX || c.score < minimum_score {
            break;
        }
        if dsts[c.dst].pair.is_some() {
            continue;
        }
        if !copies && srcs[c.src].used > 0 {
            continue;
        }
        record_rename_pair(srcs, dsts, c.src, c.dst, c.score);
        count += 1;
    }
    count
}

/// Similarity of two blobs on the [`MAX_SCORE`] scale.
///
/// Only regular files score; everything else is exact-match territory. A
/// cheap size comparison rejects pairs whose size delta alone puts them
/// under the minimum before any content is read.
fn estimate_similarity(
    store: &dyn ObjectStore,
    src: &Source,
    dst: &Destination,
    minimum_score: u16,
) -> Result<u16, DiffError> {
    if !src.mode.is_regular() || !dst.mode.is_regular() {
        return Ok(0);
    }

    let src_size = store.read_header(&src.oid)?.size as u64;
    let dst_size = store.read_header(&dst.oid)?.size as u64;
    let max_size = src_size.max(dst_size);
    let base_size = src_size.min(dst_size);
    let delta_size = max_size - base_size;

    let max_score = u64::from(MAX_SCORE);
    let headroom = max_score - u64::from(minimum_score);
    if max_size == 0 || max_size * headroom < delta_size * max_score {
        return Ok(0);
    }

    let src_data = store.read_typed(&src.oid, ObjectType::Blob)?;
    let dst_data = store.read_typed(&dst.oid, ObjectType::Blob)?;
    let budget = base_size * headroom / max_score;
    let Some((copied, _added)) = count_changes(&src_data, &dst_data, budget) else {
        return Ok(0);
    };

    Ok((copied * max_score / max_size).min(max_score) as u16)
}

/// Rebuild the change list: matched destinations become their rename/copy
/// record, claimed deletions drop out, everything else stays put.
fn rewrite_queue(
    changes: Vec<FileChange>,
    srcs: &[Source],
    dsts: &[Destination],
) -> Vec<FileChange> {
    let mut out = Vec::with_capacity(changes.len());
    for change in changes {
        match change.kind {
            ChangeKind::Added => {
                let pair = change
                    .new_path
                    .as_ref()
                    .and_then(|p| find_dst(dsts, p))
                    .and_then(|di| dsts[di].pair.clone());
                out.push(pair.unwrap_or(change));
            }
            ChangeKind::Deleted => {
                let path = match &change.old_path {
                    Some(p) => p,
                    None => {
                        out.push(change);
                        continue;
                    }
                };
                let drop = if change.score.is_some() {
                    // Broken delete: gone if its counterpart was claimed as
                    // a rename/copy destination.
                    find_dst(dsts, path).is_some_and(|di| dsts[di].pair.is_some())
                } else {
                    find_src(srcs, path).is_some_and(|si| srcs[si].used > 0)
                };
                if !drop {
                    out.push(change);
                }
            }
            _ => out.push(change),
        }
    }
    out
}

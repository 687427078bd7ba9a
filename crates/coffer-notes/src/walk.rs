//! In-order traversal with adaptive fanout tracking.

use bitflags::bitflags;
use coffer_hash::ObjectId;
use coffer_store::ObjectStore;

use crate::non_note::NonNotes;
use crate::trie::{load_subtree, IntNode, Slot, SubtreeRef};
use crate::NotesError;

bitflags! {
    /// Traversal options for [`NotesTree::for_each`](crate::NotesTree::for_each).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WalkFlags: u32 {
        /// Invoke the callback for packed subtrees (with a trailing-slash
        /// path) in addition to notes.
        const YIELD_SUBTREES = 1 << 0;
        /// Leave subtrees at or above the fanout threshold packed instead
        /// of materializing them.
        const DONT_UNPACK_SUBTREES = 1 << 1;
    }
}

/// Callback type for the internal walk. Receives the non-note list so the
/// write-back weave can consume it between notes without aliasing the
/// traversal borrow.
pub(crate) type WalkFn<'a> =
    dyn FnMut(&mut NonNotes, &ObjectId, &ObjectId, &str) -> Result<(), NotesError> + 'a;

/// Decide whether the on-disk fanout deepens at this level.
///
/// Each on-disk fanout level spans two trie levels (one hex pair). At an
/// even level still within reach of the current fanout, a full row of 16
/// internal or subtree children signals plenty of notes below, which is
/// worth another directory level.
fn determine_fanout(node: &IntNode, n: usize, fanout: usize) -> usize {
    if n % 2 == 1 || n > 2 * fanout {
        return fanout;
    }
    for slot in &node.slots {
        match slot {
            Slot::Internal(_) | Slot::Subtree(_) => continue,
            _ => return fanout,
        }
    }
    fanout + 1
}

/// Render a key as its on-disk path: `fanout` leading hex pairs become
/// directory components.
pub(crate) fn path_with_fanout(key: &ObjectId, fanout: usize) -> String {
    let hex = key.to_hex();
    let mut path = String::with_capacity(hex.len() + fanout);
    for (i, pair) in hex.as_bytes().chunks(2).enumerate() {
        if i < fanout {
            path.push(pair[0] as char);
            path.push(pair[1] as char);
            path.push('/');
        } else {
            path.push_str(std::str::from_utf8(pair).unwrap_or(""));
        }
    }
    path
}

/// Path of a still-packed subtree: the full-width rendering truncated to
/// the prefix, with a trailing slash.
fn subtree_path(st: &SubtreeRef, fanout: usize) -> String {
    let full = path_with_fanout(&st.prefix, fanout);
    let keep = (st.prefix_len * 2 + fanout).min(full.len());
    let mut path = full[..keep].to_string();
    if !path.ends_with('/') {
        path.push('/');
    }
    path
}

pub(crate) fn for_each_in(
    store: &dyn ObjectStore,
    non_notes: &mut NonNotes,
    node: &mut IntNode,
    n: usize,
    fanout_in: usize,
    flags: WalkFlags,
    f: &mut WalkFn<'_>,
) -> Result<(), NotesError> {
    let fanout = determine_fanout(node, n, fanout_in);
    for i in 0..16 {
        loop {
            match &mut node.slots[i] {
                Slot::Empty => break,
                Slot::Internal(child) => {
                    for_each_in(store, non_notes, child, n + 1, fanout, flags, f)?;
                    break;
                }
                Slot::Note(l) => {
                    let path = path_with_fanout(&l.key, fanout);
                    f(non_notes, &l.key, &l.val, &path)?;
                    break;
                }
                Slot::Subtree(_) => {}
            }

            // Subtree entries at a level within the fanout correspond to a
            // real on-disk directory and may be yielded as-is; deeper ones
            // must be consolidated into the level above, so they are
            // unpacked regardless of DONT_UNPACK_SUBTREES. A zero-length
            // prefix marks the packed root, which is not a directory at
            // all and always unpacks.
            let mut force_unpack = n > 2 * fanout;
            if let Slot::Subtree(st) = &node.slots[i] {
                if st.prefix_len == 0 {
                    force_unpack = true;
                } else if n <= 2 * fanout && flags.contains(WalkFlags::YIELD_SUBTREES) {
                    let path = subtree_path(st, fanout);
                    let (prefix, tree) = (st.prefix, st.tree);
                    f(non_notes, &prefix, &tree, &path)?;
                }
            }
            if force_unpack || !flags.contains(WalkFlags::DONT_UNPACK_SUBTREES) {
                if let Slot::Subtree(st) = std::mem::replace(&mut node.slots[i], Slot::Empty) {
                    load_subtree(store, non_notes, &st, node, n)?;
                }
                continue; // redo this slot with the unpacked content
            }
            break;
        }
    }
    Ok(())
}

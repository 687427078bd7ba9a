//! The in-memory 16-ary trie.
//!
//! Keys are full 160-bit object ids, walked one 4-bit nibble at a time.
//! Regions of the persisted tree that have not been touched yet stay
//! packed as [`Slot::Subtree`] references and are materialized on the
//! first traversal that crosses into their key range.

use bstr::BString;
use coffer_hash::{hex, ObjectId};
use coffer_store::ObjectStore;

use crate::combine::Combine;
use crate::non_note::NonNotes;
use crate::NotesError;

/// A terminal mapping: the full key and the id of its annotation blob.
#[derive(Debug)]
pub(crate) struct Leaf {
    pub key: ObjectId,
    pub val: ObjectId,
}

/// An unexpanded region of the trie, persisted as a tree object.
///
/// `prefix` holds the first `prefix_len` bytes shared by every key under
/// this region, zero-padded to full width.
#[derive(Debug)]
pub(crate) struct SubtreeRef {
    pub prefix: ObjectId,
    pub prefix_len: usize,
    pub tree: ObjectId,
}

impl SubtreeRef {
    /// Whether `key` falls inside this subtree's key range.
    pub fn contains(&self, key: &ObjectId) -> bool {
        key.prefix_eq(&self.prefix, self.prefix_len)
    }
}

#[derive(Debug)]
pub(crate) enum Slot {
    Empty,
    Internal(Box<IntNode>),
    Note(Leaf),
    Subtree(SubtreeRef),
}

impl Slot {
    pub fn is_empty(&self) -> bool {
        matches!(self, Slot::Empty)
    }
}

/// One trie level: 16 slots indexed by the next nibble of the key.
#[derive(Debug)]
pub(crate) struct IntNode {
    pub slots: [Slot; 16],
}

impl IntNode {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Slot::Empty),
        }
    }
}

/// A leaf about to be inserted, carrying its variant.
pub(crate) enum Item {
    Note(Leaf),
    Subtree(SubtreeRef),
}

impl Item {
    fn key(&self) -> &ObjectId {
        match self {
            Item::Note(l) => &l.key,
            Item::Subtree(st) => &st.prefix,
        }
    }

    fn is_null_note(&self) -> bool {
        matches!(self, Item::Note(l) if l.val.is_null())
    }

    fn into_slot(self) -> Slot {
        match self {
            Item::Note(l) => Slot::Note(l),
            Item::Subtree(st) => Slot::Subtree(st),
        }
    }
}

/// Unpack any subtree covering `key` at this level, so the caller sees a
/// stable slot for the key's nibble.
///
/// Slot 0 gets special treatment: a subtree whose 2-hex-char fanout name
/// decoded to a prefix ending in nibble 0 sits there, yet covers keys
/// hashing to other slots of this level, so it must be checked before the
/// nibble is used as an index.
fn unpack_covering(
    store: &dyn ObjectStore,
    non_notes: &mut NonNotes,
    node: &mut IntNode,
    n: usize,
    key: &ObjectId,
) -> Result<(), NotesError> {
    loop {
        if matches!(&node.slots[0], Slot::Subtree(st) if st.contains(key)) {
            if let Slot::Subtree(st) = std::mem::replace(&mut node.slots[0], Slot::Empty) {
                load_subtree(store, non_notes, &st, node, n)?;
            }
            continue;
        }
        let i = key.nibble(n) as usize;
        if i != 0 && matches!(&node.slots[i], Slot::Subtree(st) if st.contains(key)) {
            if let Slot::Subtree(st) = std::mem::replace(&mut node.slots[i], Slot::Empty) {
                load_subtree(store, non_notes, &st, node, n)?;
            }
            continue;
        }
        return Ok(());
    }
}

pub(crate) fn find(
    store: &dyn ObjectStore,
    non_notes: &mut NonNotes,
    node: &mut IntNode,
    n: usize,
    key: &ObjectId,
) -> Result<Option<ObjectId>, NotesError> {
    unpack_covering(store, non_notes, node, n, key)?;
    let i = key.nibble(n) as usize;
    match &mut node.slots[i] {
        Slot::Internal(child) => find(store, non_notes, child, n + 1, key),
        Slot::Note(l) if l.key == *key => Ok(Some(l.val)),
        _ => Ok(None),
    }
}

/// Insert a leaf, combining values on a key collision.
///
/// Returns `true` when the insert ended up removing the existing entry
/// (the combiner produced the null id), so ancestors can consolidate.
pub(crate) fn insert(
    store: &dyn ObjectStore,
    non_notes: &mut NonNotes,
    node: &mut IntNode,
    n: usize,
    item: Item,
    combine: Combine,
) -> Result<bool, NotesError> {
    unpack_covering(store, non_notes, node, n, item.key())?;
    let i = item.key().nibble(n) as usize;

    match std::mem::replace(&mut node.slots[i], Slot::Empty) {
        Slot::Empty => {
            if !item.is_null_note() {
                node.slots[i] = item.into_slot();
            }
            Ok(false)
        }
        Slot::Internal(mut child) => {
            let removed = insert(store, non_notes, &mut child, n + 1, item, combine)?;
            node.slots[i] = Slot::Internal(child);
            if removed {
                consolidate(&mut node.slots[i]);
            }
            Ok(removed)
        }
        Slot::Note(existing) => match item {
            Item::Note(new) if new.key == existing.key => {
                if new.val == existing.val {
                    node.slots[i] = Slot::Note(existing);
                    return Ok(false);
                }
                let merged = combine.combine(store, existing.val, new.val)?;
                if merged.is_null() {
                    // Combined away; slot stays empty so the caller consolidates.
                    Ok(true)
                } else {
                    node.slots[i] = Slot::Note(Leaf {
                        key: existing.key,
                        val: merged,
                    });
                    Ok(false)
                }
            }
            Item::Subtree(st) if st.contains(&existing.key) => {
                // The subtree being inserted covers the note already here;
                // unpack its contents into this level and let them merge.
                node.slots[i] = Slot::Note(existing);
                load_subtree(store, non_notes, &st, node, n)?;
                Ok(false)
            }
            other => split(store, non_notes, node, i, n, Item::Note(existing), other, combine),
        },
        Slot::Subtree(st) => {
            if st.contains(item.key()) {
                load_subtree(store, non_notes, &st, node, n)?;
                insert(store, non_notes, node, n, item, combine)
            } else {
                split(store, non_notes, node, i, n, Item::Subtree(st), item, combine)
            }
        }
    }
}

/// Two leaves landed in the same slot with diverging keys: push both one
/// nibble deeper under a fresh internal node. Bounded by the 40-nibble key
/// width since distinct keys must diverge somewhere.
#[allow(clippy::too_many_arguments)]
fn split(
    store: &dyn ObjectStore,
    non_notes: &mut NonNotes,
    node: &mut IntNode,
    i: usize,
    n: usize,
    existing: Item,
    item: Item,
    combine: Combine,
) -> Result<bool, NotesError> {
    if item.is_null_note() {
        node.slots[i] = existing.into_slot();
        return Ok(false);
    }
    let mut child = Box::new(IntNode::new());
    insert(store, non_notes, &mut child, n + 1, existing, combine)?;
    insert(store, non_notes, &mut child, n + 1, item, combine)?;
    node.slots[i] = Slot::Internal(child);
    Ok(false)
}

pub(crate) fn remove(
    store: &dyn ObjectStore,
    non_notes: &mut NonNotes,
    node: &mut IntNode,
    n: usize,
    key: &ObjectId,
) -> Result<Option<ObjectId>, NotesError> {
    unpack_covering(store, non_notes, node, n, key)?;
    let i = key.nibble(n) as usize;
    match std::mem::replace(&mut node.slots[i], Slot::Empty) {
        Slot::Internal(mut child) => {
            let removed = remove(store, non_notes, &mut child, n + 1, key)?;
            node.slots[i] = Slot::Internal(child);
            if removed.is_some() {
                consolidate(&mut node.slots[i]);
            }
            Ok(removed)
        }
        Slot::Note(l) if l.key == *key => Ok(Some(l.val)),
        other => {
            node.slots[i] = other;
            Ok(None)
        }
    }
}

/// Collapse an internal node with at most one live child into that child.
///
/// A lone internal child is left in place: hoisting it would shift the
/// trie level its slots are indexed by and break nibble lookup. Notes and
/// subtrees carry absolute keys/prefixes, so they hoist safely.
pub(crate) fn consolidate(slot: &mut Slot) {
    let Slot::Internal(node) = slot else { return };
    let mut live = None;
    for (j, s) in node.slots.iter().enumerate() {
        if !s.is_empty() {
            if live.is_some() {
                return; // more than one entry
            }
            live = Some(j);
        }
    }
    match live {
        None => *slot = Slot::Empty,
        Some(j) => {
            if !matches!(node.slots[j], Slot::Internal(_)) {
                *slot = std::mem::replace(&mut node.slots[j], Slot::Empty);
            }
        }
    }
}

/// Materialize a packed subtree into `node` at level `n`.
///
/// Every entry of the referenced tree object whose name parses as an even
/// hex segment extends the subtree's key prefix: a full 20-byte key on a
/// regular-file entry is a note, a 2-char directory component is a deeper
/// subtree. Anything else is preserved verbatim as a non-note, keyed by
/// its full fanout path.
pub(crate) fn load_subtree(
    store: &dyn ObjectStore,
    non_notes: &mut NonNotes,
    subtree: &SubtreeRef,
    node: &mut IntNode,
    n: usize,
) -> Result<(), NotesError> {
    let tree = store.read_tree(&subtree.tree)?;
    let prefix_len = subtree.prefix_len;
    if prefix_len * 2 < n {
        return Err(NotesError::Corrupt {
            reason: format!(
                "subtree {} has prefix of {} bytes at trie level {}",
                subtree.tree, prefix_len, n
            ),
        });
    }

    for entry in tree.iter() {
        let mut key_bytes = subtree.prefix.0;
        let decoded = hex::hex_decode_prefix(&entry.name, &mut key_bytes[prefix_len..]);
        if let Ok(len) = decoded {
            let total = prefix_len + len;
            // A full key names a note only for a regular file; a tree or
            // link with a note-shaped name is passed through untouched.
            if total == ObjectId::LEN && entry.mode.is_blob() {
                let item = Item::Note(Leaf {
                    key: ObjectId(key_bytes),
                    val: entry.oid,
                });
                insert(store, non_notes, node, n, item, Combine::Concatenate)?;
                continue;
            }
            if entry.mode.is_tree() && entry.name.len() == 2 {
                let item = Item::Subtree(SubtreeRef {
                    prefix: ObjectId(key_bytes),
                    prefix_len: total,
                    tree: entry.oid,
                });
                insert(store, non_notes, node, n, item, Combine::Concatenate)?;
                continue;
            }
        }

        // Non-note passthrough entry. Its directory part is deduced from
        // the subtree prefix, assuming the strict 2-hex-char progressive
        // fanout this writer produces.
        let mut path = BString::from(Vec::with_capacity(prefix_len * 3 + entry.name.len()));
        let prefix_hex = hex::hex_to_string(&subtree.prefix.0[..prefix_len]);
        for pair in prefix_hex.as_bytes().chunks(2) {
            path.extend_from_slice(pair);
            path.push(b'/');
        }
        path.extend_from_slice(&entry.name);
        non_notes.add(path, entry.mode, entry.oid);
    }
    Ok(())
}

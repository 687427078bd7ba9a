//! Persistent object-annotation map for the coffer storage engine.
//!
//! A notes tree attaches an annotation blob to any object id. In memory
//! it is a 16-ary trie keyed by the annotated id's nibbles; on disk it is
//! an ordinary tree object whose entry names are hex ids, optionally
//! split into 2-hex-char fanout directories. Untouched regions of the
//! persisted tree stay packed as subtree references and are materialized
//! lazily, so point lookups never load more of the tree than they cross.

mod combine;
mod non_note;
mod trie;
mod walk;
mod write;

use bitflags::bitflags;
use coffer_hash::ObjectId;
use coffer_object::ObjectType;
use coffer_store::{ObjectStore, RefStore, StoreError};

pub use combine::Combine;
pub use walk::WalkFlags;

use non_note::NonNotes;
use trie::{IntNode, Item, Leaf, Slot, SubtreeRef};

/// Errors produced by notes tree operations.
///
/// Malformed persisted data is fatal to the whole operation; there is no
/// partial-trie recovery.
#[derive(Debug, thiserror::Error)]
pub enum NotesError {
    #[error("malformed notes tree: {reason}")]
    Corrupt { reason: String },

    #[error("notes ref '{reference}' does not point to a tree")]
    NotATree { reference: String },

    #[error("notes tree has no backing ref")]
    NoRef,

    #[error(transparent)]
    Store(#[from] StoreError),
}

bitflags! {
    /// Options for [`NotesTree::prune`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PruneFlags: u32 {
        /// Report which notes would be removed without removing them.
        const DRY_RUN = 1 << 0;
    }
}

/// A mutable notes tree, owned by one logical transaction
/// (load, mutate, write back).
#[derive(Debug)]
pub struct NotesTree {
    root: Box<IntNode>,
    non_notes: NonNotes,
    ref_name: Option<String>,
    /// Tree id the trie was loaded from, used as the expected old value
    /// when updating the backing ref.
    base: Option<ObjectId>,
    combine: Combine,
    dirty: bool,
}

impl NotesTree {
    /// An empty tree with no backing ref.
    pub fn empty(combine: Combine) -> Self {
        Self {
            root: Box::new(IntNode::new()),
            non_notes: NonNotes::default(),
            ref_name: None,
            base: None,
            combine,
            dirty: false,
        }
    }

    /// Load the tree referenced by `ref_name`. A missing ref yields an
    /// empty tree. The root is kept packed until first use.
    pub fn init(
        refs: &dyn RefStore,
        store: &dyn ObjectStore,
        ref_name: &str,
        combine: Combine,
    ) -> Result<Self, NotesError> {
        let mut t = Self::empty(combine);
        t.ref_name = Some(ref_name.to_string());

        if let Some(tree_id) = refs.resolve(ref_name)? {
            let info = store.read_header(&tree_id)?;
            if info.obj_type != ObjectType::Tree {
                return Err(NotesError::NotATree {
                    reference: ref_name.to_string(),
                });
            }
            t.root.slots[0] = Slot::Subtree(SubtreeRef {
                prefix: ObjectId::NULL,
                prefix_len: 0,
                tree: tree_id,
            });
            t.base = Some(tree_id);
        }
        Ok(t)
    }

    pub fn ref_name(&self) -> Option<&str> {
        self.ref_name.as_deref()
    }

    /// Whether the in-memory state has diverged from what was loaded.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Look up the annotation attached to `target`.
    ///
    /// Takes `&mut self` because the lookup may materialize packed
    /// subtrees along the way; the answers it returns are unaffected.
    pub fn get(
        &mut self,
        store: &dyn ObjectStore,
        target: &ObjectId,
    ) -> Result<Option<ObjectId>, NotesError> {
        trie::find(store, &mut self.non_notes, &mut self.root, 0, target)
    }

    /// Attach `note` to `target`, merging with an existing annotation via
    /// `combine` (or the tree's default combiner).
    pub fn add(
        &mut self,
        store: &dyn ObjectStore,
        target: &ObjectId,
        note: ObjectId,
        combine: Option<Combine>,
    ) -> Result<(), NotesError> {
        self.dirty = true;
        let combine = combine.unwrap_or(self.combine);
        let item = Item::Note(Leaf {
            key: *target,
            val: note,
        });
        trie::insert(store, &mut self.non_notes, &mut self.root, 0, item, combine)?;
        Ok(())
    }

    /// Remove the annotation attached to `target`, returning the removed
    /// note id, and consolidate emptied trie levels.
    pub fn remove(
        &mut self,
        store: &dyn ObjectStore,
        target: &ObjectId,
    ) -> Result<Option<ObjectId>, NotesError> {
        let removed = trie::remove(store, &mut self.non_notes, &mut self.root, 0, target)?;
        if removed.is_some() {
            self.dirty = true;
        }
        Ok(removed)
    }

    /// Visit every note in key order. With
    /// [`WalkFlags::YIELD_SUBTREES`], still-packed fanout subtrees are
    /// reported too, with a trailing-slash path.
    pub fn for_each<F>(
        &mut self,
        store: &dyn ObjectStore,
        flags: WalkFlags,
        mut f: F,
    ) -> Result<(), NotesError>
    where
        F: FnMut(&ObjectId, &ObjectId, &str) -> Result<(), NotesError>,
    {
        walk::for_each_in(
            store,
            &mut self.non_notes,
            &mut self.root,
            0,
            0,
            flags,
            &mut |_nn, key, val, path| f(key, val, path),
        )
    }

    /// Serialize the tree back into fanout tree objects, returning the
    /// root tree id. Non-note entries are woven in by path order, with
    /// notes winning path ties.
    pub fn write(&mut self, store: &dyn ObjectStore) -> Result<ObjectId, NotesError> {
        let mut tws = write::TreeWriteStack::new();
        self.non_notes.rewind();

        walk::for_each_in(
            store,
            &mut self.non_notes,
            &mut self.root,
            0,
            0,
            WalkFlags::YIELD_SUBTREES | WalkFlags::DONT_UNPACK_SUBTREES,
            &mut |nn, _key, val, path| {
                let mut p = path.as_bytes().to_vec();
                let mut mode = 0o100644;
                if p.last() == Some(&b'/') {
                    // A packed subtree passes through as a directory entry.
                    p.pop();
                    mode = 0o40000;
                }
                write::write_non_notes_until(&mut tws, store, nn, Some(&p))?;
                tws.add(store, &p, mode, val)
            },
        )?;
        write::write_non_notes_until(&mut tws, store, &mut self.non_notes, None)?;

        let root = tws.finish(store)?;
        self.dirty = false;
        Ok(root)
    }

    /// Write the tree and move the backing ref to the result with a
    /// compare-and-swap against the tree it was loaded from.
    pub fn persist(
        &mut self,
        store: &dyn ObjectStore,
        refs: &dyn RefStore,
    ) -> Result<ObjectId, NotesError> {
        let name = self.ref_name.clone().ok_or(NotesError::NoRef)?;
        let root = self.write(store)?;
        refs.update(&name, self.base, Some(root))?;
        self.base = Some(root);
        Ok(root)
    }

    /// Copy the annotation of `from` onto `to`.
    ///
    /// Returns `false` (without changing anything) when `to` already has
    /// a note and `force` is not set. With `force`, an existing note on
    /// `to` is overwritten, or cleared when `from` has none.
    pub fn copy(
        &mut self,
        store: &dyn ObjectStore,
        from: &ObjectId,
        to: &ObjectId,
        force: bool,
        combine: Option<Combine>,
    ) -> Result<bool, NotesError> {
        let note = self.get(store, from)?;
        let existing = self.get(store, to)?;

        if !force && existing.is_some() {
            return Ok(false);
        }
        if let Some(note) = note {
            self.add(store, to, note, combine)?;
        } else if existing.is_some() {
            self.add(store, to, ObjectId::NULL, combine)?;
        }
        Ok(true)
    }

    /// Remove notes whose annotated object no longer exists in the store.
    /// Returns the affected target ids; with [`PruneFlags::DRY_RUN`] the
    /// tree is left untouched.
    pub fn prune(
        &mut self,
        store: &dyn ObjectStore,
        flags: PruneFlags,
    ) -> Result<Vec<ObjectId>, NotesError> {
        let mut dangling = Vec::new();
        self.for_each(store, WalkFlags::empty(), |target, _note, _path| {
            if !store.contains(target) {
                dangling.push(*target);
            }
            Ok(())
        })?;

        if !flags.contains(PruneFlags::DRY_RUN) {
            for target in &dangling {
                self.remove(store, target)?;
            }
        }
        Ok(dangling)
    }

    /// Whether the tree holds any non-note passthrough entries.
    pub fn has_non_notes(&self) -> bool {
        !self.non_notes.is_empty()
    }
}

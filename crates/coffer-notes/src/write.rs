//! Serializing the trie back into fanout tree objects.
//!
//! The writer keeps a stack of open tree buffers, one per fanout
//! directory level. Notes arrive in path order from the traversal; when a
//! note's fanout directories diverge from the open stack, the deeper
//! levels are finished (written to the store and recorded as subtree
//! entries in their parent) before the new directories are opened.

use coffer_hash::ObjectId;
use coffer_object::ObjectType;
use coffer_store::ObjectStore;

use crate::non_note::NonNotes;
use crate::NotesError;

struct Level {
    buf: Vec<u8>,
    /// 2-hex-char name of the open child level, if any. Present exactly
    /// when this level is not the deepest on the stack.
    child_name: Option<[u8; 2]>,
}

impl Level {
    fn new() -> Self {
        Self {
            buf: Vec::with_capacity(256 * (32 + 40)),
            child_name: None,
        }
    }
}

pub(crate) struct TreeWriteStack {
    levels: Vec<Level>,
}

fn push_tree_entry(buf: &mut Vec<u8>, mode: u32, name: &[u8], oid: &ObjectId) {
    buf.extend_from_slice(format!("{:o} ", mode).as_bytes());
    buf.extend_from_slice(name);
    buf.push(0);
    buf.extend_from_slice(oid.as_bytes());
}

impl TreeWriteStack {
    pub fn new() -> Self {
        Self {
            levels: vec![Level::new()],
        }
    }

    /// Close every level deeper than `depth`, writing each finished buffer
    /// as a tree object and recording it in its parent.
    fn finish_to(&mut self, store: &dyn ObjectStore, depth: usize) -> Result<(), NotesError> {
        while self.levels.len() > depth + 1 {
            let level = match self.levels.pop() {
                Some(l) => l,
                None => break,
            };
            let oid = store.write(ObjectType::Tree, &level.buf)?;
            if let Some(parent) = self.levels.last_mut() {
                if let Some(name) = parent.child_name.take() {
                    push_tree_entry(&mut parent.buf, 0o40000, &name, &oid);
                }
            }
        }
        Ok(())
    }

    /// Add one entry at the given fanout path (`xx/yy/rest`).
    pub fn add(
        &mut self,
        store: &dyn ObjectStore,
        path: &[u8],
        mode: u32,
        oid: &ObjectId,
    ) -> Result<(), NotesError> {
        // Depth of the common fanout prefix with the open stack.
        let mut n = 0;
        while n + 1 < self.levels.len()
            && 3 * n + 2 < path.len()
            && self.levels[n].child_name == Some([path[3 * n], path[3 * n + 1]])
            && path[3 * n + 2] == b'/'
        {
            n += 1;
        }

        self.finish_to(store, n)?;

        // Open the directories still needed for this path.
        while 3 * n + 2 < path.len() && path[3 * n + 2] == b'/' {
            self.levels[n].child_name = Some([path[3 * n], path[3 * n + 1]]);
            self.levels.push(Level::new());
            n += 1;
        }

        push_tree_entry(&mut self.levels[n].buf, mode, &path[3 * n..], oid);
        Ok(())
    }

    /// Close everything and write the root tree, returning its id.
    pub fn finish(mut self, store: &dyn ObjectStore) -> Result<ObjectId, NotesError> {
        self.finish_to(store, 0)?;
        let root = match self.levels.pop() {
            Some(l) => l,
            None => Level::new(),
        };
        Ok(store.write(ObjectType::Tree, &root.buf)?)
    }
}

/// Write non-note entries whose path sorts at or before `bound` (all of
/// them when `bound` is `None`). On a path tie the note wins and the
/// non-note is dropped.
pub(crate) fn write_non_notes_until(
    tws: &mut TreeWriteStack,
    store: &dyn ObjectStore,
    non_notes: &mut NonNotes,
    bound: Option<&[u8]>,
) -> Result<(), NotesError> {
    while let Some(entry) = non_notes.peek() {
        let ordering = match bound {
            Some(b) => entry.path.as_slice().cmp(b),
            None => std::cmp::Ordering::Less,
        };
        match ordering {
            std::cmp::Ordering::Greater => break,
            std::cmp::Ordering::Equal => non_notes.advance(),
            std::cmp::Ordering::Less => {
                let (path, mode, oid) = (entry.path.clone(), entry.mode, entry.oid);
                non_notes.advance();
                tws.add(store, &path, mode.raw(), &oid)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_object::Tree;
    use coffer_store::MemoryStore;

    fn oid(n: u8) -> ObjectId {
        let mut b = [0u8; 20];
        b[19] = n;
        ObjectId(b)
    }

    #[test]
    fn flat_entries_land_in_root_tree() {
        let store = MemoryStore::new();
        let mut tws = TreeWriteStack::new();
        tws.add(&store, b"aa11", 0o100644, &oid(1)).unwrap();
        tws.add(&store, b"bb22", 0o100644, &oid(2)).unwrap();
        let root = tws.finish(&store).unwrap();

        let tree = store.read_tree(&root).unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.entries[0].name, "aa11");
        assert_eq!(tree.entries[1].name, "bb22");
    }

    #[test]
    fn fanout_paths_nest_into_subtrees() {
        let store = MemoryStore::new();
        let mut tws = TreeWriteStack::new();
        tws.add(&store, b"aa/1111", 0o100644, &oid(1)).unwrap();
        tws.add(&store, b"aa/2222", 0o100644, &oid(2)).unwrap();
        tws.add(&store, b"bb/3333", 0o100644, &oid(3)).unwrap();
        let root = tws.finish(&store).unwrap();

        let tree = store.read_tree(&root).unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.entries[0].name, "aa");
        assert!(tree.entries[0].mode.is_tree());
        let aa = store.read_tree(&tree.entries[0].oid).unwrap();
        assert_eq!(aa.len(), 2);
        assert_eq!(aa.entries[0].name, "1111");
        assert_eq!(aa.entries[1].name, "2222");
    }
}

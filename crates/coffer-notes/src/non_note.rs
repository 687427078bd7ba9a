use bstr::BString;
use coffer_hash::ObjectId;
use coffer_object::FileMode;

/// A tree entry that does not follow the hex naming convention of notes.
/// There are typically none or few of these, but they must survive a
/// load/write round trip verbatim.
pub(crate) struct NonNote {
    pub path: BString,
    pub mode: FileMode,
    pub oid: ObjectId,
}

impl std::fmt::Debug for NonNote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonNote")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("oid", &self.oid)
            .finish()
    }
}

/// Path-sorted collection of non-note entries, with a cursor used by the
/// write-back weave.
#[derive(Debug, Default)]
pub(crate) struct NonNotes {
    entries: Vec<NonNote>,
    cursor: usize,
}

impl NonNotes {
    pub fn add(&mut self, path: BString, mode: FileMode, oid: ObjectId) {
        match self
            .entries
            .binary_search_by(|e| e.path.as_slice().cmp(path.as_slice()))
        {
            Ok(i) => {
                // Same path seen again; the later entry wins.
                self.entries[i].mode = mode;
                self.entries[i].oid = oid;
            }
            Err(i) => {
                self.entries.insert(i, NonNote { path, mode, oid });
                // Entries spliced in behind the write cursor (a subtree
                // unpacked mid-write revealing non-notes that sort before
                // the weave point) are not revisited.
                if i < self.cursor {
                    self.cursor += 1;
                }
            }
        }
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// The next unwoven entry, if any.
    pub fn peek(&self) -> Option<&NonNote> {
        self.entries.get(self.cursor)
    }

    pub fn advance(&mut self) {
        self.cursor += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

use coffer_hash::ObjectId;
use coffer_object::ObjectType;
use coffer_store::{ObjectStore, StoreError};

use crate::NotesError;

/// Strategy for merging two annotations attached to the same object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Combine {
    /// Append the new note after the current one, separated by a blank line.
    #[default]
    Concatenate,
    /// The new note replaces the current one.
    Overwrite,
    /// The current note is kept; the new one is dropped.
    Ignore,
    /// Line-wise union of both notes, sorted and deduplicated.
    CatSortUniq,
}

impl Combine {
    /// Merge `cur` and `new`, returning the id of the resulting note blob.
    /// A null result means the note should be removed.
    pub(crate) fn combine(
        &self,
        store: &dyn ObjectStore,
        cur: ObjectId,
        new: ObjectId,
    ) -> Result<ObjectId, NotesError> {
        match self {
            Combine::Overwrite => Ok(new),
            Combine::Ignore => Ok(cur),
            Combine::Concatenate => concatenate(store, cur, new),
            Combine::CatSortUniq => cat_sort_uniq(store, cur, new),
        }
    }
}

/// Read a note blob, treating a null id or a missing/non-blob/empty object
/// as "no content". The lenient concatenate path ignores junk rather than
/// failing the whole insert.
fn read_blob_lenient(store: &dyn ObjectStore, oid: &ObjectId) -> Option<Vec<u8>> {
    if oid.is_null() {
        return None;
    }
    match store.read(oid) {
        Ok((ObjectType::Blob, content)) if !content.is_empty() => Some(content),
        _ => None,
    }
}

fn concatenate(
    store: &dyn ObjectStore,
    cur: ObjectId,
    new: ObjectId,
) -> Result<ObjectId, NotesError> {
    let Some(new_msg) = read_blob_lenient(store, &new) else {
        return Ok(cur);
    };
    let Some(mut buf) = read_blob_lenient(store, &cur) else {
        return Ok(new);
    };

    // The notes are separated by a blank line, so one trailing newline on
    // the current note is enough.
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    buf.push(b'\n');
    buf.push(b'\n');
    buf.extend_from_slice(&new_msg);

    Ok(store.write_blob(&buf)?)
}

/// Collect the non-empty lines of a note blob into the sorted set.
/// Unlike the concatenate path, a non-blob here is an error.
fn add_note_lines(
    store: &dyn ObjectStore,
    oid: &ObjectId,
    lines: &mut Vec<Vec<u8>>,
) -> Result<(), NotesError> {
    if oid.is_null() {
        return Ok(());
    }
    let content = match store.read_typed(oid, ObjectType::Blob) {
        Ok(content) => content,
        Err(StoreError::TypeMismatch { .. }) => {
            return Err(NotesError::Corrupt {
                reason: format!("note {oid} is not a blob"),
            })
        }
        Err(e) => return Err(e.into()),
    };
    for line in content.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        if let Err(pos) = lines.binary_search_by(|l| l.as_slice().cmp(line)) {
            lines.insert(pos, line.to_vec());
        }
    }
    Ok(())
}

fn cat_sort_uniq(
    store: &dyn ObjectStore,
    cur: ObjectId,
    new: ObjectId,
) -> Result<ObjectId, NotesError> {
    let mut lines = Vec::new();
    add_note_lines(store, &cur, &mut lines)?;
    add_note_lines(store, &new, &mut lines)?;

    let mut buf = Vec::new();
    for line in &lines {
        buf.extend_from_slice(line);
        buf.push(b'\n');
    }
    Ok(store.write_blob(&buf)?)
}

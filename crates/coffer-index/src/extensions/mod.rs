//! Index extension blocks: TREE, REUC, and opaque passthrough.

pub mod resolve_undo;
pub mod tree;

use bstr::BString;
use coffer_hash::ObjectId;
use coffer_object::FileMode;

/// An extension this reader does not interpret, preserved byte-for-byte
/// so a rewrite does not destroy another tool's data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawExtension {
    pub signature: [u8; 4],
    pub data: Vec<u8>,
}

/// Resolve-undo log (REUC): the pre-resolution conflict stages of
/// paths whose conflicts have been collapsed, so resolution can be
/// undone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveUndo {
    pub entries: Vec<ResolveUndoEntry>,
}

/// Conflict stages (base, ours, theirs) recorded for one path. A `None`
/// slot means that side was absent from the conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveUndoEntry {
    pub path: BString,
    pub modes: [Option<FileMode>; 3],
    pub oids: [Option<ObjectId>; 3],
}

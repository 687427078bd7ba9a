//! Index file serialization and tree building.

use std::io::Write;
use std::path::Path;

use coffer_hash::ObjectId;
use coffer_object::{FileMode, Tree, TreeEntry};
use coffer_store::ObjectStore;
use coffer_utils::LockFile;
use sha1::{Digest, Sha1};

use crate::entry::{EntryFlags, IndexEntry, Stage, StatData};
use crate::extensions::tree::CacheTree;
use crate::extensions::ResolveUndo;
use crate::read::{ondisk_entry_size, NAME_MASK, SIGNATURE};
use crate::refresh::is_racy_timestamp;
use crate::{Index, IndexError};

/// Streams bytes to the lock file while feeding the trailing checksum.
struct HashingWriter<'a> {
    inner: &'a mut LockFile,
    hasher: Sha1,
}

impl<'a> HashingWriter<'a> {
    fn new(inner: &'a mut LockFile) -> Self {
        Self {
            inner,
            hasher: Sha1::new(),
        }
    }

    fn finalize(self) -> [u8; 20] {
        self.hasher.finalize().into()
    }
}

impl Write for HashingWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.hasher.update(buf);
        self.inner.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

pub(crate) fn write_index(index: &mut Index, path: &Path) -> Result<(), IndexError> {
    let mut lock = LockFile::acquire(path)?;

    // Version 3 only when an entry actually needs the extended word.
    let version: u32 = if index.entries.iter().any(|e| e.flags.has_extended()) {
        3
    } else {
        2
    };

    let mut writer = HashingWriter::new(&mut lock);
    writer.write_all(SIGNATURE)?;
    writer.write_all(&version.to_be_bytes())?;
    writer.write_all(&(index.entries.len() as u32).to_be_bytes())?;

    for entry in &index.entries {
        write_entry(&mut writer, entry, version, index.timestamp)?;
    }

    if let Some(tree) = &index.cache_tree {
        write_extension(&mut writer, CacheTree::SIGNATURE, &tree.serialize())?;
    }
    if let Some(reuc) = &index.resolve_undo {
        write_extension(&mut writer, ResolveUndo::SIGNATURE, &reuc.serialize())?;
    }
    for ext in &index.unknown_extensions {
        write_extension(&mut writer, &ext.signature, &ext.data)?;
    }

    let checksum = writer.finalize();
    lock.write_all(&checksum)?;

    let meta = lock.commit()?;
    let st = StatData::from_metadata(&meta);
    index.timestamp = Some((st.mtime_secs, st.mtime_nsecs));
    index.version = version;
    index.dirty = false;
    Ok(())
}

fn write_extension<W: Write>(w: &mut W, sig: &[u8; 4], data: &[u8]) -> std::io::Result<()> {
    w.write_all(sig)?;
    w.write_all(&(data.len() as u32).to_be_bytes())?;
    w.write_all(data)
}

fn write_entry<W: Write>(
    w: &mut W,
    entry: &IndexEntry,
    version: u32,
    timestamp: Option<(u32, u32)>,
) -> std::io::Result<()> {
    let mut stat = entry.stat;

    // An entry whose mtime is at or past the index's own mtime could
    // have been modified again within the same tick. Zero the cached
    // size so a later refresh is forced into a content comparison
    // instead of trusting the stat match.
    if let Some(ts) = timestamp {
        if stat.size != 0 && is_racy_timestamp(ts, &stat, true) {
            stat.size = 0;
        }
    }

    w.write_all(&stat.ctime_secs.to_be_bytes())?;
    w.write_all(&stat.ctime_nsecs.to_be_bytes())?;
    w.write_all(&stat.mtime_secs.to_be_bytes())?;
    w.write_all(&stat.mtime_nsecs.to_be_bytes())?;
    w.write_all(&stat.dev.to_be_bytes())?;
    w.write_all(&stat.ino.to_be_bytes())?;
    w.write_all(&entry.mode.raw().to_be_bytes())?;
    w.write_all(&stat.uid.to_be_bytes())?;
    w.write_all(&stat.gid.to_be_bytes())?;
    w.write_all(&stat.size.to_be_bytes())?;
    w.write_all(entry.oid.as_bytes())?;

    let extended = version >= 3 && entry.flags.has_extended();
    let name_len = entry.path.len().min(NAME_MASK as usize) as u16;
    let mut flags = name_len;
    flags |= (entry.stage.as_u8() as u16) << 12;
    if entry.flags.contains(EntryFlags::ASSUME_VALID) {
        flags |= 0x8000;
    }
    if extended {
        flags |= 0x4000;
    }
    w.write_all(&flags.to_be_bytes())?;

    if extended {
        let mut ext = 0u16;
        if entry.flags.contains(EntryFlags::INTENT_TO_ADD) {
            ext |= 0x2000;
        }
        if entry.flags.contains(EntryFlags::SKIP_WORKTREE) {
            ext |= 0x4000;
        }
        w.write_all(&ext.to_be_bytes())?;
    }

    w.write_all(&entry.path)?;

    let written = 60 + if extended { 4 } else { 2 } + entry.path.len();
    let padding = ondisk_entry_size(entry.path.len(), extended) - written;
    w.write_all(&[0u8; 8][..padding])
}

pub(crate) fn write_tree_from_index(
    index: &Index,
    store: &dyn ObjectStore,
) -> Result<ObjectId, IndexError> {
    if let Some(e) = index.entries.iter().find(|e| e.stage != Stage::Normal) {
        return Err(IndexError::Unmerged(e.path.clone()));
    }
    let entries: Vec<&IndexEntry> = index.entries.iter().collect();
    build_tree(&entries, 0, store)
}

/// Recursively peel one directory level off the sorted entry slice.
/// `prefix_len` counts bytes of path already consumed, including the
/// trailing slash.
fn build_tree(
    entries: &[&IndexEntry],
    prefix_len: usize,
    store: &dyn ObjectStore,
) -> Result<ObjectId, IndexError> {
    let mut tree = Tree::new();
    let mut i = 0;

    while i < entries.len() {
        let rest = &entries[i].path[prefix_len..];
        match rest.iter().position(|&b| b == b'/') {
            Some(slash) => {
                let dir = &rest[..slash];
                let sub_prefix = prefix_len + slash + 1;
                let end = i + entries[i..]
                    .iter()
                    .take_while(|e| {
                        let p = &e.path[prefix_len..];
                        p.len() > slash && &p[..slash] == dir && p[slash] == b'/'
                    })
                    .count();

                let oid = build_tree(&entries[i..end], sub_prefix, store)?;
                tree.entries.push(TreeEntry {
                    mode: FileMode::Tree,
                    name: dir.into(),
                    oid,
                });
                i = end;
            }
            None => {
                tree.entries.push(TreeEntry {
                    mode: entries[i].mode,
                    name: rest.into(),
                    oid: entries[i].oid,
                });
                i += 1;
            }
        }
    }

    tree.sort();
    Ok(store.write_tree(&tree)?)
}

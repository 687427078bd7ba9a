//! Index file parsing (versions 2 and 3).

use bstr::BString;
use coffer_hash::ObjectId;
use coffer_object::FileMode;
use sha1::{Digest, Sha1};

use crate::entry::{EntryFlags, IndexEntry, Stage, StatData};
use crate::extensions::tree::CacheTree;
use crate::extensions::{RawExtension, ResolveUndo};
use crate::{Index, IndexError};

/// Magic bytes at the start of every index file.
pub(crate) const SIGNATURE: &[u8; 4] = b"DIRC";

/// Fixed on-disk prefix of an entry: stat data (40) + oid (20) + flags (2).
const ENTRY_PREFIX: usize = 62;

/// Name-length sentinel in the flags word. Longer names rely on the NUL
/// terminator alone.
pub(crate) const NAME_MASK: u16 = 0x0FFF;

/// Total on-disk entry size: the prefix, an optional extended flags
/// word, the name, and NUL padding out to an 8-byte multiple.
pub(crate) fn ondisk_entry_size(name_len: usize, extended: bool) -> usize {
    let flags_size = if extended { 4 } else { 2 };
    (40 + 20 + flags_size + name_len + 8) & !7
}

pub(crate) fn parse_index(data: &[u8]) -> Result<Index, IndexError> {
    if data.len() < 12 + 20 {
        return Err(IndexError::InvalidHeader("index file too short".into()));
    }
    verify_checksum(data)?;

    if &data[..4] != SIGNATURE {
        return Err(IndexError::InvalidHeader(format!(
            "bad signature: {:?}",
            &data[..4]
        )));
    }
    let version = read_u32(&data[4..]);
    if !(2..=3).contains(&version) {
        return Err(IndexError::UnsupportedVersion(version));
    }
    let entry_count = read_u32(&data[8..]) as usize;

    let content_end = data.len() - 20;
    let mut cursor = 12;
    let mut entries = Vec::with_capacity(entry_count);

    for _ in 0..entry_count {
        let (entry, next) = parse_entry(data, cursor, version, content_end)?;
        if let Some(prev) = entries.last() {
            if !sorts_after(prev, &entry) {
                return Err(IndexError::InvalidEntry {
                    offset: cursor,
                    reason: format!("entry '{}' out of order", entry.path),
                });
            }
        }
        entries.push(entry);
        cursor = next;
    }

    let mut index = Index::new();
    index.version = version;
    index.names = entries.iter().map(|e| e.path.clone()).collect();
    index.entries = entries;

    parse_extensions(data, cursor, content_end, &mut index)?;
    Ok(index)
}

fn sorts_after(prev: &IndexEntry, next: &IndexEntry) -> bool {
    prev.path
        .cmp(&next.path)
        .then(prev.stage.as_u8().cmp(&next.stage.as_u8()))
        .is_lt()
}

fn parse_entry(
    data: &[u8],
    start: usize,
    version: u32,
    content_end: usize,
) -> Result<(IndexEntry, usize), IndexError> {
    if start + ENTRY_PREFIX > content_end {
        return Err(IndexError::InvalidEntry {
            offset: start,
            reason: "truncated entry".into(),
        });
    }

    let stat = StatData {
        ctime_secs: read_u32(&data[start..]),
        ctime_nsecs: read_u32(&data[start + 4..]),
        mtime_secs: read_u32(&data[start + 8..]),
        mtime_nsecs: read_u32(&data[start + 12..]),
        dev: read_u32(&data[start + 16..]),
        ino: read_u32(&data[start + 20..]),
        uid: read_u32(&data[start + 28..]),
        gid: read_u32(&data[start + 32..]),
        size: read_u32(&data[start + 36..]),
    };
    let mode = FileMode::from_raw(read_u32(&data[start + 24..]));
    let oid = ObjectId::from_bytes(&data[start + 40..start + 60]).map_err(|_| {
        IndexError::InvalidEntry {
            offset: start,
            reason: "invalid object id".into(),
        }
    })?;

    let flags_raw = read_u16(&data[start + 60..]);
    let stage = Stage::from_u8(((flags_raw >> 12) & 0x3) as u8)?;
    let extended = flags_raw & 0x4000 != 0;
    let name_len_field = flags_raw & NAME_MASK;

    let mut flags = EntryFlags::empty();
    if flags_raw & 0x8000 != 0 {
        flags.insert(EntryFlags::ASSUME_VALID);
    }

    let mut name_start = start + ENTRY_PREFIX;
    if extended {
        if version < 3 {
            return Err(IndexError::InvalidEntry {
                offset: start,
                reason: "extended flags in a version 2 index".into(),
            });
        }
        if name_start + 2 > content_end {
            return Err(IndexError::InvalidEntry {
                offset: start,
                reason: "truncated extended flags".into(),
            });
        }
        let ext = read_u16(&data[name_start..]);
        if ext & 0x2000 != 0 {
            flags.insert(EntryFlags::INTENT_TO_ADD);
        }
        if ext & 0x4000 != 0 {
            flags.insert(EntryFlags::SKIP_WORKTREE);
        }
        name_start += 2;
    }

    let name_len = data[name_start..content_end]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| IndexError::InvalidEntry {
            offset: start,
            reason: "unterminated name".into(),
        })?;
    if name_len_field < NAME_MASK && name_len != name_len_field as usize {
        return Err(IndexError::InvalidEntry {
            offset: start,
            reason: format!(
                "name length field {} disagrees with name of {} bytes",
                name_len_field, name_len
            ),
        });
    }
    let path = BString::from(&data[name_start..name_start + name_len]);

    let next = start + ondisk_entry_size(name_len, extended);
    if next > content_end {
        return Err(IndexError::InvalidEntry {
            offset: start,
            reason: "entry padding exceeds index bounds".into(),
        });
    }

    Ok((
        IndexEntry {
            path,
            oid,
            mode,
            stage,
            stat,
            flags,
        },
        next,
    ))
}

/// Decode the trailing extension blocks. A tag whose first byte falls
/// outside `A..=Z` marks a mandatory extension this reader does not
/// understand, which is a hard error; unknown tags in that range are
/// carried through opaquely.
fn parse_extensions(
    data: &[u8],
    mut cursor: usize,
    content_end: usize,
    index: &mut Index,
) -> Result<(), IndexError> {
    while cursor + 8 <= content_end {
        let sig = [data[cursor], data[cursor + 1], data[cursor + 2], data[cursor + 3]];
        let size = read_u32(&data[cursor + 4..]) as usize;
        cursor += 8;

        if cursor + size > content_end {
            return Err(IndexError::InvalidExtension {
                sig: String::from_utf8_lossy(&sig).into_owned(),
                reason: "extension data exceeds index bounds".into(),
            });
        }
        let ext_data = &data[cursor..cursor + size];
        cursor += size;

        match &sig {
            b"TREE" => index.cache_tree = Some(CacheTree::parse(ext_data)?),
            b"REUC" => index.resolve_undo = Some(ResolveUndo::parse(ext_data)?),
            _ if sig[0].is_ascii_uppercase() => {
                index.unknown_extensions.push(RawExtension {
                    signature: sig,
                    data: ext_data.to_vec(),
                });
            }
            _ => {
                return Err(IndexError::InvalidExtension {
                    sig: String::from_utf8_lossy(&sig).into_owned(),
                    reason: "unrecognized mandatory extension".into(),
                });
            }
        }
    }
    if cursor != content_end {
        return Err(IndexError::InvalidHeader("trailing garbage".into()));
    }
    Ok(())
}

fn verify_checksum(data: &[u8]) -> Result<(), IndexError> {
    let (content, stored) = data.split_at(data.len() - 20);
    let computed = Sha1::digest(content);
    if computed.as_slice() != stored {
        return Err(IndexError::ChecksumMismatch);
    }
    Ok(())
}

fn read_u32(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

fn read_u16(data: &[u8]) -> u16 {
    u16::from_be_bytes([data[0], data[1]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_file() {
        assert!(matches!(
            parse_index(b"DIRC"),
            Err(IndexError::InvalidHeader(_))
        ));
    }

    #[test]
    fn rejects_bad_checksum() {
        let mut data = Vec::new();
        data.extend_from_slice(SIGNATURE);
        data.extend_from_slice(&2u32.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&[0u8; 20]);
        assert!(matches!(
            parse_index(&data),
            Err(IndexError::ChecksumMismatch)
        ));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut data = Vec::new();
        data.extend_from_slice(SIGNATURE);
        data.extend_from_slice(&9u32.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(Sha1::digest(&data).as_slice());
        assert!(matches!(
            parse_index(&data),
            Err(IndexError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn empty_index_parses() {
        let mut data = Vec::new();
        data.extend_from_slice(SIGNATURE);
        data.extend_from_slice(&2u32.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(Sha1::digest(&data).as_slice());
        let index = parse_index(&data).unwrap();
        assert!(index.is_empty());
        assert_eq!(index.version(), 2);
    }

    #[test]
    fn mandatory_extension_is_fatal_optional_is_kept() {
        // One optional (uppercase tag) and the same body under a
        // lowercase tag.
        let body = b"payload";
        let mut optional = Vec::new();
        optional.extend_from_slice(SIGNATURE);
        optional.extend_from_slice(&2u32.to_be_bytes());
        optional.extend_from_slice(&0u32.to_be_bytes());
        let mut mandatory = optional.clone();

        optional.extend_from_slice(b"XYZW");
        optional.extend_from_slice(&(body.len() as u32).to_be_bytes());
        optional.extend_from_slice(body);
        optional.extend_from_slice(Sha1::digest(&optional).as_slice());
        let index = parse_index(&optional).unwrap();
        assert_eq!(index.unknown_extensions.len(), 1);
        assert_eq!(index.unknown_extensions[0].signature, *b"XYZW");
        assert_eq!(index.unknown_extensions[0].data, body);

        mandatory.extend_from_slice(b"xyzw");
        mandatory.extend_from_slice(&(body.len() as u32).to_be_bytes());
        mandatory.extend_from_slice(body);
        mandatory.extend_from_slice(Sha1::digest(&mandatory).as_slice());
        assert!(matches!(
            parse_index(&mandatory),
            Err(IndexError::InvalidExtension { .. })
        ));
    }

    #[test]
    fn entry_size_is_padded_to_eight() {
        // 62-byte prefix + 1-byte name = 63, padded to 64.
        assert_eq!(ondisk_entry_size(1, false), 64);
        assert_eq!(ondisk_entry_size(2, false), 72);
        assert_eq!(ondisk_entry_size(9, false), 72);
        assert_eq!(ondisk_entry_size(10, false), 80);
        assert_eq!(ondisk_entry_size(1, true), 72);
    }
}

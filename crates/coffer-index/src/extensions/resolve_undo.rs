//! Resolve-undo extension (REUC).
//!
//! On-disk layout per path: the NUL-terminated path, three octal ASCII
//! modes (NUL-terminated, `0` for an absent side), then a raw object id
//! for each non-zero mode.

use bstr::BString;
use coffer_hash::ObjectId;
use coffer_object::FileMode;

use crate::extensions::{ResolveUndo, ResolveUndoEntry};
use crate::IndexError;

fn ext_err(reason: impl Into<String>) -> IndexError {
    IndexError::InvalidExtension {
        sig: "REUC".into(),
        reason: reason.into(),
    }
}

fn read_cstr<'a>(data: &'a [u8], cursor: &mut usize) -> Result<&'a [u8], IndexError> {
    let end = data[*cursor..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ext_err("missing NUL terminator"))?;
    let out = &data[*cursor..*cursor + end];
    *cursor += end + 1;
    Ok(out)
}

impl ResolveUndo {
    pub const SIGNATURE: &'static [u8; 4] = b"REUC";

    pub fn parse(data: &[u8]) -> Result<Self, IndexError> {
        let mut entries = Vec::new();
        let mut cursor = 0;

        while cursor < data.len() {
            let path = BString::from(read_cstr(data, &mut cursor)?);

            let mut modes = [None; 3];
            for mode in &mut modes {
                let text = read_cstr(data, &mut cursor)?;
                let text = std::str::from_utf8(text).map_err(|_| ext_err("non-ASCII mode"))?;
                let raw = u32::from_str_radix(text, 8)
                    .map_err(|_| ext_err(format!("invalid mode: {text}")))?;
                if raw != 0 {
                    *mode = Some(FileMode::from_raw(raw));
                }
            }

            let mut oids = [None; 3];
            for (slot, mode) in oids.iter_mut().zip(&modes) {
                if mode.is_none() {
                    continue;
                }
                let end = cursor + ObjectId::LEN;
                if end > data.len() {
                    return Err(ext_err("truncated object id"));
                }
                *slot = Some(
                    ObjectId::from_bytes(&data[cursor..end])
                        .map_err(|_| ext_err("invalid object id"))?,
                );
                cursor = end;
            }

            entries.push(ResolveUndoEntry { path, modes, oids });
        }

        Ok(ResolveUndo { entries })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for entry in &self.entries {
            buf.extend_from_slice(&entry.path);
            buf.push(0);
            for mode in &entry.modes {
                let raw = mode.map(|m| m.raw()).unwrap_or(0);
                buf.extend_from_slice(format!("{raw:o}").as_bytes());
                buf.push(0);
            }
            for (oid, mode) in entry.oids.iter().zip(&entry.modes) {
                if mode.is_some() {
                    if let Some(oid) = oid {
                        buf.extend_from_slice(oid.as_bytes());
                    }
                }
            }
        }
        buf
    }
}

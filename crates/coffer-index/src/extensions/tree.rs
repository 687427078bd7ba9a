//! Cache tree extension (TREE).
//!
//! Caches the tree object id covering each directory of the index so an
//! unchanged directory does not have to be re-serialized. A node whose
//! covered-entry count is negative is invalid; mutating any path
//! invalidates the nodes along it.

use bstr::{BStr, BString};
use coffer_hash::ObjectId;

use crate::IndexError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTree {
    pub root: CacheNode,
}

/// One directory's cached state. `covered` counts the index entries
/// under this directory, or is negative when the cache is invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNode {
    pub name: BString,
    pub covered: i32,
    pub oid: Option<ObjectId>,
    pub children: Vec<CacheNode>,
}

fn ext_err(reason: impl Into<String>) -> IndexError {
    IndexError::InvalidExtension {
        sig: "TREE".into(),
        reason: reason.into(),
    }
}

/// ASCII decimal terminated by `stop`; returns (value, bytes consumed
/// including the terminator).
fn read_decimal(data: &[u8], stop: u8) -> Result<(i64, usize), IndexError> {
    let end = data
        .iter()
        .position(|&b| b == stop)
        .ok_or_else(|| ext_err("missing number terminator"))?;
    let text = std::str::from_utf8(&data[..end]).map_err(|_| ext_err("non-ASCII number"))?;
    let value = text
        .parse()
        .map_err(|_| ext_err(format!("invalid number: {text}")))?;
    Ok((value, end + 1))
}

impl CacheTree {
    pub const SIGNATURE: &'static [u8; 4] = b"TREE";

    pub fn parse(data: &[u8]) -> Result<Self, IndexError> {
        // The root's name is empty, so the stream opens with its NUL.
        if data.first() != Some(&0) {
            return Err(ext_err("missing root name terminator"));
        }
        let mut cursor = 1;
        let root = parse_node(data, &mut cursor, BString::default())?;
        Ok(CacheTree { root })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        serialize_node(&self.root, &mut buf);
        buf
    }

    /// Invalidate the nodes covering `path`, from the root down. Every
    /// level on the way is invalidated even when a deeper component has
    /// no child node yet: the first file of a new directory still
    /// dirties all its tracked ancestors.
    pub fn invalidate(&mut self, path: &BStr) {
        invalidate_node(&mut self.root, path.as_ref());
    }

    /// The cached root tree id, when still valid.
    pub fn root_oid(&self) -> Option<&ObjectId> {
        if self.root.covered >= 0 {
            self.root.oid.as_ref()
        } else {
            None
        }
    }
}

fn parse_node(data: &[u8], cursor: &mut usize, name: BString) -> Result<CacheNode, IndexError> {
    let (covered, used) = read_decimal(&data[*cursor..], b' ')?;
    *cursor += used;
    let (child_count, used) = read_decimal(&data[*cursor..], b'\n')?;
    *cursor += used;
    let covered = i32::try_from(covered).map_err(|_| ext_err("entry count out of range"))?;
    let child_count = usize::try_from(child_count).map_err(|_| ext_err("negative child count"))?;

    let oid = if covered >= 0 {
        let end = *cursor + ObjectId::LEN;
        if end > data.len() {
            return Err(ext_err("truncated tree id"));
        }
        let oid = ObjectId::from_bytes(&data[*cursor..end])
            .map_err(|_| ext_err("invalid tree id"))?;
        *cursor = end;
        Some(oid)
    } else {
        None
    };

    let mut children = Vec::with_capacity(child_count);
    for _ in 0..child_count {
        let name_end = data[*cursor..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ext_err("unterminated child name"))?;
        let child_name = BString::from(&data[*cursor..*cursor + name_end]);
        *cursor += name_end + 1;
        children.push(parse_node(data, cursor, child_name)?);
    }

    Ok(CacheNode {
        name,
        covered,
        oid,
        children,
    })
}

fn serialize_node(node: &CacheNode, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&node.name);
    buf.push(0);
    buf.extend_from_slice(node.covered.to_string().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(node.children.len().to_string().as_bytes());
    buf.push(b'\n');
    if node.covered >= 0 {
        if let Some(oid) = &node.oid {
            buf.extend_from_slice(oid.as_bytes());
        }
    }
    for child in &node.children {
        serialize_node(child, buf);
    }
}

fn invalidate_node(node: &mut CacheNode, path: &[u8]) {
    node.covered = -1;
    node.oid = None;
    if let Some(slash) = path.iter().position(|&b| b == b'/') {
        let (dir, rest) = (&path[..slash], &path[slash + 1..]);
        if let Some(child) = node
            .children
            .iter_mut()
            .find(|c| c.name.as_slice() == dir)
        {
            invalidate_node(child, rest);
        }
    }
}

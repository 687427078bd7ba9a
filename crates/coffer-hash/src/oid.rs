use std::fmt;
use std::str::FromStr;

use crate::hex::{hex_decode, hex_to_string};
use crate::HashError;

/// A content identifier: the SHA-1 of an object's typed payload.
///
/// A fixed-width 160-bit key. Byte-lexicographic ordering on the raw
/// digest is the canonical order used by every sorted structure in the
/// engine (index entries, fan-out tries, pack lookups).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub [u8; 20]);

impl ObjectId {
    /// Number of raw bytes in an id.
    pub const LEN: usize = 20;
    /// Number of hex characters in an id.
    pub const HEX_LEN: usize = 40;

    /// The null id (all zeros). Used as an "absent" marker in wire formats
    /// and as the root path of a flat notes tree.
    pub const NULL: Self = Self([0u8; 20]);

    /// Id of the zero-length blob. Zero-size index entries are verified
    /// against this before being trusted, since a zeroed stat field can
    /// also mean the entry was smudged by a previous writer.
    pub const EMPTY_BLOB: Self = Self([
        0xe6, 0x9d, 0xe2, 0x9b, 0xb2, 0xd1, 0xd6, 0x43, 0x4b, 0x8b, 0x29, 0xae, 0x77, 0x5a,
        0xd8, 0xc2, 0xe4, 0x8c, 0x53, 0x91,
    ]);

    /// Create an ObjectId from a raw byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HashError> {
        if bytes.len() != Self::LEN {
            return Err(HashError::InvalidHashLength {
                expected: Self::LEN,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 20];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Create an ObjectId from a 40-character hex string.
    pub fn from_hex(hex: &str) -> Result<Self, HashError> {
        let mut bytes = [0u8; 20];
        hex_decode(hex.as_bytes(), &mut bytes)?;
        Ok(Self(bytes))
    }

    /// Get the raw bytes of the hash.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Check if this is the null (all-zeros) id.
    pub fn is_null(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Get the hex string representation (lowercase).
    pub fn to_hex(&self) -> String {
        hex_to_string(&self.0)
    }

    /// Get the `i`-th nibble (half-byte), most significant first.
    ///
    /// Nibble 0 is the high half of byte 0, nibble 1 the low half, and so
    /// on through nibble 39. This is the digit sequence a 16-ary trie
    /// walks when keyed by id.
    #[inline]
    pub fn nibble(&self, i: usize) -> u8 {
        let b = self.0[i >> 1];
        if i & 1 == 0 {
            b >> 4
        } else {
            b & 0x0f
        }
    }

    /// Get the first byte of the hash (for fan-out table indexing).
    pub fn first_byte(&self) -> u8 {
        self.0[0]
    }

    /// Compare the first `n` bytes of two ids.
    pub fn prefix_eq(&self, other: &Self, n: usize) -> bool {
        self.0[..n] == other.0[..n]
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", &self.to_hex()[..8])
    }
}

impl FromStr for ObjectId {
    type Err = HashError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl AsRef<[u8]> for ObjectId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

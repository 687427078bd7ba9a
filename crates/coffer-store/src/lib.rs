//! Object and ref storage abstractions for the coffer storage engine.
//!
//! Provides the [`ObjectStore`] and [`RefStore`] traits that higher layers
//! (the notes trie, the tree differ, index tree writing) build on, plus
//! in-memory implementations used for tests and scratch pipelines.

mod memory;

use coffer_hash::{HashError, Hasher, ObjectId};
use coffer_object::{ObjectType, Tree};

pub use error::StoreError;
pub use memory::{MemoryRefs, MemoryStore};

mod error {
    use coffer_hash::{HashError, ObjectId};
    use coffer_object::{ObjectError, ObjectType};

    #[derive(Debug, thiserror::Error)]
    pub enum StoreError {
        #[error("object not found: {0}")]
        NotFound(ObjectId),

        #[error("object {oid} is a {actual}, expected {expected}")]
        TypeMismatch {
            oid: ObjectId,
            expected: ObjectType,
            actual: ObjectType,
        },

        #[error("corrupt object {oid}: {reason}")]
        Corrupt { oid: ObjectId, reason: String },

        #[error("ref not found: {0}")]
        RefNotFound(String),

        #[error("ref '{name}' changed concurrently")]
        StaleRef { name: String },

        #[error(transparent)]
        Object(#[from] ObjectError),

        #[error(transparent)]
        Hash(#[from] HashError),

        #[error(transparent)]
        Io(#[from] std::io::Error),
    }
}

/// Lightweight object info (header only, no content).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    pub obj_type: ObjectType,
    pub size: usize,
}

/// Content-addressed object storage.
///
/// Objects are keyed by the hash of `"{type} {len}\0{content}"`, so a write
/// of identical content is always a no-op that returns the same id.
pub trait ObjectStore {
    /// Write an object, returning its id.
    fn write(&self, obj_type: ObjectType, content: &[u8]) -> Result<ObjectId, StoreError>;

    /// Read an object's type and content.
    fn read(&self, oid: &ObjectId) -> Result<(ObjectType, Vec<u8>), StoreError>;

    /// Read just the header (type + size) without the content.
    fn read_header(&self, oid: &ObjectId) -> Result<ObjectInfo, StoreError>;

    /// Check if an object exists.
    fn contains(&self, oid: &ObjectId) -> bool;

    /// Read an object, requiring a specific type.
    fn read_typed(&self, oid: &ObjectId, expected: ObjectType) -> Result<Vec<u8>, StoreError> {
        let (actual, content) = self.read(oid)?;
        if actual != expected {
            return Err(StoreError::TypeMismatch {
                oid: *oid,
                expected,
                actual,
            });
        }
        Ok(content)
    }

    /// Read and parse a tree object.
    fn read_tree(&self, oid: &ObjectId) -> Result<Tree, StoreError> {
        let content = self.read_typed(oid, ObjectType::Tree)?;
        Ok(Tree::parse(&content)?)
    }

    /// Serialize and write a tree object.
    fn write_tree(&self, tree: &Tree) -> Result<ObjectId, StoreError> {
        self.write(ObjectType::Tree, &tree.serialize_content())
    }

    /// Write a blob object.
    fn write_blob(&self, content: &[u8]) -> Result<ObjectId, StoreError> {
        self.write(ObjectType::Blob, content)
    }
}

/// Named references resolving to object ids.
///
/// Updates are compare-and-swap: the caller states what it believes the
/// current value is, and the update fails with [`StoreError::StaleRef`] if
/// another writer got there first.
pub trait RefStore {
    /// Resolve a ref name to an id. Returns `None` if the ref does not exist.
    fn resolve(&self, name: &str) -> Result<Option<ObjectId>, StoreError>;

    /// Update a ref, checking the expected old value.
    ///
    /// `expected` of `None` means the ref must not currently exist.
    /// A `new` value of `None` deletes the ref.
    fn update(
        &self,
        name: &str,
        expected: Option<ObjectId>,
        new: Option<ObjectId>,
    ) -> Result<(), StoreError>;
}

/// Compute the id content of the given type would be stored under,
/// without writing anything.
pub fn hash_object(obj_type: ObjectType, content: &[u8]) -> Result<ObjectId, HashError> {
    Hasher::hash_object(obj_type.as_str(), content)
}

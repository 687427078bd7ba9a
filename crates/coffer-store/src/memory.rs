use std::collections::HashMap;
use std::sync::RwLock;

use coffer_hash::ObjectId;
use coffer_object::ObjectType;

use crate::{hash_object, ObjectInfo, ObjectStore, RefStore, StoreError};

/// In-memory content-addressed object store.
///
/// Used by tests and by pipelines that build objects before deciding
/// whether to persist them.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<ObjectId, (ObjectType, Vec<u8>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().unwrap().is_empty()
    }
}

impl ObjectStore for MemoryStore {
    fn write(&self, obj_type: ObjectType, content: &[u8]) -> Result<ObjectId, StoreError> {
        let oid = hash_object(obj_type, content)?;
        self.objects
            .write()
            .unwrap()
            .entry(oid)
            .or_insert_with(|| (obj_type, content.to_vec()));
        Ok(oid)
    }

    fn read(&self, oid: &ObjectId) -> Result<(ObjectType, Vec<u8>), StoreError> {
        self.objects
            .read()
            .unwrap()
            .get(oid)
            .cloned()
            .ok_or(StoreError::NotFound(*oid))
    }

    fn read_header(&self, oid: &ObjectId) -> Result<ObjectInfo, StoreError> {
        self.objects
            .read()
            .unwrap()
            .get(oid)
            .map(|(obj_type, content)| ObjectInfo {
                obj_type: *obj_type,
                size: content.len(),
            })
            .ok_or(StoreError::NotFound(*oid))
    }

    fn contains(&self, oid: &ObjectId) -> bool {
        self.objects.read().unwrap().contains_key(oid)
    }
}

/// In-memory ref store with compare-and-swap updates.
#[derive(Default)]
pub struct MemoryRefs {
    refs: RwLock<HashMap<String, ObjectId>>,
}

impl MemoryRefs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RefStore for MemoryRefs {
    fn resolve(&self, name: &str) -> Result<Option<ObjectId>, StoreError> {
        Ok(self.refs.read().unwrap().get(name).copied())
    }

    fn update(
        &self,
        name: &str,
        expected: Option<ObjectId>,
        new: Option<ObjectId>,
    ) -> Result<(), StoreError> {
        let mut refs = self.refs.write().unwrap();
        let current = refs.get(name).copied();
        if current != expected {
            return Err(StoreError::StaleRef {
                name: name.to_string(),
            });
        }
        match new {
            Some(oid) => {
                refs.insert(name.to_string(), oid);
            }
            None => {
                refs.remove(name);
            }
        }
        Ok(())
    }
}

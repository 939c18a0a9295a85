//! In-memory object store for tests and embedding.

use crate::error::Result;
use crate::hash::Hash;
use crate::object::ObjectType;
use crate::store::ObjectStore;
use crate::tree::{self, TreeEntry};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// `HashMap`-based object store.
///
/// Objects are held in memory behind a lock. The store counts both save
/// calls and physical writes (saves of objects it did not already hold), so
/// callers can check that a persist did not even re-serialize anything.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<Hash, (ObjectType, Vec<u8>)>>,
    saves: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Number of objects written since creation.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of `save_blob` and `save_tree` calls, including ones that
    /// stored nothing new.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Remove an object, simulating an upstream deletion.
    pub fn remove(&self, id: &Hash) -> bool {
        self.objects.write().remove(id).is_some()
    }

    fn read(&self, id: &Hash, expected: ObjectType) -> Result<Option<Vec<u8>>> {
        match self.objects.read().get(id) {
            Some((object_type, data)) if *object_type == expected => Ok(Some(data.clone())),
            Some((object_type, _)) => Err(crate::Error::invalid_object_type(
                expected.as_str(),
                object_type.as_str(),
            )),
            None => Ok(None),
        }
    }

    fn write(&self, object_type: ObjectType, data: Vec<u8>) -> Hash {
        self.saves.fetch_add(1, Ordering::SeqCst);
        let id = Hash::for_object(object_type, &data);
        let mut map = self.objects.write();
        map.entry(id).or_insert_with(|| {
            self.writes.fetch_add(1, Ordering::SeqCst);
            (object_type, data)
        });
        id
    }
}

impl ObjectStore for MemoryStore {
    fn read_blob(&self, id: &Hash) -> Result<Option<Vec<u8>>> {
        self.read(id, ObjectType::Blob)
    }

    fn blob_size(&self, id: &Hash) -> Result<Option<u64>> {
        match self.objects.read().get(id) {
            Some((ObjectType::Blob, data)) => Ok(Some(data.len() as u64)),
            Some((object_type, _)) => Err(crate::Error::invalid_object_type(
                ObjectType::Blob.as_str(),
                object_type.as_str(),
            )),
            None => Ok(None),
        }
    }

    fn read_tree(&self, id: &Hash) -> Result<Option<Vec<TreeEntry>>> {
        match self.read(id, ObjectType::Tree)? {
            Some(payload) => tree::decode_tree(&payload).map(Some),
            None => Ok(None),
        }
    }

    fn has_object(&self, id: &Hash) -> Result<bool> {
        Ok(self.objects.read().contains_key(id))
    }

    fn save_blob(&self, data: &[u8]) -> Result<Hash> {
        Ok(self.write(ObjectType::Blob, data.to_vec()))
    }

    fn save_tree(&self, entries: Vec<TreeEntry>) -> Result<Hash> {
        let payload = tree::encode_tree(entries)?;
        Ok(self.write(ObjectType::Tree, payload))
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("object_count", &self.len())
            .field("saves", &self.save_count())
            .field("writes", &self.write_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::FileMode;

    #[test]
    fn test_write_and_read_blob() {
        let store = MemoryStore::new();
        let id = store.save_blob(b"hello world").unwrap();
        assert_eq!(store.read_blob(&id).unwrap().unwrap(), b"hello world");
        assert_eq!(store.blob_size(&id).unwrap(), Some(11));
        assert!(store.has_object(&id).unwrap());
    }

    #[test]
    fn test_idempotent_writes_are_not_counted() {
        let store = MemoryStore::new();
        store.save_blob(b"same").unwrap();
        store.save_blob(b"same").unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.save_count(), 2);
    }

    #[test]
    fn test_save_count_includes_deduplicated_trees() {
        let store = MemoryStore::new();
        let blob = store.save_blob(b"a").unwrap();
        let entries = || vec![TreeEntry::new(FileMode::Regular, blob, "a").unwrap()];
        store.save_tree(entries()).unwrap();
        store.save_blob(b"a").unwrap();
        store.save_tree(entries()).unwrap();

        assert_eq!(store.write_count(), 2);
        assert_eq!(store.save_count(), 4);
    }

    #[test]
    fn test_tree_roundtrip_is_sorted() {
        let store = MemoryStore::new();
        let blob = store.save_blob(b"x").unwrap();
        let id = store
            .save_tree(vec![
                TreeEntry::new(FileMode::Regular, blob, "b").unwrap(),
                TreeEntry::new(FileMode::Regular, blob, "a").unwrap(),
            ])
            .unwrap();

        let entries = store.read_tree(&id).unwrap().unwrap();
        assert_eq!(entries[0].name, "a");
        assert_eq!(entries[1].name, "b");
    }

    #[test]
    fn test_missing_and_removed_objects() {
        let store = MemoryStore::new();
        let id = store.save_blob(b"gone soon").unwrap();
        assert!(store.remove(&id));
        assert!(store.read_blob(&id).unwrap().is_none());
        assert!(store.blob_size(&id).unwrap().is_none());
        assert!(!store.remove(&id));
    }

    #[test]
    fn test_kind_mismatch_is_an_error() {
        let store = MemoryStore::new();
        let tree = store.save_tree(Vec::new()).unwrap();
        assert!(store.read_blob(&tree).is_err());
        assert!(store.read_tree(&tree).unwrap().unwrap().is_empty());
    }
}

//! Writing dirty nodes back to the object store.
//!
//! Persisting is a post-order walk: children are written before the tree
//! that lists them. Clean nodes short-circuit to their existing address, so
//! an unmodified subtree costs no store writes and is never loaded. Empty
//! directories below the root produce no object and are left out of their
//! parent's listing.

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::node::Node;
use crate::store::ObjectStore;
use crate::tree::TreeEntry;
use tracing::trace;

impl Node {
    /// Write this node and every dirty descendant, returning the node's
    /// address. `None` means the node is an empty non-root directory and was
    /// pruned.
    ///
    /// Afterwards the node and its descendants are clean.
    pub fn persist(&mut self, is_root: bool, store: &dyn ObjectStore) -> Result<Option<Hash>> {
        if !self.is_dirty() {
            return Ok(self.object_id());
        }

        let id = if self.is_directory() {
            self.persist_directory(is_root, store)?
        } else {
            Some(self.persist_file(store)?)
        };

        self.set_object(id);
        self.take_snapshot();
        Ok(id)
    }

    fn persist_file(&self, store: &dyn ObjectStore) -> Result<Hash> {
        match self.loaded_content() {
            Some(bytes) => store.save_blob(bytes),
            // Only the mode changed; the blob is the same.
            None => self
                .object_id()
                .ok_or_else(|| Error::invalid_state("file has neither content nor an address")),
        }
    }

    fn persist_directory(&mut self, is_root: bool, store: &dyn ObjectStore) -> Result<Option<Hash>> {
        if !self.is_initialized() {
            if let Some(id) = self.object_id() {
                return Ok(Some(id));
            }
        }

        let mut entries = Vec::new();
        if let Some(children) = self.loaded_children_mut() {
            for (name, child) in children.iter_mut() {
                if let Some(id) = child.persist(false, store)? {
                    entries.push(TreeEntry::new(child.mode(), id, name.clone())?);
                }
            }
        }

        if entries.is_empty() && !is_root {
            trace!("pruning empty directory");
            return Ok(None);
        }

        trace!(entries = entries.len(), "writing tree");
        store.save_tree(entries).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::tree::FileMode;

    fn file(content: &[u8]) -> Node {
        Node::file(content.to_vec(), FileMode::Regular).unwrap()
    }

    #[test]
    fn test_empty_root_is_written() {
        let store = MemoryStore::new();
        let mut root = Node::root(None);
        let id = root.persist(true, &store).unwrap().unwrap();
        assert!(store.read_tree(&id).unwrap().unwrap().is_empty());
        assert!(!root.is_dirty());
    }

    #[test]
    fn test_empty_subdirectories_are_pruned() {
        let store = MemoryStore::new();
        let mut root = Node::root(None);
        let mut outer = Node::directory();
        outer.insert_child("inner", Node::directory(), false, &store).unwrap();
        root.insert_child("outer", outer, false, &store).unwrap();
        root.insert_child("keep.txt", file(b"k"), false, &store).unwrap();

        let id = root.persist(true, &store).unwrap().unwrap();
        let entries = store.read_tree(&id).unwrap().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "keep.txt");

        // The pruned directory stays in memory and does not keep the tree dirty.
        assert!(root.has_child("outer", &store).unwrap());
        assert!(!root.is_dirty());
    }

    #[test]
    fn test_clean_subtrees_are_not_rewritten_or_loaded() {
        let store = MemoryStore::new();
        let mut root = Node::root(None);
        let mut dir = Node::directory();
        dir.insert_child("a", file(b"a"), false, &store).unwrap();
        root.insert_child("dir", dir, false, &store).unwrap();
        let first = root.persist(true, &store).unwrap().unwrap();

        let mut reopened = Node::root(Some(first));
        reopened.insert_child("b", file(b"b"), false, &store).unwrap();
        let saves = store.save_count();
        let second = reopened.persist(true, &store).unwrap().unwrap();

        // One blob and one root tree; "dir" is referenced by address.
        assert_eq!(store.save_count(), saves + 2);
        assert_ne!(first, second);
        let dir = reopened.child("dir", &store).unwrap().unwrap();
        assert!(!dir.is_initialized());
    }

    #[test]
    fn test_mode_change_reuses_blob() {
        let store = MemoryStore::new();
        let blob = store.save_blob(b"#!/bin/sh").unwrap();
        let mut node = Node::from_object(FileMode::Regular, blob);
        node.set_mode(FileMode::Executable).unwrap();

        let saves = store.save_count();
        assert_eq!(node.persist(false, &store).unwrap(), Some(blob));
        assert_eq!(store.save_count(), saves);
        assert!(!node.is_dirty());
    }

    #[test]
    fn test_persist_is_deterministic() {
        let build = |store: &MemoryStore| {
            let mut root = Node::root(None);
            root.insert_child("z", file(b"1"), false, store).unwrap();
            root.insert_child("a", file(b"2"), false, store).unwrap();
            root.persist(true, store).unwrap().unwrap()
        };
        let store = MemoryStore::new();
        assert_eq!(build(&store), build(&MemoryStore::new()));
    }
}

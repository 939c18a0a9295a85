//! In-memory file hierarchy nodes.
//!
//! A [`Node`] is either a file (regular, executable or symlink) or a
//! directory. Nodes loaded from a stored tree start out holding only their
//! address; their content or children are pulled from the store the first
//! time they are needed, exactly once, and cached.
//!
//! Nodes never hold the store. Every operation that may touch storage takes
//! it as an argument.
//!
//! Dirtiness is derived from a revision counter: each mutation bumps the
//! node's revision, and a node is clean only while its revision equals the
//! one recorded by the last load or persist. A directory is also dirty while
//! any materialized descendant is dirty.

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::store::ObjectStore;
use crate::tree::FileMode;
use std::collections::BTreeMap;
use once_cell::sync::OnceCell;
use tracing::{debug, warn};

/// Children of a directory, keyed by entry name.
pub type Children = BTreeMap<String, Node>;

#[derive(Debug)]
enum Payload {
    File {
        content: OnceCell<Vec<u8>>,
        size: OnceCell<u64>,
    },
    Directory {
        children: OnceCell<Children>,
    },
}

impl Payload {
    fn for_mode(mode: FileMode) -> Self {
        if mode.is_directory() {
            Payload::Directory {
                children: OnceCell::new(),
            }
        } else {
            Payload::File {
                content: OnceCell::new(),
                size: OnceCell::new(),
            }
        }
    }
}

/// One entry of the working tree.
#[derive(Debug)]
pub struct Node {
    mode: FileMode,
    object_id: Option<Hash>,
    revision: u64,
    snapshot: Option<u64>,
    payload: Payload,
}

impl Node {
    /// A node backed by a stored object. It is clean and nothing is loaded.
    pub fn from_object(mode: FileMode, id: Hash) -> Self {
        let mut node = Self {
            mode,
            object_id: Some(id),
            revision: 0,
            snapshot: None,
            payload: Payload::for_mode(mode),
        };
        node.take_snapshot();
        node
    }

    /// A new file holding `content`. It has no address yet, so it is dirty.
    ///
    /// `mode` must not be [`FileMode::Directory`].
    pub fn file(content: Vec<u8>, mode: FileMode) -> Result<Self> {
        if mode.is_directory() {
            return Err(Error::invalid_state("file node cannot have directory mode"));
        }
        Ok(Self {
            mode,
            object_id: None,
            revision: 0,
            snapshot: None,
            payload: Payload::File {
                content: OnceCell::with_value(content),
                size: OnceCell::new(),
            },
        })
    }

    /// A new, empty directory.
    pub fn directory() -> Self {
        Self::directory_with(Children::new())
    }

    /// A new directory owning `children`.
    pub fn directory_with(children: Children) -> Self {
        Self {
            mode: FileMode::Directory,
            object_id: None,
            revision: 0,
            snapshot: None,
            payload: Payload::Directory {
                children: OnceCell::with_value(children),
            },
        }
    }

    /// The root of a working tree: the stored tree `id`, or a new empty tree.
    pub fn root(id: Option<Hash>) -> Self {
        match id {
            Some(id) => Self::from_object(FileMode::Directory, id),
            None => Self::directory(),
        }
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    /// The address of the last loaded or persisted state.
    pub fn object_id(&self) -> Option<Hash> {
        self.object_id
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.payload, Payload::Directory { .. })
    }

    pub fn is_file(&self) -> bool {
        !self.is_directory()
    }

    pub fn is_executable_file(&self) -> bool {
        self.mode == FileMode::Executable
    }

    /// Whether lazy content (file bytes or directory listing) is loaded.
    pub fn is_initialized(&self) -> bool {
        match &self.payload {
            Payload::File { content, .. } => content.get().is_some(),
            Payload::Directory { children } => children.get().is_some(),
        }
    }

    /// Whether the in-memory state may differ from what `object_id` denotes.
    pub fn is_dirty(&self) -> bool {
        if self.snapshot != Some(self.revision) {
            return true;
        }
        match &self.payload {
            Payload::Directory { children } => children
                .get()
                .is_some_and(|children| children.values().any(Node::is_dirty)),
            Payload::File { .. } => false,
        }
    }

    /// Record the current state as the clean baseline.
    pub(crate) fn take_snapshot(&mut self) {
        self.snapshot = Some(self.revision);
    }

    /// Set the address produced by a persist.
    pub(crate) fn set_object(&mut self, id: Option<Hash>) {
        self.object_id = id;
    }

    fn touch(&mut self) {
        self.revision += 1;
    }

    /// Change between regular, executable and symlink file modes.
    pub fn set_mode(&mut self, mode: FileMode) -> Result<()> {
        if mode.is_directory() != self.is_directory() {
            return Err(Error::invalid_state(format!(
                "cannot change a {} node to {}",
                self.mode.as_str(),
                mode.as_str()
            )));
        }
        if mode != self.mode {
            self.mode = mode;
            self.touch();
        }
        Ok(())
    }

    /// File bytes, loaded on first access.
    pub fn content(&self, store: &dyn ObjectStore) -> Result<&[u8]> {
        match &self.payload {
            Payload::File { content, .. } => content
                .get_or_try_init(|| self.load_blob(store))
                .map(Vec::as_slice),
            Payload::Directory { .. } => Err(Error::invalid_state("directory has no content")),
        }
    }

    /// Replace the file bytes.
    pub fn set_content(&mut self, bytes: Vec<u8>) -> Result<()> {
        match &mut self.payload {
            Payload::File { content, size } => {
                *content = OnceCell::with_value(bytes);
                *size = OnceCell::new();
            }
            Payload::Directory { .. } => {
                return Err(Error::invalid_state("directory has no content"));
            }
        }
        self.touch();
        Ok(())
    }

    /// Size in bytes. Directories report zero.
    ///
    /// Loaded content answers directly; otherwise the store's metadata
    /// lookup is used and the result cached.
    pub fn size(&self, store: &dyn ObjectStore) -> Result<u64> {
        let Payload::File { content, size } = &self.payload else {
            return Ok(0);
        };
        if let Some(bytes) = content.get() {
            return Ok(bytes.len() as u64);
        }
        let size = size.get_or_try_init(|| -> Result<u64> {
            let Some(id) = &self.object_id else {
                return Ok(0);
            };
            Ok(store.blob_size(id)?.unwrap_or_else(|| {
                warn!(id = %id.short(), "blob missing from store; reporting size 0");
                0
            }))
        })?;
        Ok(*size)
    }

    /// Directory listing, loaded on first access.
    pub fn children(&self, store: &dyn ObjectStore) -> Result<&Children> {
        match &self.payload {
            Payload::Directory { children } => children.get_or_try_init(|| self.load_tree(store)),
            Payload::File { .. } => Err(Error::invalid_state("file has no children")),
        }
    }

    /// File bytes if already loaded; never touches the store.
    pub(crate) fn loaded_content(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::File { content, .. } => content.get().map(Vec::as_slice),
            Payload::Directory { .. } => None,
        }
    }

    /// Children if already loaded; never touches the store.
    pub(crate) fn loaded_children_mut(&mut self) -> Option<&mut Children> {
        match &mut self.payload {
            Payload::Directory { children } => children.get_mut(),
            Payload::File { .. } => None,
        }
    }

    fn children_loaded_mut(&mut self, store: &dyn ObjectStore) -> Result<&mut Children> {
        self.children(store)?;
        match &mut self.payload {
            Payload::Directory { children } => children
                .get_mut()
                .ok_or_else(|| Error::invalid_state("directory listing not loaded")),
            Payload::File { .. } => Err(Error::invalid_state("file has no children")),
        }
    }

    pub fn child(&self, name: &str, store: &dyn ObjectStore) -> Result<Option<&Node>> {
        Ok(self.children(store)?.get(name))
    }

    /// Mutable access to a child. Does not by itself mark this directory
    /// dirty; changes below it are picked up through the child.
    pub fn child_mut(&mut self, name: &str, store: &dyn ObjectStore) -> Result<Option<&mut Node>> {
        Ok(self.children_loaded_mut(store)?.get_mut(name))
    }

    pub fn has_child(&self, name: &str, store: &dyn ObjectStore) -> Result<bool> {
        Ok(self.children(store)?.contains_key(name))
    }

    /// Insert `node` under `name`. Returns `false` without changing anything
    /// if the name is taken and `replace` is not set.
    pub fn insert_child(
        &mut self,
        name: &str,
        node: Node,
        replace: bool,
        store: &dyn ObjectStore,
    ) -> Result<bool> {
        let children = self.children_loaded_mut(store)?;
        if !replace && children.contains_key(name) {
            return Ok(false);
        }
        children.insert(name.to_string(), node);
        self.touch();
        Ok(true)
    }

    /// Detach the child called `name`.
    pub fn remove_child(&mut self, name: &str, store: &dyn ObjectStore) -> Result<Option<Node>> {
        let removed = self.children_loaded_mut(store)?.remove(name);
        if removed.is_some() {
            self.touch();
        }
        Ok(removed)
    }

    /// Clone this subtree into a new, fully independent node.
    ///
    /// A clean node that was never loaded, and whose object the store
    /// confirms, becomes a reference to the same address. Anything loaded or
    /// modified is copied now: bytes are duplicated and children cloned
    /// recursively, and the copy has no address until it is persisted.
    pub fn duplicate(&self, store: &dyn ObjectStore) -> Result<Node> {
        if !self.is_initialized() && !self.is_dirty() {
            if let Some(id) = self.object_id {
                if store.has_object(&id)? {
                    return Ok(Node::from_object(self.mode, id));
                }
            }
        }

        match &self.payload {
            Payload::File { .. } => Node::file(self.content(store)?.to_vec(), self.mode),
            Payload::Directory { .. } => {
                let mut children = Children::new();
                for (name, child) in self.children(store)? {
                    children.insert(name.clone(), child.duplicate(store)?);
                }
                Ok(Node::directory_with(children))
            }
        }
    }

    fn load_blob(&self, store: &dyn ObjectStore) -> Result<Vec<u8>> {
        let Some(id) = &self.object_id else {
            return Ok(Vec::new());
        };
        match store.read_blob(id)? {
            Some(bytes) => {
                debug!(id = %id.short(), len = bytes.len(), "blob loaded");
                Ok(bytes)
            }
            None => {
                warn!(id = %id.short(), "blob missing from store; loading as empty");
                Ok(Vec::new())
            }
        }
    }

    fn load_tree(&self, store: &dyn ObjectStore) -> Result<Children> {
        let Some(id) = &self.object_id else {
            return Ok(Children::new());
        };
        let Some(entries) = store.read_tree(id)? else {
            warn!(id = %id.short(), "tree missing from store; loading as empty");
            return Ok(Children::new());
        };
        debug!(id = %id.short(), entries = entries.len(), "tree loaded");
        Ok(entries
            .into_iter()
            .map(|entry| (entry.name, Node::from_object(entry.mode, entry.hash)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::tree::TreeEntry;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    /// Delays and counts reads so racing loaders overlap.
    struct SlowStore {
        inner: MemoryStore,
        reads: AtomicUsize,
    }

    impl SlowStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                reads: AtomicUsize::new(0),
            }
        }

        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }

        fn slow_read(&self) {
            self.reads.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
        }
    }

    impl ObjectStore for SlowStore {
        fn read_blob(&self, id: &Hash) -> Result<Option<Vec<u8>>> {
            self.slow_read();
            self.inner.read_blob(id)
        }

        fn blob_size(&self, id: &Hash) -> Result<Option<u64>> {
            self.slow_read();
            self.inner.blob_size(id)
        }

        fn read_tree(&self, id: &Hash) -> Result<Option<Vec<TreeEntry>>> {
            self.slow_read();
            self.inner.read_tree(id)
        }

        fn has_object(&self, id: &Hash) -> Result<bool> {
            self.inner.has_object(id)
        }

        fn save_blob(&self, data: &[u8]) -> Result<Hash> {
            self.inner.save_blob(data)
        }

        fn save_tree(&self, entries: Vec<TreeEntry>) -> Result<Hash> {
            self.inner.save_tree(entries)
        }
    }

    fn race<T: Send>(threads: usize, load: impl Fn() -> T + Sync) -> Vec<T> {
        let barrier = Barrier::new(threads);
        thread::scope(|s| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        load()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    fn stored_tree(store: &MemoryStore) -> Hash {
        let a = store.save_blob(b"alpha").unwrap();
        let b = store.save_blob(b"beta").unwrap();
        let sub = store
            .save_tree(vec![TreeEntry::new(FileMode::Regular, b, "b.txt").unwrap()])
            .unwrap();
        store
            .save_tree(vec![
                TreeEntry::new(FileMode::Regular, a, "a.txt").unwrap(),
                TreeEntry::new(FileMode::Directory, sub, "sub").unwrap(),
            ])
            .unwrap()
    }

    #[test]
    fn test_stored_node_is_clean_and_lazy() {
        let store = MemoryStore::new();
        let root = Node::root(Some(stored_tree(&store)));

        assert!(!root.is_dirty());
        assert!(!root.is_initialized());

        let children = root.children(&store).unwrap();
        assert_eq!(children.len(), 2);
        assert!(root.is_initialized());
        assert!(!root.is_dirty());

        let file = root.child("a.txt", &store).unwrap().unwrap();
        assert!(!file.is_initialized());
        assert_eq!(file.content(&store).unwrap(), b"alpha");
        assert!(file.is_initialized());
        assert!(!file.is_dirty());
    }

    #[test]
    fn test_new_nodes_are_dirty() {
        assert!(Node::directory().is_dirty());
        assert!(Node::file(b"x".to_vec(), FileMode::Regular).unwrap().is_dirty());
        assert!(Node::file(Vec::new(), FileMode::Directory).is_err());
    }

    #[test]
    fn test_absent_address_loads_empty() {
        let store = MemoryStore::new();
        let gone = store.save_blob(b"deleted upstream").unwrap();
        store.remove(&gone);

        let file = Node::from_object(FileMode::Regular, gone);
        assert_eq!(file.size(&store).unwrap(), 0);
        assert_eq!(file.content(&store).unwrap(), b"");

        let dir = Node::from_object(FileMode::Directory, Hash::hash_bytes(b"missing"));
        assert!(dir.children(&store).unwrap().is_empty());
    }

    #[test]
    fn test_size_uses_metadata_without_loading_content() {
        let store = MemoryStore::new();
        let id = store.save_blob(b"twelve bytes").unwrap();
        let file = Node::from_object(FileMode::Regular, id);

        assert_eq!(file.size(&store).unwrap(), 12);
        assert!(!file.is_initialized());
        assert_eq!(Node::directory().size(&store).unwrap(), 0);
    }

    #[test]
    fn test_mutation_marks_dirty_and_propagates_to_ancestors() {
        let store = MemoryStore::new();
        let mut root = Node::root(Some(stored_tree(&store)));

        let sub = root.child_mut("sub", &store).unwrap().unwrap();
        let leaf = sub.child_mut("b.txt", &store).unwrap().unwrap();
        leaf.set_content(b"changed".to_vec()).unwrap();
        assert!(leaf.is_dirty());
        assert_eq!(leaf.size(&store).unwrap(), 7);

        assert!(root.child("sub", &store).unwrap().unwrap().is_dirty());
        assert!(root.is_dirty());
        assert!(!root.child("a.txt", &store).unwrap().unwrap().is_dirty());
    }

    #[test]
    fn test_insert_respects_existing_names() {
        let store = MemoryStore::new();
        let mut dir = Node::directory();
        let file = || Node::file(b"x".to_vec(), FileMode::Regular).unwrap();

        assert!(dir.insert_child("f", file(), false, &store).unwrap());
        assert!(!dir.insert_child("f", Node::directory(), false, &store).unwrap());
        assert!(dir.child("f", &store).unwrap().unwrap().is_file());

        assert!(dir.insert_child("f", Node::directory(), true, &store).unwrap());
        assert!(dir.child("f", &store).unwrap().unwrap().is_directory());

        assert!(dir.remove_child("f", &store).unwrap().is_some());
        assert!(dir.remove_child("f", &store).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_of_untouched_node_is_a_reference() {
        let store = MemoryStore::new();
        let root = Node::root(Some(stored_tree(&store)));
        let sub = root.child("sub", &store).unwrap().unwrap();

        let copy = sub.duplicate(&store).unwrap();
        assert_eq!(copy.object_id(), sub.object_id());
        assert!(!copy.is_dirty());
        assert!(!copy.is_initialized());
        assert!(!sub.is_initialized());
    }

    #[test]
    fn test_duplicate_of_loaded_node_is_deep_and_independent() {
        let store = MemoryStore::new();
        let root = Node::root(Some(stored_tree(&store)));
        let file = root.child("a.txt", &store).unwrap().unwrap();
        file.content(&store).unwrap();

        let mut copy = file.duplicate(&store).unwrap();
        assert!(copy.object_id().is_none());
        assert!(copy.is_dirty());

        copy.set_content(b"different".to_vec()).unwrap();
        assert_eq!(file.content(&store).unwrap(), b"alpha");
        assert_eq!(copy.content(&store).unwrap(), b"different");
    }

    #[test]
    fn test_duplicate_of_unconfirmed_address_copies_content() {
        let store = MemoryStore::new();
        let id = store.save_blob(b"soon gone").unwrap();
        let file = Node::from_object(FileMode::Executable, id);
        store.remove(&id);

        let copy = file.duplicate(&store).unwrap();
        assert!(copy.object_id().is_none());
        assert_eq!(copy.mode(), FileMode::Executable);
        assert_eq!(copy.content(&store).unwrap(), b"");
    }

    #[test]
    fn test_set_mode_between_file_kinds_only() {
        let mut file = Node::file(Vec::new(), FileMode::Regular).unwrap();
        file.take_snapshot();
        assert!(!file.is_dirty());

        file.set_mode(FileMode::Executable).unwrap();
        assert!(file.is_executable_file());
        assert!(file.is_dirty());
        assert!(file.set_mode(FileMode::Directory).is_err());
        assert!(Node::directory().set_mode(FileMode::Regular).is_err());
    }

    #[test]
    fn test_concurrent_content_loads_once() {
        let store = SlowStore::new();
        let id = store.save_blob(b"shared").unwrap();
        let file = Node::from_object(FileMode::Regular, id);

        let results = race(8, || file.content(&store).unwrap().to_vec());

        assert!(results.iter().all(|bytes| bytes == b"shared"));
        assert_eq!(store.reads(), 1);
    }

    #[test]
    fn test_concurrent_children_and_size_load_once() {
        let store = SlowStore::new();
        let root = Node::root(Some(stored_tree(&store.inner)));

        let counts = race(8, || root.children(&store).unwrap().len());
        assert!(counts.iter().all(|&n| n == 2));
        assert_eq!(store.reads(), 1);

        let file = root.child("a.txt", &store).unwrap().unwrap();
        let sizes = race(8, || file.size(&store).unwrap());
        assert!(sizes.iter().all(|&n| n == 5));
        assert_eq!(store.reads(), 2);
    }
}

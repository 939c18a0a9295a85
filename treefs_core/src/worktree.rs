//! A mutable, lazily loaded view of a stored tree.
//!
//! [`WorkTree`] owns the root [`Node`] behind a read/write lock. Lookups
//! take the read lock and may still load content from the store, since
//! nodes cache lazily through interior mutability. Every mutation takes the
//! write lock for its whole duration, so each operation is atomic with
//! respect to the others. A move is two such steps.

use crate::error::{Error, Result};
use crate::handle::{FileHandle, OpenOptions};
use crate::hash::Hash;
use crate::node::Node;
use crate::path::TreePath;
use crate::store::ObjectStore;
use crate::tree::FileMode;
use parking_lot::{RwLock, RwLockReadGuard};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Options for [`WorkTree::copy`] and [`WorkTree::rename`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyOptions {
    /// Supersede whatever already exists at the target.
    pub replace_existing: bool,
}

impl CopyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_existing(mut self, replace: bool) -> Self {
        self.replace_existing = replace;
        self
    }
}

/// Access checked by [`WorkTree::check_access`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    Execute,
}

/// Attributes of one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metadata {
    pub mode: FileMode,
    /// Byte length for files, zero for directories.
    pub size: u64,
    /// Address of the last loaded or persisted state.
    pub object_id: Option<Hash>,
    /// Whether the entry has changes not yet persisted.
    pub dirty: bool,
}

impl Metadata {
    pub fn is_dir(&self) -> bool {
        self.mode.is_directory()
    }

    pub fn is_file(&self) -> bool {
        !self.is_dir()
    }

    pub fn is_executable(&self) -> bool {
        self.mode == FileMode::Executable
    }

    pub fn is_symlink(&self) -> bool {
        self.mode == FileMode::Symlink
    }
}

/// One child in a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub mode: FileMode,
    pub object_id: Option<Hash>,
}

type EntryFilter = Box<dyn Fn(&DirEntry) -> bool + Send + Sync>;

/// A directory listing captured at the time of the call, sorted by name.
///
/// Iteration applies the optional filter lazily and can be repeated.
pub struct ReadDir {
    path: TreePath,
    entries: Vec<DirEntry>,
    filter: Option<EntryFilter>,
}

impl ReadDir {
    /// The listed directory.
    pub fn path(&self) -> &TreePath {
        &self.path
    }

    /// Keep only the entries accepted by `filter`.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&DirEntry) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(filter));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &DirEntry> + '_ {
        self.entries
            .iter()
            .filter(move |entry| self.filter.as_ref().is_none_or(|accept| accept(*entry)))
    }

    /// Entry names in order.
    pub fn names(&self) -> Vec<String> {
        self.iter().map(|entry| entry.name.clone()).collect()
    }
}

impl<'a> IntoIterator for &'a ReadDir {
    type Item = &'a DirEntry;
    type IntoIter = Box<dyn Iterator<Item = &'a DirEntry> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

impl std::fmt::Debug for ReadDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadDir")
            .field("path", &self.path)
            .field("entries", &self.entries.len())
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

/// An in-memory working copy of a tree, backed by an object store.
pub struct WorkTree {
    store: Arc<dyn ObjectStore>,
    root: RwLock<Node>,
}

impl WorkTree {
    /// An empty working tree.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            root: RwLock::new(Node::root(None)),
        }
    }

    /// A working tree over the stored tree `root`. Nothing is read until
    /// first accessed.
    pub fn load(store: Arc<dyn ObjectStore>, root: Hash) -> Self {
        debug!(root = %root.short(), "opening working tree");
        Self {
            store,
            root: RwLock::new(Node::root(Some(root))),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Address of the root as last loaded or persisted.
    pub fn root_id(&self) -> Option<Hash> {
        self.root.read().object_id()
    }

    /// Whether anything changed since the last load or persist.
    pub fn is_dirty(&self) -> bool {
        self.root.read().is_dirty()
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        let path = TreePath::parse(path)?;
        let root = self.root.read();
        Ok(find(&root, path.components(), self.store.as_ref())?.is_some())
    }

    pub fn metadata(&self, path: &str) -> Result<Metadata> {
        let path = TreePath::parse(path)?;
        let store = self.store.as_ref();
        let root = self.root.read();
        let node = find(&root, path.components(), store)?
            .ok_or_else(|| Error::not_found(path.to_string()))?;
        Ok(Metadata {
            mode: node.mode(),
            size: node.size(store)?,
            object_id: node.object_id(),
            dirty: node.is_dirty(),
        })
    }

    /// The full content of a file.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let path = TreePath::parse(path)?;
        let store = self.store.as_ref();
        let root = self.root.read();
        let node = get_file(&root, &path, store)?;
        Ok(node.content(store)?.to_vec())
    }

    pub fn read_dir(&self, path: &str) -> Result<ReadDir> {
        let path = TreePath::parse(path)?;
        let store = self.store.as_ref();
        let root = self.root.read();
        let dir = get_directory(&root, &path, store)?;
        let entries = dir
            .children(store)?
            .iter()
            .map(|(name, child)| DirEntry {
                name: name.clone(),
                mode: child.mode(),
                object_id: child.object_id(),
            })
            .collect();
        Ok(ReadDir {
            path,
            entries,
            filter: None,
        })
    }

    /// Fails with `NotFound` if the entry is missing, or `AccessDenied` if
    /// `Execute` is requested on anything but an executable file.
    pub fn check_access(&self, path: &str, modes: &[AccessMode]) -> Result<()> {
        let path = TreePath::parse(path)?;
        let root = self.root.read();
        let node = find(&root, path.components(), self.store.as_ref())?
            .ok_or_else(|| Error::not_found(path.to_string()))?;
        if modes.contains(&AccessMode::Execute) && !node.is_executable_file() {
            return Err(Error::access_denied(path.to_string()));
        }
        Ok(())
    }

    pub fn create_dir(&self, path: &str) -> Result<()> {
        let path = TreePath::parse(path)?;
        if path.is_root() {
            return Err(Error::already_exists(path.to_string()));
        }
        let store = self.store.as_ref();
        let mut root = self.root.write();
        let (dir, name) = parent_dir_mut(&mut root, &path, store)?;
        if !dir.insert_child(name, Node::directory(), false, store)? {
            return Err(Error::already_exists(path.to_string()));
        }
        debug!(path = %path, "created directory");
        Ok(())
    }

    /// Create a directory and any missing ancestors. Existing directories
    /// along the way are fine; an existing file is `NotADirectory`.
    pub fn create_dir_all(&self, path: &str) -> Result<()> {
        let path = TreePath::parse(path)?;
        let store = self.store.as_ref();
        let mut root = self.root.write();
        let mut current: &mut Node = &mut root;
        for (depth, name) in path.components().iter().enumerate() {
            if !current.has_child(name, store)? {
                current.insert_child(name, Node::directory(), false, store)?;
            }
            let child = current
                .child_mut(name, store)?
                .ok_or_else(|| Error::invalid_state("directory vanished while held"))?;
            if !child.is_directory() {
                let prefix = path.components()[..=depth].join("/");
                return Err(Error::not_a_directory(format!("/{}", prefix)));
            }
            current = child;
        }
        Ok(())
    }

    /// Add a new file. Fails with `AlreadyExists` if the name is taken,
    /// unless `replace_existing` is set, in which case the new file
    /// supersedes whatever was there.
    pub fn create_file(
        &self,
        path: &str,
        content: impl Into<Vec<u8>>,
        mode: FileMode,
        replace_existing: bool,
    ) -> Result<()> {
        let path = TreePath::parse(path)?;
        if path.is_root() {
            return Err(Error::access_denied(path.to_string()));
        }
        let node = Node::file(content.into(), mode)?;
        let store = self.store.as_ref();
        let mut root = self.root.write();
        let (dir, name) = parent_dir_mut(&mut root, &path, store)?;
        if !dir.insert_child(name, node, replace_existing, store)? {
            return Err(Error::already_exists(path.to_string()));
        }
        debug!(path = %path, mode = mode.as_str(), "created file");
        Ok(())
    }

    /// Add a symlink whose target is stored uninterpreted.
    pub fn symlink(&self, path: &str, target: &str) -> Result<()> {
        self.create_file(path, target.as_bytes(), FileMode::Symlink, false)
    }

    /// Set a file's content, creating a regular file if needed.
    pub fn write_file(&self, path: &str, content: impl Into<Vec<u8>>) -> Result<()> {
        let path = TreePath::parse(path)?;
        if path.is_root() {
            return Err(Error::access_denied(path.to_string()));
        }
        let content = content.into();
        let store = self.store.as_ref();
        let mut root = self.root.write();
        let (dir, name) = parent_dir_mut(&mut root, &path, store)?;
        match dir.child_mut(name, store)? {
            Some(node) if node.is_directory() => Err(Error::access_denied(path.to_string())),
            Some(node) => node.set_content(content),
            None => {
                dir.insert_child(name, Node::file(content, FileMode::Regular)?, false, store)?;
                Ok(())
            }
        }
    }

    /// Toggle between the regular and executable file modes.
    pub fn set_executable(&self, path: &str, executable: bool) -> Result<()> {
        let path = TreePath::parse(path)?;
        let store = self.store.as_ref();
        let mut root = self.root.write();
        let node = get_file_mut(&mut root, &path, store)?;
        match node.mode() {
            FileMode::Regular | FileMode::Executable => node.set_mode(if executable {
                FileMode::Executable
            } else {
                FileMode::Regular
            }),
            _ => Err(Error::access_denied(path.to_string())),
        }
    }

    /// Open a file for byte-level access.
    pub fn open(&self, path: &str, options: &OpenOptions) -> Result<FileHandle<'_>> {
        let path = TreePath::parse(path)?;
        if path.is_root() {
            return Err(Error::access_denied(path.to_string()));
        }
        let store = self.store.as_ref();
        let mut root = self.root.write();
        let (dir, name) = parent_dir_mut(&mut root, &path, store)?;

        let exists = dir.has_child(name, store)?;
        let content = if options.create_new || (options.create && !exists) {
            let node = Node::file(Vec::new(), options.new_file_mode())?;
            if !dir.insert_child(name, node, false, store)? {
                return Err(Error::already_exists(path.to_string()));
            }
            Vec::new()
        } else {
            match dir.child(name, store)? {
                None => return Err(Error::not_found(path.to_string())),
                Some(node) if node.is_directory() => {
                    return Err(Error::access_denied(path.to_string()));
                }
                Some(_) if options.truncate && options.is_writable() => Vec::new(),
                Some(node) => node.content(store)?.to_vec(),
            }
        };
        drop(root);

        Ok(FileHandle::new(self, path, content, options))
    }

    /// Replace a file's bytes on behalf of a [`FileHandle`].
    pub(crate) fn commit_content(&self, path: &TreePath, content: Vec<u8>) -> Result<()> {
        let store = self.store.as_ref();
        let mut root = self.root.write();
        get_file_mut(&mut root, path, store)?.set_content(content)
    }

    /// Remove a file or a whole directory subtree.
    pub fn remove(&self, path: &str) -> Result<()> {
        let path = TreePath::parse(path)?;
        let mut root = self.root.write();
        remove_entry(&mut root, &path, self.store.as_ref())
    }

    /// Copy `source` to `target`, returning `false` when they are the same
    /// path.
    ///
    /// The copy is independent of the source. Copying a directory into its
    /// own subtree copies the directory as it was before the call.
    pub fn copy(&self, source: &str, target: &str, options: CopyOptions) -> Result<bool> {
        let source = TreePath::parse(source)?;
        let target = TreePath::parse(target)?;
        let mut root = self.root.write();
        copy_entry(&mut root, &source, &target, options, self.store.as_ref())
    }

    /// Move `source` to `target` by copying and then removing the source.
    ///
    /// Not atomic: if the removal fails the copy remains. Moving onto the
    /// root is `AccessDenied`, as for [`copy`](Self::copy). Moving an entry
    /// into its own subtree, or onto one of its ancestors, is `InvalidPath`.
    pub fn rename(&self, source: &str, target: &str, options: CopyOptions) -> Result<bool> {
        let source = TreePath::parse(source)?;
        let target = TreePath::parse(target)?;
        if target.is_root() && !source.is_root() {
            return Err(Error::access_denied(target.to_string()));
        }
        if source != target && (target.starts_with(&source) || source.starts_with(&target)) {
            return Err(Error::invalid_path(
                target.to_string(),
                format!("cannot move {} into itself or onto an ancestor", source),
            ));
        }

        let store = self.store.as_ref();
        if !copy_entry(&mut self.root.write(), &source, &target, options, store)? {
            return Ok(false);
        }
        remove_entry(&mut self.root.write(), &source, store)?;
        Ok(true)
    }

    /// Write every dirty node to the store and return the root's address.
    ///
    /// The root is always written, even when empty. Persisting a clean tree
    /// writes nothing.
    pub fn persist(&self) -> Result<Hash> {
        let mut root = self.root.write();
        let id = root
            .persist(true, self.store.as_ref())?
            .ok_or_else(|| Error::invalid_state("root persisted without an address"))?;
        info!(root = %id.short(), "persisted working tree");
        Ok(id)
    }

    pub(crate) fn root_read(&self) -> RwLockReadGuard<'_, Node> {
        self.root.read()
    }

    /// Run `f` against the root under the write lock.
    pub(crate) fn with_root_mut<R>(
        &self,
        f: impl FnOnce(&mut Node, &dyn ObjectStore) -> Result<R>,
    ) -> Result<R> {
        let mut root = self.root.write();
        f(&mut root, self.store.as_ref())
    }
}

impl std::fmt::Debug for WorkTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let root = self.root.read();
        f.debug_struct("WorkTree")
            .field("root_id", &root.object_id())
            .field("dirty", &root.is_dirty())
            .finish()
    }
}

/// Walk `components` from `root`. Missing entries, and descending through a
/// file, both yield `None`.
pub(crate) fn find<'a>(
    root: &'a Node,
    components: &[String],
    store: &dyn ObjectStore,
) -> Result<Option<&'a Node>> {
    let mut current = root;
    for name in components {
        if !current.is_directory() {
            return Ok(None);
        }
        match current.child(name, store)? {
            Some(child) => current = child,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

pub(crate) fn find_mut<'a>(
    root: &'a mut Node,
    components: &[String],
    store: &dyn ObjectStore,
) -> Result<Option<&'a mut Node>> {
    let mut current = root;
    for name in components {
        if !current.is_directory() {
            return Ok(None);
        }
        match current.child_mut(name, store)? {
            Some(child) => current = child,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

fn get_file<'a>(root: &'a Node, path: &TreePath, store: &dyn ObjectStore) -> Result<&'a Node> {
    match find(root, path.components(), store)? {
        None => Err(Error::not_found(path.to_string())),
        Some(node) if node.is_directory() => Err(Error::access_denied(path.to_string())),
        Some(node) => Ok(node),
    }
}

fn get_file_mut<'a>(
    root: &'a mut Node,
    path: &TreePath,
    store: &dyn ObjectStore,
) -> Result<&'a mut Node> {
    match find_mut(root, path.components(), store)? {
        None => Err(Error::not_found(path.to_string())),
        Some(node) if node.is_directory() => Err(Error::access_denied(path.to_string())),
        Some(node) => Ok(node),
    }
}

fn get_directory<'a>(
    root: &'a Node,
    path: &TreePath,
    store: &dyn ObjectStore,
) -> Result<&'a Node> {
    match find(root, path.components(), store)? {
        None => Err(Error::not_found(path.to_string())),
        Some(node) if !node.is_directory() => Err(Error::not_a_directory(path.to_string())),
        Some(node) => Ok(node),
    }
}

/// Resolve the directory that holds `path`, plus the final name.
pub(crate) fn parent_dir_mut<'a, 'p>(
    root: &'a mut Node,
    path: &'p TreePath,
    store: &dyn ObjectStore,
) -> Result<(&'a mut Node, &'p str)> {
    let (name, parent) = path
        .components()
        .split_last()
        .ok_or_else(|| Error::invalid_path(path.to_string(), "the root has no parent"))?;
    let parent_path = || format!("/{}", parent.join("/"));
    match find_mut(root, parent, store)? {
        None => Err(Error::not_found(parent_path())),
        Some(dir) if !dir.is_directory() => Err(Error::not_a_directory(parent_path())),
        Some(dir) => Ok((dir, name.as_str())),
    }
}

pub(crate) fn remove_entry(root: &mut Node, path: &TreePath, store: &dyn ObjectStore) -> Result<()> {
    if path.is_root() {
        return Err(Error::access_denied(path.to_string()));
    }
    let (dir, name) = parent_dir_mut(root, path, store)?;
    if dir.remove_child(name, store)?.is_none() {
        return Err(Error::not_found(path.to_string()));
    }
    debug!(path = %path, "removed");
    Ok(())
}

fn copy_entry(
    root: &mut Node,
    source: &TreePath,
    target: &TreePath,
    options: CopyOptions,
    store: &dyn ObjectStore,
) -> Result<bool> {
    if source == target {
        return Ok(false);
    }
    if target.is_root() {
        return Err(Error::access_denied(target.to_string()));
    }

    let copied = find(root, source.components(), store)?
        .ok_or_else(|| Error::not_found(source.to_string()))?
        .duplicate(store)?;

    let (dir, name) = parent_dir_mut(root, target, store)?;
    if !dir.insert_child(name, copied, options.replace_existing, store)? {
        return Err(Error::already_exists(target.to_string()));
    }
    debug!(source = %source, target = %target, "copied");
    Ok(true)
}

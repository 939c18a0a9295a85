//! Moving content between the host filesystem and a working tree.

use crate::error::{Error, Result};
use crate::node::{Children, Node};
use crate::path::TreePath;
use crate::store::ObjectStore;
use crate::tree::FileMode;
use crate::worktree::{CopyOptions, WorkTree, find, parent_dir_mut};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Counts from an import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
}

impl WorkTree {
    /// Read a host file or directory into the tree at `target`.
    ///
    /// Directories are walked recursively, honoring `.gitignore`. Symlinks
    /// are stored with their target text, not followed. The parent of
    /// `target` must already exist.
    pub fn import_path(
        &self,
        source: &Path,
        target: &str,
        options: CopyOptions,
    ) -> Result<ImportStats> {
        let target = TreePath::parse(target)?;
        if target.is_root() {
            return Err(Error::access_denied(target.to_string()));
        }
        if fs::symlink_metadata(source).is_err() {
            return Err(Error::Io {
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("Path does not exist: {}", source.display()),
                ),
            });
        }

        // Build the subtree before taking the lock.
        let mut stats = ImportStats::default();
        let node = import_entry(source, &mut stats)?;

        self.with_root_mut(|root, store| {
            let (dir, name) = parent_dir_mut(root, &target, store)?;
            if !dir.insert_child(name, node, options.replace_existing, store)? {
                return Err(Error::already_exists(target.to_string()));
            }
            Ok(())
        })?;

        info!(
            source = %source.display(),
            target = %target,
            files = stats.files,
            directories = stats.directories,
            "imported"
        );
        Ok(stats)
    }

    /// Write the entry at `source` out to the host path `dest`, which must
    /// not exist yet.
    pub fn materialize(&self, source: &str, dest: &Path) -> Result<()> {
        if dest.exists() {
            return Err(Error::path_exists(dest));
        }
        let source = TreePath::parse(source)?;
        let store = self.store().as_ref();
        let root = self.root_read();
        let node = find(&root, source.components(), store)?
            .ok_or_else(|| Error::not_found(source.to_string()))?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        materialize_node(node, dest, store)
    }
}

fn import_entry(path: &Path, stats: &mut ImportStats) -> Result<Node> {
    let metadata = fs::symlink_metadata(path)?;

    if metadata.file_type().is_symlink() {
        let target = fs::read_link(path)?;
        let target = target.to_str().ok_or_else(|| {
            Error::invalid_path(path.display().to_string(), "symlink target is not UTF-8")
        })?;
        stats.files += 1;
        return Node::file(target.as_bytes().to_vec(), FileMode::Symlink);
    }

    if metadata.is_dir() {
        stats.directories += 1;
        return import_directory(path, stats);
    }

    let content = fs::read(path)?;
    stats.files += 1;
    stats.bytes += content.len() as u64;
    Node::file(content, file_mode(&metadata))
}

fn import_directory(path: &Path, stats: &mut ImportStats) -> Result<Node> {
    let mut children = Children::new();

    let walker = ignore::WalkBuilder::new(path)
        .max_depth(Some(1)) // Only immediate children
        .hidden(false) // Include hidden files
        .git_ignore(true) // Respect .gitignore
        .build();

    for entry in walker {
        let entry = entry?;
        let entry_path = entry.path();
        if entry_path == path {
            continue;
        }

        let name = entry_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::invalid_path(entry_path.display().to_string(), "name is not UTF-8")
            })?;
        if name == ".git" {
            continue;
        }
        crate::tree::validate_name(name)
            .map_err(|e| Error::invalid_path(entry_path.display().to_string(), e.to_string()))?;

        debug!(path = %entry_path.display(), "importing");
        children.insert(name.to_string(), import_entry(entry_path, stats)?);
    }

    Ok(Node::directory_with(children))
}

fn materialize_node(node: &Node, dest: &Path, store: &dyn ObjectStore) -> Result<()> {
    match node.mode() {
        FileMode::Directory => {
            fs::create_dir(dest)?;
            for (name, child) in node.children(store)? {
                materialize_node(child, &dest.join(name), store)?;
            }
        }
        FileMode::Symlink => write_symlink(node.content(store)?, dest)?,
        mode => {
            fs::write(dest, node.content(store)?)?;
            set_file_mode(dest, mode)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> FileMode {
    use std::os::unix::fs::PermissionsExt;
    if metadata.permissions().mode() & 0o111 != 0 {
        FileMode::Executable
    } else {
        FileMode::Regular
    }
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata) -> FileMode {
    FileMode::Regular
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: FileMode) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let bits = if mode == FileMode::Executable { 0o755 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(bits))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: FileMode) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn write_symlink(target: &[u8], dest: &Path) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;
    std::os::unix::fs::symlink(std::ffi::OsStr::from_bytes(target), dest)?;
    Ok(())
}

// Without symlink support the target text is written as a plain file.
#[cfg(not(unix))]
fn write_symlink(target: &[u8], dest: &Path) -> Result<()> {
    fs::write(dest, target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn tree() -> WorkTree {
        WorkTree::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_import_single_file() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("hello.txt");
        fs::write(&file, b"hello world").unwrap();

        let tree = tree();
        let stats = tree.import_path(&file, "/hello.txt", CopyOptions::new()).unwrap();
        assert_eq!(stats.files, 1);
        assert_eq!(stats.bytes, 11);
        assert_eq!(tree.read_file("/hello.txt").unwrap(), b"hello world");
    }

    #[test]
    fn test_import_directory_respects_gitignore() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("project");
        fs::create_dir_all(root.join("src")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::write(root.join(".gitignore"), "*.log\n").unwrap();
        fs::write(root.join("src/main.rs"), b"fn main() {}").unwrap();
        fs::write(root.join("debug.log"), b"noise").unwrap();

        let tree = tree();
        tree.import_path(&root, "/project", CopyOptions::new()).unwrap();

        assert_eq!(
            tree.read_dir("/project").unwrap().names(),
            [".gitignore", "src"]
        );
        assert_eq!(
            tree.read_file("/project/src/main.rs").unwrap(),
            b"fn main() {}"
        );
    }

    #[test]
    fn test_import_into_existing_name() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("f");
        fs::write(&file, b"new").unwrap();

        let tree = tree();
        tree.write_file("/f", "old").unwrap();
        assert!(matches!(
            tree.import_path(&file, "/f", CopyOptions::new()),
            Err(Error::AlreadyExists { .. })
        ));
        tree.import_path(&file, "/f", CopyOptions::new().replace_existing(true))
            .unwrap();
        assert_eq!(tree.read_file("/f").unwrap(), b"new");
        assert!(tree.import_path(&temp_dir.path().join("missing"), "/m", CopyOptions::new()).is_err());
    }

    #[test]
    fn test_materialize_roundtrip_through_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let tree = WorkTree::new(store.clone());
        tree.create_dir_all("/out/nested").unwrap();
        tree.write_file("/out/nested/data.bin", vec![0u8, 1, 2, 255]).unwrap();
        tree.create_file("/out/run.sh", "#!/bin/sh", FileMode::Executable, false)
            .unwrap();
        let id = tree.persist().unwrap();

        let reopened = WorkTree::load(store, id);
        let dest = temp_dir.path().join("restored");
        reopened.materialize("/out", &dest).unwrap();

        assert_eq!(
            fs::read(dest.join("nested/data.bin")).unwrap(),
            [0u8, 1, 2, 255]
        );
        assert_eq!(fs::read(dest.join("run.sh")).unwrap(), b"#!/bin/sh");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dest.join("run.sh")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn test_materialize_refuses_existing_dest() {
        let temp_dir = TempDir::new().unwrap();
        let tree = tree();
        tree.write_file("/f", "x").unwrap();
        assert!(matches!(
            tree.materialize("/f", temp_dir.path()),
            Err(Error::PathExists { .. })
        ));
        assert!(matches!(
            tree.materialize("/missing", &temp_dir.path().join("new")),
            Err(Error::NotFound { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_structural() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("links");
        fs::create_dir(&dir).unwrap();
        std::os::unix::fs::symlink("does/not/exist", dir.join("dangling")).unwrap();
        fs::write(dir.join("exec"), b"#!/bin/sh").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir.join("exec"), fs::Permissions::from_mode(0o755)).unwrap();
        }

        let tree = tree();
        tree.import_path(&dir, "/links", CopyOptions::new()).unwrap();
        assert!(tree.metadata("/links/dangling").unwrap().is_symlink());
        assert!(tree.metadata("/links/exec").unwrap().is_executable());
        assert_eq!(tree.read_file("/links/dangling").unwrap(), b"does/not/exist");

        let out = temp_dir.path().join("out");
        tree.materialize("/links", &out).unwrap();
        assert_eq!(
            fs::read_link(out.join("dangling")).unwrap(),
            Path::new("does/not/exist")
        );
    }
}

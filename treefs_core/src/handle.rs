//! Byte-channel access to working-tree files.

use crate::error::Result;
use crate::path::TreePath;
use crate::tree::FileMode;
use crate::worktree::WorkTree;
use std::io::{self, Read, Seek, SeekFrom, Write};
use tracing::warn;

/// Flags for [`WorkTree::open`], in the style of [`std::fs::OpenOptions`].
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    pub(crate) read: bool,
    pub(crate) write: bool,
    pub(crate) append: bool,
    pub(crate) truncate: bool,
    pub(crate) create: bool,
    pub(crate) create_new: bool,
    pub(crate) executable: bool,
}

impl OpenOptions {
    /// All flags off. Set at least `read` or `write` before opening.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&mut self, read: bool) -> &mut Self {
        self.read = read;
        self
    }

    pub fn write(&mut self, write: bool) -> &mut Self {
        self.write = write;
        self
    }

    /// Writes always go to the end of the file. Implies `write`.
    pub fn append(&mut self, append: bool) -> &mut Self {
        self.append = append;
        self
    }

    /// Start from empty content.
    pub fn truncate(&mut self, truncate: bool) -> &mut Self {
        self.truncate = truncate;
        self
    }

    /// Create the file if it does not exist.
    pub fn create(&mut self, create: bool) -> &mut Self {
        self.create = create;
        self
    }

    /// Create the file, failing with `AlreadyExists` if the name is taken.
    pub fn create_new(&mut self, create_new: bool) -> &mut Self {
        self.create_new = create_new;
        self
    }

    /// Give a newly created file the executable mode.
    pub fn executable(&mut self, executable: bool) -> &mut Self {
        self.executable = executable;
        self
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.write || self.append
    }

    pub(crate) fn new_file_mode(&self) -> FileMode {
        if self.executable {
            FileMode::Executable
        } else {
            FileMode::Regular
        }
    }
}

/// An open file in a [`WorkTree`].
///
/// The handle works on a private copy of the file's bytes. Writes become
/// visible in the tree when the handle is flushed or closed; dropping an
/// unflushed handle commits too, logging any failure.
pub struct FileHandle<'a> {
    tree: &'a WorkTree,
    path: TreePath,
    buffer: Vec<u8>,
    position: usize,
    readable: bool,
    writable: bool,
    append: bool,
    modified: bool,
}

impl<'a> FileHandle<'a> {
    pub(crate) fn new(
        tree: &'a WorkTree,
        path: TreePath,
        buffer: Vec<u8>,
        options: &OpenOptions,
    ) -> Self {
        let writable = options.is_writable();
        Self {
            tree,
            path,
            buffer,
            position: 0,
            readable: options.read,
            writable,
            append: options.append,
            modified: writable && options.truncate,
        }
    }

    pub fn path(&self) -> &TreePath {
        &self.path
    }

    /// Current length of the handle's view of the file.
    pub fn len(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether there are writes not yet committed to the tree.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Shorten or zero-extend the file.
    pub fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.ensure_writable()?;
        let len = to_usize(len)?;
        if len > self.buffer.len() {
            self.grow_to(len)?;
        } else {
            self.buffer.truncate(len);
        }
        self.modified = true;
        Ok(())
    }

    /// Commit pending writes and release the handle.
    pub fn close(mut self) -> Result<()> {
        self.commit()
    }

    fn commit(&mut self) -> Result<()> {
        if !self.modified {
            return Ok(());
        }
        self.tree.commit_content(&self.path, self.buffer.clone())?;
        self.modified = false;
        Ok(())
    }

    /// Zero-extend the buffer to `len` bytes, reporting allocation failure
    /// as an error rather than aborting.
    fn grow_to(&mut self, len: usize) -> io::Result<()> {
        let additional = len.saturating_sub(self.buffer.len());
        self.buffer
            .try_reserve_exact(additional)
            .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e))?;
        self.buffer.resize(len, 0);
        Ok(())
    }

    fn ensure_writable(&self) -> io::Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} was not opened for writing", self.path),
            ))
        }
    }
}

impl Read for FileHandle<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.readable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} was not opened for reading", self.path),
            ));
        }
        let start = self.position.min(self.buffer.len());
        let n = (self.buffer.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&self.buffer[start..start + n]);
        self.position = start + n;
        Ok(n)
    }
}

impl Write for FileHandle<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_writable()?;
        if self.append {
            self.position = self.buffer.len();
        }
        let end = self.position.checked_add(buf.len()).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "write past maximum file size")
        })?;
        if end > self.buffer.len() {
            self.grow_to(end)?;
        }
        self.buffer[self.position..end].copy_from_slice(buf);
        self.position = end;
        self.modified = true;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.commit().map_err(io::Error::other)
    }
}

impl Seek for FileHandle<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => (self.buffer.len() as u64).checked_add_signed(delta),
            SeekFrom::Current(delta) => (self.position as u64).checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of file")
        })?;
        self.position = to_usize(target)?;
        Ok(target)
    }
}

impl Drop for FileHandle<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.commit() {
            warn!(path = %self.path, error = %e, "failed to commit file handle on drop");
        }
    }
}

impl std::fmt::Debug for FileHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.path)
            .field("len", &self.buffer.len())
            .field("position", &self.position)
            .field("modified", &self.modified)
            .finish()
    }
}

fn to_usize(value: u64) -> io::Result<usize> {
    usize::try_from(value)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset out of range"))
}

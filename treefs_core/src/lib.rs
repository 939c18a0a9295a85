//! # Treefs Core
//!
//! A mutable, in-memory file hierarchy over a content-addressed object store.
//!
//! A stored tree is opened as a [`WorkTree`]. Files and directories are
//! loaded from the store only when first touched, can be created, copied,
//! moved and deleted in memory, and are written back with
//! [`WorkTree::persist`]. Only what changed is re-serialized: an untouched
//! subtree keeps its address and is never read.
//!
//! ## Features
//!
//! - BLAKE3 content addressing with separate blob and tree domains
//! - Lazy, load-once materialization of file content and directory listings
//! - Computed dirty tracking and minimal re-serialization on persist
//! - Batch change application with abort or collect conflict policies
//! - On-disk store with zstd compression, and an in-memory store
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use treefs_core::{Change, ChangeSet, ConflictPolicy, CopyOptions, DiskStore, StoreConfig, WorkTree};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(DiskStore::init("./my-store", StoreConfig::default())?);
//! let tree = WorkTree::new(store.clone());
//!
//! tree.create_dir("/docs")?;
//! tree.write_file("/docs/readme.md", "hello")?;
//! tree.copy("/docs", "/backup", CopyOptions::new())?;
//! let root = tree.persist()?;
//!
//! // Reopen and apply a batch of changes.
//! let tree = WorkTree::load(store, root);
//! let mut changes = ChangeSet::new();
//! changes.delete("/backup")?;
//! changes.add("/docs/notes.md", Change::file("more"))?;
//! let report = tree.apply(changes, ConflictPolicy::Collect)?;
//! assert!(!report.has_conflicts());
//! println!("new root: {}", tree.persist()?);
//! # Ok(())
//! # }
//! ```

mod checkout;
mod error;
mod handle;
mod hash;
mod memory;
mod node;
mod object;
mod path;
mod persist;
mod store;
mod tree;
mod walk;
mod worktree;

pub use checkout::{
    Baseline, Change, ChangeEntry, ChangeSet, CheckoutReport, Conflict, ConflictPolicy, Found,
};
pub use error::{Error, Result};
pub use handle::{FileHandle, OpenOptions};
pub use hash::{Algorithm, Hash};
pub use memory::MemoryStore;
pub use node::{Children, Node};
pub use object::{CompressionType, ObjectHeader, ObjectType};
pub use path::TreePath;
pub use store::{DiskStore, ObjectStore, StoreConfig};
pub use tree::{FileMode, TreeEntry};
pub use walk::ImportStats;
pub use worktree::{AccessMode, CopyOptions, DirEntry, Metadata, ReadDir, WorkTree};

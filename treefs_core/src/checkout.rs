//! Batch application of path changes to a working tree.
//!
//! A [`ChangeSet`] names, for each path, the entry it should end up as (or
//! that it should be gone). [`WorkTree::apply`] runs the whole batch under
//! the tree's write lock, parents before children, and checks each entry
//! against the baseline the caller expects to find there.

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::node::Node;
use crate::path::TreePath;
use crate::store::ObjectStore;
use crate::tree::FileMode;
use crate::worktree::{WorkTree, find, parent_dir_mut};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tracing::{debug, info, warn};

/// Desired state of one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Remove whatever is at the path. Absent paths are left alone.
    Delete,
    /// A file with the given bytes.
    Content { mode: FileMode, content: Vec<u8> },
    /// An already stored blob, or a tree when `mode` is a directory.
    Object { mode: FileMode, id: Hash },
}

impl Change {
    /// A regular file holding `content`.
    pub fn file(content: impl Into<Vec<u8>>) -> Self {
        Change::Content {
            mode: FileMode::Regular,
            content: content.into(),
        }
    }

    pub fn executable(content: impl Into<Vec<u8>>) -> Self {
        Change::Content {
            mode: FileMode::Executable,
            content: content.into(),
        }
    }

    pub fn symlink(target: &str) -> Self {
        Change::Content {
            mode: FileMode::Symlink,
            content: target.as_bytes().to_vec(),
        }
    }

    /// The stored tree `id`, as a directory.
    pub fn tree(id: Hash) -> Self {
        Change::Object {
            mode: FileMode::Directory,
            id,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Change::Content { mode, .. } if mode.is_directory() => Err(
                Error::invalid_tree_entry("content change cannot have directory mode"),
            ),
            _ => Ok(()),
        }
    }

    fn into_node(self) -> Result<Node> {
        match self {
            Change::Delete => Err(Error::invalid_state("a deletion has no node")),
            Change::Content { mode, content } => Node::file(content, mode),
            Change::Object { mode, id } => Ok(Node::from_object(mode, id)),
        }
    }
}

/// What the caller expects to find at a path before a change is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Baseline {
    /// Apply regardless of the current state.
    #[default]
    Unchecked,
    /// Nothing may exist at the path.
    Absent,
    /// An unmodified entry with exactly this mode and address.
    Entry { mode: FileMode, id: Hash },
}

/// One entry of a [`ChangeSet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    pub path: TreePath,
    pub change: Change,
    pub baseline: Baseline,
}

impl ChangeEntry {
    /// Require `baseline` at the path for this change to apply.
    pub fn expecting(&mut self, baseline: Baseline) -> &mut Self {
        self.baseline = baseline;
        self
    }
}

/// An ordered batch of changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    entries: Vec<ChangeEntry>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a change. The root cannot be changed.
    pub fn add(&mut self, path: &str, change: Change) -> Result<&mut ChangeEntry> {
        let path = TreePath::parse(path)?;
        if path.is_root() {
            return Err(Error::access_denied(path.to_string()));
        }
        change.validate()?;
        self.entries.push(ChangeEntry {
            path,
            change,
            baseline: Baseline::Unchecked,
        });
        let last = self.entries.len() - 1;
        Ok(&mut self.entries[last])
    }

    pub fn delete(&mut self, path: &str) -> Result<&mut ChangeEntry> {
        self.add(path, Change::Delete)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChangeEntry> {
        self.entries.iter()
    }
}

/// How [`WorkTree::apply`] reacts to a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Fail with [`Error::Conflict`] at the first conflict. Entries applied
    /// before it stay applied.
    Abort,
    /// Skip conflicting entries, record them, and carry on.
    #[default]
    Collect,
}

/// State of an entry found in the working tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Found {
    pub mode: FileMode,
    pub object_id: Option<Hash>,
    pub dirty: bool,
}

impl Found {
    fn of(node: &Node) -> Self {
        Self {
            mode: node.mode(),
            object_id: node.object_id(),
            dirty: node.is_dirty(),
        }
    }
}

/// Why an entry was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Conflict {
    /// The path does not hold what the caller expected.
    Diverged {
        expected: Baseline,
        found: Option<Found>,
    },
    /// A file outside the batch sits where a directory is needed.
    Blocked { ancestor: String, found: Found },
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conflict::Diverged { expected, found } => {
                let expected = match expected {
                    Baseline::Unchecked => "anything".to_string(),
                    Baseline::Absent => "nothing".to_string(),
                    Baseline::Entry { mode, id } => format!("{} {}", mode.as_str(), id.short()),
                };
                match found {
                    None => write!(f, "expected {}, found nothing", expected),
                    Some(found) if found.dirty => {
                        write!(f, "expected {}, found local modifications", expected)
                    }
                    Some(found) => write!(
                        f,
                        "expected {}, found {} {}",
                        expected,
                        found.mode.as_str(),
                        found.object_id.map(|id| id.short()).unwrap_or_default()
                    ),
                }
            }
            Conflict::Blocked { ancestor, found } => {
                write!(f, "{} {} blocks a directory", found.mode.as_str(), ancestor)
            }
        }
    }
}

/// Outcome of [`WorkTree::apply`] under [`ConflictPolicy::Collect`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckoutReport {
    /// Entries that changed the tree.
    pub applied: usize,
    /// Entries whose target state was already in place.
    pub unchanged: usize,
    /// Conflicts by path.
    pub conflicts: BTreeMap<String, Conflict>,
}

impl CheckoutReport {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

enum Outcome {
    Applied,
    Unchanged,
    Conflicted(Conflict),
}

/// Paths named in the batch, and those skipped for conflicts so far.
struct BatchState {
    named: HashSet<TreePath>,
    conflicted: HashSet<TreePath>,
}

impl WorkTree {
    /// Apply `changes` to the tree.
    ///
    /// Entries run parents first: they are stably sorted by path, so a
    /// directory is handled before anything beneath it and entries for the
    /// same path keep their relative order. Missing ancestor directories are
    /// created. An ancestor that is a file is replaced by a directory only
    /// if the batch itself names that file; otherwise it is a conflict.
    pub fn apply(&self, changes: ChangeSet, policy: ConflictPolicy) -> Result<CheckoutReport> {
        let mut entries = changes.entries;
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        let mut batch = BatchState {
            named: entries.iter().map(|entry| entry.path.clone()).collect(),
            conflicted: HashSet::new(),
        };

        self.with_root_mut(|root, store| {
            let mut report = CheckoutReport::default();
            for entry in entries {
                let path = entry.path.clone();
                match apply_entry(root, entry, &batch, store)? {
                    Outcome::Applied => report.applied += 1,
                    Outcome::Unchanged => report.unchanged += 1,
                    Outcome::Conflicted(conflict) => {
                        if policy == ConflictPolicy::Abort {
                            return Err(Error::conflict(path.to_string(), conflict.to_string()));
                        }
                        warn!(path = %path, %conflict, "checkout conflict");
                        report.conflicts.insert(path.to_string(), conflict);
                        batch.conflicted.insert(path);
                    }
                }
            }
            info!(
                applied = report.applied,
                unchanged = report.unchanged,
                conflicts = report.conflicts.len(),
                "applied change set"
            );
            Ok(report)
        })
    }
}

fn apply_entry(
    root: &mut Node,
    entry: ChangeEntry,
    batch: &BatchState,
    store: &dyn ObjectStore,
) -> Result<Outcome> {
    let ChangeEntry {
        path,
        change,
        baseline,
    } = entry;

    let current = find(root, path.components(), store)?;
    if let Some(conflict) = check_baseline(baseline, current.map(Found::of)) {
        return Ok(Outcome::Conflicted(conflict));
    }

    if matches!(change, Change::Delete) {
        return match current {
            None => Ok(Outcome::Unchanged),
            Some(_) => {
                let (dir, name) = parent_dir_mut(root, &path, store)?;
                dir.remove_child(name, store)?;
                debug!(path = %path, "deleted");
                Ok(Outcome::Applied)
            }
        };
    }

    if let (Change::Object { mode, id }, Some(node)) = (&change, current) {
        if !node.is_dirty() && node.mode() == *mode && node.object_id() == Some(*id) {
            return Ok(Outcome::Unchanged);
        }
    }

    let (name, ancestors) = path
        .components()
        .split_last()
        .ok_or_else(|| Error::access_denied(path.to_string()))?;

    let mut dir = root;
    for (depth, component) in ancestors.iter().enumerate() {
        let existing = dir.child(component, store)?.map(Found::of);
        match existing {
            Some(found) if found.mode.is_directory() => {}
            Some(found) => {
                let ancestor = TreePath::parse(&format!("/{}", ancestors[..=depth].join("/")))?;
                if !batch.named.contains(&ancestor) || batch.conflicted.contains(&ancestor) {
                    return Ok(Outcome::Conflicted(Conflict::Blocked {
                        ancestor: ancestor.to_string(),
                        found,
                    }));
                }
                dir.insert_child(component, Node::directory(), true, store)?;
            }
            None => {
                dir.insert_child(component, Node::directory(), false, store)?;
            }
        }
        dir = dir
            .child_mut(component, store)?
            .ok_or_else(|| Error::invalid_state("ancestor directory vanished while held"))?;
    }

    dir.insert_child(name, change.into_node()?, true, store)?;
    debug!(path = %path, "written");
    Ok(Outcome::Applied)
}

fn check_baseline(baseline: Baseline, found: Option<Found>) -> Option<Conflict> {
    let matches = match (baseline, found) {
        (Baseline::Unchecked, _) => true,
        (Baseline::Absent, None) => true,
        (Baseline::Entry { mode, id }, Some(found)) => {
            !found.dirty && found.mode == mode && found.object_id == Some(id)
        }
        _ => false,
    };
    if matches {
        None
    } else {
        Some(Conflict::Diverged {
            expected: baseline,
            found,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::tree::TreeEntry;
    use crate::worktree::CopyOptions;
    use std::sync::Arc;

    /// A stored tree holding `dir/old.txt` and `top.txt`.
    fn backing(store: &MemoryStore) -> Hash {
        let old = store.save_blob(b"old").unwrap();
        let top = store.save_blob(b"top").unwrap();
        let dir = store
            .save_tree(vec![TreeEntry::new(FileMode::Regular, old, "old.txt").unwrap()])
            .unwrap();
        store
            .save_tree(vec![
                TreeEntry::new(FileMode::Directory, dir, "dir").unwrap(),
                TreeEntry::new(FileMode::Regular, top, "top.txt").unwrap(),
            ])
            .unwrap()
    }

    fn open(store: &Arc<MemoryStore>) -> WorkTree {
        WorkTree::load(store.clone(), backing(store))
    }

    #[test]
    fn test_delete_then_recreate_directory() {
        let store = Arc::new(MemoryStore::new());
        let tree = open(&store);

        let mut changes = ChangeSet::new();
        changes.delete("/dir").unwrap();
        changes.add("/dir/new.txt", Change::file("hi")).unwrap();
        let report = tree.apply(changes, ConflictPolicy::Collect).unwrap();

        assert!(!report.has_conflicts());
        assert_eq!(report.applied, 2);
        assert_eq!(tree.read_dir("/dir").unwrap().names(), ["new.txt"]);
        assert_eq!(tree.read_file("/dir/new.txt").unwrap(), b"hi");
    }

    #[test]
    fn test_parents_first_regardless_of_input_order() {
        let store = Arc::new(MemoryStore::new());
        let empty = store.save_tree(Vec::new()).unwrap();
        let tree = WorkTree::new(store);

        let mut changes = ChangeSet::new();
        changes.add("/a/b/c.txt", Change::file("c")).unwrap();
        changes.add("/a", Change::tree(empty)).unwrap();
        let report = tree.apply(changes, ConflictPolicy::Abort).unwrap();

        assert_eq!(report.applied, 2);
        assert_eq!(tree.read_file("/a/b/c.txt").unwrap(), b"c");
    }

    #[test]
    fn test_same_path_keeps_input_order() {
        let tree = WorkTree::new(Arc::new(MemoryStore::new()));
        let mut changes = ChangeSet::new();
        changes.add("/f", Change::file("first")).unwrap();
        changes.add("/f", Change::file("second")).unwrap();
        tree.apply(changes, ConflictPolicy::Abort).unwrap();
        assert_eq!(tree.read_file("/f").unwrap(), b"second");
    }

    #[test]
    fn test_kind_replacement_both_ways() {
        let store = Arc::new(MemoryStore::new());
        let tree = open(&store);
        let sub_blob = store.save_blob(b"inner").unwrap();
        let sub = store
            .save_tree(vec![TreeEntry::new(FileMode::Regular, sub_blob, "inner.txt").unwrap()])
            .unwrap();

        let mut changes = ChangeSet::new();
        changes.add("/top.txt", Change::tree(sub)).unwrap();
        changes.add("/dir", Change::executable("now a file")).unwrap();
        tree.apply(changes, ConflictPolicy::Abort).unwrap();

        assert!(tree.metadata("/top.txt").unwrap().is_dir());
        assert_eq!(tree.read_file("/top.txt/inner.txt").unwrap(), b"inner");
        let dir = tree.metadata("/dir").unwrap();
        assert!(dir.is_executable());
        assert_eq!(tree.read_file("/dir").unwrap(), b"now a file");
    }

    #[test]
    fn test_deleting_absent_path_is_a_noop() {
        let tree = WorkTree::new(Arc::new(MemoryStore::new()));
        let mut changes = ChangeSet::new();
        changes.delete("/never/existed").unwrap();
        let report = tree.apply(changes, ConflictPolicy::Abort).unwrap();
        assert_eq!(report.applied, 0);
        assert_eq!(report.unchanged, 1);
    }

    #[test]
    fn test_matching_object_is_left_untouched() {
        let store = Arc::new(MemoryStore::new());
        let tree = open(&store);
        let original = tree.metadata("/dir").unwrap().object_id.unwrap();
        let root = tree.persist().unwrap();

        let mut changes = ChangeSet::new();
        changes
            .add("/dir", Change::tree(original))
            .unwrap()
            .expecting(Baseline::Entry {
                mode: FileMode::Directory,
                id: original,
            });
        let report = tree.apply(changes, ConflictPolicy::Abort).unwrap();

        assert_eq!(report.unchanged, 1);
        let saves = store.save_count();
        assert_eq!(tree.persist().unwrap(), root);
        assert_eq!(store.save_count(), saves);
    }

    #[test]
    fn test_baseline_mismatch_collects() {
        let store = Arc::new(MemoryStore::new());
        let tree = open(&store);
        let top = tree.metadata("/top.txt").unwrap().object_id.unwrap();
        tree.write_file("/dir/old.txt", "local edit").unwrap();

        let mut changes = ChangeSet::new();
        changes
            .add("/top.txt", Change::file("clean update"))
            .unwrap()
            .expecting(Baseline::Entry {
                mode: FileMode::Regular,
                id: top,
            });
        changes
            .add("/dir/old.txt", Change::file("theirs"))
            .unwrap()
            .expecting(Baseline::Entry {
                mode: FileMode::Regular,
                id: Hash::hash_bytes(b"whatever"),
            });
        changes
            .add("/new.txt", Change::file("x"))
            .unwrap()
            .expecting(Baseline::Absent);
        changes
            .add("/top.txt", Change::file("again"))
            .unwrap()
            .expecting(Baseline::Absent);

        let report = tree.apply(changes, ConflictPolicy::Collect).unwrap();
        assert!(report.has_conflicts());
        assert_eq!(report.applied, 2);
        assert_eq!(
            report.conflicts.keys().collect::<Vec<_>>(),
            ["/dir/old.txt", "/top.txt"]
        );
        assert!(matches!(
            report.conflicts["/dir/old.txt"],
            Conflict::Diverged {
                found: Some(Found { dirty: true, .. }),
                ..
            }
        ));
        assert_eq!(tree.read_file("/dir/old.txt").unwrap(), b"local edit");
        assert_eq!(tree.read_file("/top.txt").unwrap(), b"clean update");
        assert_eq!(tree.read_file("/new.txt").unwrap(), b"x");
    }

    #[test]
    fn test_abort_stops_at_first_conflict() {
        let store = Arc::new(MemoryStore::new());
        let tree = open(&store);

        let mut changes = ChangeSet::new();
        changes.add("/a.txt", Change::file("applied")).unwrap();
        changes
            .add("/b.txt", Change::file("conflicts"))
            .unwrap()
            .expecting(Baseline::Entry {
                mode: FileMode::Regular,
                id: Hash::hash_bytes(b"nope"),
            });
        changes.add("/c.txt", Change::file("never")).unwrap();

        let err = tree.apply(changes, ConflictPolicy::Abort).unwrap_err();
        assert!(matches!(err, Error::Conflict { ref path, .. } if path == "/b.txt"));
        assert!(tree.exists("/a.txt").unwrap());
        assert!(!tree.exists("/b.txt").unwrap());
        assert!(!tree.exists("/c.txt").unwrap());
    }

    #[test]
    fn test_file_outside_batch_blocks_ancestor() {
        let store = Arc::new(MemoryStore::new());
        let tree = open(&store);

        let mut changes = ChangeSet::new();
        changes.add("/top.txt/child", Change::file("x")).unwrap();
        let report = tree.apply(changes, ConflictPolicy::Collect).unwrap();

        assert!(matches!(
            &report.conflicts["/top.txt/child"],
            Conflict::Blocked { ancestor, .. } if ancestor == "/top.txt"
        ));
        assert_eq!(tree.read_file("/top.txt").unwrap(), b"top");
    }

    #[test]
    fn test_file_named_in_batch_gives_way_to_directory() {
        let store = Arc::new(MemoryStore::new());
        let tree = open(&store);

        let mut changes = ChangeSet::new();
        changes.add("/top.txt", Change::file("replaced")).unwrap();
        changes.add("/top.txt/child", Change::file("x")).unwrap();
        let report = tree.apply(changes, ConflictPolicy::Abort).unwrap();

        assert!(!report.has_conflicts());
        assert!(tree.metadata("/top.txt").unwrap().is_dir());
        assert_eq!(tree.read_file("/top.txt/child").unwrap(), b"x");
    }

    #[test]
    fn test_conflicted_ancestor_stays_blocking() {
        let store = Arc::new(MemoryStore::new());
        let tree = open(&store);
        tree.write_file("/top.txt", "local").unwrap();

        let mut changes = ChangeSet::new();
        changes
            .add("/top.txt", Change::file("theirs"))
            .unwrap()
            .expecting(Baseline::Absent);
        changes.add("/top.txt/child", Change::file("x")).unwrap();
        let report = tree.apply(changes, ConflictPolicy::Collect).unwrap();

        assert_eq!(report.conflicts.len(), 2);
        assert_eq!(tree.read_file("/top.txt").unwrap(), b"local");
    }

    #[test]
    fn test_apply_then_persist_and_copy() {
        let store = Arc::new(MemoryStore::new());
        let tree = open(&store);

        let mut changes = ChangeSet::new();
        changes.add("/bin/run", Change::executable("#!/bin/sh")).unwrap();
        changes.add("/bin/link", Change::symlink("run")).unwrap();
        tree.apply(changes, ConflictPolicy::Abort).unwrap();
        tree.copy("/bin", "/bin2", CopyOptions::new()).unwrap();

        let id = tree.persist().unwrap();
        let reopened = WorkTree::load(store, id);
        assert!(reopened.metadata("/bin2/run").unwrap().is_executable());
        assert!(reopened.metadata("/bin/link").unwrap().is_symlink());
    }

    #[test]
    fn test_invalid_changes_rejected_up_front() {
        let mut changes = ChangeSet::new();
        assert!(matches!(changes.delete("/"), Err(Error::AccessDenied { .. })));
        assert!(changes
            .add(
                "/x",
                Change::Content {
                    mode: FileMode::Directory,
                    content: Vec::new()
                }
            )
            .is_err());
        assert!(changes.delete("relative").is_err());
        assert!(changes.is_empty());
    }
}

//! JSON change batches for the `apply` command.
//!
//! A batch is a JSON array of entries:
//!
//! ```json
//! [
//!   { "path": "/dir", "op": "delete" },
//!   { "path": "/dir/new.txt", "op": "write", "content": "hi" },
//!   { "path": "/bin/tool", "op": "write", "content": "#!/bin/sh", "mode": "executable" },
//!   { "path": "/vendor", "op": "object", "mode": "directory", "id": "<hex>",
//!     "baseline": { "state": "absent" } }
//! ]
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use treefs_core::{Baseline, Change, ChangeSet, FileMode, Hash};

#[derive(Debug, Deserialize)]
struct BatchEntry {
    path: String,
    #[serde(flatten)]
    target: Target,
    #[serde(default)]
    baseline: Baseline,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Target {
    Delete,
    Write {
        content: String,
        #[serde(default = "regular")]
        mode: FileMode,
    },
    Object {
        id: Hash,
        mode: FileMode,
    },
}

fn regular() -> FileMode {
    FileMode::Regular
}

impl From<Target> for Change {
    fn from(target: Target) -> Self {
        match target {
            Target::Delete => Change::Delete,
            Target::Write { content, mode } => Change::Content {
                mode,
                content: content.into_bytes(),
            },
            Target::Object { id, mode } => Change::Object { mode, id },
        }
    }
}

/// Parse a JSON batch into a change set.
pub fn parse_batch(json: &str) -> Result<ChangeSet> {
    let entries: Vec<BatchEntry> = serde_json::from_str(json).context("Invalid batch JSON")?;

    let mut changes = ChangeSet::new();
    for entry in entries {
        changes
            .add(&entry.path, entry.target.into())
            .with_context(|| format!("Invalid batch entry for {}", entry.path))?
            .expecting(entry.baseline);
    }
    Ok(changes)
}

//! Output formatting for CLI commands.
//!
//! Provides abstraction layer for outputting results in text or JSON format.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Write};
use treefs_core::{CheckoutReport, Conflict, DirEntry, Hash, ImportStats, Metadata};

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
    stdout: io::Stdout,
}

impl OutputWriter {
    /// Create a new OutputWriter.
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            stdout: io::stdout(),
        }
    }

    /// Check if JSON mode is enabled.
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Write output using the configured format.
    ///
    /// The `text_fn` closure is called only in text mode to generate the
    /// human-readable output.
    pub fn write<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(&self.stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(&self.stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Write raw bytes to stdout regardless of format.
    pub fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut stdout = self.stdout.lock();
        stdout.write_all(bytes)?;
        stdout.flush()?;
        Ok(())
    }

    /// Write an error message to stderr.
    ///
    /// In JSON mode, writes a JSON error object with success=false.
    pub fn write_error(&self, error: &anyhow::Error, result_code: u8) {
        match self.format {
            OutputFormat::Json => {
                let error_output = ErrorOutput {
                    success: false,
                    result_code,
                    error: format!("{:#}", error),
                };
                if let Ok(json) = serde_json::to_string_pretty(&error_output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
            }
        }
    }
}

/// Error output structure.
#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: u8,
    pub error: String,
}

/// Output for `init` command.
#[derive(Debug, Serialize)]
pub struct InitOutput {
    pub success: bool,
    pub result_code: u8,
    pub root: String,
    pub algorithm: String,
    /// Address of the empty tree, a starting point for new trees.
    pub empty_tree: Hash,
}

/// Output for commands that produce a new tree.
#[derive(Debug, Serialize)]
pub struct TreeOutput {
    pub success: bool,
    pub result_code: u8,
    pub operation: String,
    pub tree: Hash,
}

impl TreeOutput {
    pub fn new(operation: &str, tree: Hash) -> Self {
        Self {
            success: true,
            result_code: 0,
            operation: operation.to_string(),
            tree,
        }
    }
}

/// Output for `import` command.
#[derive(Debug, Serialize)]
pub struct ImportOutput {
    pub success: bool,
    pub result_code: u8,
    pub tree: Hash,
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
}

impl ImportOutput {
    pub fn new(tree: Hash, stats: ImportStats) -> Self {
        Self {
            success: true,
            result_code: 0,
            tree,
            files: stats.files,
            directories: stats.directories,
            bytes: stats.bytes,
        }
    }
}

/// Output for `ls` command.
#[derive(Debug, Serialize)]
pub struct LsOutput {
    pub success: bool,
    pub result_code: u8,
    pub path: String,
    pub entries: Vec<DirEntry>,
}

/// Output for `stat` command.
#[derive(Debug, Serialize)]
pub struct StatOutput {
    pub success: bool,
    pub result_code: u8,
    pub path: String,
    #[serde(flatten)]
    pub metadata: Metadata,
}

/// Output for `apply` command.
#[derive(Debug, Serialize)]
pub struct ApplyOutput {
    pub success: bool,
    pub result_code: u8,
    /// New tree; absent when conflicts kept the result from being persisted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tree: Option<Hash>,
    pub applied: usize,
    pub unchanged: usize,
    pub conflicts: BTreeMap<String, Conflict>,
}

impl ApplyOutput {
    pub fn new(tree: Option<Hash>, report: CheckoutReport) -> Self {
        Self {
            success: !report.has_conflicts(),
            result_code: if report.has_conflicts() { 2 } else { 0 },
            tree,
            applied: report.applied,
            unchanged: report.unchanged,
            conflicts: report.conflicts,
        }
    }
}

/// Output for `materialize` command.
#[derive(Debug, Serialize)]
pub struct MaterializeOutput {
    pub success: bool,
    pub result_code: u8,
    pub tree: Hash,
    pub path: String,
    pub destination: String,
}

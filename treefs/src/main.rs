mod batch;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use output::{
    ApplyOutput, ImportOutput, InitOutput, LsOutput, MaterializeOutput, OutputWriter, StatOutput,
    TreeOutput,
};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use treefs_core::{
    ConflictPolicy, CopyOptions, DiskStore, FileMode, Hash, ObjectStore, StoreConfig, WorkTree,
};

/// Treefs - a mutable file hierarchy over a content-addressed store
///
/// Every command that changes a tree prints the address of the new tree.
#[derive(Parser)]
#[command(name = "treefs")]
#[command(about = "Edit content-addressed trees as a file hierarchy", long_about = None)]
#[command(version)]
struct Cli {
    /// Store root directory (defaults to TREEFS_ROOT env var or ./treefs-store)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Output results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new store
    Init {
        /// Blobs at least this large are stored zstd-compressed
        #[arg(long)]
        compression_threshold: Option<usize>,
    },

    /// Import a host file or directory into a tree
    Import {
        /// Host path to import
        source: PathBuf,

        /// Path inside the tree
        target: String,

        /// Tree to import into (defaults to a new, empty tree)
        #[arg(long)]
        into: Option<String>,

        /// Replace an existing entry at the target
        #[arg(long)]
        replace: bool,
    },

    /// List a directory
    Ls {
        /// Tree address
        tree: String,

        /// Directory inside the tree
        #[arg(default_value = "/")]
        path: String,

        /// Show modes and addresses
        #[arg(short, long)]
        long: bool,
    },

    /// Output file content to stdout
    Cat {
        /// Tree address
        tree: String,

        /// File inside the tree
        path: String,
    },

    /// Show entry metadata
    Stat {
        /// Tree address
        tree: String,

        /// Entry inside the tree
        path: String,
    },

    /// Write stdin to a file
    Write {
        /// Tree address
        tree: String,

        /// File inside the tree
        path: String,

        /// Mark the file executable
        #[arg(long)]
        executable: bool,
    },

    /// Create a directory
    Mkdir {
        /// Tree address
        tree: String,

        /// Directory inside the tree
        path: String,

        /// Create missing parents
        #[arg(short, long)]
        parents: bool,
    },

    /// Remove a file or directory
    Rm {
        /// Tree address
        tree: String,

        /// Entry inside the tree
        path: String,
    },

    /// Copy an entry
    Cp {
        /// Tree address
        tree: String,

        source: String,

        target: String,

        /// Replace an existing entry at the target
        #[arg(long)]
        replace: bool,
    },

    /// Move an entry
    Mv {
        /// Tree address
        tree: String,

        source: String,

        target: String,

        /// Replace an existing entry at the target
        #[arg(long)]
        replace: bool,
    },

    /// Apply a JSON change batch (use - for stdin)
    Apply {
        /// Tree address
        tree: String,

        /// Batch file
        batch: PathBuf,

        /// Stop at the first conflict instead of collecting them
        #[arg(long)]
        abort_on_conflict: bool,
    },

    /// Write an entry out to the host filesystem
    Materialize {
        /// Tree address
        tree: String,

        /// Entry inside the tree
        path: String,

        /// Destination path (must not exist)
        dest: PathBuf,
    },
}

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    let output = OutputWriter::new(cli.json);

    // Determine store root: CLI arg > TREEFS_ROOT env var > ./treefs-store default
    let root = cli
        .root
        .or_else(|| std::env::var("TREEFS_ROOT").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./treefs-store"));

    match run(cli.command, &root, &output) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            output.write_error(&e, 1);
            ExitCode::from(1)
        }
    }
}

/// Logs go to stderr so they don't interfere with command output.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("TREEFS_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(command: Commands, root: &Path, output: &OutputWriter) -> Result<u8> {
    match command {
        Commands::Init {
            compression_threshold,
        } => cmd_init(root, compression_threshold, output),
        Commands::Import {
            source,
            target,
            into,
            replace,
        } => cmd_import(root, &source, &target, into.as_deref(), replace, output),
        Commands::Ls { tree, path, long } => cmd_ls(root, &tree, &path, long, output),
        Commands::Cat { tree, path } => cmd_cat(root, &tree, &path, output),
        Commands::Stat { tree, path } => cmd_stat(root, &tree, &path, output),
        Commands::Write {
            tree,
            path,
            executable,
        } => cmd_write(root, &tree, &path, executable, output),
        Commands::Mkdir {
            tree,
            path,
            parents,
        } => mutate(root, &tree, "mkdir", output, |wt| {
            if parents {
                wt.create_dir_all(&path)
            } else {
                wt.create_dir(&path)
            }
        }),
        Commands::Rm { tree, path } => mutate(root, &tree, "rm", output, |wt| wt.remove(&path)),
        Commands::Cp {
            tree,
            source,
            target,
            replace,
        } => mutate(root, &tree, "cp", output, |wt| {
            let options = CopyOptions::new().replace_existing(replace);
            wt.copy(&source, &target, options).map(|_| ())
        }),
        Commands::Mv {
            tree,
            source,
            target,
            replace,
        } => mutate(root, &tree, "mv", output, |wt| {
            let options = CopyOptions::new().replace_existing(replace);
            wt.rename(&source, &target, options).map(|_| ())
        }),
        Commands::Apply {
            tree,
            batch,
            abort_on_conflict,
        } => cmd_apply(root, &tree, &batch, abort_on_conflict, output),
        Commands::Materialize { tree, path, dest } => {
            cmd_materialize(root, &tree, &path, &dest, output)
        }
    }
}

fn open_store(root: &Path) -> Result<Arc<DiskStore>> {
    let store =
        DiskStore::open(root).with_context(|| format!("Failed to open store at {}", root.display()))?;
    Ok(Arc::new(store))
}

fn open_tree(root: &Path, tree: &str) -> Result<WorkTree> {
    let store = open_store(root)?;
    let id = Hash::from_hex(tree).with_context(|| format!("Invalid hash: {}", tree))?;
    if !store.has_object(&id)? {
        anyhow::bail!("Tree not found: {}", id);
    }
    Ok(WorkTree::load(store, id))
}

/// Open `tree`, run `op` against it, persist and report the new address.
fn mutate(
    root: &Path,
    tree: &str,
    operation: &str,
    output: &OutputWriter,
    op: impl FnOnce(&WorkTree) -> treefs_core::Result<()>,
) -> Result<u8> {
    let work_tree = open_tree(root, tree)?;
    op(&work_tree).with_context(|| format!("{} failed", operation))?;
    let id = work_tree.persist().context("Failed to persist tree")?;

    let data = TreeOutput::new(operation, id);
    output.write(&data, || format!("{}\n", id))?;
    Ok(0)
}

fn cmd_init(root: &Path, compression_threshold: Option<usize>, output: &OutputWriter) -> Result<u8> {
    let mut config = StoreConfig::default();
    if let Some(threshold) = compression_threshold {
        config.compression_threshold = threshold;
    }

    let store = DiskStore::init(root, config)
        .with_context(|| format!("Failed to initialize store at {}", root.display()))?;
    let empty_tree = WorkTree::new(Arc::new(store)).persist()?;

    let data = InitOutput {
        success: true,
        result_code: 0,
        root: root.display().to_string(),
        algorithm: treefs_core::Algorithm::Blake3.as_str().to_string(),
        empty_tree,
    };
    output.write(&data, || {
        format!(
            "Initialized treefs store at {}\nEmpty tree: {}\n",
            root.display(),
            empty_tree
        )
    })?;
    Ok(0)
}

fn cmd_import(
    root: &Path,
    source: &Path,
    target: &str,
    into: Option<&str>,
    replace: bool,
    output: &OutputWriter,
) -> Result<u8> {
    let work_tree = match into {
        Some(tree) => open_tree(root, tree)?,
        None => WorkTree::new(open_store(root)?),
    };

    let stats = work_tree
        .import_path(source, target, CopyOptions::new().replace_existing(replace))
        .with_context(|| format!("Failed to import {}", source.display()))?;
    let id = work_tree.persist().context("Failed to persist tree")?;

    let data = ImportOutput::new(id, stats);
    output.write(&data, || format!("{}\n", id))?;
    Ok(0)
}

fn cmd_ls(root: &Path, tree: &str, path: &str, long: bool, output: &OutputWriter) -> Result<u8> {
    let work_tree = open_tree(root, tree)?;
    let listing = work_tree
        .read_dir(path)
        .with_context(|| format!("Failed to list {}", path))?;
    let entries: Vec<_> = listing.iter().cloned().collect();

    let data = LsOutput {
        success: true,
        result_code: 0,
        path: path.to_string(),
        entries,
    };
    output.write(&data, || {
        let mut text = String::new();
        for entry in &data.entries {
            if long {
                let id = entry.object_id.map(|id| id.to_hex()).unwrap_or_default();
                text.push_str(&format!(
                    "{:06o} {} {}\n",
                    entry.mode.bits(),
                    id,
                    entry.name
                ));
            } else {
                text.push_str(&entry.name);
                text.push('\n');
            }
        }
        text
    })?;
    Ok(0)
}

fn cmd_cat(root: &Path, tree: &str, path: &str, output: &OutputWriter) -> Result<u8> {
    let work_tree = open_tree(root, tree)?;
    let content = work_tree
        .read_file(path)
        .with_context(|| format!("Failed to read {}", path))?;

    if output.is_json() {
        let data = serde_json::json!({
            "success": true,
            "result_code": 0,
            "path": path,
            "size": content.len(),
            "content": String::from_utf8_lossy(&content),
        });
        output.write(&data, String::new)?;
    } else {
        output.write_raw(&content)?;
    }
    Ok(0)
}

fn cmd_stat(root: &Path, tree: &str, path: &str, output: &OutputWriter) -> Result<u8> {
    let work_tree = open_tree(root, tree)?;
    let metadata = work_tree
        .metadata(path)
        .with_context(|| format!("Failed to stat {}", path))?;

    let data = StatOutput {
        success: true,
        result_code: 0,
        path: path.to_string(),
        metadata,
    };
    output.write(&data, || {
        let meta = &data.metadata;
        let mut text = format!("Path: {}\nType: {}\n", data.path, meta.mode.as_str());
        if meta.is_file() {
            text.push_str(&format!("Size: {} bytes\n", meta.size));
            text.push_str(&format!("Executable: {}\n", meta.is_executable()));
        }
        if let Some(id) = meta.object_id {
            text.push_str(&format!("Hash: {}\n", id));
        }
        text
    })?;
    Ok(0)
}

fn cmd_write(
    root: &Path,
    tree: &str,
    path: &str,
    executable: bool,
    output: &OutputWriter,
) -> Result<u8> {
    let content = read_stdin()?;
    let mode = if executable {
        FileMode::Executable
    } else {
        FileMode::Regular
    };
    mutate(root, tree, "write", output, |wt| {
        wt.create_file(path, content, mode, true)
    })
}

fn cmd_apply(
    root: &Path,
    tree: &str,
    batch: &Path,
    abort_on_conflict: bool,
    output: &OutputWriter,
) -> Result<u8> {
    let json = if batch == Path::new("-") {
        String::from_utf8(read_stdin()?).context("Batch is not UTF-8")?
    } else {
        std::fs::read_to_string(batch)
            .with_context(|| format!("Failed to read batch {}", batch.display()))?
    };
    let changes = batch::parse_batch(&json)?;

    let policy = if abort_on_conflict {
        ConflictPolicy::Abort
    } else {
        ConflictPolicy::Collect
    };

    let work_tree = open_tree(root, tree)?;
    let report = work_tree.apply(changes, policy)?;

    // A conflicted result is reported but not persisted.
    let id = if report.has_conflicts() {
        None
    } else {
        Some(work_tree.persist().context("Failed to persist tree")?)
    };

    let data = ApplyOutput::new(id, report);
    output.write(&data, || {
        let mut text = String::new();
        for (path, conflict) in &data.conflicts {
            text.push_str(&format!("conflict {}: {}\n", path, conflict));
        }
        match data.tree {
            Some(id) => text.push_str(&format!("{}\n", id)),
            None => text.push_str(&format!(
                "{} conflicts; tree not written\n",
                data.conflicts.len()
            )),
        }
        text
    })?;
    Ok(data.result_code)
}

fn cmd_materialize(
    root: &Path,
    tree: &str,
    path: &str,
    dest: &Path,
    output: &OutputWriter,
) -> Result<u8> {
    let work_tree = open_tree(root, tree)?;
    work_tree
        .materialize(path, dest)
        .with_context(|| format!("Failed to materialize {} to {}", path, dest.display()))?;

    let tree_id = work_tree
        .root_id()
        .context("Opened tree has no address")?;
    let data = MaterializeOutput {
        success: true,
        result_code: 0,
        tree: tree_id,
        path: path.to_string(),
        destination: dest.display().to_string(),
    };
    output.write(&data, || {
        format!("Materialized {} to {}\n", path, dest.display())
    })?;
    Ok(0)
}

/// Read all of stdin, refusing to wait on an interactive terminal.
fn read_stdin() -> Result<Vec<u8>> {
    if atty::is(atty::Stream::Stdin) {
        anyhow::bail!("No input on stdin (pipe content in, e.g. `echo hi | treefs write ...`)");
    }
    let mut buf = Vec::new();
    io::stdin()
        .read_to_end(&mut buf)
        .context("Failed to read stdin")?;
    Ok(buf)
}

//! Tree encoding and entry modes.

use crate::error::{Error, Result};
use crate::hash::Hash;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Maximum length of an entry name in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// The kind of an entry in a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileMode {
    /// Regular, non-executable file.
    Regular,
    /// Executable file.
    Executable,
    /// Directory (subtree).
    Directory,
    /// Symbolic link; the blob holds the uninterpreted target.
    Symlink,
}

impl FileMode {
    /// POSIX-style mode bits written into tree entries.
    pub fn bits(self) -> u32 {
        match self {
            FileMode::Regular => 0o100644,
            FileMode::Executable => 0o100755,
            FileMode::Directory => 0o040000,
            FileMode::Symlink => 0o120000,
        }
    }

    /// Parse mode bits read from a tree entry.
    pub fn from_bits(bits: u32) -> Result<Self> {
        match bits {
            0o100644 => Ok(FileMode::Regular),
            0o100755 => Ok(FileMode::Executable),
            0o040000 => Ok(FileMode::Directory),
            0o120000 => Ok(FileMode::Symlink),
            _ => Err(Error::invalid_tree_entry(format!(
                "Invalid mode: {:06o}",
                bits
            ))),
        }
    }

    /// Whether entries of this mode are stored as trees.
    pub fn is_directory(self) -> bool {
        self == FileMode::Directory
    }

    /// Whether entries of this mode are stored as blobs.
    pub fn is_blob(self) -> bool {
        !self.is_directory()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileMode::Regular => "file",
            FileMode::Executable => "exec",
            FileMode::Directory => "dir",
            FileMode::Symlink => "link",
        }
    }
}

/// Check that `name` can be used as a single tree entry name.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_tree_entry("Name cannot be empty"));
    }

    if name.len() > MAX_NAME_LEN {
        return Err(Error::invalid_tree_entry(format!(
            "Name too long: {} bytes (max {})",
            name.len(),
            MAX_NAME_LEN
        )));
    }

    if name.contains('\0') {
        return Err(Error::invalid_tree_entry("Name cannot contain null bytes"));
    }

    if name.contains('/') {
        return Err(Error::invalid_tree_entry("Name cannot contain '/'"));
    }

    if name == "." || name == ".." {
        return Err(Error::invalid_tree_entry(format!(
            "Name cannot be {:?}",
            name
        )));
    }

    Ok(())
}

/// An entry in a tree: one (name, mode, address) triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Kind of the entry.
    pub mode: FileMode,
    /// Address of the blob or subtree.
    pub hash: Hash,
    /// Name of the entry (UTF-8).
    pub name: String,
}

impl TreeEntry {
    /// Create a new tree entry.
    pub fn new(mode: FileMode, hash: Hash, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self { mode, hash, name })
    }

    /// Encode the entry to bytes.
    ///
    /// Format:
    /// - 4 bytes: mode bits (u32 LE)
    /// - 32 bytes: hash
    /// - 1 byte: name_len
    /// - N bytes: name (UTF-8)
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.mode.bits().to_le_bytes());
        buf.extend_from_slice(self.hash.as_bytes());
        buf.push(self.name.len() as u8);
        buf.extend_from_slice(self.name.as_bytes());
    }

    /// Decode an entry from a reader.
    pub fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        let mut mode_buf = [0u8; 4];
        reader.read_exact(&mut mode_buf)?;
        let mode = FileMode::from_bits(u32::from_le_bytes(mode_buf))?;

        let mut hash_buf = [0u8; 32];
        reader.read_exact(&mut hash_buf)?;
        let hash = Hash::from_bytes(hash_buf);

        let mut name_len_buf = [0u8; 1];
        reader.read_exact(&mut name_len_buf)?;
        let name_len = name_len_buf[0] as usize;

        if name_len == 0 {
            return Err(Error::invalid_tree_entry("Name length is zero"));
        }

        let mut name_buf = vec![0u8; name_len];
        reader.read_exact(&mut name_buf)?;
        let name = String::from_utf8(name_buf)
            .map_err(|e| Error::invalid_tree_entry(format!("Invalid UTF-8 in name: {}", e)))?;

        Self::new(mode, hash, name)
    }
}

impl PartialOrd for TreeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TreeEntry {
    /// Compare by name (bytewise UTF-8) for canonical ordering.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name.as_bytes().cmp(other.name.as_bytes())
    }
}

/// Encode a list of tree entries in canonical (name-sorted) order.
///
/// Duplicate names are rejected: a tree maps each name to one entry.
pub fn encode_tree(mut entries: Vec<TreeEntry>) -> Result<Vec<u8>> {
    entries.sort();

    if let Some(pair) = entries.windows(2).find(|w| w[0].name == w[1].name) {
        return Err(Error::invalid_tree_entry(format!(
            "Duplicate name: {}",
            pair[0].name
        )));
    }

    let mut buf = Vec::new();
    for entry in &entries {
        entry.encode(&mut buf);
    }
    Ok(buf)
}

/// Decode a list of tree entries from bytes.
pub fn decode_tree(data: &[u8]) -> Result<Vec<TreeEntry>> {
    let mut reader = std::io::Cursor::new(data);
    let mut entries = Vec::new();

    while reader.position() < data.len() as u64 {
        entries.push(TreeEntry::decode(&mut reader)?);
    }

    Ok(entries)
}

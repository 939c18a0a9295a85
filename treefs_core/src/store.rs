//! Object store contract and the on-disk backend.

use crate::error::{Error, Result};
use crate::hash::{Algorithm, Hash};
use crate::object::{CompressionType, HEADER_SIZE, ObjectHeader, ObjectType};
use crate::tree::{self, TreeEntry};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default compression threshold: blobs >= 4KB are compressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 4096;

/// Content-addressed storage of blobs and trees.
///
/// Implementations must satisfy:
/// - the same bytes always produce the same address;
/// - saving an object that already exists is a no-op returning its address;
/// - reads of an address that was never written return `Ok(None)`, never an
///   error, so callers can treat a missing object as empty;
/// - reads are safe from any number of threads.
pub trait ObjectStore: Send + Sync {
    /// Read the bytes of a blob.
    fn read_blob(&self, id: &Hash) -> Result<Option<Vec<u8>>>;

    /// Length of a blob in bytes.
    ///
    /// The default reads the whole blob; backends that keep the length in
    /// object metadata should override this.
    fn blob_size(&self, id: &Hash) -> Result<Option<u64>> {
        Ok(self.read_blob(id)?.map(|data| data.len() as u64))
    }

    /// Read the entries of a tree, in name order.
    fn read_tree(&self, id: &Hash) -> Result<Option<Vec<TreeEntry>>>;

    /// Check whether an object exists.
    fn has_object(&self, id: &Hash) -> Result<bool>;

    /// Store a blob and return its address.
    fn save_blob(&self, data: &[u8]) -> Result<Hash>;

    /// Store a tree and return its address. Entries are sorted by name
    /// before encoding.
    fn save_tree(&self, entries: Vec<TreeEntry>) -> Result<Hash>;
}

/// Settings read from a disk store's `config` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Hash algorithm for object addresses.
    pub algorithm: Algorithm,
    /// Blobs at or above this size are zstd-compressed.
    pub compression_threshold: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Blake3,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }
}

impl StoreConfig {
    /// Parse `key=value` lines. Blank lines and `#` comments are skipped,
    /// unknown keys are ignored.
    pub fn parse(content: &str) -> Result<Self> {
        let mut version = None;
        let mut algo = None;
        let mut threshold = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                match key.trim() {
                    "version" => version = Some(value.trim()),
                    "algo" => algo = Some(value.trim()),
                    "compression_threshold" => threshold = Some(value.trim()),
                    _ => {}
                }
            }
        }

        if version != Some("1") {
            return Err(Error::invalid_hash(format!(
                "Unsupported config version: {:?}",
                version
            )));
        }

        let algo_str = algo.ok_or_else(|| Error::invalid_hash("Missing algo in config"))?;
        let algorithm = Algorithm::parse(algo_str)?;

        let compression_threshold = match threshold {
            Some(value) => value.parse::<usize>().map_err(|_| {
                Error::invalid_hash(format!("Invalid compression_threshold: {}", value))
            })?,
            None => DEFAULT_COMPRESSION_THRESHOLD,
        };

        Ok(Self {
            algorithm,
            compression_threshold,
        })
    }

    /// Render the config file contents.
    pub fn render(&self) -> String {
        format!(
            "version=1\nalgo={}\ncompression_threshold={}\n",
            self.algorithm.as_str(),
            self.compression_threshold
        )
    }
}

/// A content-addressed store on the local filesystem.
///
/// Layout:
/// - `config` with version, algorithm and compression settings
/// - `objects/{algorithm}/{prefix}/{suffix}` for each object
#[derive(Debug)]
pub struct DiskStore {
    root: PathBuf,
    config: StoreConfig,
}

impl DiskStore {
    /// Initialize a new store at the given path.
    pub fn init<P: AsRef<Path>>(root: P, config: StoreConfig) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        let objects_dir = root.join("objects").join(config.algorithm.as_str());
        fs::create_dir_all(&objects_dir)?;
        fs::write(root.join("config"), config.render())?;

        debug!(root = %root.display(), algo = config.algorithm.as_str(), "store initialized");
        Ok(Self { root, config })
    }

    /// Open an existing store at the given path.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            return Err(Error::invalid_store(&root, "directory does not exist"));
        }

        let config_path = root.join("config");
        if !config_path.exists() {
            return Err(Error::invalid_store(&root, "config file not found"));
        }

        let config = StoreConfig::parse(&fs::read_to_string(&config_path)?)?;

        let objects_dir = root.join("objects").join(config.algorithm.as_str());
        if !objects_dir.exists() {
            return Err(Error::invalid_store(
                &root,
                "objects directory structure missing",
            ));
        }

        Ok(Self { root, config })
    }

    /// Get the root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the store settings.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn shard_dir(&self, hash: &Hash) -> PathBuf {
        self.root
            .join("objects")
            .join(self.config.algorithm.as_str())
            .join(hash.prefix())
    }

    /// Get the path to an object file given its hash.
    pub fn object_path(&self, hash: &Hash) -> PathBuf {
        self.shard_dir(hash).join(hash.suffix())
    }

    /// Read an object's header, or `None` if the object does not exist.
    pub fn read_header(&self, hash: &Hash) -> Result<Option<ObjectHeader>> {
        let path = self.object_path(hash);
        let mut file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut header_buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)?;
        ObjectHeader::decode(&header_buf).map(Some)
    }

    /// Read and verify an object of the expected type.
    fn read_object(&self, hash: &Hash, expected: ObjectType) -> Result<Option<Vec<u8>>> {
        let path = self.object_path(hash);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let header = ObjectHeader::decode(&raw)?;
        if header.object_type != expected {
            return Err(Error::invalid_object_type(
                expected.as_str(),
                header.object_type.as_str(),
            ));
        }

        let stored = &raw[HEADER_SIZE..];
        if stored.len() as u64 != header.payload_len {
            return Err(Error::corrupted_object(
                &path,
                format!(
                    "Payload length mismatch: expected {}, got {}",
                    header.payload_len,
                    stored.len()
                ),
            ));
        }

        let payload = match header.compression {
            CompressionType::None => stored.to_vec(),
            CompressionType::Zstd => decompress_zstd(stored)?,
        };

        let computed = Hash::for_object(expected, &payload);
        if computed != *hash {
            return Err(Error::corrupted_object(
                &path,
                format!(
                    "Hash mismatch: expected {}, got {}",
                    hash.to_hex(),
                    computed.to_hex()
                ),
            ));
        }

        Ok(Some(payload))
    }

    /// Hash, compress and atomically write an object. Existing objects are
    /// left untouched.
    fn write_object(&self, object_type: ObjectType, payload: &[u8]) -> Result<Hash> {
        let hash = Hash::for_object(object_type, payload);
        let obj_path = self.object_path(&hash);
        if obj_path.exists() {
            return Ok(hash);
        }

        // Trees are small metadata and are never compressed.
        let compress =
            object_type == ObjectType::Blob && payload.len() >= self.config.compression_threshold;
        let compressed;
        let (stored, compression) = if compress {
            compressed = compress_zstd(payload)?;
            (compressed.as_slice(), CompressionType::Zstd)
        } else {
            (payload, CompressionType::None)
        };

        let header = ObjectHeader::new(
            object_type,
            self.config.algorithm,
            compression,
            stored.len() as u64,
            payload.len() as u64,
        );

        let shard = self.shard_dir(&hash);
        fs::create_dir_all(&shard)?;
        let mut temp_file = tempfile::NamedTempFile::new_in(&shard)?;
        temp_file.write_all(&header.encode())?;
        temp_file.write_all(stored)?;
        temp_file.flush()?;
        temp_file.persist(&obj_path)?;

        debug!(
            hash = %hash.short(),
            kind = object_type.as_str(),
            len = payload.len(),
            "object written"
        );
        Ok(hash)
    }
}

impl ObjectStore for DiskStore {
    fn read_blob(&self, id: &Hash) -> Result<Option<Vec<u8>>> {
        self.read_object(id, ObjectType::Blob)
    }

    fn blob_size(&self, id: &Hash) -> Result<Option<u64>> {
        match self.read_header(id)? {
            Some(header) if header.object_type == ObjectType::Blob => {
                Ok(Some(header.content_len))
            }
            Some(header) => Err(Error::invalid_object_type(
                ObjectType::Blob.as_str(),
                header.object_type.as_str(),
            )),
            None => Ok(None),
        }
    }

    fn read_tree(&self, id: &Hash) -> Result<Option<Vec<TreeEntry>>> {
        match self.read_object(id, ObjectType::Tree)? {
            Some(payload) => tree::decode_tree(&payload).map(Some),
            None => Ok(None),
        }
    }

    fn has_object(&self, id: &Hash) -> Result<bool> {
        Ok(self.object_path(id).exists())
    }

    fn save_blob(&self, data: &[u8]) -> Result<Hash> {
        self.write_object(ObjectType::Blob, data)
    }

    fn save_tree(&self, entries: Vec<TreeEntry>) -> Result<Hash> {
        let payload = tree::encode_tree(entries)?;
        self.write_object(ObjectType::Tree, &payload)
    }
}

/// Compress data using zstd.
fn compress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    zstd::encode_all(data, 3) // Level 3 = fast compression
        .map_err(|e| Error::compression_error(format!("zstd compression failed: {}", e)))
}

/// Decompress data using zstd.
fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    zstd::decode_all(data)
        .map_err(|e| Error::compression_error(format!("zstd decompression failed: {}", e)))
}

//! Binary object format and encoding.
//!
//! Objects are stored with a 24-byte header followed by the payload:
//!
//! ```text
//! 0x00  4   "TRFS" magic
//! 0x04  1   version (u8) = 1
//! 0x05  1   type: 1=blob, 2=tree
//! 0x06  1   algo: 1=blake3-256
//! 0x07  1   compression: 0=none, 1=zstd
//! 0x08  8   payload_len (u64 LE) - stored (possibly compressed) size
//! 0x10  8   content_len (u64 LE) - uncompressed size
//! 0x18  ... payload
//! ```
//!
//! `content_len` lets a blob's size be answered from the header alone.

use crate::error::{Error, Result};
use crate::hash::Algorithm;

/// Magic bytes at the start of every object file.
pub const MAGIC: &[u8; 4] = b"TRFS";

/// Current object format version.
pub const VERSION: u8 = 1;

/// Size of the object header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Object types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    /// A blob (file content).
    Blob = 1,
    /// A tree (directory listing).
    Tree = 2,
}

impl ObjectType {
    /// Convert to byte representation.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse from byte representation.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(ObjectType::Blob),
            2 => Ok(ObjectType::Tree),
            _ => Err(Error::invalid_object_type(
                "blob or tree",
                format!("type byte {}", value),
            )),
        }
    }

    /// Get the string name of this object type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Blob => "blob",
            ObjectType::Tree => "tree",
        }
    }

    /// Domain tag mixed into the object's address.
    pub fn domain(&self) -> &'static str {
        match self {
            ObjectType::Blob => "treefs-blob-v1",
            ObjectType::Tree => "treefs-tree-v1",
        }
    }
}

/// Compression types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    /// No compression.
    None = 0,
    /// Zstandard compression.
    Zstd = 1,
}

impl CompressionType {
    /// Convert to byte representation.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse from byte representation.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Zstd),
            _ => Err(Error::compression_error(format!(
                "Invalid compression type: {}",
                value
            ))),
        }
    }
}

/// A 24-byte object header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHeader {
    /// Object type (blob or tree).
    pub object_type: ObjectType,
    /// Hash algorithm used.
    pub algorithm: Algorithm,
    /// Compression applied to the payload.
    pub compression: CompressionType,
    /// Length of the stored payload in bytes.
    pub payload_len: u64,
    /// Length of the payload after decompression.
    pub content_len: u64,
}

impl ObjectHeader {
    /// Create a new object header.
    pub fn new(
        object_type: ObjectType,
        algorithm: Algorithm,
        compression: CompressionType,
        payload_len: u64,
        content_len: u64,
    ) -> Self {
        Self {
            object_type,
            algorithm,
            compression,
            payload_len,
            content_len,
        }
    }

    /// Encode the header to a 24-byte array.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4] = VERSION;
        buf[5] = self.object_type.to_u8();
        buf[6] = self.algorithm.id();
        buf[7] = self.compression.to_u8();
        buf[8..16].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[16..24].copy_from_slice(&self.content_len.to_le_bytes());
        buf
    }

    /// Decode a header from the first 24 bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::invalid_hash(format!(
                "Header too short: {} bytes (expected {})",
                buf.len(),
                HEADER_SIZE
            )));
        }

        if &buf[0..4] != MAGIC {
            return Err(Error::invalid_hash(format!(
                "Invalid magic: expected {:?}, got {:?}",
                MAGIC,
                &buf[0..4]
            )));
        }

        if buf[4] != VERSION {
            return Err(Error::invalid_hash(format!(
                "Unsupported version: {} (expected {})",
                buf[4], VERSION
            )));
        }

        let object_type = ObjectType::from_u8(buf[5])?;
        let algorithm = Algorithm::from_id(buf[6])?;
        let compression = CompressionType::from_u8(buf[7])?;

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&buf[8..16]);
        let payload_len = u64::from_le_bytes(len_bytes);
        len_bytes.copy_from_slice(&buf[16..24]);
        let content_len = u64::from_le_bytes(len_bytes);

        Ok(Self {
            object_type,
            algorithm,
            compression,
            payload_len,
            content_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(version: u8, object_type: u8, compression: u8) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4] = version;
        buf[5] = object_type;
        buf[6] = Algorithm::Blake3.id();
        buf[7] = compression;
        buf
    }

    #[test]
    fn test_object_type_conversions() {
        assert_eq!(ObjectType::from_u8(1).unwrap(), ObjectType::Blob);
        assert_eq!(ObjectType::from_u8(2).unwrap(), ObjectType::Tree);
        assert!(ObjectType::from_u8(0).is_err());
        assert!(ObjectType::from_u8(3).is_err());
        assert_ne!(ObjectType::Blob.domain(), ObjectType::Tree.domain());
    }

    #[test]
    fn test_header_encode_decode() {
        let header = ObjectHeader::new(
            ObjectType::Blob,
            Algorithm::Blake3,
            CompressionType::Zstd,
            312,
            4096,
        );
        let encoded = header.encode();
        assert_eq!(&encoded[0..4], MAGIC);
        assert_eq!(ObjectHeader::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn test_header_decode_rejects_bad_input() {
        let mut bad_magic = header_bytes(VERSION, 1, 0);
        bad_magic[0..4].copy_from_slice(b"CAFS");
        assert!(ObjectHeader::decode(&bad_magic).is_err());

        assert!(ObjectHeader::decode(&header_bytes(9, 1, 0)).is_err());
        assert!(ObjectHeader::decode(&header_bytes(VERSION, 7, 0)).is_err());
        assert!(ObjectHeader::decode(&header_bytes(VERSION, 1, 5)).is_err());
        assert!(ObjectHeader::decode(&[0u8; 10]).is_err());
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_header_roundtrip(
            object_type in prop::sample::select(vec![ObjectType::Blob, ObjectType::Tree]),
            compression in prop::sample::select(vec![CompressionType::None, CompressionType::Zstd]),
            payload_len in any::<u64>(),
            content_len in any::<u64>(),
        ) {
            let header = ObjectHeader::new(
                object_type,
                Algorithm::Blake3,
                compression,
                payload_len,
                content_len,
            );
            prop_assert_eq!(ObjectHeader::decode(&header.encode())?, header);
        }
    }
}

//! Block addressing.
//!
//! A logical file is stored as independently addressable blocks keyed by
//! `(path, offset, version)`, where `offset` is the byte offset of the first
//! byte the block holds. Block 0 additionally carries the file size and its
//! version is the version of the whole file.
//!
//! Versions count *down*: beginning a batch reserves `version - 1`. Because
//! keys sort ascending by version, the first key of a scan over one block's
//! versions is the newest one, and starting the scan at a reader's version
//! skips anything newer than the reader is allowed to see:
//!
//! ```text
//! (db, 4096, -3)   <- in-flight batch, invisible to a reader at -2
//! (db, 4096, -2)   <- first hit for a reader at -2
//! (db, 4096,  0)   <- superseded, removed by purge
//! ```

use serde::{Deserialize, Serialize};
use std::ops::Bound;

use crate::encoding::keycode::{self, KeyReader};
use crate::encoding::Key;
use crate::error::Result;

/// Offset of the block that carries the file metadata.
pub const METADATA_OFFSET: u64 = 0;

/// Version given to block 0 when a file is created.
pub const INITIAL_VERSION: i64 = 0;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockKey {
    pub path: String,
    pub offset: u64,
    pub version: i64,
}

impl BlockKey {
    pub fn new(path: impl Into<String>, offset: u64, version: i64) -> Self {
        Self {
            path: path.into(),
            offset,
            version,
        }
    }

    pub fn is_metadata(&self) -> bool {
        self.offset == METADATA_OFFSET
    }

    /// Encodes the entry of the `(path, version)` secondary index.
    pub fn index_key(&self) -> Vec<u8> {
        let mut key = keycode::encode_string(&self.path);
        key.extend(keycode::encode_integer(self.version));
        key.extend(keycode::encode_unsigned(self.offset));
        key
    }

    pub fn from_index_key(bytes: &[u8]) -> Result<Self> {
        let mut reader = KeyReader::new(bytes);
        let path = reader.read_string()?;
        let version = reader.read_integer()?;
        let offset = reader.read_unsigned()?;
        reader.finish()?;
        Ok(Self::new(path, offset, version))
    }
}

impl Key for BlockKey {
    fn encode(&self) -> Vec<u8> {
        let mut key = keycode::encode_string(&self.path);
        key.extend(keycode::encode_unsigned(self.offset));
        key.extend(keycode::encode_integer(self.version));
        key
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = KeyReader::new(bytes);
        let path = reader.read_string()?;
        let offset = reader.read_unsigned()?;
        let version = reader.read_integer()?;
        reader.finish()?;
        Ok(Self::new(path, offset, version))
    }
}

/// Stored value of a block. Only block 0 carries a file size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub data: Vec<u8>,
    pub file_size: Option<u64>,
}

impl Block {
    pub fn page(data: Vec<u8>) -> Self {
        Self {
            data,
            file_size: None,
        }
    }
}

/// In-memory copy of a file's block 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub path: String,
    pub version: i64,
    pub file_size: u64,
    pub data: Vec<u8>,
}

impl Metadata {
    /// Metadata of a freshly created, empty file.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            version: INITIAL_VERSION,
            file_size: 0,
            data: Vec::new(),
        }
    }

    pub fn from_block(key: BlockKey, block: Block) -> Self {
        let file_size = block.file_size.unwrap_or(block.data.len() as u64);
        Self {
            path: key.path,
            version: key.version,
            file_size,
            data: block.data,
        }
    }

    pub fn key(&self) -> BlockKey {
        BlockKey::new(self.path.clone(), METADATA_OFFSET, self.version)
    }

    pub fn to_block(&self) -> Block {
        Block {
            data: self.data.clone(),
            file_size: Some(self.file_size),
        }
    }
}

/// A bounded range of block keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Bound<BlockKey>,
    pub end: Bound<BlockKey>,
}

impl KeyRange {
    /// Versions of the block at `offset` that a reader at `version` may see,
    /// newest first.
    pub fn visible(path: &str, offset: u64, version: i64) -> Self {
        Self {
            start: Bound::Included(BlockKey::new(path, offset, version)),
            end: Bound::Included(BlockKey::new(path, offset, i64::MAX)),
        }
    }

    /// Exactly one stored block.
    pub fn exact(key: &BlockKey) -> Self {
        Self {
            start: Bound::Included(key.clone()),
            end: Bound::Included(key.clone()),
        }
    }

    /// Every version of the block at `offset`, newest first.
    pub fn block(path: &str, offset: u64) -> Self {
        Self::visible(path, offset, i64::MIN)
    }

    /// Versions of the block at `offset` strictly older than `version`.
    pub fn older(path: &str, offset: u64, version: i64) -> Self {
        Self {
            start: Bound::Excluded(BlockKey::new(path, offset, version)),
            end: Bound::Included(BlockKey::new(path, offset, i64::MAX)),
        }
    }

    /// Every block of a file.
    pub fn file(path: &str) -> Self {
        Self::from_offset(path, METADATA_OFFSET)
    }

    /// Blocks that start at or after `offset`.
    pub fn from_offset(path: &str, offset: u64) -> Self {
        Self {
            start: Bound::Included(BlockKey::new(path, offset, i64::MIN)),
            end: Bound::Included(BlockKey::new(path, u64::MAX, i64::MAX)),
        }
    }

    /// Blocks that start in `[start, end)`.
    pub fn offsets(path: &str, start: u64, end: u64) -> Self {
        Self {
            start: Bound::Included(BlockKey::new(path, start, i64::MIN)),
            end: Bound::Excluded(BlockKey::new(path, end, i64::MIN)),
        }
    }

    /// Blocks that start strictly before `offset`.
    pub fn before(path: &str, offset: u64) -> Self {
        Self::offsets(path, METADATA_OFFSET, offset)
    }

    pub fn encode(&self) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
        (encode_bound(&self.start), encode_bound(&self.end))
    }
}

fn encode_bound(bound: &Bound<BlockKey>) -> Bound<Vec<u8>> {
    match bound {
        Bound::Included(key) => Bound::Included(key.encode()),
        Bound::Excluded(key) => Bound::Excluded(key.encode()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// A range over the `(path, version)` index of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    pub path: String,
    pub start: Bound<i64>,
    pub end: Bound<i64>,
}

impl VersionRange {
    /// Every version of every block of `path`.
    pub fn all(path: &str) -> Self {
        Self {
            path: path.to_string(),
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    /// Blocks written at `version` or at any newer (smaller) version.
    pub fn at_or_newer(path: &str, version: i64) -> Self {
        Self {
            path: path.to_string(),
            start: Bound::Unbounded,
            end: Bound::Included(version),
        }
    }

    /// Blocks written at versions strictly older (larger) than `version`.
    pub fn older(path: &str, version: i64) -> Self {
        Self {
            path: path.to_string(),
            start: Bound::Excluded(version),
            end: Bound::Unbounded,
        }
    }

    pub fn encode(&self) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
        let prefix = keycode::encode_string(&self.path);
        let at = |version: i64| {
            let mut key = prefix.clone();
            key.extend(keycode::encode_integer(version));
            key
        };
        let through = |version: i64| {
            let mut key = at(version);
            key.extend(keycode::encode_unsigned(u64::MAX));
            key
        };

        let start = match self.start {
            Bound::Included(version) => Bound::Included(at(version)),
            Bound::Excluded(version) => Bound::Excluded(through(version)),
            Bound::Unbounded => Bound::Included(prefix.clone()),
        };
        let end = match self.end {
            Bound::Included(version) => Bound::Included(through(version)),
            Bound::Excluded(version) => Bound::Excluded(at(version)),
            Bound::Unbounded => {
                // the path encoding is prefix-free, so nothing else sorts here
                let mut key = prefix.clone();
                key.push(0xFF);
                Bound::Excluded(key)
            }
        };
        (start, end)
    }
}

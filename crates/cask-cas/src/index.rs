//! The block index: the repository's catalog of stored blocks.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::write_atomic;
use crate::{BlockId, Result};

/// Bookkeeping for one stored block.
///
/// `references` counts uses within the currently open head's table of
/// contents only; blocks held alive by other heads are rediscovered by the
/// reachability scan at commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub id: BlockId,
    /// Plaintext length in bytes.
    pub byte_size: u64,
    /// On-disk (post-transform) length in bytes.
    pub stored_size: u64,
    pub references: u32,
}

/// Ordered collection of [`BlockInfo`] records, persisted wholesale at
/// `blocks.idx`. Lookups are linear scans; the index is small relative to
/// the payload it describes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockIndex {
    blocks: Vec<BlockInfo>,
}

impl BlockIndex {
    pub fn find(&self, id: &BlockId) -> Option<&BlockInfo> {
        self.blocks.iter().find(|b| b.id == *id)
    }

    pub fn find_mut(&mut self, id: &BlockId) -> Option<&mut BlockInfo> {
        self.blocks.iter_mut().find(|b| b.id == *id)
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.find(id).is_some()
    }

    pub fn add(&mut self, info: BlockInfo) {
        self.blocks.push(info);
    }

    /// Removes the record for `id`; returns whether it was present.
    pub fn remove(&mut self, id: &BlockId) -> bool {
        let before = self.blocks.len();
        self.blocks.retain(|b| b.id != *id);
        self.blocks.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockInfo> {
        self.blocks.iter()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Loads the index from `path`; an absent file is an empty index.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<BlockIndex> {
        let data = match fs::read(path.as_ref()) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BlockIndex::default());
            }
            Err(e) => return Err(e.into()),
        };
        let index: BlockIndex = bincode::deserialize(&data)?;
        debug!(blocks = index.len(), "loaded block index");
        Ok(index)
    }

    /// Persists the index to `path` via temp file and atomic rename.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let data = bincode::serialize(self)?;
        write_atomic(path.as_ref(), &data)
    }
}

//! Access to locally held file blocks.

use crate::error::{Error, Result};
use crate::ledger::FileId;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Source of the data blocks a storage node serves and proves.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Block `index` of a file.
    async fn read_block(&self, file_id: &FileId, index: u64) -> Result<Bytes>;

    /// Number of blocks held for a file, or `None` if the file is not held.
    async fn block_count(&self, file_id: &FileId) -> Result<Option<u64>>;
}

/// Blocks held in memory.
#[derive(Default)]
pub struct MemoryBlockStore {
    files: RwLock<HashMap<FileId, Vec<Bytes>>>,
}

impl MemoryBlockStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `data` split into blocks of `block_size` bytes, returning the block count.
    pub fn insert(&self, file_id: FileId, data: &[u8], block_size: usize) -> u64 {
        let blocks = data
            .chunks(block_size.max(1))
            .map(Bytes::copy_from_slice)
            .collect();
        self.insert_blocks(file_id, blocks)
    }

    /// Store pre-split blocks, returning the block count.
    pub fn insert_blocks(&self, file_id: FileId, blocks: Vec<Bytes>) -> u64 {
        let count = blocks.len() as u64;
        self.files.write().insert(file_id, blocks);
        count
    }

    /// Drop a file's blocks.
    pub fn remove(&self, file_id: &FileId) {
        self.files.write().remove(file_id);
    }
}

#[async_trait]
impl BlockSource for MemoryBlockStore {
    async fn read_block(&self, file_id: &FileId, index: u64) -> Result<Bytes> {
        let files = self.files.read();
        let blocks = files
            .get(file_id)
            .ok_or_else(|| Error::NotFound(format!("blocks of {file_id}")))?;
        usize::try_from(index)
            .ok()
            .and_then(|i| blocks.get(i))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("block {index} of {file_id}")))
    }

    async fn block_count(&self, file_id: &FileId) -> Result<Option<u64>> {
        Ok(self.files.read().get(file_id).map(|b| b.len() as u64))
    }
}

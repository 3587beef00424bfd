//! Possession-proof generation.

use crate::blocks::BlockSource;
use crate::error::{Error, Result};
use crate::ledger::FileInfo;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Produces a possession proof for a challenge height.
///
/// The proof algorithm is opaque to the scheduler; it only needs a blob the
/// ledger will accept for `challenge_height`.
#[async_trait]
pub trait Prover: Send + Sync {
    /// Prove possession of `file` for `challenge_height`.
    async fn prove(&self, file: &FileInfo, challenge_height: u64) -> Result<Vec<u8>>;
}

/// Deterministic stand-in prover: SHA-256 over the challenged block.
///
/// The challenged block is `challenge_height % block_count`.
pub struct DigestProver {
    blocks: Arc<dyn BlockSource>,
}

impl DigestProver {
    /// Create a prover reading from `blocks`.
    #[must_use]
    pub fn new(blocks: Arc<dyn BlockSource>) -> Self {
        Self { blocks }
    }
}

#[async_trait]
impl Prover for DigestProver {
    async fn prove(&self, file: &FileInfo, challenge_height: u64) -> Result<Vec<u8>> {
        if file.block_count == 0 {
            return Err(Error::Protocol(format!("{} has no blocks to prove", file.file_id)));
        }
        let index = challenge_height % file.block_count;
        let block = self.blocks.read_block(&file.file_id, index).await?;

        let mut hasher = Sha256::new();
        hasher.update(file.file_id.as_str().as_bytes());
        hasher.update(challenge_height.to_le_bytes());
        hasher.update(&file.pdp_param);
        hasher.update(&block);
        Ok(hasher.finalize().to_vec())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::blocks::MemoryBlockStore;
    use crate::identity::Address;
    use crate::ledger::FileId;

    fn file(block_count: u64) -> FileInfo {
        FileInfo {
            file_id: FileId::new("f"),
            owner: Address([1u8; 20]),
            block_count,
            proof_interval: 10,
            start_height: 0,
            expire_height: 100,
            pdp_param: vec![7],
        }
    }

    #[tokio::test]
    async fn test_proof_depends_on_challenge() {
        let store = Arc::new(MemoryBlockStore::new());
        store.insert(FileId::new("f"), b"aaaabbbb", 4);
        let prover = DigestProver::new(store);

        let p10 = prover.prove(&file(2), 10).await.unwrap();
        assert_eq!(p10.len(), 32);
        assert_eq!(p10, prover.prove(&file(2), 10).await.unwrap());
        assert_ne!(p10, prover.prove(&file(2), 11).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_blocks_fail() {
        let prover = DigestProver::new(Arc::new(MemoryBlockStore::new()));
        assert!(matches!(
            prover.prove(&file(2), 1).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            prover.prove(&file(0), 1).await,
            Err(Error::Protocol(_))
        ));
    }
}

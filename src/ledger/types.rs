//! Ledger record types shared by every protocol component.

use crate::identity::Address;
use crate::settlement::Voucher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a stored file (its content hash as registered on the ledger).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    /// Wrap a file identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if the identifier is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0)
    }
}

impl From<&str> for FileId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Hash of a ledger block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// True if every byte is zero (no hash supplied).
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", hex::encode(self.0))
    }
}

/// Handle of a submitted transaction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxHandle(pub [u8; 32]);

impl fmt::Display for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHandle({self})")
    }
}

/// File metadata as recorded on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// File identifier.
    pub file_id: FileId,
    /// Owner of the file.
    pub owner: Address,
    /// Number of blocks in the file.
    pub block_count: u64,
    /// Blocks between required possession proofs.
    pub proof_interval: u64,
    /// Height the storage term started at.
    pub start_height: u64,
    /// Height the storage term ends at.
    pub expire_height: u64,
    /// Opaque parameters for the proof algorithm.
    pub pdp_param: Vec<u8>,
}

impl FileInfo {
    /// Total number of proofs required over the storage term.
    #[must_use]
    pub fn required_proof_count(&self) -> u64 {
        if self.proof_interval == 0 {
            return 0;
        }
        self.expire_height.saturating_sub(self.start_height) / self.proof_interval + 1
    }

    /// True once `height` is past the storage term.
    #[must_use]
    pub fn is_expired_at(&self, height: u64) -> bool {
        height > self.expire_height
    }
}

/// Possession-proof schedule state of one node for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdpRecord {
    /// File identifier.
    pub file_id: FileId,
    /// Storage node responsible for the file.
    pub node: Address,
    /// Proofs accepted so far.
    pub proof_count: u64,
    /// Challenge height the next proof must answer.
    pub next_height: u64,
    /// Time the last proof was accepted.
    pub last_submitted: Option<DateTime<Utc>>,
    /// Whether the storage term has been settled.
    pub settled: bool,
}

/// One storage node's share of a read allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPlan {
    /// Storage node serving the blocks.
    pub node: Address,
    /// Maximum blocks the node may serve.
    pub max_read_blocks: u64,
    /// Blocks already paid for.
    pub have_read_blocks: u64,
}

impl ReadPlan {
    /// Plan for `node` with nothing served yet.
    #[must_use]
    pub fn new(node: Address, max_read_blocks: u64) -> Self {
        Self {
            node,
            max_read_blocks,
            have_read_blocks: 0,
        }
    }

    /// Blocks left to serve.
    #[must_use]
    pub fn remaining_blocks(&self) -> u64 {
        self.max_read_blocks.saturating_sub(self.have_read_blocks)
    }
}

/// A downloader's prepaid read allocation for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPledge {
    /// File being read.
    pub file_id: FileId,
    /// Downloader paying for the reads.
    pub downloader: Address,
    /// Height the allocation was recorded at; distinguishes re-issued allocations.
    pub pledge_height: u64,
    /// Height after which the allocation cannot be consumed.
    pub expire_height: u64,
    /// Remaining prepaid balance.
    pub rest_balance: u64,
    /// One plan per serving node.
    pub plans: Vec<ReadPlan>,
}

impl ReadPledge {
    /// The plan naming `node`, if any.
    #[must_use]
    pub fn plan_for(&self, node: &Address) -> Option<&ReadPlan> {
        self.plans.iter().find(|p| p.node == *node)
    }
}

/// A possession proof answering a challenge height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofSubmission {
    /// File being proven.
    pub file_id: FileId,
    /// Node submitting the proof.
    pub node: Address,
    /// Proof blob.
    pub proof: Vec<u8>,
    /// Challenge height the proof answers.
    pub challenge_height: u64,
}

/// State-changing ledger operations used by this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Submit a possession proof.
    FileProve(ProofSubmission),
    /// Settle a read session with its final voucher.
    ReadSettle(Voucher),
    /// Record a read allocation.
    ReadPledge(ReadPledge),
    /// Cancel the caller's read allocation for a file.
    CancelRead {
        /// File whose allocation is cancelled.
        file_id: FileId,
    },
}

impl Operation {
    /// Short name for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::FileProve(_) => "file_prove",
            Self::ReadSettle(_) => "read_settle",
            Self::ReadPledge(_) => "read_pledge",
            Self::CancelRead { .. } => "cancel_read",
        }
    }
}

/// A transaction addressed to the storage contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Contract the transaction is addressed to.
    pub contract: String,
    /// Account submitting the transaction.
    pub signer: Address,
    /// The operation.
    pub operation: Operation,
}

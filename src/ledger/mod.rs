//! Ledger collaborator interface.
//!
//! The ledger is the only durable shared resource: it records files,
//! possession-proof schedules, read allocations and settlements. This crate
//! consumes it through the [`Ledger`] trait; the concrete connector (RPC
//! client, wire codec, wallet signing) is supplied by the embedding
//! application. [`MemoryLedger`] is an in-process implementation used by the
//! CLI's development mode and by tests.
//!
//! # Architecture
//!
//! ```text
//!   ProofTask ──submit(FileProve)──┐
//!                                  ▼
//!   ReadSessionProvider ──submit(ReadSettle)──▶ Ledger ◀── ConfirmationWaiter
//!                                  ▲              (polls tx_height)
//!   Downloader ──submit(ReadPledge)┘
//! ```

mod confirmation;
mod memory;
mod types;

pub use confirmation::ConfirmationWaiter;
pub use memory::MemoryLedger;
pub use types::{
    BlockHash, FileId, FileInfo, Operation, PdpRecord, ProofSubmission, ReadPlan, ReadPledge,
    Transaction, TxHandle,
};

use crate::error::Result;
use crate::identity::Address;
use crate::passport::Passport;
use async_trait::async_trait;

/// Read and write access to the storage contract's state.
///
/// Implementations must be safe for concurrent use by many sessions and
/// proof tasks. Query methods return `Ok(None)` / an empty list for entities
/// that do not exist and reserve `Err` for unavailability.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Current chain height.
    async fn current_height(&self) -> Result<u64>;

    /// Hash of the block at `height`.
    async fn block_hash(&self, height: u64) -> Result<BlockHash>;

    /// Submit a transaction, returning its handle without waiting for inclusion.
    async fn submit(&self, tx: Transaction) -> Result<TxHandle>;

    /// Height a transaction was included at, or 0 if not yet observed.
    async fn tx_height(&self, tx: &TxHandle) -> Result<u64>;

    /// File metadata.
    async fn file_info(&self, file_id: &FileId) -> Result<Option<FileInfo>>;

    /// Possession-proof records for every node holding the file.
    async fn pdp_records(&self, file_id: &FileId) -> Result<Vec<PdpRecord>>;

    /// Read allocation of `downloader` for a file.
    async fn read_pledge(
        &self,
        file_id: &FileId,
        downloader: &Address,
    ) -> Result<Option<ReadPledge>>;

    /// Files owned by the passport holder; the ledger verifies the passport.
    async fn file_list(&self, passport: &Passport) -> Result<Vec<FileId>>;
}

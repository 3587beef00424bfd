//! In-process ledger for development and tests.
//!
//! Applies the storage contract's rules for the operations this crate
//! submits: proof challenges must match the recorded next height, settlement
//! vouchers must verify and stay inside an unexpired plan, and
//! passport-authorized listings check the passport's height window.

use crate::config::PassportConfig;
use crate::error::{Error, Result};
use crate::identity::Address;
use crate::ledger::{
    BlockHash, FileId, FileInfo, Ledger, Operation, PdpRecord, ProofSubmission, ReadPledge,
    Transaction, TxHandle,
};
use crate::passport::Passport;
use crate::settlement::Voucher;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Default lifetime of a read allocation submitted without an expiry.
pub const DEFAULT_PLEDGE_LIFETIME: u64 = 1000;

struct State {
    height: u64,
    files: HashMap<FileId, FileInfo>,
    pdp: HashMap<FileId, Vec<PdpRecord>>,
    pledges: HashMap<(FileId, Address), ReadPledge>,
    pending: Vec<(TxHandle, Transaction)>,
    included: HashMap<TxHandle, u64>,
    submitted: Vec<Transaction>,
    tx_counter: u64,
    auto_mine: bool,
    available: bool,
    fail_submissions: u32,
}

/// An in-memory implementation of [`Ledger`].
pub struct MemoryLedger {
    contract: String,
    passport: PassportConfig,
    state: Mutex<State>,
}

impl MemoryLedger {
    /// Create an empty ledger at height 0 serving `contract`.
    #[must_use]
    pub fn new(contract: impl Into<String>) -> Self {
        Self {
            contract: contract.into(),
            passport: PassportConfig::default(),
            state: Mutex::new(State {
                height: 0,
                files: HashMap::new(),
                pdp: HashMap::new(),
                pledges: HashMap::new(),
                pending: Vec::new(),
                included: HashMap::new(),
                submitted: Vec::new(),
                tx_counter: 0,
                auto_mine: true,
                available: true,
                fail_submissions: 0,
            }),
        }
    }

    /// Set the passport window and clock skew used for authorized listings.
    #[must_use]
    pub fn with_passport_config(mut self, passport: PassportConfig) -> Self {
        self.passport = passport;
        self
    }

    /// Contract address this ledger accepts transactions for.
    #[must_use]
    pub fn contract(&self) -> &str {
        &self.contract
    }

    /// Register a file.
    pub fn add_file(&self, info: FileInfo) {
        self.state.lock().files.insert(info.file_id.clone(), info);
    }

    /// Delete a file together with its possession records.
    pub fn remove_file(&self, file_id: &FileId) {
        let mut state = self.state.lock();
        state.files.remove(file_id);
        state.pdp.remove(file_id);
    }

    /// Make `node` responsible for proving possession of a file.
    ///
    /// The first challenge is the file's start height.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the file is not registered.
    pub fn assign_node(&self, file_id: &FileId, node: Address) -> Result<()> {
        let mut state = self.state.lock();
        let start = state
            .files
            .get(file_id)
            .map(|f| f.start_height)
            .ok_or_else(|| Error::NotFound(format!("file {file_id}")))?;
        let records = state.pdp.entry(file_id.clone()).or_default();
        if !records.iter().any(|r| r.node == node) {
            records.push(PdpRecord {
                file_id: file_id.clone(),
                node,
                proof_count: 0,
                next_height: start,
                last_submitted: None,
                settled: false,
            });
        }
        Ok(())
    }

    /// Remove `node`'s responsibility for a file.
    pub fn unassign_node(&self, file_id: &FileId, node: &Address) {
        if let Some(records) = self.state.lock().pdp.get_mut(file_id) {
            records.retain(|r| r.node != *node);
        }
    }

    /// Insert a read allocation directly, bypassing submission.
    pub fn put_read_pledge(&self, pledge: ReadPledge) {
        self.state
            .lock()
            .pledges
            .insert((pledge.file_id.clone(), pledge.downloader), pledge);
    }

    /// Snapshot of a read allocation.
    #[must_use]
    pub fn pledge(&self, file_id: &FileId, downloader: &Address) -> Option<ReadPledge> {
        self.state
            .lock()
            .pledges
            .get(&(file_id.clone(), *downloader))
            .cloned()
    }

    /// Snapshot of one node's possession record.
    #[must_use]
    pub fn pdp_record(&self, file_id: &FileId, node: &Address) -> Option<PdpRecord> {
        self.state
            .lock()
            .pdp
            .get(file_id)
            .and_then(|records| records.iter().find(|r| r.node == *node).cloned())
    }

    /// Every transaction accepted for submission, in order.
    #[must_use]
    pub fn submitted(&self) -> Vec<Transaction> {
        self.state.lock().submitted.clone()
    }

    /// Current height without going through the async trait.
    #[must_use]
    pub fn height(&self) -> u64 {
        self.state.lock().height
    }

    /// Include submitted transactions in blocks immediately (default) or only on [`Self::mine_block`].
    pub fn set_auto_mine(&self, enabled: bool) {
        self.state.lock().auto_mine = enabled;
    }

    /// Simulate the ledger becoming unreachable.
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Make the next `count` submissions fail as if the ledger were unreachable.
    pub fn fail_next_submissions(&self, count: u32) {
        self.state.lock().fail_submissions = count;
    }

    /// Produce one block, including all pending transactions.
    pub fn mine_block(&self) -> u64 {
        let mut state = self.state.lock();
        self.mine_locked(&mut state)
    }

    /// Produce `blocks` blocks.
    pub fn advance(&self, blocks: u64) -> u64 {
        let mut state = self.state.lock();
        for _ in 0..blocks {
            self.mine_locked(&mut state);
        }
        state.height
    }

    fn mine_locked(&self, state: &mut State) -> u64 {
        state.height += 1;
        let height = state.height;
        for (handle, tx) in std::mem::take(&mut state.pending) {
            if let Err(e) = Self::apply(state, &tx, height) {
                warn!("tx {handle} ({}) failed at height {height}: {e}", tx.operation.name());
            }
            state.included.insert(handle, height);
        }
        height
    }

    fn hash_for(&self, height: u64) -> BlockHash {
        let mut hasher = Sha256::new();
        hasher.update(self.contract.as_bytes());
        hasher.update(height.to_le_bytes());
        BlockHash(hasher.finalize().into())
    }

    fn check_available(state: &State) -> Result<()> {
        if state.available {
            Ok(())
        } else {
            Err(Error::LedgerUnavailable("ledger is offline".to_string()))
        }
    }

    fn validate(state: &State, tx: &Transaction) -> Result<()> {
        match &tx.operation {
            Operation::FileProve(sub) => Self::validate_proof(state, tx.signer, sub),
            Operation::ReadSettle(voucher) => Self::validate_settle(state, tx.signer, voucher),
            Operation::ReadPledge(pledge) => {
                if !state.files.contains_key(&pledge.file_id) {
                    return Err(Error::NotFound(format!("file {}", pledge.file_id)));
                }
                if pledge.plans.is_empty() {
                    return Err(Error::Protocol("read pledge has no plans".to_string()));
                }
                Ok(())
            }
            Operation::CancelRead { file_id } => {
                if state.pledges.contains_key(&(file_id.clone(), tx.signer)) {
                    Ok(())
                } else {
                    Err(Error::NotFound(format!("read pledge for {file_id}")))
                }
            }
        }
    }

    fn validate_proof(state: &State, signer: Address, sub: &ProofSubmission) -> Result<()> {
        if sub.node != signer {
            return Err(Error::Protocol("proof submitted for another node".to_string()));
        }
        let record = state
            .pdp
            .get(&sub.file_id)
            .and_then(|records| records.iter().find(|r| r.node == sub.node))
            .ok_or_else(|| {
                Error::NotFound(format!("pdp record for {} on {}", sub.file_id, sub.node))
            })?;
        if record.proof_count > 0 && sub.challenge_height != record.next_height {
            return Err(Error::Protocol(format!(
                "stale challenge {}: next required height is {}",
                sub.challenge_height, record.next_height
            )));
        }
        Ok(())
    }

    fn validate_settle(state: &State, signer: Address, voucher: &Voucher) -> Result<()> {
        voucher.verify()?;
        if voucher.payee != signer {
            return Err(Error::Protocol("settlement submitted by non-payee".to_string()));
        }
        let pledge = state
            .pledges
            .get(&(voucher.file_id.clone(), voucher.payer))
            .ok_or_else(|| Error::NotFound(format!("read pledge for {}", voucher.file_id)))?;
        if state.height > pledge.expire_height {
            return Err(Error::AllocationExpired {
                expire_height: pledge.expire_height,
                current: state.height,
            });
        }
        if pledge.pledge_height != voucher.pledge_height {
            return Err(Error::MalformedVoucher(format!(
                "pledge height {} does not match allocation {}",
                voucher.pledge_height, pledge.pledge_height
            )));
        }
        let plan = pledge
            .plan_for(&voucher.payee)
            .ok_or_else(|| Error::NotFound(format!("read plan for {}", voucher.payee)))?;
        if voucher.slice_id < plan.have_read_blocks || voucher.slice_id >= plan.max_read_blocks {
            return Err(Error::OrderingViolation {
                expected: plan.have_read_blocks,
                got: voucher.slice_id,
            });
        }
        Ok(())
    }

    fn apply(state: &mut State, tx: &Transaction, height: u64) -> Result<()> {
        Self::validate(state, tx)?;
        match &tx.operation {
            Operation::FileProve(sub) => {
                let interval = state
                    .files
                    .get(&sub.file_id)
                    .map_or(0, |f| f.proof_interval);
                if let Some(record) = state
                    .pdp
                    .get_mut(&sub.file_id)
                    .and_then(|records| records.iter_mut().find(|r| r.node == sub.node))
                {
                    record.proof_count += 1;
                    record.next_height = height + interval;
                    record.last_submitted = Some(Utc::now());
                }
            }
            Operation::ReadSettle(voucher) => {
                if let Some(pledge) = state
                    .pledges
                    .get_mut(&(voucher.file_id.clone(), voucher.payer))
                {
                    if let Some(plan) = pledge.plans.iter_mut().find(|p| p.node == voucher.payee) {
                        let newly_paid = voucher.slice_id + 1 - plan.have_read_blocks;
                        plan.have_read_blocks = voucher.slice_id + 1;
                        pledge.rest_balance = pledge.rest_balance.saturating_sub(newly_paid);
                    }
                }
            }
            Operation::ReadPledge(pledge) => {
                let mut pledge = pledge.clone();
                pledge.downloader = tx.signer;
                pledge.pledge_height = height;
                if pledge.expire_height == 0 {
                    pledge.expire_height = height + DEFAULT_PLEDGE_LIFETIME;
                }
                for plan in &mut pledge.plans {
                    plan.have_read_blocks = 0;
                }
                state
                    .pledges
                    .insert((pledge.file_id.clone(), pledge.downloader), pledge);
            }
            Operation::CancelRead { file_id } => {
                state.pledges.remove(&(file_id.clone(), tx.signer));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn current_height(&self) -> Result<u64> {
        let state = self.state.lock();
        Self::check_available(&state)?;
        Ok(state.height)
    }

    async fn block_hash(&self, height: u64) -> Result<BlockHash> {
        let state = self.state.lock();
        Self::check_available(&state)?;
        if height > state.height {
            return Err(Error::NotFound(format!("block at height {height}")));
        }
        Ok(self.hash_for(height))
    }

    async fn submit(&self, tx: Transaction) -> Result<TxHandle> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        if state.fail_submissions > 0 {
            state.fail_submissions -= 1;
            return Err(Error::LedgerUnavailable("submission dropped".to_string()));
        }
        if tx.contract != self.contract {
            return Err(Error::Config(format!(
                "transaction addressed to contract {} (ledger serves {})",
                tx.contract, self.contract
            )));
        }
        Self::validate(&state, &tx)?;

        state.tx_counter += 1;
        let mut hasher = Sha256::new();
        hasher.update(self.contract.as_bytes());
        hasher.update(state.tx_counter.to_le_bytes());
        hasher.update(tx.signer.as_bytes());
        let handle = TxHandle(hasher.finalize().into());

        debug!("Accepted tx {handle} ({})", tx.operation.name());
        state.submitted.push(tx.clone());
        state.pending.push((handle, tx));
        if state.auto_mine {
            self.mine_locked(&mut state);
        }
        Ok(handle)
    }

    async fn tx_height(&self, tx: &TxHandle) -> Result<u64> {
        let state = self.state.lock();
        Self::check_available(&state)?;
        Ok(state.included.get(tx).copied().unwrap_or(0))
    }

    async fn file_info(&self, file_id: &FileId) -> Result<Option<FileInfo>> {
        let state = self.state.lock();
        Self::check_available(&state)?;
        Ok(state.files.get(file_id).cloned())
    }

    async fn pdp_records(&self, file_id: &FileId) -> Result<Vec<PdpRecord>> {
        let state = self.state.lock();
        Self::check_available(&state)?;
        Ok(state.pdp.get(file_id).cloned().unwrap_or_default())
    }

    async fn read_pledge(
        &self,
        file_id: &FileId,
        downloader: &Address,
    ) -> Result<Option<ReadPledge>> {
        let state = self.state.lock();
        Self::check_available(&state)?;
        Ok(state.pledges.get(&(file_id.clone(), *downloader)).cloned())
    }

    async fn file_list(&self, passport: &Passport) -> Result<Vec<FileId>> {
        let state = self.state.lock();
        Self::check_available(&state)?;
        let holder = passport.verify(
            state.height,
            self.passport.tolerance_window,
            self.passport.clock_skew,
        )?;
        let mut files: Vec<FileId> = state
            .files
            .values()
            .filter(|f| f.owner == holder)
            .map(|f| f.file_id.clone())
            .collect();
        files.sort();
        Ok(files)
    }
}

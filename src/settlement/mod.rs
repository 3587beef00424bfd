//! Settlement voucher protocol.
//!
//! During a read session the downloader mints one [`Voucher`] per delivered
//! block. The storage node accepts them through a [`VoucherChain`], which
//! enforces that every voucher verifies, belongs to the session's
//! `(file, payer, payee, pledge height)` tuple and carries exactly the next
//! slice index. The last accepted voucher is submitted to the ledger by a
//! [`Settler`] to release payment.
//!
//! # Flow
//!
//! ```text
//! allocation.have_read = h
//!        │
//!        ▼
//! VoucherChain::resume(.., h)        expects slice h
//!        │
//!   voucher(h) ──▶ verify ──▶ tuple ──▶ ordering ──▶ accepted, expects h+1
//!        │             │         │           │
//!        │             └─────────┴───────────┴──▶ session aborted
//!        ▼
//! last accepted ──▶ Settler::settle ──▶ ledger ──▶ ConfirmationWaiter
//! ```

mod voucher;

pub use voucher::{check_ordering, Voucher, VOUCHER_CONTEXT};

use crate::error::{Error, Result};
use crate::identity::Address;
use crate::ledger::{ConfirmationWaiter, FileId, Ledger, Operation, Transaction, TxHandle};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Accepted vouchers of one read session, in strictly increasing slice order.
#[derive(Debug)]
pub struct VoucherChain {
    file_id: FileId,
    payer: Address,
    payee: Address,
    pledge_height: u64,
    first_slice: u64,
    accepted: Vec<Voucher>,
}

impl VoucherChain {
    /// Start a chain for a session.
    ///
    /// `have_read` is the allocation's already-paid counter; the first
    /// voucher of the session must carry exactly that slice index.
    #[must_use]
    pub fn resume(
        file_id: FileId,
        payer: Address,
        payee: Address,
        pledge_height: u64,
        have_read: u64,
    ) -> Self {
        Self {
            file_id,
            payer,
            payee,
            pledge_height,
            first_slice: have_read,
            accepted: Vec::new(),
        }
    }

    /// Slice index the next voucher must carry.
    #[must_use]
    pub fn next_expected(&self) -> u64 {
        self.accepted
            .last()
            .map_or(self.first_slice, |v| v.slice_id.saturating_add(1))
    }

    /// Verify and append a voucher.
    ///
    /// # Errors
    ///
    /// - [`Error::BadSignature`] / [`Error::MalformedVoucher`] if the voucher
    ///   does not verify.
    /// - [`Error::MalformedVoucher`] naming the field if it belongs to another
    ///   session.
    /// - [`Error::OrderingViolation`] if it is not the immediate successor.
    pub fn accept(&mut self, voucher: Voucher) -> Result<&Voucher> {
        voucher.verify()?;

        if voucher.file_id != self.file_id {
            return Err(Error::MalformedVoucher(format!(
                "file_id {} does not match session file {}",
                voucher.file_id, self.file_id
            )));
        }
        if voucher.payer != self.payer {
            return Err(Error::MalformedVoucher(format!(
                "payer {} does not match session downloader {}",
                voucher.payer, self.payer
            )));
        }
        if voucher.payee != self.payee {
            return Err(Error::MalformedVoucher(format!(
                "payee {} does not match this node {}",
                voucher.payee, self.payee
            )));
        }
        if voucher.pledge_height != self.pledge_height {
            return Err(Error::MalformedVoucher(format!(
                "pledge_height {} does not match allocation {}",
                voucher.pledge_height, self.pledge_height
            )));
        }

        let in_order = match self.accepted.last() {
            Some(prev) => check_ordering(prev.slice_id, &voucher),
            None => voucher.slice_id == self.first_slice,
        };
        if !in_order {
            return Err(Error::OrderingViolation {
                expected: self.next_expected(),
                got: voucher.slice_id,
            });
        }

        debug!(
            "Accepted voucher slice {} for {}",
            voucher.slice_id, self.file_id
        );
        self.accepted.push(voucher);
        Ok(&self.accepted[self.accepted.len() - 1])
    }

    /// The most recently accepted voucher.
    #[must_use]
    pub fn last(&self) -> Option<&Voucher> {
        self.accepted.last()
    }

    /// Number of accepted vouchers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.accepted.len()
    }

    /// True if no voucher has been accepted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty()
    }

    /// Drop intermediate vouchers, keeping only the final one.
    #[must_use]
    pub fn into_final(mut self) -> Option<Voucher> {
        self.accepted.pop()
    }
}

/// Outcome of submitting a final voucher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementReceipt {
    /// Handle of the settlement transaction.
    pub tx: TxHandle,
    /// Slice index settled up to.
    pub slice_id: u64,
    /// Inclusion height, or `None` if not observed within the wait budget.
    pub confirmed_height: Option<u64>,
}

/// Submits final vouchers to the ledger on behalf of a storage node.
#[derive(Clone)]
pub struct Settler {
    ledger: Arc<dyn Ledger>,
    waiter: ConfirmationWaiter,
    contract: String,
    payee: Address,
    confirm_timeout: Duration,
}

impl Settler {
    /// Create a settler for `payee` addressing `contract`.
    #[must_use]
    pub fn new(
        ledger: Arc<dyn Ledger>,
        waiter: ConfirmationWaiter,
        contract: String,
        payee: Address,
        confirm_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            waiter,
            contract,
            payee,
            confirm_timeout,
        }
    }

    /// Submit `voucher` and wait for confirmation.
    ///
    /// A confirmation timeout is not a failure: the receipt is returned with
    /// `confirmed_height: None` and the handle can be checked later.
    ///
    /// # Errors
    ///
    /// Returns an error if the voucher is not payable to this node or the
    /// ledger refuses the submission.
    pub async fn settle(&self, voucher: &Voucher) -> Result<SettlementReceipt> {
        if voucher.payee != self.payee {
            return Err(Error::MalformedVoucher(format!(
                "payee {} is not this node {}",
                voucher.payee, self.payee
            )));
        }
        let slice_id = voucher.slice_id;
        let file_id = voucher.file_id.clone();

        let tx = self
            .ledger
            .submit(Transaction {
                contract: self.contract.clone(),
                signer: self.payee,
                operation: Operation::ReadSettle(voucher.clone()),
            })
            .await?;
        info!("Submitted settlement for {file_id} up to slice {slice_id}: tx {tx}");

        let confirmed_height = match self.waiter.wait(&tx, self.confirm_timeout).await {
            Ok(height) => Some(height),
            Err(Error::Timeout(_)) => {
                warn!("Settlement tx {tx} not observed yet; leaving it for a later check");
                None
            }
            Err(e) => return Err(e),
        };

        Ok(SettlementReceipt {
            tx,
            slice_id,
            confirmed_height,
        })
    }

    /// Settle `voucher`, resubmitting up to `attempts` times while the
    /// ledger is unavailable, sleeping `delay` between attempts.
    ///
    /// # Errors
    ///
    /// Returns the last error once attempts are used up, or the first error
    /// that is not [`Error::LedgerUnavailable`].
    pub async fn settle_with_retry(
        &self,
        voucher: &Voucher,
        attempts: u32,
        delay: Duration,
    ) -> Result<SettlementReceipt> {
        let mut attempt = 1;
        loop {
            match self.settle(voucher).await {
                Err(Error::LedgerUnavailable(reason)) if attempt < attempts => {
                    warn!(
                        "Settlement of slice {} failed (attempt {attempt}/{attempts}): {reason}",
                        voucher.slice_id
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}

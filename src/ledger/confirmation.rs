//! Bounded polling for transaction inclusion.

use crate::error::{Error, Result};
use crate::ledger::{Ledger, TxHandle};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Polls the ledger until a transaction is included or the budget runs out.
///
/// A timeout means the transaction was not observed, not that it failed; the
/// handle stays valid and the caller may check again later.
#[derive(Clone)]
pub struct ConfirmationWaiter {
    ledger: Arc<dyn Ledger>,
    poll_interval: Duration,
}

impl ConfirmationWaiter {
    /// Create a waiter polling once per `poll_interval` (typically one block period).
    #[must_use]
    pub fn new(ledger: Arc<dyn Ledger>, poll_interval: Duration) -> Self {
        Self {
            ledger,
            poll_interval,
        }
    }

    /// The configured poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Wait up to `timeout` for `tx` to be included, returning its height.
    ///
    /// At least one poll is always made. Poll failures count as
    /// non-observation; if every poll failed the last ledger error is returned
    /// instead of [`Error::Timeout`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the transaction was not observed in time,
    /// or the ledger error if the ledger could not be reached at all.
    pub async fn wait(&self, tx: &TxHandle, timeout: Duration) -> Result<u64> {
        let polls = self.poll_count(timeout);
        let mut last_error = None;
        let mut reached = false;

        for attempt in 1..=polls {
            tokio::time::sleep(self.poll_interval).await;
            match self.ledger.tx_height(tx).await {
                Ok(0) => {
                    reached = true;
                    debug!("tx {tx} not yet included (poll {attempt}/{polls})");
                }
                Ok(height) => {
                    debug!("tx {tx} confirmed at height {height}");
                    return Ok(height);
                }
                Err(e) => {
                    warn!("Confirmation poll for {tx} failed: {e}");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if !reached => Err(e),
            _ => Err(Error::Timeout(tx.to_string())),
        }
    }

    fn poll_count(&self, timeout: Duration) -> u32 {
        if self.poll_interval.is_zero() {
            return 1;
        }
        let n = timeout.as_nanos() / self.poll_interval.as_nanos();
        u32::try_from(n).unwrap_or(u32::MAX).max(1)
    }
}

//! Per-file proof loop.

use crate::error::{Error, Result};
use crate::event::{NodeEvent, NodeEventsSender};
use crate::identity::Address;
use crate::ledger::{
    ConfirmationWaiter, FileId, FileInfo, Ledger, Operation, PdpRecord, ProofSubmission,
    Transaction, TxHandle,
};
use crate::proof::prover::Prover;
use crate::proof::shadow::PossessionShadow;
use crate::proof::ticker::Ticker;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Consecutive missed intervals at which failures are logged as errors.
pub const MISSED_INTERVAL_ALERT: u32 = 2;

/// Why a proof loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The file no longer exists on the ledger.
    FileRemoved,
    /// The ledger is past the file's expiry height.
    FileExpired,
    /// This node is no longer listed as holding the file.
    NotResponsible,
    /// A stop was requested.
    Requested,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::FileRemoved => "file removed",
            Self::FileExpired => "file expired",
            Self::NotResponsible => "node no longer responsible",
            Self::Requested => "stop requested",
        };
        f.write_str(reason)
    }
}

/// Snapshot of one file's proof loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProofStatus {
    /// Proofs confirmed on the ledger by this loop.
    pub proofs_submitted: u64,
    /// Challenge height of the last confirmed proof.
    pub last_challenge: Option<u64>,
    /// Next required height as last read from the ledger.
    pub next_due_height: Option<u64>,
    /// Proofs the ledger expects over the file's lifetime.
    pub required_proofs: u64,
    /// Intervals missed in a row.
    pub consecutive_failures: u32,
    /// Most recent failure.
    pub last_error: Option<String>,
    /// Set once the loop has ended.
    pub stopped: Option<StopReason>,
}

/// Collaborators shared by every proof task of a node.
pub(crate) struct ProofContext {
    pub(crate) node: Address,
    pub(crate) contract: String,
    pub(crate) ledger: Arc<dyn Ledger>,
    pub(crate) prover: Arc<dyn Prover>,
    pub(crate) waiter: ConfirmationWaiter,
    pub(crate) confirm_timeout: Duration,
    pub(crate) shadow: PossessionShadow,
    pub(crate) events: NodeEventsSender,
}

struct Pending {
    challenge: u64,
    tx: TxHandle,
}

enum Attempt {
    Confirmed,
    Unobserved(TxHandle),
}

/// The recurring proof loop for one file.
pub(crate) struct ProofTask {
    file_id: FileId,
    ctx: Arc<ProofContext>,
    status: Arc<RwLock<ProofStatus>>,
    pending: Option<Pending>,
}

impl ProofTask {
    pub(crate) fn new(
        file_id: FileId,
        ctx: Arc<ProofContext>,
        status: Arc<RwLock<ProofStatus>>,
    ) -> Self {
        Self {
            file_id,
            ctx,
            status,
            pending: None,
        }
    }

    /// Run until the file ends, the node loses responsibility, or `stop` is set.
    pub(crate) async fn run(
        mut self,
        mut ticker: Box<dyn Ticker>,
        initial_challenge: Option<u64>,
        mut stop: watch::Receiver<bool>,
    ) {
        let reason = match self.initial(initial_challenge).await {
            Some(reason) => reason,
            None => loop {
                if *stop.borrow() {
                    break StopReason::Requested;
                }
                tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break StopReason::Requested;
                        }
                        continue;
                    }
                    () = ticker.tick() => {}
                }
                if let Some(reason) = self.on_tick().await {
                    break reason;
                }
            },
        };

        info!("Proof loop for {} stopped: {reason}", self.file_id);
        self.status.write().stopped = Some(reason);
        if reason != StopReason::Requested {
            self.ctx.shadow.remove(&self.file_id);
        }
        let _ = self.ctx.events.send(NodeEvent::ProofLoopStopped {
            file_id: self.file_id.clone(),
            reason: reason.to_string(),
        });
    }

    /// Submit the first proof of a newly acquired file.
    ///
    /// Skipped when the ledger already holds proofs from this node; the
    /// regular ticks then continue from the recorded next height.
    async fn initial(&mut self, challenge: Option<u64>) -> Option<StopReason> {
        let (file, record) = match self.observe().await {
            Ok(Ok(found)) => found,
            Ok(Err(reason)) => return Some(reason),
            Err(e) => {
                self.record_failure(&e);
                return None;
            }
        };
        if record.proof_count > 0 {
            debug!(
                "{} already proved {} times, waiting for next tick",
                self.file_id, record.proof_count
            );
            return None;
        }

        let challenge = match challenge {
            Some(height) => height,
            None => match self.ctx.ledger.current_height().await {
                Ok(height) => height,
                Err(e) => {
                    self.record_failure(&e);
                    return None;
                }
            },
        };
        self.prove_at(&file, challenge).await;
        None
    }

    async fn on_tick(&mut self) -> Option<StopReason> {
        let (file, record) = match self.observe().await {
            Ok(Ok(found)) => found,
            Ok(Err(reason)) => return Some(reason),
            Err(e) => {
                self.record_failure(&e);
                return None;
            }
        };
        let challenge = record.next_height;

        if let Some(pending) = self.pending.take() {
            if pending.challenge == challenge {
                match self.ctx.ledger.tx_height(&pending.tx).await {
                    Ok(0) => {
                        self.record_failure(&Error::Timeout(pending.tx.to_string()));
                        self.pending = Some(pending);
                        return None;
                    }
                    Ok(height) => {
                        warn!(
                            "Proof tx {} for {} included at {height} without advancing the challenge",
                            pending.tx, self.file_id
                        );
                    }
                    Err(e) => {
                        self.record_failure(&e);
                        self.pending = Some(pending);
                        return None;
                    }
                }
            } else {
                self.record_success(pending.challenge);
            }
        }

        if self.status.read().last_challenge == Some(challenge) {
            debug!("{} already proved for height {challenge}", self.file_id);
            return None;
        }

        self.prove_at(&file, challenge).await;
        None
    }

    /// Read the file and this node's record, refreshing the shadow.
    async fn observe(&self) -> Result<std::result::Result<(FileInfo, PdpRecord), StopReason>> {
        let Some(file) = self.ctx.ledger.file_info(&self.file_id).await? else {
            return Ok(Err(StopReason::FileRemoved));
        };
        let height = self.ctx.ledger.current_height().await?;
        if file.is_expired_at(height) {
            return Ok(Err(StopReason::FileExpired));
        }
        let Some(record) = self
            .ctx
            .ledger
            .pdp_records(&self.file_id)
            .await?
            .into_iter()
            .find(|r| r.node == self.ctx.node)
        else {
            return Ok(Err(StopReason::NotResponsible));
        };

        self.ctx.shadow.refresh(record.clone());
        {
            let mut status = self.status.write();
            status.next_due_height = Some(record.next_height);
            status.required_proofs = file.required_proof_count();
        }
        Ok(Ok((file, record)))
    }

    async fn prove_at(&mut self, file: &FileInfo, challenge: u64) {
        match self.attempt(file, challenge).await {
            Ok(Attempt::Confirmed) => self.record_success(challenge),
            Ok(Attempt::Unobserved(tx)) => {
                warn!(
                    "Proof for {} at {challenge} not observed yet (tx {tx}); checking next tick",
                    self.file_id
                );
                self.pending = Some(Pending { challenge, tx });
            }
            Err(e) => self.record_failure(&e),
        }
    }

    async fn attempt(&self, file: &FileInfo, challenge: u64) -> Result<Attempt> {
        let proof = self.ctx.prover.prove(file, challenge).await?;
        let tx = self
            .ctx
            .ledger
            .submit(Transaction {
                contract: self.ctx.contract.clone(),
                signer: self.ctx.node,
                operation: Operation::FileProve(ProofSubmission {
                    file_id: self.file_id.clone(),
                    node: self.ctx.node,
                    proof,
                    challenge_height: challenge,
                }),
            })
            .await?;
        debug!("Submitted proof for {} at {challenge}: tx {tx}", self.file_id);

        match self.ctx.waiter.wait(&tx, self.ctx.confirm_timeout).await {
            Ok(_) => Ok(Attempt::Confirmed),
            Err(Error::Timeout(_)) => Ok(Attempt::Unobserved(tx)),
            Err(e) => Err(e),
        }
    }

    fn record_success(&self, challenge: u64) {
        {
            let mut status = self.status.write();
            status.proofs_submitted += 1;
            status.last_challenge = Some(challenge);
            status.consecutive_failures = 0;
            status.last_error = None;
        }
        info!("Proof for {} at height {challenge} confirmed", self.file_id);
        let _ = self.ctx.events.send(NodeEvent::ProofSubmitted {
            file_id: self.file_id.clone(),
            challenge_height: challenge,
        });
    }

    fn record_failure(&self, err: &Error) {
        let consecutive = {
            let mut status = self.status.write();
            status.consecutive_failures += 1;
            status.last_error = Some(err.to_string());
            status.consecutive_failures
        };
        if consecutive >= MISSED_INTERVAL_ALERT {
            error!(
                "Proof for {} missed {consecutive} consecutive intervals: {err}",
                self.file_id
            );
        } else {
            warn!("Proof for {} failed, retrying next tick: {err}", self.file_id);
        }
        let _ = self.ctx.events.send(NodeEvent::ProofFailed {
            file_id: self.file_id.clone(),
            consecutive,
            message: err.to_string(),
        });
    }
}

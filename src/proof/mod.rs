//! Possession-proof scheduling.
//!
//! A storage node runs one proof loop per file it holds. Each loop submits an
//! initial proof when the file is acquired, then on every tick re-reads the
//! file and this node's possession record from the ledger and proves the
//! recorded next height. The required height always comes from the ledger, so
//! a node that misses a cycle proves the correct height on the next one.
//!
//! ```text
//! schedule(file) ──▶ initial proof
//!                        │
//!        ┌───────────────┘
//!        ▼
//!      tick ──▶ file gone / expired? ──▶ stop
//!        │      record for this node? ──▶ stop if absent
//!        │      already proved next height? ──▶ wait
//!        ▼
//!      prove(next height) ──▶ submit ──▶ wait for inclusion
//!        │                                  │
//!        └── failure: log, retry next tick ◀┘
//! ```

mod prover;
mod shadow;
mod task;
mod ticker;

pub use prover::{DigestProver, Prover};
pub use shadow::{PossessionShadow, ShadowStats};
pub use task::{ProofStatus, StopReason, MISSED_INTERVAL_ALERT};
pub use ticker::{manual_ticker, IntervalTicker, ManualTickHandle, ManualTicker, Ticker};

use crate::config::LedgerConfig;
use crate::error::{Error, Result};
use crate::event::NodeEventsSender;
use crate::identity::Address;
use crate::ledger::{ConfirmationWaiter, FileId, Ledger};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use task::{ProofContext, ProofTask};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct TaskHandle {
    stop: watch::Sender<bool>,
    status: Arc<RwLock<ProofStatus>>,
    join: JoinHandle<()>,
}

/// Registry of per-file proof loops for one storage node.
pub struct ProofScheduler {
    ctx: Arc<ProofContext>,
    ledger_config: LedgerConfig,
    tasks: Mutex<HashMap<FileId, TaskHandle>>,
}

impl ProofScheduler {
    /// Create a scheduler proving as `node`.
    #[must_use]
    pub fn new(
        node: Address,
        ledger: Arc<dyn Ledger>,
        prover: Arc<dyn Prover>,
        shadow: PossessionShadow,
        ledger_config: LedgerConfig,
        events: NodeEventsSender,
    ) -> Self {
        let waiter = ConfirmationWaiter::new(ledger.clone(), ledger_config.poll_interval());
        let ctx = ProofContext {
            node,
            contract: ledger_config.contract.clone(),
            ledger,
            prover,
            waiter,
            confirm_timeout: ledger_config.confirm_timeout(),
            shadow,
            events,
        };
        Self {
            ctx: Arc::new(ctx),
            ledger_config,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start proving `file_id`, ticking once per proof interval.
    ///
    /// `initial_challenge` is the height of the first proof; the current
    /// height is used when `None`. Returns false if a loop for the file is
    /// already running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the ledger does not know the file.
    pub async fn schedule(&self, file_id: FileId, initial_challenge: Option<u64>) -> Result<bool> {
        if self.is_running(&file_id) {
            debug!("Proof loop for {file_id} already running");
            return Ok(false);
        }
        let file = self
            .ctx
            .ledger
            .file_info(&file_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("file {file_id}")))?;
        let period = self
            .ledger_config
            .blocks_to_duration(file.proof_interval.max(1));
        debug!(
            "Proving {file_id} every {} blocks ({period:?})",
            file.proof_interval
        );
        Ok(self.schedule_with_ticker(file_id, initial_challenge, Box::new(IntervalTicker::new(period))))
    }

    /// Start proving `file_id` driven by a caller-supplied ticker.
    ///
    /// Returns false if a loop for the file is already running.
    pub fn schedule_with_ticker(
        &self,
        file_id: FileId,
        initial_challenge: Option<u64>,
        ticker: Box<dyn Ticker>,
    ) -> bool {
        let mut tasks = self.tasks.lock();
        if tasks.get(&file_id).is_some_and(|t| !t.join.is_finished()) {
            return false;
        }

        let (stop, stop_rx) = watch::channel(false);
        let status = Arc::new(RwLock::new(ProofStatus::default()));
        let task = ProofTask::new(file_id.clone(), Arc::clone(&self.ctx), Arc::clone(&status));
        let join = tokio::spawn(task.run(ticker, initial_challenge, stop_rx));

        info!("Scheduled proof loop for {file_id}");
        tasks.insert(file_id, TaskHandle { stop, status, join });
        true
    }

    /// Ask the loop for `file_id` to stop at its next tick boundary.
    ///
    /// Returns false if no loop is registered for the file.
    pub fn stop(&self, file_id: &FileId) -> bool {
        self.tasks
            .lock()
            .get(file_id)
            .is_some_and(|t| t.stop.send(true).is_ok())
    }

    /// Status of the loop for `file_id`, including loops that have ended.
    #[must_use]
    pub fn status(&self, file_id: &FileId) -> Option<ProofStatus> {
        self.tasks
            .lock()
            .get(file_id)
            .map(|t| t.status.read().clone())
    }

    /// Whether a loop for `file_id` is still running.
    #[must_use]
    pub fn is_running(&self, file_id: &FileId) -> bool {
        self.tasks
            .lock()
            .get(file_id)
            .is_some_and(|t| !t.join.is_finished())
    }

    /// Files with a running loop, sorted.
    #[must_use]
    pub fn active_files(&self) -> Vec<FileId> {
        let mut files: Vec<FileId> = self
            .tasks
            .lock()
            .iter()
            .filter(|(_, t)| !t.join.is_finished())
            .map(|(f, _)| f.clone())
            .collect();
        files.sort();
        files
    }

    /// The possession shadow the loops keep fresh.
    #[must_use]
    pub fn shadow(&self) -> &PossessionShadow {
        &self.ctx.shadow
    }

    /// Stop every loop and wait for them to finish.
    pub async fn shutdown_all(&self) {
        let handles: Vec<(FileId, TaskHandle)> = self.tasks.lock().drain().collect();
        for (_, handle) in &handles {
            let _ = handle.stop.send(true);
        }
        for (file_id, handle) in handles {
            if let Err(e) = handle.join.await {
                debug!("Proof loop for {file_id} ended abnormally: {e}");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::blocks::MemoryBlockStore;
    use crate::event::{create_event_channel, NodeEvent, NodeEventsChannel};
    use crate::ledger::{FileInfo, MemoryLedger, Operation};
    use std::time::Duration;

    const NODE: Address = Address([6u8; 20]);

    struct Fixture {
        ledger: Arc<MemoryLedger>,
        scheduler: ProofScheduler,
        events: NodeEventsChannel,
        fid: FileId,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(MemoryLedger::new("fs"));
        let fid = FileId::new("held");
        ledger.add_file(FileInfo {
            file_id: fid.clone(),
            owner: Address([1u8; 20]),
            block_count: 2,
            proof_interval: 10,
            start_height: 0,
            expire_height: 1_000,
            pdp_param: Vec::new(),
        });
        ledger.assign_node(&fid, NODE).unwrap();

        let store = Arc::new(MemoryBlockStore::new());
        store.insert(fid.clone(), b"abcdefgh", 4);

        let (events_tx, events) = create_event_channel();
        let config = LedgerConfig {
            contract: "fs".to_string(),
            confirm_timeout_secs: 2,
            poll_interval_ms: 100,
            block_period_ms: 1000,
        };
        let scheduler = ProofScheduler::new(
            NODE,
            ledger.clone(),
            Arc::new(DigestProver::new(store)),
            PossessionShadow::new(),
            config,
            events_tx,
        );
        Fixture {
            ledger,
            scheduler,
            events,
            fid,
        }
    }

    async fn wait_for<F>(events: &mut NodeEventsChannel, pred: F) -> NodeEvent
    where
        F: Fn(&NodeEvent) -> bool,
    {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    }

    fn proved_challenges(ledger: &MemoryLedger) -> Vec<u64> {
        ledger
            .submitted()
            .into_iter()
            .filter_map(|tx| match tx.operation {
                Operation::FileProve(sub) => Some(sub.challenge_height),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_waits_for_interval_then_proves_next_height() {
        let mut fx = fixture();
        assert!(fx.scheduler.schedule(fx.fid.clone(), Some(0)).await.unwrap());

        let initial = wait_for(&mut fx.events, |e| matches!(e, NodeEvent::ProofSubmitted { .. })).await;
        assert_eq!(
            initial,
            NodeEvent::ProofSubmitted {
                file_id: fx.fid.clone(),
                challenge_height: 0
            }
        );
        // Included at height 1, so the ledger now requires height 11.
        let next = fx.ledger.pdp_record(&fx.fid, &NODE).unwrap().next_height;
        assert_eq!(next, 11);

        // Less than one interval later nothing more was submitted.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(proved_challenges(&fx.ledger), vec![0]);

        let second = wait_for(&mut fx.events, |e| matches!(e, NodeEvent::ProofSubmitted { .. })).await;
        assert_eq!(
            second,
            NodeEvent::ProofSubmitted {
                file_id: fx.fid.clone(),
                challenge_height: 11
            }
        );
        assert_eq!(proved_challenges(&fx.ledger), vec![0, 11]);

        let status = fx.scheduler.status(&fx.fid).unwrap();
        assert_eq!(status.proofs_submitted, 2);
        assert_eq!(status.last_challenge, Some(11));
        assert_eq!(status.required_proofs, 101);
        fx.scheduler.shutdown_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_submission_retried_on_next_tick_only() {
        let mut fx = fixture();
        fx.ledger.fail_next_submissions(2);
        let (ticker, ticks) = manual_ticker();
        fx.scheduler
            .schedule_with_ticker(fx.fid.clone(), Some(0), Box::new(ticker));

        let first = wait_for(&mut fx.events, |e| matches!(e, NodeEvent::ProofFailed { .. })).await;
        assert!(matches!(first, NodeEvent::ProofFailed { consecutive: 1, .. }));
        assert!(proved_challenges(&fx.ledger).is_empty());

        ticks.tick();
        let second = wait_for(&mut fx.events, |e| matches!(e, NodeEvent::ProofFailed { .. })).await;
        assert!(matches!(second, NodeEvent::ProofFailed { consecutive: 2, .. }));

        ticks.tick();
        wait_for(&mut fx.events, |e| matches!(e, NodeEvent::ProofSubmitted { challenge_height: 0, .. })).await;
        let status = fx.scheduler.status(&fx.fid).unwrap();
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.proofs_submitted, 1);
        fx.scheduler.shutdown_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unobserved_proof_is_not_resubmitted() {
        let mut fx = fixture();
        fx.ledger.set_auto_mine(false);
        let (ticker, ticks) = manual_ticker();
        fx.scheduler
            .schedule_with_ticker(fx.fid.clone(), Some(0), Box::new(ticker));

        // Initial proof submitted but never observed within the budget.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(proved_challenges(&fx.ledger), vec![0]);

        ticks.tick();
        wait_for(&mut fx.events, |e| matches!(e, NodeEvent::ProofFailed { .. })).await;
        assert_eq!(proved_challenges(&fx.ledger), vec![0]);

        // Once included, the next tick credits it and proves the new height.
        let height = fx.ledger.mine_block();
        ticks.tick();
        wait_for(&mut fx.events, |e| matches!(e, NodeEvent::ProofSubmitted { challenge_height: 0, .. })).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(proved_challenges(&fx.ledger), vec![0, height + 10]);
        fx.scheduler.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_loop_stops_when_file_removed() {
        let mut fx = fixture();
        let (ticker, ticks) = manual_ticker();
        fx.scheduler
            .schedule_with_ticker(fx.fid.clone(), Some(0), Box::new(ticker));
        wait_for(&mut fx.events, |e| matches!(e, NodeEvent::ProofSubmitted { .. })).await;
        assert!(fx.scheduler.shadow().get(&fx.fid).is_some());

        fx.ledger.remove_file(&fx.fid);
        ticks.tick();
        let stopped = wait_for(&mut fx.events, |e| matches!(e, NodeEvent::ProofLoopStopped { .. })).await;
        assert_eq!(
            stopped,
            NodeEvent::ProofLoopStopped {
                file_id: fx.fid.clone(),
                reason: StopReason::FileRemoved.to_string(),
            }
        );
        assert_eq!(
            fx.scheduler.status(&fx.fid).unwrap().stopped,
            Some(StopReason::FileRemoved)
        );
        assert!(fx.scheduler.shadow().get(&fx.fid).is_none());
    }

    #[tokio::test]
    async fn test_loop_stops_when_node_unassigned() {
        let mut fx = fixture();
        let (ticker, ticks) = manual_ticker();
        fx.scheduler
            .schedule_with_ticker(fx.fid.clone(), Some(0), Box::new(ticker));
        wait_for(&mut fx.events, |e| matches!(e, NodeEvent::ProofSubmitted { .. })).await;

        fx.ledger.unassign_node(&fx.fid, &NODE);
        ticks.tick();
        wait_for(&mut fx.events, |e| matches!(e, NodeEvent::ProofLoopStopped { .. })).await;
        assert_eq!(
            fx.scheduler.status(&fx.fid).unwrap().stopped,
            Some(StopReason::NotResponsible)
        );
        tokio::time::timeout(Duration::from_secs(5), async {
            while !fx.scheduler.active_files().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_stop_request_and_duplicate_schedule() {
        let mut fx = fixture();
        let (ticker, _ticks) = manual_ticker();
        assert!(fx
            .scheduler
            .schedule_with_ticker(fx.fid.clone(), Some(0), Box::new(ticker)));
        let (again, _) = manual_ticker();
        assert!(!fx
            .scheduler
            .schedule_with_ticker(fx.fid.clone(), Some(0), Box::new(again)));

        assert!(fx.scheduler.stop(&fx.fid));
        wait_for(&mut fx.events, |e| matches!(e, NodeEvent::ProofLoopStopped { .. })).await;
        assert_eq!(
            fx.scheduler.status(&fx.fid).unwrap().stopped,
            Some(StopReason::Requested)
        );
        assert!(!fx.scheduler.stop(&FileId::new("unknown")));
    }

    #[tokio::test]
    async fn test_schedule_unknown_file() {
        let fx = fixture();
        let err = fx
            .scheduler
            .schedule(FileId::new("missing"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}

//! Storage-node side of a read session.

use crate::blocks::BlockSource;
use crate::error::{Error, Result};
use crate::identity::Address;
use crate::ledger::{FileId, Ledger, PdpRecord, ReadPlan, ReadPledge};
use crate::proof::PossessionShadow;
use crate::session::message::Frame;
use crate::session::state::SessionState;
use crate::session::transport::FramedStream;
use crate::settlement::{SettlementReceipt, Settler, VoucherChain};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Result of a completed read session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    /// File that was read.
    pub file_id: FileId,
    /// Downloader that paid for it.
    pub downloader: Address,
    /// Number of blocks served and paid for.
    pub blocks_served: u64,
    /// Settlement of the final voucher.
    pub settlement: SettlementReceipt,
    /// Terminal state, always [`SessionState::Closed`].
    pub state: SessionState,
}

/// Tracks where a session is so an abort can report the failing step.
struct Progress {
    state: SessionState,
    slice: Option<u64>,
}

impl Progress {
    fn advance(&mut self, next: SessionState) {
        debug_assert!(self.state.can_advance_to(next));
        self.state = next;
    }
}

/// Serves read sessions for one storage node.
///
/// Sessions share nothing mutable except the possession shadow and the
/// ledger, so one provider can serve many connections concurrently.
#[derive(Clone)]
pub struct ReadSessionProvider {
    node: Address,
    ledger: Arc<dyn Ledger>,
    shadow: PossessionShadow,
    blocks: Arc<dyn BlockSource>,
    settler: Settler,
}

impl ReadSessionProvider {
    /// Create a provider for `node`.
    #[must_use]
    pub fn new(
        node: Address,
        ledger: Arc<dyn Ledger>,
        shadow: PossessionShadow,
        blocks: Arc<dyn BlockSource>,
        settler: Settler,
    ) -> Self {
        Self {
            node,
            ledger,
            shadow,
            blocks,
            settler,
        }
    }

    /// Run a session after the `ReadFile` command has been acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionAborted`] naming the state and slice at which
    /// the session failed. The peer is sent an `Abort` frame first when the
    /// transport still allows it. A failure in Settling wraps
    /// [`Error::SettlementPending`], which keeps the final voucher for a
    /// later [`Settler::settle`].
    pub async fn serve<S>(
        &self,
        transport: &mut FramedStream<S>,
        file_id: FileId,
        downloader: Address,
    ) -> Result<SessionOutcome>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        let mut progress = Progress {
            state: SessionState::Handshake,
            slice: None,
        };

        match self
            .run(transport, &file_id, downloader, &mut progress)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(cause) => {
                warn!(
                    "Read session for {file_id} with {downloader} aborted in {} (slice {:?}): {cause}",
                    progress.state, progress.slice
                );
                // Close was already sent once Settling is reached.
                if progress.state != SessionState::Settling
                    && !matches!(cause, Error::Transport(_))
                {
                    if let Err(e) = transport.send(&Frame::Abort(cause.to_string())).await {
                        debug!("Could not notify {downloader} of abort: {e}");
                    }
                }
                Err(Error::SessionAborted {
                    state: progress.state.to_string(),
                    slice: progress.slice,
                    source: Box::new(cause),
                })
            }
        }
    }

    async fn run<S>(
        &self,
        transport: &mut FramedStream<S>,
        file_id: &FileId,
        downloader: Address,
        progress: &mut Progress,
    ) -> Result<SessionOutcome>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        let (pledge, plan, held) = self.handshake(file_id, downloader).await?;

        progress.advance(SessionState::Negotiating);
        if plan.remaining_blocks() == 0 {
            return Err(Error::PlanExhausted {
                file_id: file_id.to_string(),
                max_read: plan.max_read_blocks,
                have_read: plan.have_read_blocks,
            });
        }
        let end = plan.max_read_blocks.min(held);
        let remaining = end.saturating_sub(plan.have_read_blocks);
        if remaining == 0 {
            return Err(Error::NotFound(format!(
                "{file_id} has {held} blocks, plan resumes at {}",
                plan.have_read_blocks
            )));
        }
        debug!(
            "Serving {remaining} blocks of {file_id} to {downloader} from slice {}",
            plan.have_read_blocks
        );

        progress.advance(SessionState::Streaming);
        let mut chain = VoucherChain::resume(
            file_id.clone(),
            downloader,
            self.node,
            pledge.pledge_height,
            plan.have_read_blocks,
        );
        for slice in plan.have_read_blocks..end {
            progress.slice = Some(slice);
            let data = self.blocks.read_block(file_id, slice).await?;
            transport.send(&Frame::Block { slice, data }).await?;

            match transport.recv().await? {
                Frame::Voucher(voucher) => {
                    chain.accept(*voucher)?;
                }
                Frame::Abort(reason) => {
                    return Err(Error::Protocol(format!("downloader aborted: {reason}")));
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "expected voucher, got {}",
                        other.kind()
                    )));
                }
            }
            transport.send(&Frame::VoucherAck).await?;
        }
        transport
            .send(&Frame::Close {
                slices: chain.len() as u64,
            })
            .await?;

        progress.advance(SessionState::Settling);
        let blocks_served = chain.len() as u64;
        let last = chain
            .into_final()
            .ok_or_else(|| Error::Protocol("no voucher accepted".to_string()))?;
        progress.slice = Some(last.slice_id);
        let settlement = match self.settler.settle(&last).await {
            Ok(settlement) => settlement,
            Err(source) => {
                return Err(Error::SettlementPending {
                    voucher: Box::new(last),
                    blocks: blocks_served,
                    source: Box::new(source),
                });
            }
        };

        progress.advance(SessionState::Closed);
        info!(
            "Read session for {file_id} with {downloader} closed: {blocks_served} blocks, settled tx {}",
            settlement.tx
        );
        if let Err(e) = transport.close().await {
            debug!("Closing session transport: {e}");
        }

        Ok(SessionOutcome {
            file_id: file_id.clone(),
            downloader,
            blocks_served,
            settlement,
            state: SessionState::Closed,
        })
    }

    /// Settler used for this node's final vouchers.
    #[must_use]
    pub fn settler(&self) -> &Settler {
        &self.settler
    }

    async fn handshake(
        &self,
        file_id: &FileId,
        downloader: Address,
    ) -> Result<(ReadPledge, ReadPlan, u64)> {
        self.possession(file_id).await?;
        let held = self
            .blocks
            .block_count(file_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("blocks of {file_id} are not held locally")))?;

        let pledge = self
            .ledger
            .read_pledge(file_id, &downloader)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("read pledge for {file_id} from {downloader}"))
            })?;

        let current = self.ledger.current_height().await?;
        if current > pledge.expire_height {
            return Err(Error::AllocationExpired {
                expire_height: pledge.expire_height,
                current,
            });
        }

        let plan = pledge
            .plan_for(&self.node)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("read plan naming {}", self.node)))?;
        Ok((pledge, plan, held))
    }

    async fn possession(&self, file_id: &FileId) -> Result<PdpRecord> {
        if let Some(record) = self.shadow.get(file_id) {
            return Ok(record);
        }
        let record = self
            .ledger
            .pdp_records(file_id)
            .await?
            .into_iter()
            .find(|r| r.node == self.node)
            .ok_or_else(|| Error::NotFound(format!("{file_id} is not held by {}", self.node)))?;
        self.shadow.refresh(record.clone());
        Ok(record)
    }
}

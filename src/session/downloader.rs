//! Downloader side of a read session, plus its passport-authorized queries.

use crate::config::{LedgerConfig, SessionConfig};
use crate::error::{Error, Result};
use crate::identity::{Address, KeyPair};
use crate::ledger::{
    ConfirmationWaiter, FileId, Ledger, Operation, ReadPlan, ReadPledge, Transaction,
};
use crate::passport::Passport;
use crate::session::message::{Command, Frame};
use crate::session::state::SessionState;
use crate::session::transport::FramedStream;
use crate::settlement::Voucher;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Blocks received in one read session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    /// File that was read.
    pub file_id: FileId,
    /// Storage node that served it.
    pub payee: Address,
    /// Slice index of the first block received.
    pub first_slice: u64,
    /// Blocks in slice order.
    pub blocks: Vec<Bytes>,
}

impl ReadResult {
    /// Concatenated block contents.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.blocks.iter().flat_map(|b| b.iter().copied()).collect()
    }
}

/// Reads files from storage nodes, paying one voucher per block.
pub struct Downloader {
    key: Arc<KeyPair>,
    ledger: Arc<dyn Ledger>,
    waiter: ConfirmationWaiter,
    ledger_config: LedgerConfig,
    session_config: SessionConfig,
}

impl Downloader {
    /// Create a downloader paying with `key`.
    #[must_use]
    pub fn new(
        key: Arc<KeyPair>,
        ledger: Arc<dyn Ledger>,
        ledger_config: LedgerConfig,
        session_config: SessionConfig,
    ) -> Self {
        let waiter = ConfirmationWaiter::new(ledger.clone(), ledger_config.poll_interval());
        Self {
            key,
            ledger,
            waiter,
            ledger_config,
            session_config,
        }
    }

    /// This downloader's address.
    #[must_use]
    pub fn address(&self) -> Address {
        self.key.address()
    }

    /// List the files this downloader owns, authorized by a fresh passport.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger is unavailable or rejects the passport.
    pub async fn list_files(&self) -> Result<Vec<FileId>> {
        let passport = Passport::issue_current(self.ledger.as_ref(), &self.key).await?;
        debug!("Issued passport at height {} for file listing", passport.height);
        self.ledger.file_list(&passport).await
    }

    /// Create a read allocation for `file_id` and wait until it is recorded.
    ///
    /// The ledger stamps the pledge height and, when `expire_height` is 0, a
    /// default expiry.
    ///
    /// # Errors
    ///
    /// Returns an error if the submission is refused, is not confirmed in
    /// time, or the recorded allocation cannot be read back.
    pub async fn pledge_read(
        &self,
        file_id: &FileId,
        plans: Vec<ReadPlan>,
        expire_height: u64,
    ) -> Result<ReadPledge> {
        let rest_balance = plans.iter().map(|p| p.max_read_blocks).sum();
        let tx = self
            .ledger
            .submit(Transaction {
                contract: self.ledger_config.contract.clone(),
                signer: self.address(),
                operation: Operation::ReadPledge(ReadPledge {
                    file_id: file_id.clone(),
                    downloader: self.address(),
                    pledge_height: 0,
                    expire_height,
                    rest_balance,
                    plans,
                }),
            })
            .await?;
        let height = self
            .waiter
            .wait(&tx, self.ledger_config.confirm_timeout())
            .await?;
        info!("Read pledge for {file_id} recorded at height {height}");

        self.ledger
            .read_pledge(file_id, &self.address())
            .await?
            .ok_or_else(|| Error::NotFound(format!("read pledge for {file_id} after tx {tx}")))
    }

    /// Cancel this downloader's read allocation for `file_id` and wait until
    /// the cancellation is included, returning its height.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no allocation to cancel, the ledger
    /// refuses the submission, or it is not confirmed in time.
    pub async fn cancel_read(&self, file_id: &FileId) -> Result<u64> {
        let tx = self
            .ledger
            .submit(Transaction {
                contract: self.ledger_config.contract.clone(),
                signer: self.address(),
                operation: Operation::CancelRead {
                    file_id: file_id.clone(),
                },
            })
            .await?;
        let height = self
            .waiter
            .wait(&tx, self.ledger_config.confirm_timeout())
            .await?;
        info!("Read pledge for {file_id} cancelled at height {height}");
        Ok(height)
    }

    /// Connect to a storage node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the connection fails.
    pub async fn connect(&self, addr: SocketAddr) -> Result<FramedStream<TcpStream>> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Transport(format!("connect to {addr}: {e}")))?;
        Ok(FramedStream::new(stream, &self.session_config))
    }

    /// Read `file_id` from the storage node `payee` listening at `addr`.
    ///
    /// # Errors
    ///
    /// See [`Self::read_over`].
    pub async fn read_file(
        &self,
        addr: SocketAddr,
        file_id: &FileId,
        payee: Address,
    ) -> Result<ReadResult> {
        let mut transport = self.connect(addr).await?;
        self.read_over(&mut transport, file_id, payee).await
    }

    /// Run a read session over an established transport.
    ///
    /// Vouchers start at the allocation's already-served count for `payee`
    /// and carry the allocation's pledge height.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionAborted`] naming the state and slice at which
    /// the session failed, including aborts sent by the storage node.
    pub async fn read_over<S>(
        &self,
        transport: &mut FramedStream<S>,
        file_id: &FileId,
        payee: Address,
    ) -> Result<ReadResult>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        let mut state = SessionState::Handshake;
        let mut slice = None;
        match self
            .exchange(transport, file_id, payee, &mut state, &mut slice)
            .await
        {
            Ok(result) => Ok(result),
            Err(cause) => {
                warn!("Read of {file_id} from {payee} aborted in {state} (slice {slice:?}): {cause}");
                Err(Error::SessionAborted {
                    state: state.to_string(),
                    slice,
                    source: Box::new(cause),
                })
            }
        }
    }

    async fn exchange<S>(
        &self,
        transport: &mut FramedStream<S>,
        file_id: &FileId,
        payee: Address,
        state: &mut SessionState,
        slice: &mut Option<u64>,
    ) -> Result<ReadResult>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        let pledge = self
            .ledger
            .read_pledge(file_id, &self.address())
            .await?
            .ok_or_else(|| Error::NotFound(format!("read pledge for {file_id}")))?;
        let plan = pledge
            .plan_for(&payee)
            .ok_or_else(|| Error::NotFound(format!("read plan naming {payee}")))?;
        let first_slice = plan.have_read_blocks;
        let max_read = plan.max_read_blocks;

        transport
            .send(&Frame::Command(Command::ReadFile {
                file_id: file_id.clone(),
                downloader: self.address(),
            }))
            .await?;
        expect_frame(transport, &Frame::SetupAck).await?;

        *state = SessionState::Streaming;
        let mut expected = first_slice;
        let mut blocks = Vec::new();
        loop {
            match transport.recv().await? {
                Frame::Block { slice: got, data } => {
                    *slice = Some(got);
                    if got != expected {
                        return Err(Error::OrderingViolation { expected, got });
                    }
                    if got >= max_read {
                        return Err(Error::PlanExhausted {
                            file_id: file_id.to_string(),
                            max_read,
                            have_read: got,
                        });
                    }
                    let voucher =
                        Voucher::mint(file_id, &self.key, payee, got, pledge.pledge_height)?;
                    transport.send(&Frame::Voucher(Box::new(voucher))).await?;
                    expect_frame(transport, &Frame::VoucherAck).await?;
                    blocks.push(data);
                    expected += 1;
                }
                Frame::Close { slices } => {
                    if slices != blocks.len() as u64 {
                        return Err(Error::Protocol(format!(
                            "node closed after {slices} slices, received {}",
                            blocks.len()
                        )));
                    }
                    break;
                }
                Frame::Abort(reason) => {
                    return Err(Error::Protocol(format!("storage node aborted: {reason}")));
                }
                other => {
                    return Err(Error::Protocol(format!("unexpected {}", other.kind())));
                }
            }
        }

        *state = SessionState::Closed;
        debug!("Read {} blocks of {file_id} from {payee}", blocks.len());
        Ok(ReadResult {
            file_id: file_id.clone(),
            payee,
            first_slice,
            blocks,
        })
    }
}

/// Tell a storage node it now holds `file_id` and must start proving it.
///
/// # Errors
///
/// Returns an error if the node cannot be reached or does not acknowledge.
pub async fn announce_store(
    addr: SocketAddr,
    file_id: &FileId,
    config: &SessionConfig,
) -> Result<()> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| Error::Transport(format!("connect to {addr}: {e}")))?;
    let mut transport = FramedStream::new(stream, config);
    transport
        .send(&Frame::Command(Command::StoreFile {
            file_id: file_id.clone(),
        }))
        .await?;
    expect_frame(&mut transport, &Frame::SetupAck).await?;
    transport.close().await
}

async fn expect_frame<S>(transport: &mut FramedStream<S>, wanted: &Frame) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send,
{
    match transport.recv().await? {
        ref frame if frame == wanted => Ok(()),
        Frame::Abort(reason) => Err(Error::Protocol(format!("peer aborted: {reason}"))),
        other => Err(Error::Protocol(format!(
            "expected {}, got {}",
            wanted.kind(),
            other.kind()
        ))),
    }
}

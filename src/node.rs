//! Storage node: accepts session connections and runs the proof scheduler.

use crate::blocks::{BlockSource, MemoryBlockStore};
use crate::config::{NodeConfig, SessionConfig};
use crate::error::{Error, Result};
use crate::event::{create_event_channel, NodeEvent, NodeEventsChannel, NodeEventsSender};
use crate::identity::{Address, KeyPair, SECRET_KEY_FILE};
use crate::ledger::{ConfirmationWaiter, FileId, Ledger};
use crate::proof::{DigestProver, PossessionShadow, ProofScheduler, Prover};
use crate::session::{Command, Frame, FramedStream, ReadSessionProvider};
use crate::settlement::{Settler, Voucher};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Settlement submissions per session, including the one made in the session.
const SETTLE_ATTEMPTS: u32 = 3;

/// Builder for constructing a storage node.
pub struct NodeBuilder {
    config: NodeConfig,
    key: Option<Arc<KeyPair>>,
    ledger: Option<Arc<dyn Ledger>>,
    blocks: Option<Arc<dyn BlockSource>>,
    prover: Option<Arc<dyn Prover>>,
}

impl NodeBuilder {
    /// Create a new node builder with the given configuration.
    #[must_use]
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            key: None,
            ledger: None,
            blocks: None,
            prover: None,
        }
    }

    /// Use this identity instead of the one stored under the root directory.
    #[must_use]
    pub fn with_key(mut self, key: Arc<KeyPair>) -> Self {
        self.key = Some(key);
        self
    }

    /// Ledger connector. Required.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Where served and proved blocks are read from. Defaults to an empty in-memory store.
    #[must_use]
    pub fn with_block_source(mut self, blocks: Arc<dyn BlockSource>) -> Self {
        self.blocks = Some(blocks);
        self
    }

    /// Possession prover. Defaults to [`DigestProver`] over the block source.
    #[must_use]
    pub fn with_prover(mut self, prover: Arc<dyn Prover>) -> Self {
        self.prover = Some(prover);
        self
    }

    /// Build the node and bind its listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, no ledger was
    /// supplied, the identity cannot be loaded, or the port cannot be bound.
    pub async fn build(self) -> Result<RunningNode> {
        info!("Building custody-node with config: {:?}", self.config);
        self.config.validate()?;

        let ledger = self
            .ledger
            .ok_or_else(|| Error::Config("no ledger connector supplied".to_string()))?;

        std::fs::create_dir_all(&self.config.root_dir)?;
        let key = match self.key {
            Some(key) => key,
            None => Arc::new(load_or_create_key(&self.config.root_dir)?),
        };
        let address = key.address();

        let blocks = self
            .blocks
            .unwrap_or_else(|| Arc::new(MemoryBlockStore::new()));
        let prover = self
            .prover
            .unwrap_or_else(|| Arc::new(DigestProver::new(Arc::clone(&blocks))));

        let listener = TcpListener::bind(self.config.socket_addr()).await?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = create_event_channel();

        let shadow = PossessionShadow::with_capacity(self.config.proof.shadow_capacity);
        let scheduler = Arc::new(ProofScheduler::new(
            address,
            Arc::clone(&ledger),
            prover,
            shadow.clone(),
            self.config.ledger.clone(),
            events_tx.clone(),
        ));
        let settler = Settler::new(
            Arc::clone(&ledger),
            ConfirmationWaiter::new(Arc::clone(&ledger), self.config.ledger.poll_interval()),
            self.config.ledger.contract.clone(),
            address,
            self.config.ledger.confirm_timeout(),
        );
        let provider = ReadSessionProvider::new(address, ledger, shadow, blocks, settler);

        info!("Node {address} listening on {local_addr}");

        Ok(RunningNode {
            dispatch: Dispatch {
                scheduler,
                provider,
                events: events_tx.clone(),
                session: self.config.session,
                settle_retry_delay: self.config.ledger.blocks_to_duration(1),
            },
            config: self.config,
            address,
            listener,
            local_addr,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            events_tx,
            events_rx: Some(events_rx),
        })
    }
}

fn load_or_create_key(root_dir: &std::path::Path) -> Result<KeyPair> {
    let path = root_dir.join(SECRET_KEY_FILE);
    if path.exists() {
        debug!("Loading node key from {}", path.display());
        KeyPair::load(&path)
    } else {
        let key = KeyPair::generate()?;
        let saved = key.save(root_dir)?;
        info!("Generated node key {} at {}", key.address(), saved.display());
        Ok(key)
    }
}

/// Requests shutdown of a [`RunningNode`] from another task.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Request the node to shut down.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// Everything a connection handler needs.
#[derive(Clone)]
struct Dispatch {
    scheduler: Arc<ProofScheduler>,
    provider: ReadSessionProvider,
    events: NodeEventsSender,
    session: SessionConfig,
    settle_retry_delay: Duration,
}

impl Dispatch {
    async fn handle(self, stream: TcpStream, peer: SocketAddr) {
        let mut transport = FramedStream::new(stream, &self.session);
        let command = match transport.recv().await {
            Ok(Frame::Command(command)) => command,
            Ok(other) => {
                warn!("{peer} opened with {} instead of a command", other.kind());
                let _ = transport
                    .send(&Frame::Abort("expected a command".to_string()))
                    .await;
                return;
            }
            Err(e) => {
                warn!("Bad setup from {peer}: {e}");
                let _ = transport.send(&Frame::Abort(e.to_string())).await;
                return;
            }
        };
        debug!("{peer}: {command}");
        if let Err(e) = transport.send(&Frame::SetupAck).await {
            warn!("Could not acknowledge {peer}: {e}");
            return;
        }

        match command {
            Command::StoreFile { file_id } => {
                match self.scheduler.schedule(file_id.clone(), None).await {
                    Ok(true) => info!("Now proving {file_id}"),
                    Ok(false) => debug!("{file_id} is already being proved"),
                    Err(e) => {
                        warn!("Cannot prove {file_id}: {e}");
                        let _ = self.events.send(NodeEvent::Error {
                            message: format!("StoreFile {file_id}: {e}"),
                        });
                    }
                }
                let _ = transport.close().await;
            }
            Command::ReadFile {
                file_id,
                downloader,
            } => {
                let _ = self.events.send(NodeEvent::SessionOpened {
                    file_id: file_id.clone(),
                    downloader,
                });
                let event = match self
                    .provider
                    .serve(&mut transport, file_id.clone(), downloader)
                    .await
                {
                    Ok(outcome) => NodeEvent::SessionClosed {
                        file_id,
                        downloader,
                        blocks: outcome.blocks_served,
                        settled_slice: Some(outcome.settlement.slice_id),
                    },
                    Err(e) => match e.pending_settlement() {
                        Some((voucher, blocks)) => {
                            let voucher = voucher.clone();
                            self.retry_settlement(file_id, downloader, &voucher, blocks)
                                .await
                        }
                        None => NodeEvent::SessionAborted {
                            file_id,
                            downloader,
                            reason: e.to_string(),
                        },
                    },
                };
                let _ = self.events.send(event);
            }
        }
    }

    /// Resubmit the final voucher of a session whose settlement failed.
    async fn retry_settlement(
        &self,
        file_id: FileId,
        downloader: Address,
        voucher: &Voucher,
        blocks: u64,
    ) -> NodeEvent {
        match self
            .provider
            .settler()
            .settle_with_retry(voucher, SETTLE_ATTEMPTS - 1, self.settle_retry_delay)
            .await
        {
            Ok(receipt) => {
                info!(
                    "Settled {file_id} for {downloader} up to slice {} on retry: tx {}",
                    receipt.slice_id, receipt.tx
                );
                NodeEvent::SessionClosed {
                    file_id,
                    downloader,
                    blocks,
                    settled_slice: Some(receipt.slice_id),
                }
            }
            Err(e) => {
                error!(
                    "Giving up settling {file_id} for {downloader} at slice {}: {e}",
                    voucher.slice_id
                );
                NodeEvent::SessionAborted {
                    file_id,
                    downloader,
                    reason: format!(
                        "settlement of slice {} failed after {SETTLE_ATTEMPTS} attempts: {e}",
                        voucher.slice_id
                    ),
                }
            }
        }
    }
}

/// A running storage node.
pub struct RunningNode {
    config: NodeConfig,
    address: Address,
    listener: TcpListener,
    local_addr: SocketAddr,
    dispatch: Dispatch,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    events_tx: NodeEventsSender,
    events_rx: Option<NodeEventsChannel>,
}

impl RunningNode {
    /// Get the node's root directory.
    #[must_use]
    pub fn root_dir(&self) -> &PathBuf {
        &self.config.root_dir
    }

    /// The node's ledger address.
    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The node's proof scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<ProofScheduler> {
        &self.dispatch.scheduler
    }

    /// Get a receiver for node events.
    ///
    /// Note: Can only be called once. Subsequent calls return None.
    pub fn events(&mut self) -> Option<NodeEventsChannel> {
        self.events_rx.take()
    }

    /// Subscribe to node events.
    #[must_use]
    pub fn subscribe_events(&self) -> NodeEventsChannel {
        self.events_tx.subscribe()
    }

    /// Handle for requesting shutdown while [`Self::run`] is borrowed.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Accept connections until shutdown is requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the node encounters a fatal error.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting custody-node {}", self.address);
        let _ = self.events_tx.send(NodeEvent::Started);

        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received");
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl-C received, initiating shutdown");
                    self.shutdown();
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Connection from {peer}");
                        sessions.spawn(self.dispatch.clone().handle(stream, peer));
                    }
                    Err(e) => {
                        warn!("Accept failed: {e}");
                        let _ = self.events_tx.send(NodeEvent::Error {
                            message: format!("accept failed: {e}"),
                        });
                    }
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        let _ = self.events_tx.send(NodeEvent::ShuttingDown);
        sessions.abort_all();
        self.dispatch.scheduler.shutdown_all().await;
        info!("Node shutdown complete");
        Ok(())
    }

    /// Request the node to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

//! Test harness that runs one storage node against an in-process ledger.

use custody_node::blocks::MemoryBlockStore;
use custody_node::config::NodeConfig;
use custody_node::ledger::{FileId, FileInfo, MemoryLedger};
use custody_node::{Address, Downloader, KeyPair, NodeBuilder, NodeEvent, NodeEventsChannel, ShutdownHandle};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::info;

/// Contract address used by every harness ledger.
pub const CONTRACT: &str = "fs-e2e";

/// How long helpers wait for an expected event.
const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Error type for test harness operations.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Node error
    #[error("Node error: {0}")]
    Node(#[from] custody_node::Error),

    /// Expected event never arrived
    #[error("Timed out waiting for {0}")]
    EventTimeout(String),

    /// Node task failed
    #[error("Node task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result type for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// A running node plus the ledger and block store behind it.
pub struct TestHarness {
    /// The node's ledger.
    pub ledger: Arc<MemoryLedger>,
    /// The node's block store.
    pub blocks: Arc<MemoryBlockStore>,
    config: NodeConfig,
    node_addr: SocketAddr,
    node_address: Address,
    shutdown: ShutdownHandle,
    events: NodeEventsChannel,
    task: JoinHandle<custody_node::Result<()>>,
    _root: TempDir,
}

impl TestHarness {
    /// Start a node on an ephemeral loopback port.
    ///
    /// # Errors
    ///
    /// Returns an error if the node fails to start.
    pub async fn setup() -> Result<Self> {
        let root = TempDir::new().map_err(custody_node::Error::from)?;
        let mut config = NodeConfig {
            root_dir: root.path().to_path_buf(),
            listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..NodeConfig::default()
        };
        config.ledger.contract = CONTRACT.to_string();
        config.ledger.poll_interval_ms = 10;
        config.ledger.confirm_timeout_secs = 5;
        config.session.idle_timeout_secs = 5;

        let ledger = Arc::new(MemoryLedger::new(CONTRACT));
        let blocks = Arc::new(MemoryBlockStore::new());
        let mut node = NodeBuilder::new(config.clone())
            .with_ledger(ledger.clone())
            .with_block_source(blocks.clone())
            .build()
            .await?;

        let node_addr = node.local_addr();
        let node_address = node.address();
        let shutdown = node.shutdown_handle();
        let events = node.subscribe_events();
        let task = tokio::spawn(async move { node.run().await });
        info!("Test node {node_address} on {node_addr}");

        let mut harness = Self {
            ledger,
            blocks,
            config,
            node_addr,
            node_address,
            shutdown,
            events,
            task,
            _root: root,
        };
        harness
            .wait_for_event("Started", |e| matches!(e, NodeEvent::Started))
            .await?;
        Ok(harness)
    }

    /// Socket the node listens on.
    #[must_use]
    pub fn node_addr(&self) -> SocketAddr {
        self.node_addr
    }

    /// The node's ledger address.
    #[must_use]
    pub fn node_address(&self) -> Address {
        self.node_address
    }

    /// The node's configuration.
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Register a file on the ledger, hold its blocks and make the node responsible for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the node cannot be assigned.
    pub fn add_file(
        &self,
        id: &str,
        owner: Address,
        data: &[u8],
        block_size: usize,
        proof_interval: u64,
    ) -> Result<FileId> {
        let file_id = FileId::new(id);
        let block_count = self.blocks.insert(file_id.clone(), data, block_size);
        let start_height = self.ledger.height();
        self.ledger.add_file(FileInfo {
            file_id: file_id.clone(),
            owner,
            block_count,
            proof_interval,
            start_height,
            expire_height: start_height + 10_000,
            pdp_param: Vec::new(),
        });
        self.ledger.assign_node(&file_id, self.node_address)?;
        Ok(file_id)
    }

    /// A downloader with a fresh identity talking to this harness's ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation fails.
    pub fn downloader(&self) -> Result<Downloader> {
        let key = Arc::new(KeyPair::generate()?);
        Ok(Downloader::new(
            key,
            self.ledger.clone(),
            self.config.ledger.clone(),
            self.config.session,
        ))
    }

    /// Wait for the first event matching `pred`, skipping others.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::EventTimeout`] if none arrives in time.
    pub async fn wait_for_event<F>(&mut self, what: &str, pred: F) -> Result<NodeEvent>
    where
        F: Fn(&NodeEvent) -> bool,
    {
        let events = &mut self.events;
        let found = tokio::time::timeout(EVENT_TIMEOUT, async {
            while let Ok(event) = events.recv().await {
                if pred(&event) {
                    return Some(event);
                }
            }
            None
        })
        .await;
        match found {
            Ok(Some(event)) => Ok(event),
            _ => Err(HarnessError::EventTimeout(what.to_string())),
        }
    }

    /// Shut the node down and wait for it to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the node task failed.
    pub async fn teardown(mut self) -> Result<()> {
        self.shutdown.shutdown();
        self.wait_for_event("ShuttingDown", |e| matches!(e, NodeEvent::ShuttingDown))
            .await?;
        self.task.await??;
        Ok(())
    }
}

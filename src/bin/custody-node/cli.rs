//! Command-line interface definition.

use clap::Parser;
use custody_node::config::NodeConfig;
use std::net::IpAddr;
use std::path::PathBuf;

/// Storage node serving pay-per-block reads and submitting possession proofs.
#[derive(Parser, Debug)]
#[command(name = "custody-node")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Root directory for node data.
    #[arg(long, env = "CUSTODY_ROOT_DIR")]
    pub root_dir: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long, env = "CUSTODY_LISTEN_ADDR")]
    pub listen_addr: Option<IpAddr>,

    /// Listening port (0 for auto-select).
    #[arg(long, short, env = "CUSTODY_PORT")]
    pub port: Option<u16>,

    /// Storage contract address.
    #[arg(long, env = "CUSTODY_CONTRACT")]
    pub contract: Option<String>,

    /// Seconds to wait for a submitted transaction to be included.
    #[arg(long, env = "CUSTODY_CONFIRM_TIMEOUT")]
    pub confirm_timeout: Option<u64>,

    /// Milliseconds between blocks on the development ledger.
    #[arg(long, env = "CUSTODY_BLOCK_PERIOD_MS")]
    pub block_period_ms: Option<u64>,

    /// Files to store and prove on the development ledger.
    #[arg(long = "dev-file", value_name = "PATH")]
    pub dev_files: Vec<PathBuf>,

    /// Proof interval in blocks for development files.
    #[arg(long, default_value = "600")]
    pub dev_proof_interval: u64,

    /// Block size in bytes for development files.
    #[arg(long, default_value = "4096")]
    pub dev_block_size: usize,

    /// Log level.
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Emit logs as JSON.
    #[arg(long)]
    pub log_json: bool,

    /// Path to configuration file.
    #[arg(long, short)]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Convert CLI arguments into a NodeConfig.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is specified but cannot be loaded.
    pub fn to_config(&self) -> color_eyre::Result<NodeConfig> {
        // Start with default config or load from file
        let mut config = if let Some(ref path) = self.config {
            NodeConfig::from_file(path)?
        } else {
            NodeConfig::default()
        };

        // Override with CLI arguments
        if let Some(ref root_dir) = self.root_dir {
            config.root_dir.clone_from(root_dir);
        }
        if let Some(listen_addr) = self.listen_addr {
            config.listen_addr = listen_addr;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(ref contract) = self.contract {
            config.ledger.contract.clone_from(contract);
        }
        if let Some(secs) = self.confirm_timeout {
            config.ledger.confirm_timeout_secs = secs;
        }
        if let Some(ms) = self.block_period_ms {
            config.ledger.block_period_ms = ms;
        }
        config.log_level.clone_from(&self.log_level);

        config.validate()?;
        Ok(config)
    }
}

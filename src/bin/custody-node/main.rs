//! custody-node CLI entry point.
//!
//! Runs a storage node against the in-process development ledger. Files
//! passed with `--dev-file` are registered, assigned to this node and proved.

mod cli;

use clap::Parser;
use cli::Cli;
use color_eyre::eyre::WrapErr;
use custody_node::blocks::MemoryBlockStore;
use custody_node::ledger::{FileId, FileInfo, MemoryLedger};
use custody_node::{NodeBuilder, RunningNode};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Blocks a development file stays on the ledger.
const DEV_FILE_LIFETIME: u64 = 1_000_000;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    info!("custody-node v{}", env!("CARGO_PKG_VERSION"));

    // Build configuration
    let config = cli.to_config()?;
    let block_period = Duration::from_millis(config.ledger.block_period_ms.max(1));

    let ledger = Arc::new(
        MemoryLedger::new(config.ledger.contract.clone())
            .with_passport_config(config.passport),
    );
    let blocks = Arc::new(MemoryBlockStore::new());

    let mut node = NodeBuilder::new(config)
        .with_ledger(ledger.clone())
        .with_block_source(blocks.clone())
        .build()
        .await?;

    for path in &cli.dev_files {
        seed_file(&node, &ledger, &blocks, path, &cli)
            .await
            .wrap_err_with(|| format!("seeding {}", path.display()))?;
    }

    // The development ledger produces blocks on its own schedule.
    let producer = Arc::clone(&ledger);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(block_period);
        loop {
            ticker.tick().await;
            producer.mine_block();
        }
    });

    // Run until shutdown
    node.run().await?;

    info!("Goodbye!");
    Ok(())
}

async fn seed_file(
    node: &RunningNode,
    ledger: &MemoryLedger,
    blocks: &MemoryBlockStore,
    path: &std::path::Path,
    cli: &Cli,
) -> color_eyre::Result<()> {
    let data = std::fs::read(path)?;
    let name = path
        .file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
    let file_id = FileId::new(name);

    let block_count = blocks.insert(file_id.clone(), &data, cli.dev_block_size);
    let start_height = ledger.height();
    ledger.add_file(FileInfo {
        file_id: file_id.clone(),
        owner: node.address(),
        block_count,
        proof_interval: cli.dev_proof_interval,
        start_height,
        expire_height: start_height + DEV_FILE_LIFETIME,
        pdp_param: Vec::new(),
    });
    ledger.assign_node(&file_id, node.address())?;
    node.scheduler().schedule(file_id.clone(), None).await?;

    info!("Serving {file_id} ({block_count} blocks)");
    Ok(())
}

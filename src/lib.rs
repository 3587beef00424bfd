//! # custody-node
//!
//! Off-chain trust protocol for a storage network whose state lives on a
//! ledger.
//!
//! This crate provides:
//! - Height-bound passports authorizing ledger state queries
//! - Per-block settlement vouchers forming a strictly increasing chain
//! - Read sessions exchanging data blocks for vouchers over TCP
//! - A per-file possession-proof scheduler with retry and staleness handling
//! - Bounded confirmation waiting for every ledger submission
//!
//! ## Architecture
//!
//! The ledger is the only durable shared resource and is consumed through the
//! [`ledger::Ledger`] trait. A [`RunningNode`] accepts `StoreFile` commands
//! (which start a proof loop) and `ReadFile` commands (which run a read
//! session), both answered over the same line-framed transport.
//!
//! ## Example
//!
//! ```rust,no_run
//! use custody_node::ledger::MemoryLedger;
//! use custody_node::{NodeBuilder, NodeConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::default();
//!     let ledger = Arc::new(MemoryLedger::new(config.ledger.contract.clone()));
//!     let mut node = NodeBuilder::new(config).with_ledger(ledger).build().await?;
//!     node.run().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod blocks;
pub mod config;
pub mod error;
pub mod event;
pub mod identity;
pub mod ledger;
pub mod node;
pub mod passport;
pub mod proof;
pub mod session;
pub mod settlement;

pub use config::NodeConfig;
pub use error::{Error, Result};
pub use event::{NodeEvent, NodeEventsChannel};
pub use identity::{Address, KeyPair};
pub use node::{NodeBuilder, RunningNode, ShutdownHandle};
pub use passport::Passport;
pub use proof::{ProofScheduler, ProofStatus};
pub use session::{Downloader, ReadSessionProvider, SessionState};
pub use settlement::{Voucher, VoucherChain};

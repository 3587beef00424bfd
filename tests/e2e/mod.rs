//! End-to-end tests for custody-node.
//!
//! Each test starts a real node on a loopback TCP listener backed by the
//! in-process ledger, then drives it as a downloader or file owner would.

mod harness;
mod integration_tests;

pub use harness::{HarnessError, TestHarness};

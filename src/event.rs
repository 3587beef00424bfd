//! Node event system.

use crate::identity::Address;
use crate::ledger::FileId;
use tokio::sync::broadcast;

/// Events emitted by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// Node has started successfully.
    Started,

    /// Node is shutting down.
    ShuttingDown,

    /// A downloader opened a read session.
    SessionOpened {
        /// File being read.
        file_id: FileId,
        /// Downloader address.
        downloader: Address,
    },

    /// A read session finished and its final voucher was submitted.
    SessionClosed {
        /// File that was read.
        file_id: FileId,
        /// Downloader address.
        downloader: Address,
        /// Number of blocks served.
        blocks: u64,
        /// Slice index settled, if any block was served.
        settled_slice: Option<u64>,
    },

    /// A read session was aborted.
    SessionAborted {
        /// File being read.
        file_id: FileId,
        /// Downloader address.
        downloader: Address,
        /// State, slice and cause of the abort.
        reason: String,
    },

    /// A possession proof was included on the ledger.
    ProofSubmitted {
        /// File proved.
        file_id: FileId,
        /// Challenge height the proof answered.
        challenge_height: u64,
    },

    /// A possession proof could not be submitted or confirmed.
    ProofFailed {
        /// File proved.
        file_id: FileId,
        /// Consecutive failures so far.
        consecutive: u32,
        /// Error message.
        message: String,
    },

    /// The proof loop for a file ended.
    ProofLoopStopped {
        /// File no longer being proved.
        file_id: FileId,
        /// Why the loop ended.
        reason: String,
    },

    /// Error occurred.
    Error {
        /// Error message.
        message: String,
    },
}

/// Channel for receiving node events.
pub type NodeEventsChannel = broadcast::Receiver<NodeEvent>;

/// Sender for node events.
pub type NodeEventsSender = broadcast::Sender<NodeEvent>;

/// Create a new event channel pair.
#[must_use]
pub fn create_event_channel() -> (NodeEventsSender, NodeEventsChannel) {
    broadcast::channel(256)
}

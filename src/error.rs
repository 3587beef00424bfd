//! Error types for custody-node.

use crate::settlement::Voucher;
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in custody-node.
#[derive(Debug, Error)]
pub enum Error {
    /// Passport issued outside the verifier's height window.
    #[error("expired capability: issued at height {issued}, current height {current}, window {window}")]
    ExpiredCapability {
        /// Height the passport was issued at.
        issued: u64,
        /// Verifier's current height.
        current: u64,
        /// Configured tolerance window.
        window: u64,
    },

    /// Signature did not verify.
    #[error("bad signature: {0}")]
    BadSignature(String),

    /// Passport is missing required fields or cannot be decoded.
    #[error("malformed capability: {0}")]
    MalformedCapability(String),

    /// Voucher is missing required fields, cannot be decoded, or belongs to another session.
    #[error("malformed voucher: {0}")]
    MalformedVoucher(String),

    /// Voucher slice index is not the immediate successor.
    #[error("ordering violation: expected slice {expected}, got {got}")]
    OrderingViolation {
        /// Slice index the payee was waiting for.
        expected: u64,
        /// Slice index received.
        got: u64,
    },

    /// Read plan has no blocks left to serve.
    #[error("read plan exhausted for {file_id}: {have_read} of {max_read} blocks served")]
    PlanExhausted {
        /// File the plan belongs to.
        file_id: String,
        /// Maximum blocks for this node.
        max_read: u64,
        /// Blocks already served.
        have_read: u64,
    },

    /// Read allocation is past its expiry height.
    #[error("read allocation expired at height {expire_height} (current {current})")]
    AllocationExpired {
        /// Expiry height of the allocation.
        expire_height: u64,
        /// Current ledger height.
        current: u64,
    },

    /// Connection failure, closed stream or idle timeout.
    #[error("transport error: {0}")]
    Transport(String),

    /// Ledger could not be reached or rejected the request.
    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(String),

    /// Transaction was not observed within the wait budget.
    #[error("timed out waiting for confirmation of {0}")]
    Timeout(String),

    /// A read session was aborted.
    #[error("session aborted in {state} (slice {}): {source}", fmt_slice(.slice))]
    SessionAborted {
        /// Session state in which the failure happened.
        state: String,
        /// Slice index being exchanged, if any.
        slice: Option<u64>,
        /// Underlying cause.
        #[source]
        source: Box<Error>,
    },

    /// The final voucher of a served session could not be settled.
    ///
    /// Carries the voucher so the storage node can submit it again.
    #[error("settlement of slice {} pending after {blocks} blocks: {source}", .voucher.slice_id)]
    SettlementPending {
        /// Final accepted voucher of the session.
        voucher: Box<Voucher>,
        /// Blocks served in the session.
        blocks: u64,
        /// Why the submission failed.
        #[source]
        source: Box<Error>,
    },

    /// Unexpected or unparseable protocol frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Key handling or signing error.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[allow(clippy::ref_option)]
fn fmt_slice(slice: &Option<u64>) -> String {
    slice.map_or_else(|| "-".to_string(), |s| s.to_string())
}

impl Error {
    /// Returns true if the error invalidates the counterparty's signed data.
    ///
    /// Such errors are never retried.
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        match self {
            Self::BadSignature(_)
            | Self::MalformedVoucher(_)
            | Self::MalformedCapability(_)
            | Self::OrderingViolation { .. } => true,
            Self::SessionAborted { source, .. } => source.is_protocol_violation(),
            _ => false,
        }
    }

    /// The unsettled final voucher and block count, if this error carries one.
    #[must_use]
    pub fn pending_settlement(&self) -> Option<(&Voucher, u64)> {
        match self {
            Self::SettlementPending { voucher, blocks, .. } => Some((&**voucher, *blocks)),
            Self::SessionAborted { source, .. } => source.pending_settlement(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_abort_reports_step() {
        let err = Error::SessionAborted {
            state: "streaming".to_string(),
            slice: Some(4),
            source: Box::new(Error::OrderingViolation {
                expected: 4,
                got: 6,
            }),
        };
        let msg = err.to_string();
        assert!(msg.contains("streaming"));
        assert!(msg.contains("slice 4"));
        assert!(msg.contains("expected slice 4, got 6"));
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_transport_is_not_violation() {
        assert!(!Error::Transport("reset".to_string()).is_protocol_violation());
        assert!(!Error::Timeout("abc".to_string()).is_protocol_violation());
    }
}

//! Read session states and their allowed transitions.

use std::fmt;

/// Read session lifecycle.
///
/// `Handshake -> Negotiating -> Streaming -> Settling -> Closed`, with
/// `Aborted` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Checking the downloader's allocation and this node's responsibility.
    Handshake,
    /// Computing how many blocks the plan still allows.
    Negotiating,
    /// Exchanging blocks for vouchers.
    Streaming,
    /// Submitting the final voucher and waiting for confirmation.
    Settling,
    /// Finished normally.
    Closed,
    /// Ended by an error.
    Aborted,
}

impl SessionState {
    /// True for `Closed` and `Aborted`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Aborted)
    }

    /// Whether moving to `next` is a legal transition.
    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        match (self, next) {
            (s, Self::Aborted) => !s.is_terminal(),
            (Self::Handshake, Self::Negotiating)
            | (Self::Negotiating, Self::Streaming)
            | (Self::Streaming, Self::Settling)
            | (Self::Settling, Self::Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Handshake => "Handshake",
            Self::Negotiating => "Negotiating",
            Self::Streaming => "Streaming",
            Self::Settling => "Settling",
            Self::Closed => "Closed",
            Self::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use SessionState::*;
        assert!(Handshake.can_advance_to(Negotiating));
        assert!(Settling.can_advance_to(Closed));
        assert!(Streaming.can_advance_to(Aborted));
        assert!(!Handshake.can_advance_to(Streaming));
        assert!(!Closed.can_advance_to(Aborted));
        assert!(!Aborted.can_advance_to(Aborted));
    }
}

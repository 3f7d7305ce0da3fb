//! Errors surfaced to callers of engine operations.
//!
//! Inbound-message failures never show up here; they travel through the
//! processor pipeline as [`Notification::Error`](crate::Notification).

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::transport::{Ticket, TransportError};

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The transport returned no tickets for a send.
    #[error("No receiver registered")]
    NoReceivers,

    /// Every ticket returned for a send denotes a failure.
    #[error("Sending failed to all receivers: {}", join_tickets(.tickets))]
    AllReceiversFailed {
        /// The raw tickets as returned by the transport.
        tickets: Vec<Ticket>,
    },

    /// The operation's deadline passed.
    #[error("Operation timed out")]
    Timeout,

    /// The operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// A batch operation answered fewer items than it was asked about.
    #[error("Batch output finished early: expected {expected} results, got {actual}")]
    LengthMismatch {
        /// Number of inputs.
        expected: usize,
        /// Number of outputs returned.
        actual: usize,
    },

    /// The caller or transport supplied an unusable argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The transport failed the call.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A crypto capability faulted.
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// A child task of a composed operation died.
    #[error("Task failed: {0}")]
    TaskFailed(String),
}

fn join_tickets(tickets: &[Ticket]) -> String {
    tickets
        .iter()
        .map(|ticket| format!("\"{ticket}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

impl EngineError {
    /// Check if this error settles a wait that was cut short.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, EngineError::Timeout | EngineError::Cancelled)
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_receivers_failed_message() {
        let err = EngineError::AllReceiversFailed {
            tickets: vec![Ticket::from("error:a"), Ticket::from("error-b")],
        };
        assert_eq!(
            err.to_string(),
            "Sending failed to all receivers: \"error:a\", \"error-b\""
        );
    }

    #[test]
    fn test_interrupted() {
        assert!(EngineError::Timeout.is_interrupted());
        assert!(EngineError::Cancelled.is_interrupted());
        assert!(!EngineError::NoReceivers.is_interrupted());
    }
}

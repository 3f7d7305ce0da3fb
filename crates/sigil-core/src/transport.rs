//! The transport contract.
//!
//! A host application supplies a transport through a factory; the factory
//! receives a [`TransportControl`] through which the transport reports
//! inbound messages, faults and remote resets back to the engine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{error, trace, warn};

use crate::crypto::{Anonymous, Ciphertext, Receiver};
use crate::engine::{Engine, Inner};
use crate::error::Result;
use crate::gate;
use crate::notification::{Handling, Notification};
use crate::options::Scope;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The remote side did not answer in time.
    #[error("Request timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// The remote side rejected a request.
    #[error("Remote error {code}: {message}")]
    Remote {
        /// Error code.
        code: u16,
        /// Human-readable reason.
        message: String,
    },

    /// The transport does not implement this operation.
    #[error("Not supported: {0}")]
    Unsupported(&'static str),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] sigil_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type for transport calls.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Opaque per-recipient acknowledgment of a send.
///
/// A ticket starting with `"error"` marks a failed attempt; anything else
/// means the transport accepted the message, not that it was delivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ticket(pub String);

impl Ticket {
    /// Create a ticket.
    #[must_use]
    pub fn new(ticket: impl Into<String>) -> Self {
        Self(ticket.into())
    }

    /// Check if this ticket marks a failed attempt.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.0.starts_with("error")
    }

    /// Get the ticket as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Ticket {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Ticket {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Moves ciphertext between channels.
///
/// Batch calls answer positionally: one flag per receiver, in input order,
/// `true` meaning the transport now honors the requested state. Dropping a
/// returned future cancels the call.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start delivering messages for the given receivers.
    async fn subscribe(&self, receivers: &[Arc<dyn Receiver>]) -> TransportResult<Vec<bool>>;

    /// Stop delivering messages for the given receivers.
    async fn unsubscribe(&self, receivers: &[Arc<dyn Receiver>]) -> TransportResult<Vec<bool>>;

    /// Drop every subscription and deliver only for the given receivers.
    async fn reset(&self, receivers: &[Arc<dyn Receiver>]) -> TransportResult<Vec<bool>>;

    /// Send ciphertext to a channel; one ticket per reached recipient.
    async fn send(&self, channel: &Anonymous, ciphertext: Ciphertext) -> TransportResult<Vec<Ticket>>;

    /// Get the transport name.
    fn name(&self) -> &'static str;
}

/// Engine-side callbacks handed to a transport at construction.
///
/// Holds the engine weakly: once the engine is gone, messages go unhandled.
#[derive(Clone)]
pub struct TransportControl {
    pub(crate) engine: Weak<Inner>,
}

impl TransportControl {
    /// Report a transport fault to every processor.
    pub fn error(&self, err: TransportError) {
        error!(error = %err, "Transport error");
        if let Some(inner) = self.engine.upgrade() {
            inner
                .pipeline
                .dispatch(&Notification::transport_error(Arc::new(err)));
        }
    }

    /// Hand an inbound ciphertext to the engine.
    ///
    /// Returns how the processors handled the resulting notification.
    pub async fn message(&self, channel_id: &str, ciphertext: Ciphertext) -> Handling {
        let Some(inner) = self.engine.upgrade() else {
            trace!(channel = %channel_id, "Message after engine shutdown");
            return Handling::Unhandled;
        };
        let notification = gate::interpret(&inner.table, channel_id, &ciphertext).await;
        inner.pipeline.dispatch(&notification)
    }

    /// Re-establish every current subscription after the transport lost its
    /// state.
    ///
    /// Must not be awaited from inside one of the transport's own batch calls.
    ///
    /// # Errors
    ///
    /// Returns the error of the underlying reset.
    pub async fn reset(&self) -> Result<Vec<bool>> {
        let Some(inner) = self.engine.upgrade() else {
            return Ok(Vec::new());
        };
        let receivers = inner.table.receivers();
        warn!(count = receivers.len(), "Transport requested reset");
        Engine::from_inner(inner)
            .reset(&receivers, Scope::default())
            .await
    }

    /// Check if the engine is still alive.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.engine.strong_count() > 0
    }
}

impl fmt::Debug for TransportControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportControl")
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Stand-in used when the host supplies no transport.
///
/// Confirms nothing and cannot send.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    async fn subscribe(&self, receivers: &[Arc<dyn Receiver>]) -> TransportResult<Vec<bool>> {
        Ok(vec![false; receivers.len()])
    }

    async fn unsubscribe(&self, receivers: &[Arc<dyn Receiver>]) -> TransportResult<Vec<bool>> {
        Ok(vec![false; receivers.len()])
    }

    async fn reset(&self, receivers: &[Arc<dyn Receiver>]) -> TransportResult<Vec<bool>> {
        Ok(vec![false; receivers.len()])
    }

    async fn send(&self, _: &Anonymous, _: Ciphertext) -> TransportResult<Vec<Ticket>> {
        Err(TransportError::Unsupported("sending without a transport"))
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

//! Decoded inbound events.
//!
//! Every message a transport hands to the engine becomes exactly one
//! [`Notification`], successful or not, and is pushed through the processor
//! pipeline.

use serde::{Deserialize, Serialize};
use sigil_protocol::Body;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use crate::crypto::{ChannelId, DecryptionError, Receiver};

/// Shared cause attached to an error notification.
pub type Cause = Arc<dyn StdError + Send + Sync>;

/// What went wrong with an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Ciphertext arrived for a channel with no subscribed receiver.
    UnexpectedReceiver,
    /// The receiver's decrypt capability faulted.
    DecryptionFailed,
    /// The transport signaled a fault.
    TransportError,
    /// The receiver refused the ciphertext.
    Decryption(DecryptionError),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::UnexpectedReceiver => f.write_str("unexpected-receiver"),
            ErrorKind::DecryptionFailed => f.write_str("decryption-failed"),
            ErrorKind::TransportError => f.write_str("transport-error"),
            ErrorKind::Decryption(kind) => kind.fmt(f),
        }
    }
}

/// A failed inbound event.
#[derive(Debug, Clone)]
pub struct NotificationError {
    /// Classification.
    pub kind: ErrorKind,
    /// Channel the event arrived on, absent for transport faults.
    pub channel_id: Option<ChannelId>,
    /// Receiver consulted, when one was subscribed.
    pub receiver: Option<Arc<dyn Receiver>>,
    /// Underlying fault, if any.
    pub cause: Option<Cause>,
}

/// A decoded inbound event.
#[derive(Debug, Clone)]
pub enum Notification {
    /// The ciphertext opened to a body.
    Success {
        /// Decrypted body.
        body: Body,
        /// Receiver that opened it.
        receiver: Arc<dyn Receiver>,
        /// Channel it arrived on.
        channel_id: ChannelId,
    },
    /// The event could not be turned into a body.
    Error(NotificationError),
}

impl Notification {
    pub(crate) fn unexpected_receiver(channel_id: &str) -> Self {
        Notification::Error(NotificationError {
            kind: ErrorKind::UnexpectedReceiver,
            channel_id: Some(channel_id.to_string()),
            receiver: None,
            cause: None,
        })
    }

    pub(crate) fn refused(
        kind: DecryptionError,
        channel_id: &str,
        receiver: Arc<dyn Receiver>,
    ) -> Self {
        Notification::Error(NotificationError {
            kind: ErrorKind::Decryption(kind),
            channel_id: Some(channel_id.to_string()),
            receiver: Some(receiver),
            cause: None,
        })
    }

    pub(crate) fn decryption_failed(
        channel_id: &str,
        receiver: Arc<dyn Receiver>,
        cause: Cause,
    ) -> Self {
        Notification::Error(NotificationError {
            kind: ErrorKind::DecryptionFailed,
            channel_id: Some(channel_id.to_string()),
            receiver: Some(receiver),
            cause: Some(cause),
        })
    }

    pub(crate) fn transport_error(cause: Cause) -> Self {
        Notification::Error(NotificationError {
            kind: ErrorKind::TransportError,
            channel_id: None,
            receiver: None,
            cause: Some(cause),
        })
    }

    /// Check if this is a success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Notification::Success { .. })
    }

    /// Get the channel the event belongs to, if known.
    #[must_use]
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            Notification::Success { channel_id, .. } => Some(channel_id),
            Notification::Error(err) => err.channel_id.as_deref(),
        }
    }

    /// Get the body of a success.
    #[must_use]
    pub fn body(&self) -> Option<&Body> {
        match self {
            Notification::Success { body, .. } => Some(body),
            Notification::Error(_) => None,
        }
    }

    /// Get the error kind of a failure.
    #[must_use]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Notification::Success { .. } => None,
            Notification::Error(err) => Some(err.kind),
        }
    }
}

/// How a notification was consumed.
///
/// Transports may use the merged result of a dispatch, for example to attach
/// rich content to a platform push notification.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Handling {
    /// Nobody acted on the notification.
    #[default]
    Unhandled,
    /// At least one processor acted on it.
    Handled,
    /// A processor acted on it and produced content for the transport.
    HandledWithContent(serde_json::Value),
}

impl Handling {
    /// Combine two results; content wins over a plain handled flag and the
    /// first content seen is kept.
    #[must_use]
    pub fn merge(self, other: Handling) -> Handling {
        match (self, other) {
            (Handling::HandledWithContent(content), _) => Handling::HandledWithContent(content),
            (_, Handling::HandledWithContent(content)) => Handling::HandledWithContent(content),
            (Handling::Handled, _) | (_, Handling::Handled) => Handling::Handled,
            _ => Handling::Unhandled,
        }
    }

    /// Check if anything acted on the notification.
    #[must_use]
    pub fn is_handled(&self) -> bool {
        !matches!(self, Handling::Unhandled)
    }
}

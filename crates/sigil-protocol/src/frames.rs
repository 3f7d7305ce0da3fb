//! Frame types for the sigil relay protocol.
//!
//! Frames are the unit of communication between a relay server and a
//! client transport. Each frame is serialized using MessagePack.

use serde::{Deserialize, Serialize};

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Subscribe = 0x01,
    Unsubscribe = 0x02,
    Reset = 0x03,
    Results = 0x04,
    Send = 0x05,
    Tickets = 0x06,
    Message = 0x07,
    Error = 0x08,
    Ping = 0x09,
    Pong = 0x0A,
    Connect = 0x0B,
    Connected = 0x0C,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Subscribe),
            0x02 => Ok(FrameType::Unsubscribe),
            0x03 => Ok(FrameType::Reset),
            0x04 => Ok(FrameType::Results),
            0x05 => Ok(FrameType::Send),
            0x06 => Ok(FrameType::Tickets),
            0x07 => Ok(FrameType::Message),
            0x08 => Ok(FrameType::Error),
            0x09 => Ok(FrameType::Ping),
            0x0A => Ok(FrameType::Pong),
            0x0B => Ok(FrameType::Connect),
            0x0C => Ok(FrameType::Connected),
            _ => Err("Invalid frame type"),
        }
    }
}

/// A protocol frame.
///
/// Requests (`Subscribe`, `Unsubscribe`, `Reset`, `Send`) carry an id that
/// the matching reply (`Results`, `Tickets`, `Error`) echoes back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Subscribe to a batch of channels.
    #[serde(rename = "subscribe")]
    Subscribe {
        /// Request ID.
        id: u64,
        /// Channel ids to subscribe to.
        channels: Vec<String>,
    },

    /// Unsubscribe from a batch of channels.
    #[serde(rename = "unsubscribe")]
    Unsubscribe {
        /// Request ID.
        id: u64,
        /// Channel ids to unsubscribe from.
        channels: Vec<String>,
    },

    /// Drop every subscription, then subscribe to the given channels.
    #[serde(rename = "reset")]
    Reset {
        /// Request ID.
        id: u64,
        /// Channel ids to keep.
        channels: Vec<String>,
    },

    /// Per-channel confirmation of a batch request, positionally matched.
    #[serde(rename = "results")]
    Results {
        /// ID of the answered request.
        id: u64,
        /// One flag per requested channel.
        results: Vec<bool>,
    },

    /// Send ciphertext to everyone listening on a channel.
    #[serde(rename = "send")]
    Send {
        /// Request ID.
        id: u64,
        /// Target channel id.
        channel: String,
        /// Sealed message.
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// Tickets issued for a send, one per recipient.
    #[serde(rename = "tickets")]
    Tickets {
        /// ID of the answered send.
        id: u64,
        /// Opaque per-recipient tickets.
        tickets: Vec<String>,
    },

    /// Inbound ciphertext on a subscribed channel.
    #[serde(rename = "message")]
    Message {
        /// Channel the message arrived on.
        channel: String,
        /// Sealed message.
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code.
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        /// Optional timestamp.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Initial connection handshake.
    #[serde(rename = "connect")]
    Connect {
        /// Protocol version.
        version: u8,
    },

    /// Connection established response.
    #[serde(rename = "connected")]
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },
}

/// Error codes carried by [`Frame::Error`].
pub mod codes {
    /// The frame could not be decoded.
    pub const MALFORMED: u16 = 1001;
    /// The frame type is not valid in this direction.
    pub const UNEXPECTED: u16 = 1002;
    /// The payload exceeds the configured limit.
    pub const TOO_LARGE: u16 = 1003;
    /// The protocol version is not supported.
    pub const VERSION: u16 = 1004;
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Subscribe { .. } => FrameType::Subscribe,
            Frame::Unsubscribe { .. } => FrameType::Unsubscribe,
            Frame::Reset { .. } => FrameType::Reset,
            Frame::Results { .. } => FrameType::Results,
            Frame::Send { .. } => FrameType::Send,
            Frame::Tickets { .. } => FrameType::Tickets,
            Frame::Message { .. } => FrameType::Message,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
        }
    }

    /// Get the request id this frame carries or answers, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Frame::Subscribe { id, .. }
            | Frame::Unsubscribe { id, .. }
            | Frame::Reset { id, .. }
            | Frame::Results { id, .. }
            | Frame::Send { id, .. }
            | Frame::Tickets { id, .. }
            | Frame::Error { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Create a new Subscribe frame.
    #[must_use]
    pub fn subscribe(id: u64, channels: Vec<String>) -> Self {
        Frame::Subscribe { id, channels }
    }

    /// Create a new Unsubscribe frame.
    #[must_use]
    pub fn unsubscribe(id: u64, channels: Vec<String>) -> Self {
        Frame::Unsubscribe { id, channels }
    }

    /// Create a new Reset frame.
    #[must_use]
    pub fn reset(id: u64, channels: Vec<String>) -> Self {
        Frame::Reset { id, channels }
    }

    /// Create a new Results frame.
    #[must_use]
    pub fn results(id: u64, results: Vec<bool>) -> Self {
        Frame::Results { id, results }
    }

    /// Create a new Send frame.
    #[must_use]
    pub fn send(id: u64, channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Frame::Send {
            id,
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    /// Create a new Tickets frame.
    #[must_use]
    pub fn tickets(id: u64, tickets: Vec<String>) -> Self {
        Frame::Tickets { id, tickets }
    }

    /// Create a new Message frame.
    #[must_use]
    pub fn message(channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Frame::Message {
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create a new Connect frame.
    #[must_use]
    pub fn connect(version: u8) -> Self {
        Frame::Connect { version }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version,
            heartbeat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type() {
        let subscribe = Frame::subscribe(1, vec!["a".into()]);
        assert_eq!(subscribe.frame_type(), FrameType::Subscribe);

        let message = Frame::message("a", b"sealed".to_vec());
        assert_eq!(message.frame_type(), FrameType::Message);
    }

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::try_from(0x03), Ok(FrameType::Reset));
        assert_eq!(u8::from(FrameType::Tickets), 0x06);
        assert!(FrameType::try_from(0x00).is_err());
        assert!(FrameType::try_from(0x0D).is_err());
    }

    #[test]
    fn test_request_id() {
        assert_eq!(Frame::results(7, vec![true]).request_id(), Some(7));
        assert_eq!(Frame::tickets(9, vec![]).request_id(), Some(9));
        assert_eq!(Frame::message("a", vec![]).request_id(), None);
        assert_eq!(Frame::ping().request_id(), None);
    }
}

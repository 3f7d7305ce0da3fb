//! Capabilities supplied by the crypto collaborator.
//!
//! The engine never touches keys. It holds [`Receiver`]s while they are
//! subscribed and asks them to open inbound ciphertext; it asks [`Sender`]s
//! to seal outbound bodies. Both expose a stable channel id and the
//! [`Anonymous`] identity a transport routes on.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sigil_protocol::Body;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Stable identity routing inbound ciphertext to a receiver.
pub type ChannelId = String;

/// Sealed message bytes.
pub type Ciphertext = Bytes;

/// The public, receiver-independent identity of a channel.
///
/// Senders address it; transports route on its channel id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Anonymous {
    /// Channel id shared by every sender and receiver of the channel.
    pub channel_id: ChannelId,
    /// Public verification key of the channel.
    pub public_key: Vec<u8>,
}

impl Anonymous {
    /// Create an anonymous identity.
    #[must_use]
    pub fn new(channel_id: impl Into<ChannelId>, public_key: impl Into<Vec<u8>>) -> Self {
        Self {
            channel_id: channel_id.into(),
            public_key: public_key.into(),
        }
    }
}

impl fmt::Display for Anonymous {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.channel_id)
    }
}

/// Structured reasons a receiver refuses a ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecryptionError {
    /// The ciphertext could not be opened with the channel key.
    InvalidEncryption,
    /// The content opened but its signature does not verify.
    InvalidSignature,
    /// The content verified but is not a valid body.
    InvalidBody,
}

impl fmt::Display for DecryptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            DecryptionError::InvalidEncryption => "invalid-encryption",
            DecryptionError::InvalidSignature => "invalid-signature",
            DecryptionError::InvalidBody => "invalid-body",
        };
        f.write_str(code)
    }
}

/// Outcome of a decrypt call that did not fault.
#[derive(Debug, Clone, PartialEq)]
pub enum Decryption {
    /// The ciphertext opened to a body.
    Body(Body),
    /// The ciphertext was refused.
    Error(DecryptionError),
}

/// A crypto capability faulted rather than refusing input.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Sealing a body failed.
    #[error("Encryption failed: {0}")]
    Encrypt(String),

    /// Opening a ciphertext faulted.
    #[error("Decryption faulted: {0}")]
    Decrypt(String),

    /// Key material is unusable.
    #[error("Invalid key: {0}")]
    Key(String),

    /// Body encoding failed.
    #[error("Body encoding failed: {0}")]
    Body(#[from] sigil_protocol::ProtocolError),
}

/// Opens ciphertext addressed to one channel.
#[async_trait]
pub trait Receiver: Send + Sync + fmt::Debug {
    /// The channel this receiver listens on.
    fn channel_id(&self) -> &str;

    /// The public identity of the channel.
    fn anonymous(&self) -> Anonymous;

    /// Open a ciphertext.
    ///
    /// A refused ciphertext is `Ok(Decryption::Error(_))`; `Err` means the
    /// capability itself faulted.
    async fn decrypt(&self, ciphertext: &Ciphertext) -> Result<Decryption, CryptoError>;
}

/// Seals bodies for one channel.
#[async_trait]
pub trait Sender: Send + Sync + fmt::Debug {
    /// The channel this sender writes to.
    fn channel_id(&self) -> &str;

    /// The identity transports route sealed messages on.
    fn anonymous(&self) -> Anonymous;

    /// Seal a body.
    async fn encrypt(&self, body: &Body) -> Result<Ciphertext, CryptoError>;
}

/// A sender paired with the receiver its replies arrive on.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Where requests go.
    pub sender: Arc<dyn Sender>,
    /// Where replies come back.
    pub receiver: Arc<dyn Receiver>,
}

impl Connection {
    /// Pair a sender with a reply receiver.
    #[must_use]
    pub fn new(sender: Arc<dyn Sender>, receiver: Arc<dyn Receiver>) -> Self {
        Self { sender, receiver }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decryption_error_codes() {
        assert_eq!(
            DecryptionError::InvalidEncryption.to_string(),
            "invalid-encryption"
        );
        assert_eq!(
            serde_json::to_string(&DecryptionError::InvalidSignature).unwrap(),
            "\"invalid-signature\""
        );
    }

    #[test]
    fn test_anonymous_display() {
        let anon = Anonymous::new("abc", vec![1, 2, 3]);
        assert_eq!(anon.to_string(), "abc");
    }
}

//! Channel sender and receiver capabilities.

use async_trait::async_trait;
use ed25519_dalek::{SigningKey, VerifyingKey};
use sigil_core::{
    Anonymous, Ciphertext, CryptoError, Decryption, DecryptionError, Receiver, Sender,
};
use sigil_protocol::Body;
use std::fmt;
use tracing::trace;

use crate::seal::{generate_key, open, seal, Opened, SealKey};

/// Derive the channel id of a verifying key.
#[must_use]
pub fn channel_id_of(verifying: &VerifyingKey) -> String {
    hex::encode(blake3::hash(verifying.as_bytes()).as_bytes())
}

fn anonymous_of(channel_id: &str, verifying: &VerifyingKey) -> Anonymous {
    Anonymous::new(channel_id, verifying.to_bytes().to_vec())
}

/// Signs and seals bodies for one channel.
#[derive(Clone)]
pub struct ChannelSender {
    signing: SigningKey,
    key: SealKey,
    channel_id: String,
}

impl ChannelSender {
    /// Create a channel with fresh keys.
    #[must_use]
    pub fn create() -> Self {
        let mut rng = rand::thread_rng();
        Self::from_parts(SigningKey::generate(&mut rng), generate_key())
    }

    /// Create a channel from a signing seed and a symmetric key.
    #[must_use]
    pub fn from_seed(seed: &[u8; 32], key: SealKey) -> Self {
        Self::from_parts(SigningKey::from_bytes(seed), key)
    }

    fn from_parts(signing: SigningKey, key: SealKey) -> Self {
        let channel_id = channel_id_of(&signing.verifying_key());
        Self {
            signing,
            key,
            channel_id,
        }
    }

    /// Create the receiver that opens this channel's messages.
    #[must_use]
    pub fn new_receiver(&self) -> ChannelReceiver {
        ChannelReceiver::new(self.signing.verifying_key(), self.key)
    }

    /// Get the verifying key.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Seal raw bytes without body encoding.
    pub fn seal_bytes(&self, plaintext: &[u8]) -> Result<Ciphertext, CryptoError> {
        seal(&self.signing, &self.key, plaintext)
    }
}

#[async_trait]
impl Sender for ChannelSender {
    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn anonymous(&self) -> Anonymous {
        anonymous_of(&self.channel_id, &self.signing.verifying_key())
    }

    async fn encrypt(&self, body: &Body) -> Result<Ciphertext, CryptoError> {
        let plaintext = body.encode()?;
        let sealed = self.seal_bytes(&plaintext)?;
        trace!(channel = %self.channel_id, bytes = sealed.len(), "Sealed body");
        Ok(sealed)
    }
}

impl fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSender")
            .field("channel_id", &self.channel_id)
            .finish_non_exhaustive()
    }
}

/// Opens and verifies one channel's messages.
#[derive(Clone)]
pub struct ChannelReceiver {
    verifying: VerifyingKey,
    key: SealKey,
    channel_id: String,
}

impl ChannelReceiver {
    /// Create a receiver from the channel's verifying key and symmetric key.
    #[must_use]
    pub fn new(verifying: VerifyingKey, key: SealKey) -> Self {
        let channel_id = channel_id_of(&verifying);
        Self {
            verifying,
            key,
            channel_id,
        }
    }
}

#[async_trait]
impl Receiver for ChannelReceiver {
    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn anonymous(&self) -> Anonymous {
        anonymous_of(&self.channel_id, &self.verifying)
    }

    async fn decrypt(&self, ciphertext: &Ciphertext) -> Result<Decryption, CryptoError> {
        let plaintext = match open(&self.verifying, &self.key, ciphertext)? {
            Opened::Plaintext(plaintext) => plaintext,
            Opened::Refused(kind) => {
                trace!(channel = %self.channel_id, error = %kind, "Refused ciphertext");
                return Ok(Decryption::Error(kind));
            }
        };

        Ok(match Body::decode(&plaintext) {
            Ok(body) => Decryption::Body(body),
            Err(_) => Decryption::Error(DecryptionError::InvalidBody),
        })
    }
}

impl fmt::Debug for ChannelReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelReceiver")
            .field("channel_id", &self.channel_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_encrypt_decrypt() {
        let sender = ChannelSender::create();
        let receiver = sender.new_receiver();
        assert_eq!(Sender::channel_id(&sender), Receiver::channel_id(&receiver));

        let body = Body::Json(json!({ "op": "ping", "n": 1 }));
        let ciphertext = sender.encrypt(&body).await.unwrap();
        assert_eq!(receiver.decrypt(&ciphertext).await.unwrap(), Decryption::Body(body));
    }

    #[tokio::test]
    async fn test_other_channel_refused() {
        let sender = ChannelSender::create();
        let other = ChannelSender::create().new_receiver();

        let ciphertext = sender.encrypt(&Body::from("hi")).await.unwrap();
        assert_eq!(
            other.decrypt(&ciphertext).await.unwrap(),
            Decryption::Error(DecryptionError::InvalidEncryption)
        );
    }

    #[tokio::test]
    async fn test_forged_signature_refused() {
        let key = [3u8; 32];
        let honest = ChannelSender::from_seed(&[1u8; 32], key);
        let forger = ChannelSender::from_seed(&[2u8; 32], key);

        let ciphertext = forger.encrypt(&Body::from("hi")).await.unwrap();
        assert_eq!(
            honest.new_receiver().decrypt(&ciphertext).await.unwrap(),
            Decryption::Error(DecryptionError::InvalidSignature)
        );
    }

    #[tokio::test]
    async fn test_garbage_body_refused() {
        let sender = ChannelSender::create();
        let ciphertext = sender.seal_bytes(&[0xc1]).unwrap();
        assert_eq!(
            sender.new_receiver().decrypt(&ciphertext).await.unwrap(),
            Decryption::Error(DecryptionError::InvalidBody)
        );
    }

    #[test]
    fn test_channel_id_is_stable() {
        let a = ChannelSender::from_seed(&[5u8; 32], [0u8; 32]);
        let b = ChannelSender::from_seed(&[5u8; 32], [1u8; 32]);
        assert_eq!(Sender::channel_id(&a), Sender::channel_id(&b));
        assert_eq!(Sender::channel_id(&a).len(), 64);
        assert_eq!(a.anonymous().public_key, a.verifying_key().to_bytes().to_vec());
    }
}

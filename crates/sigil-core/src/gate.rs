//! The decryption gate.
//!
//! Turns a raw `(channel id, ciphertext)` pair into a [`Notification`].
//! Never fails: every outcome, including a faulting receiver, is a value.

use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::crypto::{Ciphertext, CryptoError, Decryption};
use crate::notification::Notification;
use crate::table::SubscriptionTable;

/// Classify an inbound ciphertext.
///
/// A refused ciphertext leaves the channel subscribed.
pub async fn interpret(
    table: &SubscriptionTable,
    channel_id: &str,
    ciphertext: &Ciphertext,
) -> Notification {
    let Some(receiver) = table.get(channel_id) else {
        debug!(channel = %channel_id, "Message for unknown channel");
        return Notification::unexpected_receiver(channel_id);
    };

    let opened = AssertUnwindSafe(receiver.decrypt(ciphertext))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            warn!(channel = %channel_id, "Decrypt panicked");
            Err(CryptoError::Decrypt(panic_message(panic.as_ref())))
        });

    match opened {
        Ok(Decryption::Body(body)) => {
            trace!(channel = %channel_id, "Decrypted message");
            Notification::Success {
                body,
                receiver,
                channel_id: channel_id.to_string(),
            }
        }
        Ok(Decryption::Error(kind)) => {
            debug!(channel = %channel_id, error = %kind, "Message refused by receiver");
            Notification::refused(kind, channel_id, receiver)
        }
        Err(err) => {
            debug!(channel = %channel_id, error = %err, "Decrypt faulted");
            Notification::decryption_failed(channel_id, receiver, Arc::new(err))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    match (panic.downcast_ref::<&str>(), panic.downcast_ref::<String>()) {
        (Some(message), _) => format!("panicked: {message}"),
        (_, Some(message)) => format!("panicked: {message}"),
        _ => "panicked".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Anonymous, CryptoError, DecryptionError, Receiver};
    use crate::notification::ErrorKind;
    use async_trait::async_trait;
    use bytes::Bytes;
    use sigil_protocol::Body;

    /// Opens `b"ok"`, refuses `b"bad"`, panics on `b"!!"`, faults on anything else.
    #[derive(Debug)]
    struct Picky;

    #[async_trait]
    impl Receiver for Picky {
        fn channel_id(&self) -> &str {
            "picky"
        }

        fn anonymous(&self) -> Anonymous {
            Anonymous::new("picky", Vec::new())
        }

        async fn decrypt(&self, ciphertext: &Ciphertext) -> Result<Decryption, CryptoError> {
            match &ciphertext[..] {
                b"ok" => Ok(Decryption::Body(Body::from("opened"))),
                b"bad" => Ok(Decryption::Error(DecryptionError::InvalidSignature)),
                b"!!" => panic!("key store unavailable"),
                _ => Err(CryptoError::Decrypt("boom".into())),
            }
        }
    }

    fn table() -> SubscriptionTable {
        let table = SubscriptionTable::new();
        table.insert_all([Arc::new(Picky) as Arc<dyn Receiver>]);
        table
    }

    #[tokio::test]
    async fn test_unknown_channel() {
        let n = interpret(&table(), "other", &Bytes::from_static(b"ok")).await;
        assert_eq!(n.error_kind(), Some(ErrorKind::UnexpectedReceiver));
        assert_eq!(n.channel_id(), Some("other"));
    }

    #[tokio::test]
    async fn test_success() {
        let n = interpret(&table(), "picky", &Bytes::from_static(b"ok")).await;
        assert_eq!(n.body(), Some(&Body::from("opened")));
    }

    #[tokio::test]
    async fn test_refused_keeps_subscription() {
        let table = table();
        let n = interpret(&table, "picky", &Bytes::from_static(b"bad")).await;

        let Notification::Error(err) = n else {
            panic!("expected error notification");
        };
        assert_eq!(
            err.kind,
            ErrorKind::Decryption(DecryptionError::InvalidSignature)
        );
        assert!(err.receiver.is_some());
        assert!(table.contains("picky"));
    }

    #[tokio::test]
    async fn test_fault_is_decryption_failed() {
        let n = interpret(&table(), "picky", &Bytes::from_static(b"??")).await;

        let Notification::Error(err) = n else {
            panic!("expected error notification");
        };
        assert_eq!(err.kind, ErrorKind::DecryptionFailed);
        assert_eq!(err.cause.unwrap().to_string(), "Decryption faulted: boom");
    }

    #[tokio::test]
    async fn test_panicking_decrypt_is_decryption_failed() {
        let table = table();
        let n = interpret(&table, "picky", &Bytes::from_static(b"!!")).await;

        let Notification::Error(err) = n else {
            panic!("expected error notification");
        };
        assert_eq!(err.kind, ErrorKind::DecryptionFailed);
        assert_eq!(
            err.cause.unwrap().to_string(),
            "Decryption faulted: panicked: key store unavailable"
        );
        assert!(table.contains("picky"));
    }
}

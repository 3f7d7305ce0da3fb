//! # sigil-crypto
//!
//! Concrete channel capabilities for the sigil engine.
//!
//! A channel is an Ed25519 key pair plus a shared symmetric key. The sender
//! signs each encoded body and seals signature and body with
//! ChaCha20-Poly1305; the receiver opens, verifies and decodes. The channel
//! id is the hex Blake3 digest of the verifying key.
//!
//! ```no_run
//! use sigil_crypto::ChannelSender;
//! use sigil_core::Connection;
//! use std::sync::Arc;
//!
//! let sender = ChannelSender::create();
//! let receiver = sender.new_receiver();
//! let connection = Connection::new(Arc::new(sender), Arc::new(receiver));
//! ```

pub mod channel;
pub mod seal;

pub use channel::{channel_id_of, ChannelReceiver, ChannelSender};
pub use seal::SealKey;

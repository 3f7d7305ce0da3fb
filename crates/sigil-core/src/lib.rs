//! # sigil-core
//!
//! Subscription engine for end-to-end encrypted channel notifications.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Engine** - Subscribe, send, and wait for replies over a pluggable transport
//! - **SubscriptionTable** - Which receivers the engine currently listens for
//! - **Gate** - Turns inbound ciphertext into notifications
//! - **Pipeline** - Ordered processors that consume every notification
//! - **Transport** - The contract a host's delivery mechanism implements
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  subscribe/send  ┌─────────────┐
//! │   Engine    │─────────────────▶│  Transport  │
//! └─────────────┘                  └─────────────┘
//!        │                                │ message
//!        ▼                                ▼
//! ┌─────────────┐     lookup      ┌─────────────┐
//! │    Table    │◀────────────────│    Gate     │
//! └─────────────┘                 └─────────────┘
//!                                        │ notification
//!                                        ▼
//!                                 ┌─────────────┐
//!                                 │  Pipeline   │
//!                                 └─────────────┘
//! ```

pub mod correlate;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod gate;
pub mod notification;
pub mod options;
pub mod pipeline;
pub mod table;
pub mod transport;

pub use crypto::{
    Anonymous, ChannelId, Ciphertext, Connection, CryptoError, Decryption, DecryptionError,
    Receiver, Sender,
};
pub use engine::{Engine, EngineConfig, PendingReply};
pub use error::{EngineError, Result};
pub use notification::{ErrorKind, Handling, Notification, NotificationError};
pub use options::{BodyFilter, CancelToken, ReceiveOptions, Scope, SubscribeOptions};
pub use pipeline::{processor, BoxError, Pipeline, Processor};
pub use table::SubscriptionTable;
pub use transport::{NullTransport, Ticket, Transport, TransportControl, TransportError, TransportResult};

pub use sigil_protocol::Body;

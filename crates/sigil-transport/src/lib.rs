//! # sigil-transport
//!
//! Transports for the sigil engine.
//!
//! - **Memory** - An in-process hub; engines attached to the same hub reach each other
//! - **WebSocket** - A client for the sigil relay server
//!
//! ## Usage
//!
//! Transports are built inside the engine's factory, which hands them the
//! control handle for inbound traffic.
//!
//! ```rust,ignore
//! use sigil_core::Engine;
//! use sigil_transport::MemoryHub;
//!
//! let hub = MemoryHub::new();
//! let alice = Engine::new(|control| hub.attach(control));
//! let bob = Engine::new(|control| hub.attach(control));
//! ```

pub mod memory;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{Delivery, MemoryHub, MemoryTransport};

#[cfg(feature = "websocket")]
pub use websocket::{connect, WebSocketConfig, WebSocketConnector, WebSocketTransport};

//! # sigil-server
//!
//! Relay for sigil clients: routes sealed messages between WebSocket
//! connections by channel id without ever opening them.

pub mod config;
pub mod handlers;
pub mod hub;
pub mod metrics;

pub use config::Config;
pub use handlers::{run_server, serve, AppState};
pub use hub::{Hub, HubConfig, HubStats};

//! Channel hub for the relay.
//!
//! Tracks which connections listen on which channel ids and fans sealed
//! messages out to them. The relay never looks inside a payload.

use dashmap::{DashMap, DashSet};
use sigil_core::table::validate_channel_id;
use sigil_protocol::Frame;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Per-connection queue of frames to write.
pub type Outbox = mpsc::UnboundedSender<Frame>;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum number of channels.
    pub max_channels: usize,
    /// Maximum subscriptions per connection.
    pub max_subscriptions_per_connection: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_channels: 10_000,
            max_subscriptions_per_connection: 100,
        }
    }
}

struct ConnectionEntry {
    outbox: Outbox,
    channels: DashSet<String>,
}

/// The relay's routing table.
pub struct Hub {
    /// Channel id -> listening connection ids.
    channels: DashMap<String, DashSet<String>>,
    /// Connection id -> outbox and subscribed channel ids.
    connections: DashMap<String, ConnectionEntry>,
    next_ticket: AtomicU64,
    config: HubConfig,
}

impl Hub {
    /// Create a hub with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    /// Create a hub with custom configuration.
    #[must_use]
    pub fn with_config(config: HubConfig) -> Self {
        info!("Creating hub with config: {:?}", config);
        Self {
            channels: DashMap::new(),
            connections: DashMap::new(),
            next_ticket: AtomicU64::new(1),
            config,
        }
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            channel_count: self.channels.len(),
            connection_count: self.connections.len(),
            total_subscriptions: self.connections.iter().map(|c| c.channels.len()).sum(),
        }
    }

    /// Register a connection and its outbox.
    pub fn connect(&self, connection_id: &str, outbox: Outbox) {
        self.connections.insert(
            connection_id.to_string(),
            ConnectionEntry {
                outbox,
                channels: DashSet::new(),
            },
        );
        debug!(connection = %connection_id, "Registered connection");
    }

    /// Drop a connection and all of its subscriptions.
    pub fn disconnect(&self, connection_id: &str) {
        if let Some((_, entry)) = self.connections.remove(connection_id) {
            for channel_id in entry.channels.iter() {
                self.detach(connection_id, channel_id.key());
            }
        }
        debug!(connection = %connection_id, "Unsubscribed from all channels");
    }

    fn detach(&self, connection_id: &str, channel_id: &str) {
        if let Some(listeners) = self.channels.get(channel_id) {
            listeners.remove(connection_id);
        }
        if self
            .channels
            .remove_if(channel_id, |_, listeners| listeners.is_empty())
            .is_some()
        {
            debug!(channel = %channel_id, "Deleted empty channel");
        }
    }

    fn subscribe_one(&self, connection_id: &str, channel_id: &str) -> bool {
        if let Err(reason) = validate_channel_id(channel_id) {
            debug!(connection = %connection_id, reason, "Rejected channel id");
            return false;
        }

        let Some(entry) = self.connections.get(connection_id) else {
            return false;
        };
        if entry.channels.contains(channel_id) {
            return true;
        }
        if entry.channels.len() >= self.config.max_subscriptions_per_connection {
            warn!(connection = %connection_id, "Maximum subscriptions reached");
            return false;
        }
        drop(entry);

        if !self.channels.contains_key(channel_id) && self.channels.len() >= self.config.max_channels {
            warn!(channel = %channel_id, "Maximum channels reached");
            return false;
        }

        self.channels
            .entry(channel_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
        if let Some(entry) = self.connections.get(connection_id) {
            entry.channels.insert(channel_id.to_string());
        }

        trace!(channel = %channel_id, connection = %connection_id, "Subscribed");
        true
    }

    fn unsubscribe_one(&self, connection_id: &str, channel_id: &str) -> bool {
        if validate_channel_id(channel_id).is_err() {
            return false;
        }
        let removed = self
            .connections
            .get(connection_id)
            .map(|entry| entry.channels.remove(channel_id).is_some());

        match removed {
            None => false,
            Some(was_subscribed) => {
                if was_subscribed {
                    self.detach(connection_id, channel_id);
                    trace!(channel = %channel_id, connection = %connection_id, "Unsubscribed");
                }
                true
            }
        }
    }

    /// Subscribe a connection to channels; one flag per channel.
    ///
    /// A flag is `false` for an invalid channel id or when a limit is hit.
    pub fn subscribe(&self, connection_id: &str, channel_ids: &[String]) -> Vec<bool> {
        channel_ids
            .iter()
            .map(|channel_id| self.subscribe_one(connection_id, channel_id))
            .collect()
    }

    /// Unsubscribe a connection from channels; one flag per channel.
    pub fn unsubscribe(&self, connection_id: &str, channel_ids: &[String]) -> Vec<bool> {
        channel_ids
            .iter()
            .map(|channel_id| self.unsubscribe_one(connection_id, channel_id))
            .collect()
    }

    /// Replace a connection's subscriptions with the given channels.
    pub fn reset(&self, connection_id: &str, channel_ids: &[String]) -> Vec<bool> {
        let current: Vec<String> = self
            .connections
            .get(connection_id)
            .map(|entry| entry.channels.iter().map(|c| c.clone()).collect())
            .unwrap_or_default();
        for channel_id in &current {
            self.unsubscribe_one(connection_id, channel_id);
        }
        self.subscribe(connection_id, channel_ids)
    }

    /// Queue a sealed message for every listener on a channel.
    ///
    /// Returns one ticket per listener; `error:queue-closed` for a listener
    /// whose connection is going away.
    pub fn publish(&self, channel_id: &str, payload: &[u8]) -> Vec<String> {
        let listeners: Vec<String> = self
            .channels
            .get(channel_id)
            .map(|set| set.iter().map(|c| c.clone()).collect())
            .unwrap_or_default();

        let tickets: Vec<String> = listeners
            .iter()
            .map(|connection_id| {
                let delivered = self.connections.get(connection_id).is_some_and(|entry| {
                    entry
                        .outbox
                        .send(Frame::message(channel_id, payload.to_vec()))
                        .is_ok()
                });
                if delivered {
                    let seq = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                    format!("{connection_id}:{seq}")
                } else {
                    "error:queue-closed".to_string()
                }
            })
            .collect();

        trace!(channel = %channel_id, recipients = tickets.len(), "Published message");
        tickets
    }

    /// Check if a channel has listeners.
    #[must_use]
    pub fn channel_exists(&self, channel_id: &str) -> bool {
        self.channels.contains_key(channel_id)
    }

    /// Get the listener count for a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel_id: &str) -> usize {
        self.channels.get(channel_id).map(|set| set.len()).unwrap_or(0)
    }

    /// Get the channels a connection listens on.
    #[must_use]
    pub fn connection_channels(&self, connection_id: &str) -> Vec<String> {
        self.connections
            .get(connection_id)
            .map(|entry| entry.channels.iter().map(|c| c.clone()).collect())
            .unwrap_or_default()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

/// Hub statistics.
#[derive(Debug, Clone)]
pub struct HubStats {
    /// Number of channels with listeners.
    pub channel_count: usize,
    /// Number of connected clients.
    pub connection_count: usize,
    /// Total number of subscriptions.
    pub total_subscriptions: usize,
}

//! In-process transport.
//!
//! A [`MemoryHub`] routes ciphertext between every engine attached to it,
//! without serialization or sockets. Used for tests and for wiring several
//! engines inside one process.

use async_trait::async_trait;
use dashmap::DashMap;
use sigil_core::table::validate_channel_id;
use sigil_core::{
    Anonymous, Ciphertext, Receiver, Ticket, Transport, TransportControl, TransportResult,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// How a send hands messages to recipients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Recipients process the message before `send` returns.
    #[default]
    Inline,
    /// Each recipient is handed the message on its own task.
    Spawned,
}

type EndpointId = u64;

/// Shared routing state for memory transports.
pub struct MemoryHub {
    delivery: Delivery,
    endpoints: DashMap<EndpointId, TransportControl>,
    channels: DashMap<String, HashSet<EndpointId>>,
    next_endpoint: AtomicU64,
    next_ticket: AtomicU64,
}

impl MemoryHub {
    /// Create a hub with inline delivery.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_delivery(Delivery::Inline)
    }

    /// Create a hub with the given delivery mode.
    #[must_use]
    pub fn with_delivery(delivery: Delivery) -> Arc<Self> {
        Arc::new(Self {
            delivery,
            endpoints: DashMap::new(),
            channels: DashMap::new(),
            next_endpoint: AtomicU64::new(1),
            next_ticket: AtomicU64::new(1),
        })
    }

    /// Attach an engine's control handle; use from the engine factory.
    pub fn attach(self: &Arc<Self>, control: TransportControl) -> MemoryTransport {
        let endpoint = self.next_endpoint.fetch_add(1, Ordering::Relaxed);
        self.endpoints.insert(endpoint, control);
        debug!(endpoint, "Endpoint attached");
        MemoryTransport {
            hub: Arc::clone(self),
            endpoint,
        }
    }

    /// Number of attached endpoints.
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Number of channels with at least one subscriber.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of endpoints subscribed to a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel_id: &str) -> usize {
        self.channels.get(channel_id).map_or(0, |set| set.len())
    }

    fn join(&self, endpoint: EndpointId, channel_id: &str) -> bool {
        if validate_channel_id(channel_id).is_err() {
            return false;
        }
        self.channels
            .entry(channel_id.to_string())
            .or_default()
            .insert(endpoint);
        true
    }

    fn leave(&self, endpoint: EndpointId, channel_id: &str) -> bool {
        if validate_channel_id(channel_id).is_err() {
            return false;
        }
        if let Some(mut set) = self.channels.get_mut(channel_id) {
            set.remove(&endpoint);
        }
        self.channels.remove_if(channel_id, |_, set| set.is_empty());
        true
    }

    fn leave_all(&self, endpoint: EndpointId) {
        for mut set in self.channels.iter_mut() {
            set.remove(&endpoint);
        }
        self.channels.retain(|_, set| !set.is_empty());
    }

    fn detach(&self, endpoint: EndpointId) {
        self.leave_all(endpoint);
        self.endpoints.remove(&endpoint);
        debug!(endpoint, "Endpoint detached");
    }

    fn recipients(&self, channel_id: &str) -> Vec<(EndpointId, Option<TransportControl>)> {
        let ids: Vec<EndpointId> = self
            .channels
            .get(channel_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        ids.into_iter()
            .map(|id| {
                let control = self.endpoints.get(&id).map(|entry| entry.value().clone());
                (id, control)
            })
            .collect()
    }
}

impl std::fmt::Debug for MemoryHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHub")
            .field("delivery", &self.delivery)
            .field("endpoints", &self.endpoints.len())
            .field("channels", &self.channels.len())
            .finish()
    }
}

/// One engine's handle on a [`MemoryHub`].
///
/// Detaches from the hub when dropped.
#[derive(Debug)]
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    endpoint: EndpointId,
}

impl MemoryTransport {
    /// Get the hub this transport is attached to.
    #[must_use]
    pub fn hub(&self) -> &Arc<MemoryHub> {
        &self.hub
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn subscribe(&self, receivers: &[Arc<dyn Receiver>]) -> TransportResult<Vec<bool>> {
        Ok(receivers
            .iter()
            .map(|receiver| self.hub.join(self.endpoint, receiver.channel_id()))
            .collect())
    }

    async fn unsubscribe(&self, receivers: &[Arc<dyn Receiver>]) -> TransportResult<Vec<bool>> {
        Ok(receivers
            .iter()
            .map(|receiver| self.hub.leave(self.endpoint, receiver.channel_id()))
            .collect())
    }

    async fn reset(&self, receivers: &[Arc<dyn Receiver>]) -> TransportResult<Vec<bool>> {
        self.hub.leave_all(self.endpoint);
        self.subscribe(receivers).await
    }

    async fn send(&self, channel: &Anonymous, ciphertext: Ciphertext) -> TransportResult<Vec<Ticket>> {
        let recipients = self.hub.recipients(&channel.channel_id);
        trace!(channel = %channel, recipients = recipients.len(), "Routing message");

        let mut tickets = Vec::with_capacity(recipients.len());
        for (endpoint, control) in recipients {
            let seq = self.hub.next_ticket.fetch_add(1, Ordering::Relaxed);
            let Some(control) = control.filter(TransportControl::is_attached) else {
                warn!(endpoint, channel = %channel, "Recipient is gone");
                tickets.push(Ticket::new(format!("error:detached:{endpoint}")));
                continue;
            };

            match self.hub.delivery {
                Delivery::Inline => {
                    control.message(&channel.channel_id, ciphertext.clone()).await;
                }
                Delivery::Spawned => {
                    let channel_id = channel.channel_id.clone();
                    let ciphertext = ciphertext.clone();
                    tokio::spawn(async move {
                        control.message(&channel_id, ciphertext).await;
                    });
                }
            }
            tickets.push(Ticket::new(format!("mem:{endpoint}:{seq}")));
        }

        Ok(tickets)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.hub.detach(self.endpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigil_core::{Body, Engine, ReceiveOptions, Scope, SubscribeOptions};
    use sigil_crypto::ChannelSender;
    use std::time::Duration;

    #[tokio::test]
    async fn test_subscribe_tracks_channels() {
        let hub = MemoryHub::new();
        let engine = Engine::new(|control| hub.attach(control));
        let channel = ChannelSender::create();
        let receiver: Arc<dyn Receiver> = Arc::new(channel.new_receiver());

        let results = engine
            .subscribe(&[Arc::clone(&receiver)], SubscribeOptions::default())
            .await
            .unwrap();
        assert_eq!(results, vec![true]);
        assert_eq!(hub.subscriber_count(receiver.channel_id()), 1);

        engine
            .unsubscribe(&[Arc::clone(&receiver)], SubscribeOptions::default())
            .await
            .unwrap();
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_send_without_subscribers() {
        let hub = MemoryHub::new();
        let engine = Engine::new(|control| hub.attach(control));
        let channel = ChannelSender::create();

        let result = engine.send(&channel, &Body::from("hi"), Scope::default()).await;
        assert!(matches!(result, Err(sigil_core::EngineError::NoReceivers)));
    }

    #[tokio::test]
    async fn test_delivery_between_engines() {
        let hub = MemoryHub::with_delivery(Delivery::Spawned);
        let alice = Engine::new(|control| hub.attach(control));
        let bob = Engine::new(|control| hub.attach(control));
        let channel = ChannelSender::create();

        let pending = bob
            .receive(
                Arc::new(channel.new_receiver()),
                ReceiveOptions::new().with_timeout(Duration::from_secs(5)),
            )
            .await
            .unwrap();

        let tickets = alice
            .send(&channel, &Body::from("hello bob"), Scope::default())
            .await
            .unwrap();
        assert_eq!(tickets.len(), 1);
        assert!(tickets[0].as_str().starts_with("mem:"));

        assert_eq!(pending.wait().await.unwrap(), Body::from("hello bob"));
        assert!(!bob.is_subscribed(channel.new_receiver().channel_id()));
    }

    #[tokio::test]
    async fn test_dropped_engine_detaches() {
        let hub = MemoryHub::new();
        let engine = Engine::new(|control| hub.attach(control));
        let receiver: Arc<dyn Receiver> = Arc::new(ChannelSender::create().new_receiver());
        engine
            .subscribe(&[receiver], SubscribeOptions::default())
            .await
            .unwrap();
        assert_eq!(hub.endpoint_count(), 1);

        drop(engine);
        assert_eq!(hub.endpoint_count(), 0);
        assert_eq!(hub.channel_count(), 0);
    }
}

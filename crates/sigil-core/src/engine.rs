//! The engine.
//!
//! Owns the subscription table and the processor pipeline, drives the
//! transport, and correlates outbound sends with inbound replies.
//!
//! Table-mutating calls (subscribe, unsubscribe, reset) are serialized by an
//! async gate held across the transport call: the table is diffed, the
//! transport asked, and the confirmed result applied as one step. A call
//! that is cancelled or times out before the transport answers leaves the
//! table untouched. The inbound path only reads the table and never waits
//! on the gate.

use serde::{Deserialize, Serialize};
use sigil_protocol::Body;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::correlate::correlate;
use crate::crypto::{Connection, Receiver, Sender};
use crate::error::{EngineError, Result};
use crate::notification::{Handling, Notification};
use crate::options::{BodyFilter, ReceiveOptions, Scope, SubscribeOptions, Window};
use crate::pipeline::{processor, Pipeline, Processor};
use crate::table::{validate_channel_id, SubscriptionTable};
use crate::transport::{NullTransport, Ticket, Transport, TransportControl};

/// Engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Timeout in milliseconds for calls that do not set their own.
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,
}

impl EngineConfig {
    /// Set the default timeout.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Get the default timeout.
    #[must_use]
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

pub(crate) struct Inner {
    config: EngineConfig,
    transport: Box<dyn Transport>,
    pub(crate) table: SubscriptionTable,
    pub(crate) pipeline: Pipeline,
    gate: tokio::sync::Mutex<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Subscribe,
    Unsubscribe,
}

/// The notification engine.
///
/// Cheap to clone; clones share one table, pipeline and transport.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Create an engine around the transport built by `factory`.
    pub fn new<T, F>(factory: F) -> Self
    where
        T: Transport + 'static,
        F: FnOnce(TransportControl) -> T,
    {
        Self::with_config(EngineConfig::default(), factory)
    }

    /// Create an engine with custom configuration.
    pub fn with_config<T, F>(config: EngineConfig, factory: F) -> Self
    where
        T: Transport + 'static,
        F: FnOnce(TransportControl) -> T,
    {
        let inner = Arc::new_cyclic(|engine| {
            let transport = factory(TransportControl {
                engine: engine.clone(),
            });
            info!(transport = transport.name(), config = ?config, "Creating engine");
            Inner {
                config,
                transport: Box::new(transport),
                table: SubscriptionTable::new(),
                pipeline: Pipeline::new(),
                gate: tokio::sync::Mutex::new(()),
            }
        });
        Self { inner }
    }

    /// Create an engine that cannot reach anyone.
    ///
    /// Subscriptions are never confirmed and sends fail.
    #[must_use]
    pub fn without_transport() -> Self {
        warn!("Transport is missing, notifications will not work");
        Self::new(|_| NullTransport)
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Get the processor pipeline.
    #[must_use]
    pub fn processors(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    /// Get the subscription table.
    #[must_use]
    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.inner.table
    }

    /// Check if a channel is currently subscribed.
    #[must_use]
    pub fn is_subscribed(&self, channel_id: &str) -> bool {
        self.inner.table.contains(channel_id)
    }

    fn window(&self, scope: &Scope) -> Window {
        Window::open(scope, self.inner.config.default_timeout())
    }

    /// Subscribe receivers.
    ///
    /// Returns one flag per input receiver, in order: `true` iff the
    /// transport was asked and confirmed. Without `force`, receivers that
    /// are already subscribed are not sent to the transport and report
    /// `false`.
    ///
    /// # Errors
    ///
    /// Returns an error if a channel id is invalid, the transport fails or
    /// answers short, or the call times out or is cancelled.
    pub async fn subscribe(
        &self,
        receivers: &[Arc<dyn Receiver>],
        opts: SubscribeOptions,
    ) -> Result<Vec<bool>> {
        let window = self.window(&opts.scope);
        self.change(receivers, opts.force, Change::Subscribe, &window)
            .await
    }

    /// Unsubscribe receivers.
    ///
    /// Mirror image of [`Engine::subscribe`]: without `force`, only
    /// receivers currently subscribed are sent to the transport.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::subscribe`].
    pub async fn unsubscribe(
        &self,
        receivers: &[Arc<dyn Receiver>],
        opts: SubscribeOptions,
    ) -> Result<Vec<bool>> {
        let window = self.window(&opts.scope);
        self.change(receivers, opts.force, Change::Unsubscribe, &window)
            .await
    }

    /// Replace all subscriptions with the given receivers.
    ///
    /// The transport is always called with the full list. Afterwards the
    /// table holds exactly the receivers the transport confirmed; every
    /// other entry is dropped.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::subscribe`].
    pub async fn reset(&self, receivers: &[Arc<dyn Receiver>], scope: Scope) -> Result<Vec<bool>> {
        validate(receivers)?;
        let window = self.window(&scope);
        let inner = &self.inner;

        window
            .guard(async {
                let _serial = inner.gate.lock().await;
                let pairs = correlate(receivers.iter().cloned(), |batch| async move {
                    inner.transport.reset(&batch).await.map_err(EngineError::from)
                })
                .await?;

                let kept: Vec<Arc<dyn Receiver>> = pairs
                    .into_iter()
                    .filter_map(|(receiver, confirmed)| confirmed.then_some(receiver))
                    .collect();
                let kept_ids: HashSet<String> = kept
                    .iter()
                    .map(|receiver| receiver.channel_id().to_string())
                    .collect();
                inner.table.replace_all(kept);

                Ok::<_, EngineError>(receivers
                    .iter()
                    .map(|receiver| kept_ids.contains(receiver.channel_id()))
                    .collect::<Vec<bool>>())
            })
            .await?
    }

    async fn change(
        &self,
        receivers: &[Arc<dyn Receiver>],
        force: bool,
        change: Change,
        window: &Window,
    ) -> Result<Vec<bool>> {
        if receivers.is_empty() {
            return Ok(Vec::new());
        }
        validate(receivers)?;
        let inner = &self.inner;

        window
            .guard(async {
                let _serial = inner.gate.lock().await;

                let candidates: Vec<Arc<dyn Receiver>> = receivers
                    .iter()
                    .filter(|receiver| {
                        force
                            || inner.table.contains(receiver.channel_id())
                                == (change == Change::Unsubscribe)
                    })
                    .cloned()
                    .collect();

                if candidates.is_empty() {
                    trace!(?change, count = receivers.len(), "Nothing to change");
                    return Ok(vec![false; receivers.len()]);
                }

                let pairs = correlate(candidates, |batch| async move {
                    match change {
                        Change::Subscribe => inner.transport.subscribe(&batch).await,
                        Change::Unsubscribe => inner.transport.unsubscribe(&batch).await,
                    }
                    .map_err(EngineError::from)
                })
                .await?;

                let changed: Vec<Arc<dyn Receiver>> = pairs
                    .into_iter()
                    .filter_map(|(receiver, confirmed)| confirmed.then_some(receiver))
                    .collect();
                let changed_ids: HashSet<String> = changed
                    .iter()
                    .map(|receiver| receiver.channel_id().to_string())
                    .collect();

                debug!(?change, requested = receivers.len(), changed = changed.len(), "Applied");
                match change {
                    Change::Subscribe => inner.table.insert_all(changed),
                    Change::Unsubscribe => inner
                        .table
                        .remove_all(changed_ids.iter().map(String::as_str)),
                }

                Ok::<_, EngineError>(receivers
                    .iter()
                    .map(|receiver| changed_ids.contains(receiver.channel_id()))
                    .collect::<Vec<bool>>())
            })
            .await?
    }

    /// Encrypt a body and send it to the sender's channel.
    ///
    /// A mix of failed and accepted tickets is returned as is.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoReceivers`] if no ticket came back,
    /// [`EngineError::AllReceiversFailed`] if every ticket is an error, or
    /// the encryption, transport, timeout or cancellation error.
    pub async fn send(&self, sender: &dyn Sender, body: &Body, scope: Scope) -> Result<Vec<Ticket>> {
        let window = self.window(&scope);
        self.send_within(sender, body, &window).await
    }

    async fn send_within(&self, sender: &dyn Sender, body: &Body, window: &Window) -> Result<Vec<Ticket>> {
        window
            .guard(async {
                let ciphertext = sender.encrypt(body).await?;
                let channel = sender.anonymous();
                trace!(channel = %channel, bytes = ciphertext.len(), "Sending");
                let tickets = self.inner.transport.send(&channel, ciphertext).await?;
                check_tickets(tickets)
            })
            .await?
    }

    /// Arm a wait for the next matching body on a receiver's channel.
    ///
    /// The listener is registered before the subscription is requested, so a
    /// reply that arrives while subscribing is not missed. Resolves once
    /// armed; await [`PendingReply::wait`] for the body.
    ///
    /// # Errors
    ///
    /// Returns the subscription error, after cleaning up.
    pub async fn receive(&self, receiver: Arc<dyn Receiver>, opts: ReceiveOptions) -> Result<PendingReply> {
        let window = self.window(&opts.scope);
        self.arm(receiver, opts.filter, window).await
    }

    async fn arm(
        &self,
        receiver: Arc<dyn Receiver>,
        filter: Option<BodyFilter>,
        window: Window,
    ) -> Result<PendingReply> {
        let (tx, rx) = oneshot::channel();
        let processor = reply_processor(receiver.channel_id().to_string(), filter, tx);
        self.inner.pipeline.add(Arc::clone(&processor));

        let mut cleanup = Cleanup {
            engine: self.clone(),
            processor,
            receiver: Arc::clone(&receiver),
            done: false,
        };

        debug!(channel = %receiver.channel_id(), "Arming reply wait");
        if let Err(err) = self
            .change(std::slice::from_ref(&receiver), false, Change::Subscribe, &window)
            .await
        {
            cleanup.abandon();
            return Err(err);
        }

        Ok(PendingReply {
            rx,
            window,
            cleanup,
        })
    }

    /// Send a body over a connection and wait for the reply on its receiver.
    ///
    /// The reply wait is fully armed before the send is issued, so replies
    /// delivered while the transport is still handling the send are kept.
    /// A failed send cancels the wait and is returned; if the wait settles
    /// first, the send is left to finish and its result dropped.
    ///
    /// # Errors
    ///
    /// Returns the send error, or the wait's subscription, timeout or
    /// cancellation error.
    pub async fn send_and_receive(
        &self,
        connection: &Connection,
        body: Body,
        opts: ReceiveOptions,
    ) -> Result<Body> {
        let window = self.window(&opts.scope);
        let (receive_window, receive_token) = window.child();

        let pending = self
            .arm(Arc::clone(&connection.receiver), opts.filter, receive_window)
            .await?;

        let mut send = {
            let engine = self.clone();
            let sender = Arc::clone(&connection.sender);
            let send_window = Window {
                deadline: window.deadline,
                cancel: None,
            };
            tokio::spawn(async move { engine.send_within(sender.as_ref(), &body, &send_window).await })
        };

        let reply = pending.wait();
        tokio::pin!(reply);

        tokio::select! {
            biased;
            result = &mut reply => result,
            sent = &mut send => {
                match sent.map_err(|err| EngineError::TaskFailed(err.to_string())).and_then(|sent| sent) {
                    Ok(tickets) => {
                        trace!(tickets = tickets.len(), "Request sent, awaiting reply");
                        reply.await
                    }
                    Err(err) => {
                        debug!(error = %err, "Request failed, abandoning reply wait");
                        receive_token.cancel();
                        let _ = reply.await;
                        Err(err)
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("transport", &self.inner.transport.name())
            .field("subscriptions", &self.inner.table.len())
            .field("processors", &self.inner.pipeline.len())
            .finish()
    }
}

fn validate(receivers: &[Arc<dyn Receiver>]) -> Result<()> {
    for receiver in receivers {
        validate_channel_id(receiver.channel_id()).map_err(|reason| {
            EngineError::InvalidArgument(format!("{reason}: {:?}", receiver.channel_id()))
        })?;
    }
    Ok(())
}

fn check_tickets(tickets: Vec<Ticket>) -> Result<Vec<Ticket>> {
    if tickets.is_empty() {
        return Err(EngineError::NoReceivers);
    }
    if tickets.iter().all(Ticket::is_error) {
        return Err(EngineError::AllReceiversFailed { tickets });
    }
    Ok(tickets)
}

/// Settle `tx` with the first matching success on `channel_id`.
fn reply_processor(
    channel_id: String,
    filter: Option<BodyFilter>,
    tx: oneshot::Sender<Body>,
) -> Arc<dyn Processor> {
    let slot = Mutex::new(Some(tx));
    processor(move |notification| {
        let Notification::Success {
            body,
            channel_id: arrived,
            ..
        } = notification
        else {
            return Ok(Handling::Unhandled);
        };
        if *arrived != channel_id || !filter.as_ref().map_or(true, |accept| accept(body)) {
            return Ok(Handling::Unhandled);
        }
        match slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
            Some(tx) => {
                let _ = tx.send(body.clone());
                Ok(Handling::Handled)
            }
            None => Ok(Handling::Unhandled),
        }
    })
}

/// Removes a reply wait's processor and subscription exactly once.
///
/// The processor goes synchronously; only the unsubscribe may wait on the
/// transport.
struct Cleanup {
    engine: Engine,
    processor: Arc<dyn Processor>,
    receiver: Arc<dyn Receiver>,
    done: bool,
}

impl Cleanup {
    /// Claim the cleanup and drop the processor; `false` if already claimed.
    fn begin(&mut self) -> bool {
        if self.done {
            return false;
        }
        self.done = true;
        self.engine.inner.pipeline.remove(&self.processor);
        true
    }

    /// Clean up, waiting for the unsubscribe until `deadline`.
    ///
    /// An unsubscribe still outstanding at the deadline continues in the
    /// background.
    async fn run(&mut self, deadline: Option<Instant>) {
        if !self.begin() {
            return;
        }
        let window = Window {
            deadline,
            cancel: None,
        };
        let receivers = [Arc::clone(&self.receiver)];
        match self
            .engine
            .change(&receivers, false, Change::Unsubscribe, &window)
            .await
        {
            Ok(_) => {}
            Err(EngineError::Timeout) => {
                debug!(channel = %self.receiver.channel_id(), "Unsubscribe outlived the wait");
                self.spawn_unsubscribe();
            }
            Err(err) => {
                warn!(channel = %self.receiver.channel_id(), error = %err, "Unsubscribe after wait failed");
            }
        }
    }

    /// Clean up without waiting: the unsubscribe runs in the background.
    fn abandon(&mut self) {
        if self.begin() {
            self.spawn_unsubscribe();
        }
    }

    fn spawn_unsubscribe(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(channel = %self.receiver.channel_id(), "Abandoned wait left subscribed, no runtime");
            return;
        };
        let engine = self.engine.clone();
        let receiver = Arc::clone(&self.receiver);
        runtime.spawn(async move {
            if let Err(err) = engine.unsubscribe(&[receiver], SubscribeOptions::default()).await {
                warn!(error = %err, "Unsubscribe of abandoned wait failed");
            }
        });
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        self.abandon();
    }
}

/// An armed reply wait.
///
/// Dropping it without waiting removes the listener at once and unsubscribes
/// in the background.
pub struct PendingReply {
    rx: oneshot::Receiver<Body>,
    window: Window,
    cleanup: Cleanup,
}

impl PendingReply {
    /// The channel the reply is expected on.
    #[must_use]
    pub fn channel_id(&self) -> &str {
        self.cleanup.receiver.channel_id()
    }

    /// Wait for the reply body.
    ///
    /// The listener is removed before returning, whatever the outcome. After
    /// a body arrives the unsubscribe is awaited within the wait's deadline;
    /// after a timeout or cancellation it is left to the background so the
    /// error surfaces at once.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Timeout`] or [`EngineError::Cancelled`] if the
    /// wait is cut short.
    pub async fn wait(mut self) -> Result<Body> {
        let outcome = self.window.guard(&mut self.rx).await;

        match outcome {
            Ok(Ok(body)) => {
                self.cleanup.run(self.window.deadline).await;
                Ok(body)
            }
            // Listener removed from the pipeline by someone else.
            Ok(Err(_)) => {
                self.cleanup.abandon();
                Err(EngineError::Cancelled)
            }
            Err(err) => {
                debug!(channel = %self.channel_id(), error = %err, "Reply wait ended");
                self.cleanup.abandon();
                Err(err)
            }
        }
    }
}

impl fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReply")
            .field("channel_id", &self.channel_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_tickets() {
        assert!(matches!(check_tickets(vec![]), Err(EngineError::NoReceivers)));

        let failed = vec![Ticket::from("error:a"), Ticket::from("error:b")];
        match check_tickets(failed.clone()) {
            Err(EngineError::AllReceiversFailed { tickets }) => assert_eq!(tickets, failed),
            other => panic!("expected AllReceiversFailed, got {other:?}"),
        }

        let mixed = vec![Ticket::from("error:a"), Ticket::from("ok")];
        assert_eq!(check_tickets(mixed.clone()).unwrap(), mixed);
    }

    #[test]
    fn test_engine_config_default_timeout() {
        let config: EngineConfig = serde_json::from_str(r#"{ "default_timeout_ms": 1500 }"#).unwrap();
        assert_eq!(config.default_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(EngineConfig::default().default_timeout(), None);
        assert_eq!(
            EngineConfig::default()
                .with_default_timeout(Duration::from_secs(2))
                .default_timeout_ms,
            Some(2000)
        );
    }

    #[test]
    fn test_default_timeout_saturates() {
        let config = EngineConfig::default().with_default_timeout(Duration::MAX);
        assert_eq!(config.default_timeout_ms, Some(u64::MAX));
    }

    #[tokio::test]
    async fn test_without_transport() {
        let engine = Engine::without_transport();
        assert!(engine.subscribe(&[], SubscribeOptions::default()).await.unwrap().is_empty());
        assert!(engine.subscriptions().is_empty());
    }
}

//! WebSocket client transport for the sigil relay.
//!
//! [`connect`] performs the handshake; [`WebSocketConnector::attach`] turns
//! the open socket into a [`Transport`] inside the engine factory. A reader
//! task routes replies to waiting requests and feeds inbound messages to the
//! engine; a writer task owns the socket sink and keeps the heartbeat.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use sigil_core::{
    Anonymous, Ciphertext, Receiver, Ticket, Transport, TransportControl, TransportError,
    TransportResult,
};
use sigil_protocol::{codec, Frame, ProtocolError, PROTOCOL_VERSION};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Relay URL.
    pub url: String,
    /// How long a request waits for its reply.
    pub request_timeout: Duration,
    /// Maximum message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            request_timeout: Duration::from_secs(10),
            max_message_size: 1024 * 1024, // 1 MB
        }
    }
}

impl WebSocketConfig {
    /// Create a config for the given relay URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

async fn write_frame(sink: &mut WsSink, frame: &Frame) -> TransportResult<()> {
    let data = codec::encode(frame)?;
    sink.send(Message::Binary(data.to_vec()))
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))
}

/// Read the next frame; `None` once the socket is closed.
async fn read_frame(
    stream: &mut WsSource,
    buffer: &mut BytesMut,
    max_message_size: usize,
) -> TransportResult<Option<Frame>> {
    loop {
        if let Some(frame) = codec::decode_from(buffer)? {
            return Ok(Some(frame));
        }

        match stream.next().await {
            Some(Ok(Message::Binary(data))) => {
                if data.len() > max_message_size {
                    warn!(size = data.len(), max = max_message_size, "Message too large");
                    return Err(ProtocolError::FrameTooLarge(data.len()).into());
                }
                buffer.extend_from_slice(&data);
            }
            Some(Ok(Message::Text(text))) => {
                buffer.extend_from_slice(text.as_bytes());
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
            Some(Ok(Message::Close(_))) | Some(Err(WsError::ConnectionClosed)) | None => {
                return Ok(None);
            }
            Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
        }
    }
}

/// Open a connection to a relay and complete the handshake.
///
/// # Errors
///
/// Returns an error if the socket cannot be opened, the relay refuses the
/// protocol version, or the handshake does not finish in time.
pub async fn connect(config: WebSocketConfig) -> TransportResult<WebSocketConnector> {
    info!(url = %config.url, "Connecting to relay");

    let (ws, _) = tokio::time::timeout(config.request_timeout, connect_async(config.url.as_str()))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::Other(format!("WebSocket handshake failed: {e}")))?;
    let (mut sink, mut stream) = ws.split();

    write_frame(&mut sink, &Frame::connect(PROTOCOL_VERSION.major)).await?;

    let mut buffer = BytesMut::with_capacity(4096);
    let handshake = tokio::time::timeout(
        config.request_timeout,
        read_frame(&mut stream, &mut buffer, config.max_message_size),
    )
    .await
    .map_err(|_| TransportError::Timeout)??;

    match handshake {
        Some(Frame::Connected {
            connection_id,
            version,
            heartbeat,
        }) => {
            info!(connection_id = %connection_id, version, "Connected to relay");
            Ok(WebSocketConnector {
                config,
                sink,
                stream,
                buffer,
                connection_id,
                heartbeat: Duration::from_millis(u64::from(heartbeat)),
            })
        }
        Some(Frame::Error { code, message, .. }) => Err(TransportError::Remote { code, message }),
        Some(other) => Err(TransportError::Other(format!(
            "Unexpected handshake frame: {:?}",
            other.frame_type()
        ))),
        None => Err(TransportError::ConnectionClosed),
    }
}

/// An open, handshaken relay connection not yet bound to an engine.
pub struct WebSocketConnector {
    config: WebSocketConfig,
    sink: WsSink,
    stream: WsSource,
    buffer: BytesMut,
    connection_id: String,
    heartbeat: Duration,
}

impl WebSocketConnector {
    /// Connection id assigned by the relay.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Bind the connection to an engine; use from the engine factory.
    ///
    /// Must be called within a tokio runtime.
    pub fn attach(self, control: TransportControl) -> WebSocketTransport {
        let (outbound, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            open: AtomicBool::new(true),
            outbound,
        });

        let writer = tokio::spawn(write_loop(
            self.sink,
            rx,
            self.heartbeat,
            Arc::clone(&shared),
            control.clone(),
        ));
        let reader = tokio::spawn(read_loop(
            self.stream,
            self.buffer,
            self.config.max_message_size,
            Arc::clone(&shared),
            control,
        ));

        WebSocketTransport {
            shared,
            config: self.config,
            connection_id: self.connection_id,
            tasks: [reader, writer],
        }
    }
}

impl std::fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnector")
            .field("url", &self.config.url)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

struct Shared {
    pending: DashMap<u64, oneshot::Sender<Frame>>,
    next_id: AtomicU64,
    open: AtomicBool,
    outbound: mpsc::UnboundedSender<Frame>,
}

impl Shared {
    /// Hand a reply to its waiting request.
    fn complete(&self, id: u64, frame: Frame) -> bool {
        match self.pending.remove(&id) {
            Some((_, tx)) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        // Dropping the senders wakes every waiter with a closed error.
        self.pending.clear();
    }
}

/// Removes a request's slot if the request is dropped before its reply.
struct Slot<'a> {
    pending: &'a DashMap<u64, oneshot::Sender<Frame>>,
    id: u64,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

async fn write_loop(
    mut sink: WsSink,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    heartbeat: Duration,
    shared: Arc<Shared>,
    control: TransportControl,
) {
    let mut ticker = (!heartbeat.is_zero()).then(|| tokio::time::interval(heartbeat));

    loop {
        let frame = tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = async {
                match ticker.as_mut() {
                    Some(ticker) => ticker.tick().await,
                    None => std::future::pending().await,
                }
            } => Frame::ping(),
        };

        if let Err(e) = write_frame(&mut sink, &frame).await {
            shared.close();
            control.error(e);
            break;
        }
    }

    let _ = sink.close().await;
    debug!("Writer stopped");
}

async fn read_loop(
    mut stream: WsSource,
    mut buffer: BytesMut,
    max_message_size: usize,
    shared: Arc<Shared>,
    control: TransportControl,
) {
    loop {
        match read_frame(&mut stream, &mut buffer, max_message_size).await {
            Ok(Some(frame)) => handle_frame(frame, &shared, &control).await,
            Ok(None) => {
                debug!("Relay closed the connection");
                shared.close();
                control.error(TransportError::ConnectionClosed);
                break;
            }
            Err(e) => {
                error!(error = %e, "Relay connection failed");
                shared.close();
                control.error(e);
                break;
            }
        }
    }
}

async fn handle_frame(frame: Frame, shared: &Shared, control: &TransportControl) {
    match frame {
        Frame::Message { channel, payload } => {
            let handled = control.message(&channel, Bytes::from(payload)).await;
            trace!(channel = %channel, handled = handled.is_handled(), "Message delivered");
        }
        Frame::Results { id, .. } | Frame::Tickets { id, .. } => {
            if !shared.complete(id, frame) {
                debug!(id, "Reply for unknown request");
            }
        }
        Frame::Error { id, code, message } => {
            let frame = Frame::Error {
                id,
                code,
                message: message.clone(),
            };
            if id == 0 || !shared.complete(id, frame) {
                control.error(TransportError::Remote { code, message });
            }
        }
        Frame::Ping { timestamp } => {
            let _ = shared.outbound.send(Frame::pong(timestamp));
        }
        Frame::Pong { .. } | Frame::Connected { .. } => {}
        other => {
            warn!(frame_type = ?other.frame_type(), "Unexpected frame from relay");
        }
    }
}

/// Engine transport over a relay connection.
///
/// Dropping it stops the connection's tasks.
pub struct WebSocketTransport {
    shared: Arc<Shared>,
    config: WebSocketConfig,
    connection_id: String,
    tasks: [JoinHandle<()>; 2],
}

impl WebSocketTransport {
    /// Connection id assigned by the relay.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Check if the connection is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    async fn request(&self, build: impl FnOnce(u64) -> Frame) -> TransportResult<Frame> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id, tx);
        let _slot = Slot {
            pending: &self.shared.pending,
            id,
        };

        self.shared
            .outbound
            .send(build(id))
            .map_err(|_| TransportError::ConnectionClosed)?;

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Ok(Ok(Frame::Error { code, message, .. })) => {
                Err(TransportError::Remote { code, message })
            }
            Ok(Ok(frame)) => Ok(frame),
        }
    }

    async fn batch(
        &self,
        build: fn(u64, Vec<String>) -> Frame,
        receivers: &[Arc<dyn Receiver>],
    ) -> TransportResult<Vec<bool>> {
        let channels = receivers
            .iter()
            .map(|receiver| receiver.channel_id().to_string())
            .collect();

        match self.request(|id| build(id, channels)).await? {
            Frame::Results { results, .. } => Ok(results),
            other => Err(TransportError::Other(format!(
                "Expected results, got {:?}",
                other.frame_type()
            ))),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn subscribe(&self, receivers: &[Arc<dyn Receiver>]) -> TransportResult<Vec<bool>> {
        self.batch(Frame::subscribe, receivers).await
    }

    async fn unsubscribe(&self, receivers: &[Arc<dyn Receiver>]) -> TransportResult<Vec<bool>> {
        self.batch(Frame::unsubscribe, receivers).await
    }

    async fn reset(&self, receivers: &[Arc<dyn Receiver>]) -> TransportResult<Vec<bool>> {
        self.batch(Frame::reset, receivers).await
    }

    async fn send(&self, channel: &Anonymous, ciphertext: Ciphertext) -> TransportResult<Vec<Ticket>> {
        let channel_id = channel.channel_id.clone();
        let payload = ciphertext.to_vec();

        match self.request(|id| Frame::send(id, channel_id, payload)).await? {
            Frame::Tickets { tickets, .. } => Ok(tickets.into_iter().map(Ticket::from).collect()),
            other => Err(TransportError::Other(format!(
                "Expected tickets, got {:?}",
                other.frame_type()
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.shared.close();
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("url", &self.config.url)
            .field("connection_id", &self.connection_id)
            .field("open", &self.is_open())
            .field("pending", &self.shared.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> (Arc<Shared>, mpsc::UnboundedReceiver<Frame>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            open: AtomicBool::new(true),
            outbound,
        });
        (shared, rx)
    }

    #[test]
    fn test_websocket_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.url, "ws://127.0.0.1:8080/ws");
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(WebSocketConfig::new("ws://relay:9000/ws").url, "ws://relay:9000/ws");
    }

    #[tokio::test]
    async fn test_complete_routes_by_id() {
        let (shared, _rx) = shared();
        let (tx, rx) = oneshot::channel();
        shared.pending.insert(7, tx);

        assert!(!shared.complete(8, Frame::results(8, vec![true])));
        assert!(shared.complete(7, Frame::results(7, vec![true, false])));
        assert_eq!(rx.await.unwrap(), Frame::results(7, vec![true, false]));
        assert!(shared.pending.is_empty());
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let (shared, _rx) = shared();
        let (tx, rx) = oneshot::channel();
        shared.pending.insert(1, tx);

        shared.close();
        assert!(rx.await.is_err());
        assert!(!shared.open.load(Ordering::SeqCst));
    }

    #[test]
    fn test_slot_removed_on_drop() {
        let (shared, _rx) = shared();
        let (tx, _rx) = oneshot::channel();
        shared.pending.insert(3, tx);
        drop(Slot {
            pending: &shared.pending,
            id: 3,
        });
        assert!(shared.pending.is_empty());
    }
}

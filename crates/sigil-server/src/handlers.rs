//! Connection handlers for the relay.
//!
//! This module handles the connection lifecycle and frame processing.

use crate::config::Config;
use crate::hub::Hub;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use sigil_core::table::validate_channel_id;
use sigil_protocol::{codec, frames::codes, Frame, PROTOCOL_VERSION};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

type WsSink = SplitSink<WebSocket, Message>;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Shared server state.
pub struct AppState {
    /// The channel hub.
    pub hub: Hub,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            hub: Hub::with_config(config.hub_config()),
            config,
        }
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;
    serve(listener, config).await
}

/// Serve the relay on an already bound listener.
///
/// # Errors
///
/// Returns an error if serving fails.
pub async fn serve(listener: TcpListener, config: Config) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("Sigil relay listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let state = Arc::new(AppState::new(config));
    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.connection_count,
        "channels": stats.channel_count,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let max = state.config.limits.max_message_size;
    ws.max_message_size(max)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = format!("conn_{}", NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed));
    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();
    let mut read_buffer = BytesMut::with_capacity(4096);

    let heartbeat = Duration::from_millis(state.config.heartbeat.interval_ms.max(1));
    let idle_timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);

    // Handshake: the client speaks first.
    match tokio::time::timeout(idle_timeout, next_frame(&mut receiver, &mut read_buffer)).await {
        Ok(Some(Frame::Connect { version })) if PROTOCOL_VERSION.accepts_wire(version) => {
            let connected = Frame::connected(
                &connection_id,
                PROTOCOL_VERSION.major,
                state.config.heartbeat.interval_ms as u32,
            );
            if send_frame(&mut sender, &connected).await.is_err() {
                error!(connection = %connection_id, "Failed to send Connected frame");
                return;
            }
        }
        Ok(Some(Frame::Connect { version })) => {
            warn!(connection = %connection_id, version, "Unsupported protocol version");
            let refusal = Frame::error(0, codes::VERSION, format!("Unsupported protocol version {version}"));
            let _ = send_frame(&mut sender, &refusal).await;
            return;
        }
        Ok(Some(other)) => {
            warn!(connection = %connection_id, frame_type = ?other.frame_type(), "Expected Connect frame");
            let _ = send_frame(&mut sender, &Frame::error(0, codes::UNEXPECTED, "Expected connect")).await;
            return;
        }
        Ok(None) | Err(_) => {
            debug!(connection = %connection_id, "Handshake not completed");
            return;
        }
    }

    let (outbox, mut inbox) = mpsc::unbounded_channel::<Frame>();
    state.hub.connect(&connection_id, outbox);

    let mut ticker = tokio::time::interval(heartbeat);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            biased;

            // Messages routed to this connection by the hub
            Some(frame) = inbox.recv() => {
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }

            _ = ticker.tick() => {
                if last_seen.elapsed() > idle_timeout {
                    debug!(connection = %connection_id, "Heartbeat timed out");
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        last_seen = Instant::now();
                        metrics::record_frame(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);
                        if !drain_frames(&mut read_buffer, &connection_id, &state, &mut sender).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        read_buffer.extend_from_slice(text.as_bytes());
                        if !drain_frames(&mut read_buffer, &connection_id, &state, &mut sender).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_seen = Instant::now();
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    state.hub.disconnect(&connection_id);
    let stats = state.hub.stats();
    metrics::set_hub_stats(stats.channel_count, stats.total_subscriptions);

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Read frames until one is complete; `None` once the socket is done.
async fn next_frame(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    buffer: &mut BytesMut,
) -> Option<Frame> {
    loop {
        match codec::decode_from(buffer) {
            Ok(Some(frame)) => return Some(frame),
            Ok(None) => {}
            Err(_) => return None,
        }
        match receiver.next().await {
            Some(Ok(Message::Binary(data))) => buffer.extend_from_slice(&data),
            Some(Ok(Message::Text(text))) => buffer.extend_from_slice(text.as_bytes()),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
        }
    }
}

/// Handle every complete frame in the buffer.
///
/// Returns `false` if the connection should be closed.
async fn drain_frames(
    buffer: &mut BytesMut,
    connection_id: &str,
    state: &AppState,
    sender: &mut WsSink,
) -> bool {
    let start = Instant::now();
    loop {
        let frame = match codec::decode_from(buffer) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "Malformed frame");
                metrics::record_error("decode");
                let _ = send_frame(sender, &Frame::error(0, codes::MALFORMED, e.to_string())).await;
                return false;
            }
        };

        if let Some(reply) = handle_frame(frame, connection_id, state) {
            if send_frame(sender, &reply).await.is_err() {
                return false;
            }
        }
    }
    metrics::record_latency(start.elapsed().as_secs_f64());
    true
}

/// Handle a decoded frame, returning the reply to send, if any.
fn handle_frame(frame: Frame, connection_id: &str, state: &AppState) -> Option<Frame> {
    let hub = &state.hub;
    let reply = match frame {
        Frame::Subscribe { id, channels } => {
            debug!(connection = %connection_id, count = channels.len(), "Subscribe request");
            Frame::results(id, hub.subscribe(connection_id, &channels))
        }

        Frame::Unsubscribe { id, channels } => {
            debug!(connection = %connection_id, count = channels.len(), "Unsubscribe request");
            Frame::results(id, hub.unsubscribe(connection_id, &channels))
        }

        Frame::Reset { id, channels } => {
            debug!(connection = %connection_id, count = channels.len(), "Reset request");
            Frame::results(id, hub.reset(connection_id, &channels))
        }

        Frame::Send { id, channel, payload } => {
            if payload.len() > state.config.limits.max_message_size {
                metrics::record_error("too_large");
                return Some(Frame::error(id, codes::TOO_LARGE, "Payload too large"));
            }
            if let Err(reason) = validate_channel_id(&channel) {
                return Some(Frame::error(id, codes::MALFORMED, reason));
            }

            let tickets = hub.publish(&channel, &payload);
            metrics::record_tickets(&tickets);
            trace!(connection = %connection_id, channel = %channel, recipients = tickets.len(), "Sent");
            Frame::tickets(id, tickets)
        }

        Frame::Ping { timestamp } => Frame::pong(timestamp),

        Frame::Pong { .. } => return None,

        other => {
            warn!(connection = %connection_id, frame_type = ?other.frame_type(), "Unexpected frame type");
            Frame::error(other.request_id().unwrap_or(0), codes::UNEXPECTED, "Unexpected frame")
        }
    };

    if matches!(reply, Frame::Results { .. }) {
        let stats = hub.stats();
        metrics::set_hub_stats(stats.channel_count, stats.total_subscriptions);
    }
    Some(reply)
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut WsSink, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_frame(data.len(), "outbound");
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AppState {
        let mut config = Config::default();
        config.limits.max_message_size = 16;
        let state = AppState::new(config);
        let (tx, _rx) = mpsc::unbounded_channel();
        state.hub.connect("conn-test", tx);
        state
    }

    #[test]
    fn test_subscribe_answers_results() {
        let state = state();
        let reply = handle_frame(
            Frame::subscribe(4, vec!["a".into(), String::new()]),
            "conn-test",
            &state,
        );
        assert_eq!(reply, Some(Frame::results(4, vec![true, false])));
    }

    #[test]
    fn test_send_limits() {
        let state = state();
        let reply = handle_frame(Frame::send(5, "a", vec![0u8; 17]), "conn-test", &state);
        assert!(matches!(reply, Some(Frame::Error { id: 5, code: codes::TOO_LARGE, .. })));

        let reply = handle_frame(Frame::send(6, "", vec![1]), "conn-test", &state);
        assert!(matches!(reply, Some(Frame::Error { id: 6, code: codes::MALFORMED, .. })));

        let reply = handle_frame(Frame::send(7, "a", vec![1]), "conn-test", &state);
        assert_eq!(reply, Some(Frame::tickets(7, vec![])));
    }

    #[test]
    fn test_ping_and_unexpected() {
        let state = state();
        assert_eq!(
            handle_frame(Frame::Ping { timestamp: Some(9) }, "conn-test", &state),
            Some(Frame::pong(Some(9)))
        );
        assert_eq!(handle_frame(Frame::pong(None), "conn-test", &state), None);
        assert!(matches!(
            handle_frame(Frame::results(3, vec![]), "conn-test", &state),
            Some(Frame::Error { id: 3, code: codes::UNEXPECTED, .. })
        ));
    }
}

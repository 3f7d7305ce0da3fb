//! Metrics collection and export for the relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "sigil_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "sigil_connections_active";
    pub const FRAMES_TOTAL: &str = "sigil_frames_total";
    pub const FRAMES_BYTES: &str = "sigil_frames_bytes";
    pub const CHANNELS_ACTIVE: &str = "sigil_channels_active";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "sigil_subscriptions_active";
    pub const TICKETS_TOTAL: &str = "sigil_tickets_total";
    pub const LATENCY_SECONDS: &str = "sigil_latency_seconds";
    pub const ERRORS_TOTAL: &str = "sigil_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames processed");
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Current number of channels with listeners");
    metrics::describe_gauge!(
        names::SUBSCRIPTIONS_ACTIVE,
        "Current number of channel subscriptions"
    );
    metrics::describe_counter!(names::TICKETS_TOTAL, "Total number of send tickets issued");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Frame processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record frame handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record issued send tickets.
pub fn record_tickets(tickets: &[String]) {
    let failed = tickets.iter().filter(|t| t.starts_with("error")).count();
    counter!(names::TICKETS_TOTAL, "outcome" => "accepted").increment((tickets.len() - failed) as u64);
    counter!(names::TICKETS_TOTAL, "outcome" => "failed").increment(failed as u64);
}

/// Update channel and subscription gauges.
pub fn set_hub_stats(channels: usize, subscriptions: usize) {
    gauge!(names::CHANNELS_ACTIVE).set(channels as f64);
    gauge!(names::SUBSCRIPTIONS_ACTIVE).set(subscriptions as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder() {
        let _guard = ConnectionMetricsGuard::new();
        record_frame(128, "inbound");
        record_tickets(&["conn_1:1".into(), "error:queue-closed".into()]);
        set_hub_stats(3, 5);
        record_error("decode");
    }
}

//! Metrics collection and export for Murmur.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use murmur_core::DeliveryReport;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "murmur_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "murmur_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "murmur_connections_rejected_total";
    pub const CLIENTS_REGISTERED: &str = "murmur_clients_registered";
    pub const FRAMES_TOTAL: &str = "murmur_frames_total";
    pub const FRAMES_BYTES: &str = "murmur_frames_bytes";
    pub const DELIVERIES_DROPPED: &str = "murmur_deliveries_dropped_total";
    pub const EVICTIONS_TOTAL: &str = "murmur_evictions_total";
    pub const DISPATCH_SECONDS: &str = "murmur_dispatch_seconds";
    pub const ERRORS_TOTAL: &str = "murmur_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Connections refused because the connection limit was reached"
    );
    metrics::describe_gauge!(
        names::CLIENTS_REGISTERED,
        "Current number of registered clients"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames by kind");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames");
    metrics::describe_counter!(
        names::DELIVERIES_DROPPED,
        "Events dropped because a client queue was full"
    );
    metrics::describe_counter!(
        names::EVICTIONS_TOTAL,
        "Clients dropped because they could not be reached"
    );
    metrics::describe_histogram!(
        names::DISPATCH_SECONDS,
        "Time to route and enqueue one command"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

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

/// Record a connection refused at the limit.
pub fn record_rejected_connection() {
    counter!(names::CONNECTIONS_REJECTED).increment(1);
}

/// Update the registered client count.
pub fn set_registered_clients(count: usize) {
    gauge!(names::CLIENTS_REGISTERED).set(count as f64);
}

/// Record a frame.
pub fn record_frame(bytes: usize, direction: &'static str, kind: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction, "kind" => kind).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record dispatch latency.
pub fn record_dispatch(seconds: f64) {
    histogram!(names::DISPATCH_SECONDS).record(seconds);
}

/// Record the failure side of a delivery.
pub fn record_delivery(report: &DeliveryReport) {
    if report.dropped > 0 {
        counter!(names::DELIVERIES_DROPPED).increment(report.dropped as u64);
    }
    if !report.evicted.is_empty() {
        counter!(names::EVICTIONS_TOTAL).increment(report.evicted.len() as u64);
    }
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

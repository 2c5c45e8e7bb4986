//! Metrics collection and export.
//!
//! Uses the `metrics` crate for instrumentation and exports to
//! Prometheus format on a dedicated port.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "parley_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "parley_connections_active";
    pub const APPENDS_TOTAL: &str = "parley_appends_total";
    pub const DELIVERIES_TOTAL: &str = "parley_deliveries_total";
    pub const SUBSCRIPTIONS_TOTAL: &str = "parley_subscriptions_total";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "parley_subscriptions_active";
    pub const HISTORY_SIZE: &str = "parley_history_size";
    pub const ERRORS_TOTAL: &str = "parley_errors_total";
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
    metrics::describe_counter!(names::APPENDS_TOTAL, "Total number of appended messages");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Total history updates delivered to subscribers"
    );
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TOTAL,
        "Total number of subscriptions opened"
    );
    metrics::describe_gauge!(
        names::SUBSCRIPTIONS_ACTIVE,
        "Current number of live subscriptions"
    );
    metrics::describe_gauge!(names::HISTORY_SIZE, "Messages currently in the log");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

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

/// Record an appended message.
pub fn record_append(history_size: usize) {
    counter!(names::APPENDS_TOTAL).increment(1);
    gauge!(names::HISTORY_SIZE).set(history_size as f64);
}

/// Record one history update delivered to a subscriber.
pub fn record_delivery() {
    counter!(names::DELIVERIES_TOTAL).increment(1);
}

/// Record a newly opened subscription.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
    gauge!(names::SUBSCRIPTIONS_ACTIVE).increment(1.0);
}

/// Record a closed subscription.
pub fn record_unsubscription() {
    gauge!(names::SUBSCRIPTIONS_ACTIVE).decrement(1.0);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
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

//! Metric instrumentation.
//!
//! Recorded through the `metrics` facade; every call is fire-and-forget and
//! is a no-op until a recorder (e.g. the Prometheus exporter) is installed.

use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "courier_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "courier_connections_active";
    pub const MESSAGES_TOTAL: &str = "courier_messages_total";
    pub const SUBSCRIBERS_ACTIVE: &str = "courier_hub_subscribers_active";
    pub const HUB_DROPPED_TOTAL: &str = "courier_hub_dropped_total";
    pub const BACKPLANE_ERRORS_TOTAL: &str = "courier_backplane_errors_total";
    pub const BACKPLANE_SELF_ECHO_TOTAL: &str = "courier_backplane_self_echo_total";
    pub const ERRORS_TOTAL: &str = "courier_errors_total";
}

/// Describe all metrics to the installed recorder.
pub fn describe() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of sessions opened since start"
    );
    metrics::describe_gauge!(names::CONNECTIONS_ACTIVE, "Current number of open sessions");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Entities sent, by kind");
    metrics::describe_gauge!(
        names::SUBSCRIBERS_ACTIVE,
        "Current number of hub subscribers"
    );
    metrics::describe_counter!(
        names::HUB_DROPPED_TOTAL,
        "Deliveries dropped because a subscriber buffer was full"
    );
    metrics::describe_counter!(
        names::BACKPLANE_ERRORS_TOTAL,
        "Backplane publish and consume failures"
    );
    metrics::describe_counter!(
        names::BACKPLANE_SELF_ECHO_TOTAL,
        "Envelopes discarded because this process published them"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");
}

/// Record a session opening.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a session closing.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a persisted entity, labelled by entity (`message` or `notification`).
pub fn record_sent(kind: &str) {
    counter!(names::MESSAGES_TOTAL, "kind" => kind.to_string()).increment(1);
}

/// Update the hub subscriber gauge.
pub fn set_active_subscribers(count: usize) {
    gauge!(names::SUBSCRIBERS_ACTIVE).set(count as f64);
}

/// Record deliveries dropped on full subscriber buffers.
pub fn record_drops(count: u64) {
    counter!(names::HUB_DROPPED_TOTAL).increment(count);
}

/// Record a backplane failure (`op` is "publish" or "consume").
pub fn record_backplane_error(transport: &'static str, op: &'static str) {
    counter!(names::BACKPLANE_ERRORS_TOTAL, "transport" => transport, "op" => op).increment(1);
}

/// Record a discarded self-echo.
pub fn record_self_echo() {
    counter!(names::BACKPLANE_SELF_ECHO_TOTAL).increment(1);
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

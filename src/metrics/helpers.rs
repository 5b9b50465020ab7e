//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    CONNECTIONS_ACTIVE, CONNECTIONS_CLOSED_TOTAL, DELIVERIES_TOTAL, DISPATCH_DROPS_TOTAL,
    DISPATCH_MISSES_TOTAL,
    ENVELOPES_DISPATCHED_TOTAL, FRAMES_TOTAL, REMOTE_DECODE_FAILURES_TOTAL, REMOTE_RECEIVED_TOTAL,
    RESOLUTION_FAILURES_TOTAL, WORKER_RESTARTS_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording routing metrics
pub struct RoutingMetrics;

impl RoutingMetrics {
    /// Record an envelope delivered without a store round trip
    pub fn record_local() {
        DELIVERIES_TOTAL.with_label_values(&["local"]).inc();
    }

    /// Record an envelope relayed through an owner's inbox
    pub fn record_remote() {
        DELIVERIES_TOTAL.with_label_values(&["remote"]).inc();
    }

    pub fn record_received() {
        REMOTE_RECEIVED_TOTAL.inc();
    }

    pub fn record_decode_failure() {
        REMOTE_DECODE_FAILURES_TOTAL.inc();
    }

    pub fn record_resolution_failure() {
        RESOLUTION_FAILURES_TOTAL.inc();
    }
}

/// Helper struct for recording connection metrics
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn record_opened() {
        CONNECTIONS_ACTIVE.inc();
    }

    pub fn record_removed() {
        CONNECTIONS_ACTIVE.dec();
    }

    /// Record why a connection closed (`local`, `remote`, `error`, `shutdown`)
    pub fn record_closed(cause: &str) {
        CONNECTIONS_CLOSED_TOTAL.with_label_values(&[cause]).inc();
    }

    pub fn record_frame_in() {
        FRAMES_TOTAL.with_label_values(&["in"]).inc();
    }

    pub fn record_frame_out() {
        FRAMES_TOTAL.with_label_values(&["out"]).inc();
    }
}

/// Helper struct for recording dispatch metrics
pub struct DispatchMetrics;

impl DispatchMetrics {
    pub fn record_dispatched() {
        ENVELOPES_DISPATCHED_TOTAL.inc();
    }

    /// Record a delivery for a channel that has already disconnected
    pub fn record_miss() {
        DISPATCH_MISSES_TOTAL.inc();
    }

    /// Record a delivery dropped on a full outbound queue
    pub fn record_dropped() {
        DISPATCH_DROPS_TOTAL.inc();
    }
}

/// Helper struct for recording worker supervision metrics
pub struct WorkerMetrics;

impl WorkerMetrics {
    pub fn record_restart(pool: &str) {
        WORKER_RESTARTS_TOTAL.with_label_values(&[pool]).inc();
    }
}

//! Prometheus metrics for the channel layer.
//!
//! - Connection metrics (active connections, frames in and out)
//! - Routing metrics (fast path vs relay, inbox receipts, resolution failures)
//! - Dispatch metrics (envelopes drained, misses after disconnect)
//! - Worker supervision metrics (restarts per pool)

mod helpers;

pub use helpers::{encode_metrics, ConnectionMetrics, DispatchMetrics, RoutingMetrics, WorkerMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "ws_channels";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Connections currently registered with the manager
    pub static ref CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_connections_active", METRIC_PREFIX),
        "Number of open WebSocket connections on this process"
    ).unwrap();

    /// Connections closed, by cause
    pub static ref CONNECTIONS_CLOSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_connections_closed_total", METRIC_PREFIX),
        "Total connections closed",
        &["cause"]
    ).unwrap();

    /// Frames by direction
    pub static ref FRAMES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_frames_total", METRIC_PREFIX),
        "Total WebSocket frames read or written",
        &["direction"]
    ).unwrap();

    // ============================================================================
    // Routing Metrics
    // ============================================================================

    /// Envelopes handed on by route (local fast path or store relay)
    pub static ref DELIVERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_deliveries_total", METRIC_PREFIX),
        "Total envelopes routed, by route",
        &["route"]
    ).unwrap();

    /// Envelopes popped from this process's inbox
    pub static ref REMOTE_RECEIVED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_remote_received_total", METRIC_PREFIX),
        "Total relayed envelopes received from the store"
    ).unwrap();

    /// Inbox records that could not be decoded
    pub static ref REMOTE_DECODE_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_remote_decode_failures_total", METRIC_PREFIX),
        "Total relayed envelopes dropped because they could not be decoded"
    ).unwrap();

    /// Group sends whose membership lookup failed
    pub static ref RESOLUTION_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_resolution_failures_total", METRIC_PREFIX),
        "Total group sends skipped because membership could not be resolved"
    ).unwrap();

    // ============================================================================
    // Dispatch Metrics
    // ============================================================================

    /// Envelopes drained from the delivery queue
    pub static ref ENVELOPES_DISPATCHED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_envelopes_dispatched_total", METRIC_PREFIX),
        "Total envelopes drained by the connection manager"
    ).unwrap();

    /// Deliveries for channels with no local connection
    pub static ref DISPATCH_MISSES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_dispatch_misses_total", METRIC_PREFIX),
        "Total deliveries addressed to channels without a live connection"
    ).unwrap();

    pub static ref DISPATCH_DROPS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_dispatch_drops_total", METRIC_PREFIX),
        "Total deliveries dropped because the connection's outbound queue was full"
    ).unwrap();

    // ============================================================================
    // Worker Metrics
    // ============================================================================

    /// Worker replacements by pool
    pub static ref WORKER_RESTARTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_worker_restarts_total", METRIC_PREFIX),
        "Total supervised worker restarts",
        &["pool"]
    ).unwrap();
}

//! Prometheus metrics for the notification engine.
//!
//! - Send/dismiss counters by delivery mode
//! - Local listener fanout
//! - Cross-replica fanout (published, received, dropped)
//! - Transport reconnects and TTL sweep

mod helpers;

pub use helpers::{encode_metrics, BackendMetrics, DeliveryMetrics, FanoutMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "notify";

lazy_static! {
    // ============================================================================
    // Delivery Metrics
    // ============================================================================

    /// Notifications accepted by `send`, by delivery mode
    pub static ref NOTIFICATIONS_SENT_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_notifications_sent_total", METRIC_PREFIX),
        "Total notifications sent",
        &["mode"]
    ).unwrap();

    /// Notifications vetoed by a pre-send filter
    pub static ref NOTIFICATIONS_CANCELLED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_notifications_cancelled_total", METRIC_PREFIX),
        "Total notifications cancelled by a pre-send filter"
    ).unwrap();

    /// Stored notifications superseded by a newer one in the same group
    pub static ref NOTIFICATIONS_REPLACED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_notifications_replaced_total", METRIC_PREFIX),
        "Total notifications replaced through group replacement"
    ).unwrap();

    /// Explicit dismissals
    pub static ref NOTIFICATIONS_DISMISSED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_notifications_dismissed_total", METRIC_PREFIX),
        "Total notifications dismissed"
    ).unwrap();

    /// Enqueues into local listener queues
    pub static ref LISTENER_PUSHES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_listener_pushes_total", METRIC_PREFIX),
        "Total notifications enqueued into local listener queues"
    ).unwrap();

    /// Active listener queues on this process
    pub static ref ACTIVE_LISTENERS: IntGauge = register_int_gauge!(
        format!("{}_active_listeners", METRIC_PREFIX),
        "Number of active listener queues on this process"
    ).unwrap();

    // ============================================================================
    // Fanout Metrics
    // ============================================================================

    /// Messages published to other replicas
    pub static ref FANOUT_PUBLISHED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_fanout_published_total", METRIC_PREFIX),
        "Total fanout messages published"
    ).unwrap();

    /// Publish attempts that failed
    pub static ref FANOUT_PUBLISH_FAILED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_fanout_publish_failed_total", METRIC_PREFIX),
        "Total fanout publish failures"
    ).unwrap();

    /// Messages received from other replicas
    pub static ref FANOUT_RECEIVED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_fanout_received_total", METRIC_PREFIX),
        "Total fanout messages received from other replicas"
    ).unwrap();

    /// Inbound messages dropped, by reason
    pub static ref FANOUT_DROPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_fanout_dropped_total", METRIC_PREFIX),
        "Total inbound fanout messages dropped",
        &["reason"]
    ).unwrap();

    /// Listener reconnect attempts, by transport
    pub static ref TRANSPORT_RECONNECTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_transport_reconnects_total", METRIC_PREFIX),
        "Total fanout listener reconnect attempts",
        &["transport"]
    ).unwrap();

    // ============================================================================
    // Backend Metrics
    // ============================================================================

    /// Rows removed by the TTL sweep
    pub static ref SWEEP_DELETED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_sweep_deleted_total", METRIC_PREFIX),
        "Total expired notifications removed by the sweep"
    ).unwrap();

    /// Backend operation latency
    pub static ref BACKEND_OPERATION_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_backend_operation_latency_seconds", METRIC_PREFIX),
        "Backend operation latency in seconds",
        &["backend", "operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    ).unwrap();

    /// Backend operation errors
    pub static ref BACKEND_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_backend_errors_total", METRIC_PREFIX),
        "Total backend operation errors",
        &["backend", "operation"]
    ).unwrap();
}

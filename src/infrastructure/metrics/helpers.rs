//! Metrics helper structs for convenient metric recording

use std::time::Instant;

use prometheus::{Encoder, TextEncoder};

use super::{
    ACTIVE_LISTENERS, BACKEND_ERRORS_TOTAL, BACKEND_OPERATION_LATENCY, FANOUT_DROPPED_TOTAL,
    FANOUT_PUBLISHED_TOTAL, FANOUT_PUBLISH_FAILED_TOTAL, FANOUT_RECEIVED_TOTAL,
    LISTENER_PUSHES_TOTAL, NOTIFICATIONS_CANCELLED_TOTAL, NOTIFICATIONS_DISMISSED_TOTAL,
    NOTIFICATIONS_REPLACED_TOTAL, NOTIFICATIONS_SENT_TOTAL, SWEEP_DELETED_TOTAL,
    TRANSPORT_RECONNECTS_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording send/dismiss metrics
pub struct DeliveryMetrics;

impl DeliveryMetrics {
    pub fn record_sent(mode: &str) {
        NOTIFICATIONS_SENT_TOTAL.with_label_values(&[mode]).inc();
    }

    pub fn record_cancelled() {
        NOTIFICATIONS_CANCELLED_TOTAL.inc();
    }

    pub fn record_replaced() {
        NOTIFICATIONS_REPLACED_TOTAL.inc();
    }

    pub fn record_dismissed() {
        NOTIFICATIONS_DISMISSED_TOTAL.inc();
    }

    pub fn record_pushed(count: usize) {
        LISTENER_PUSHES_TOTAL.inc_by(count as u64);
    }

    pub fn listener_opened() {
        ACTIVE_LISTENERS.inc();
    }

    pub fn listener_closed() {
        ACTIVE_LISTENERS.dec();
    }
}

/// Helper struct for recording cross-replica fanout metrics
pub struct FanoutMetrics;

impl FanoutMetrics {
    pub fn record_published() {
        FANOUT_PUBLISHED_TOTAL.inc();
    }

    pub fn record_publish_failed() {
        FANOUT_PUBLISH_FAILED_TOTAL.inc();
    }

    pub fn record_received() {
        FANOUT_RECEIVED_TOTAL.inc();
    }

    /// Inbound payload could not be decoded
    pub fn record_malformed() {
        FANOUT_DROPPED_TOTAL.with_label_values(&["malformed"]).inc();
    }

    /// Inbound message originated on this process
    pub fn record_self_echo() {
        FANOUT_DROPPED_TOTAL.with_label_values(&["self_echo"]).inc();
    }

    pub fn record_reconnect(transport: &str) {
        TRANSPORT_RECONNECTS_TOTAL.with_label_values(&[transport]).inc();
    }
}

/// Helper struct for recording backend metrics
pub struct BackendMetrics;

impl BackendMetrics {
    /// Start a latency timer; observe it with [`BackendMetrics::observe`]
    pub fn start() -> Instant {
        Instant::now()
    }

    pub fn observe(backend: &str, operation: &str, started: Instant) {
        BACKEND_OPERATION_LATENCY
            .with_label_values(&[backend, operation])
            .observe(started.elapsed().as_secs_f64());
    }

    pub fn record_error(backend: &str, operation: &str) {
        BACKEND_ERRORS_TOTAL
            .with_label_values(&[backend, operation])
            .inc();
    }

    pub fn record_swept(count: usize) {
        SWEEP_DELETED_TOTAL.inc_by(count as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_metrics() {
        DeliveryMetrics::record_sent("queued");
        DeliveryMetrics::record_pushed(3);
        DeliveryMetrics::listener_opened();
        DeliveryMetrics::listener_closed();
        // Just verify no panics
    }

    #[test]
    fn test_backend_latency_observation() {
        let started = BackendMetrics::start();
        BackendMetrics::observe("memory", "store", started);
        BackendMetrics::record_error("memory", "store");
        BackendMetrics::record_swept(2);
    }
}

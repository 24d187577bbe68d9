//! Periodic TTL sweep.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::BackendError;
use crate::config::NotificationConfig;
use crate::metrics::BackendMetrics;

/// How long stored notifications live, and how often the sweep runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub queued_ttl_seconds: u64,
    pub timeseries_ttl_seconds: u64,
    pub sweep_interval: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            queued_ttl_seconds: 86_400,
            timeseries_ttl_seconds: 604_800,
            sweep_interval: Duration::from_secs(600),
        }
    }
}

impl From<&NotificationConfig> for RetentionPolicy {
    fn from(config: &NotificationConfig) -> Self {
        Self {
            queued_ttl_seconds: config.queued_ttl_seconds,
            timeseries_ttl_seconds: config.timeseries_ttl_seconds,
            sweep_interval: Duration::from_secs(config.sweep_interval_seconds.max(1)),
        }
    }
}

/// Something that can delete its expired notifications.
#[async_trait]
pub trait ExpirySweep: Send + Sync {
    async fn sweep_expired(&self) -> Result<usize, BackendError>;
}

/// Background task running an [`ExpirySweep`] on a fixed interval
pub struct SweepTask {
    target: Arc<dyn ExpirySweep>,
    backend: &'static str,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl SweepTask {
    pub fn new(
        target: Arc<dyn ExpirySweep>,
        backend: &'static str,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            target,
            backend,
            interval,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            backend = self.backend,
            interval_secs = self.interval.as_secs(),
            "TTL sweep task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!(backend = self.backend, "TTL sweep task received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    self.sweep_once().await;
                }
            }
        }

        tracing::info!(backend = self.backend, "TTL sweep task stopped");
    }

    async fn sweep_once(&self) {
        let started = BackendMetrics::start();
        match self.target.sweep_expired().await {
            Ok(removed) => {
                BackendMetrics::observe(self.backend, "sweep", started);
                BackendMetrics::record_swept(removed);
                if removed > 0 {
                    tracing::info!(backend = self.backend, removed = removed, "Swept expired notifications");
                }
            }
            Err(e) => {
                BackendMetrics::record_error(self.backend, "sweep");
                tracing::error!(backend = self.backend, error = %e, "TTL sweep failed");
            }
        }
    }
}

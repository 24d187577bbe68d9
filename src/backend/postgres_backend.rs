//! LISTEN/NOTIFY fanout over Postgres storage.
//!
//! Publishing is a `pg_notify` on the shared pool. Receiving uses one
//! dedicated [`PgListener`] connection per process, supervised by
//! [`PgFanoutListener`]: it reconnects with exponential backoff and probes
//! the connection with `SELECT 1` on an interval so silent drops surface.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgNotification};
use sqlx::PgPool;
use tokio::sync::broadcast;

use crate::backoff::{BackoffConfig, ExponentialBackoff};
use crate::metrics::FanoutMetrics;

use super::durable::{DurableBackend, FanoutTransport};
use super::tasks::BackgroundTasks;
use super::{BackendError, BackendKind, RemoteHandlerSlot};

/// Postgres rejects NOTIFY payloads of 8000 bytes or more.
pub const MAX_NOTIFY_PAYLOAD_BYTES: usize = 7_900;

/// Durable backend fanning out over LISTEN/NOTIFY.
pub type PostgresBackend = DurableBackend<PgNotifyTransport>;

pub struct PgNotifyTransport {
    pool: PgPool,
    channel: String,
    keepalive_interval: Duration,
    backoff: BackoffConfig,
}

impl PgNotifyTransport {
    pub fn new(
        pool: PgPool,
        channel: impl Into<String>,
        keepalive_interval: Duration,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            pool,
            channel: channel.into(),
            keepalive_interval,
            backoff,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

fn check_payload_size(payload: &str) -> Result<(), BackendError> {
    if payload.len() > MAX_NOTIFY_PAYLOAD_BYTES {
        return Err(BackendError::PayloadTooLarge {
            size: payload.len(),
            limit: MAX_NOTIFY_PAYLOAD_BYTES,
        });
    }
    Ok(())
}

#[async_trait]
impl FanoutTransport for PgNotifyTransport {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    async fn publish(&self, payload: String) -> Result<(), BackendError> {
        if let Err(e) = check_payload_size(&payload) {
            // The row is already stored; remote replicas pick it up on their next read
            tracing::warn!(channel = %self.channel, error = %e, "Fanout payload too large for NOTIFY, skipping");
            return Err(e);
        }

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(&payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn spawn_listener(&self, tasks: &BackgroundTasks, handler: RemoteHandlerSlot) {
        let listener = PgFanoutListener::new(
            self.pool.clone(),
            self.channel.clone(),
            self.keepalive_interval,
            handler,
            ExponentialBackoff::with_config(self.backoff.clone()),
            tasks.subscribe(),
        );
        tasks.spawn("postgres-fanout", listener.run());
    }
}

/// One step of the listen loop, decided before acting so the listener
/// connection is free to run the keepalive query.
enum ListenStep {
    Shutdown,
    Keepalive,
    Received(Result<Option<PgNotification>, sqlx::Error>),
}

/// Background task owning the dedicated LISTEN connection
pub struct PgFanoutListener {
    pool: PgPool,
    channel: String,
    keepalive_interval: Duration,
    handler: RemoteHandlerSlot,
    backoff: ExponentialBackoff,
    shutdown: broadcast::Receiver<()>,
}

impl PgFanoutListener {
    pub fn new(
        pool: PgPool,
        channel: String,
        keepalive_interval: Duration,
        handler: RemoteHandlerSlot,
        backoff: ExponentialBackoff,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            pool,
            channel,
            keepalive_interval,
            handler,
            backoff,
            shutdown,
        }
    }

    /// Run the listener with automatic reconnection
    pub async fn run(mut self) {
        tracing::info!(
            channel = %self.channel,
            keepalive_secs = self.keepalive_interval.as_secs(),
            "Postgres fanout listener starting"
        );

        loop {
            match self.run_listen_loop().await {
                Ok(()) => {
                    tracing::info!("Postgres fanout listener stopped gracefully");
                    break;
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    FanoutMetrics::record_reconnect("postgres");
                    tracing::error!(
                        error = %e,
                        attempt = self.backoff.attempt(),
                        retry_delay_ms = delay.as_millis() as u64,
                        "Postgres fanout listener error, reconnecting"
                    );

                    tokio::select! {
                        _ = self.shutdown.recv() => {
                            tracing::info!("Shutdown requested during reconnect delay");
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn run_listen_loop(&mut self) -> Result<(), BackendError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;

        self.backoff.reset();
        tracing::info!(channel = %self.channel, "Listening on fanout channel");

        let mut keepalive = tokio::time::interval(self.keepalive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip immediate first tick
        keepalive.tick().await;

        loop {
            let step = tokio::select! {
                biased;
                _ = self.shutdown.recv() => ListenStep::Shutdown,
                _ = keepalive.tick() => ListenStep::Keepalive,
                received = listener.try_recv() => ListenStep::Received(received),
            };

            match step {
                ListenStep::Shutdown => {
                    tracing::info!("Postgres fanout listener received shutdown signal");
                    if let Err(e) = listener.unlisten_all().await {
                        tracing::debug!(error = %e, "UNLISTEN failed during shutdown");
                    }
                    return Ok(());
                }
                ListenStep::Keepalive => {
                    sqlx::query("SELECT 1").execute(&mut listener).await?;
                    tracing::trace!("Fanout listener keepalive ok");
                }
                ListenStep::Received(Ok(Some(notification))) => {
                    self.handler.deliver_payload("postgres", notification.payload());
                }
                ListenStep::Received(Ok(None)) => {
                    return Err(BackendError::Unavailable(
                        "listener connection lost".into(),
                    ));
                }
                ListenStep::Received(Err(e)) => return Err(e.into()),
            }
        }
    }
}

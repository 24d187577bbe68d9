//! Redis pub/sub fanout over Postgres storage.
//!
//! Publishes go through the shared multiplexed connection. Receiving needs
//! a dedicated pub/sub connection, owned by [`RedisFanoutSubscriber`], which
//! reconnects with exponential backoff whenever the stream ends or errors.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;

use crate::backoff::{BackoffConfig, ExponentialBackoff};
use crate::metrics::FanoutMetrics;
use crate::redis::RedisPool;

use super::durable::{DurableBackend, FanoutTransport};
use super::tasks::BackgroundTasks;
use super::{BackendError, BackendKind, RemoteHandlerSlot};

/// Durable backend fanning out over Redis pub/sub.
pub type RedisBackend = DurableBackend<RedisTransport>;

pub struct RedisTransport {
    pool: Arc<RedisPool>,
    channel: String,
    backoff: BackoffConfig,
}

impl RedisTransport {
    pub fn new(pool: Arc<RedisPool>, channel: impl Into<String>, backoff: BackoffConfig) -> Self {
        Self {
            pool,
            channel: channel.into(),
            backoff,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl FanoutTransport for RedisTransport {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    async fn publish(&self, payload: String) -> Result<(), BackendError> {
        let receivers = self.pool.publish(&self.channel, &payload).await?;
        tracing::trace!(channel = %self.channel, receivers = receivers, "Fanout message published");
        Ok(())
    }

    fn spawn_listener(&self, tasks: &BackgroundTasks, handler: RemoteHandlerSlot) {
        let subscriber = RedisFanoutSubscriber::new(
            self.pool.client().clone(),
            self.channel.clone(),
            handler,
            ExponentialBackoff::with_config(self.backoff.clone()),
            tasks.subscribe(),
        );
        tasks.spawn("redis-fanout", subscriber.run());
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Background task receiving fanout messages from other replicas
pub struct RedisFanoutSubscriber {
    client: redis::Client,
    channel: String,
    handler: RemoteHandlerSlot,
    backoff: ExponentialBackoff,
    shutdown: broadcast::Receiver<()>,
}

impl RedisFanoutSubscriber {
    pub fn new(
        client: redis::Client,
        channel: String,
        handler: RemoteHandlerSlot,
        backoff: ExponentialBackoff,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            client,
            channel,
            handler,
            backoff,
            shutdown,
        }
    }

    /// Run the subscriber task with automatic reconnection
    pub async fn run(mut self) {
        tracing::info!(channel = %self.channel, "Redis fanout subscriber starting");

        loop {
            match self.run_subscription_loop().await {
                Ok(()) => {
                    tracing::info!("Redis fanout subscriber stopped gracefully");
                    break;
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    FanoutMetrics::record_reconnect("redis");
                    tracing::error!(
                        error = %e,
                        attempt = self.backoff.attempt(),
                        retry_delay_ms = delay.as_millis() as u64,
                        "Redis fanout subscription error, reconnecting"
                    );

                    // Check for shutdown during retry delay
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

    /// Subscribe and pump messages until shutdown (`Ok`) or a connection
    /// failure (`Err`).
    async fn run_subscription_loop(&mut self) -> Result<(), BackendError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;

        self.backoff.reset();
        tracing::info!(channel = %self.channel, "Subscribed to fanout channel");

        let mut message_stream = pubsub.on_message();

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.recv() => {
                    tracing::info!("Redis fanout subscriber received shutdown signal");
                    return Ok(());
                }

                msg = message_stream.next() => {
                    let Some(msg) = msg else {
                        tracing::warn!("Redis message stream ended unexpectedly");
                        return Err(BackendError::Unavailable("redis message stream ended".into()));
                    };
                    match msg.get_payload::<String>() {
                        Ok(payload) => self.handler.deliver_payload("redis", &payload),
                        Err(e) => {
                            FanoutMetrics::record_malformed();
                            tracing::warn!(error = %e, "Failed to get message payload");
                        }
                    }
                }
            }
        }
    }
}

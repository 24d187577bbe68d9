//! Shared Redis handle for the fanout publisher.
//!
//! `PUBLISH` goes over one lazily opened multiplexed connection, reused by
//! every task and dropped after a connection-level failure so the next
//! publish reconnects. Subscribers open their own pub/sub connection from
//! [`RedisPool::client`].

use std::sync::atomic::{AtomicBool, Ordering};

use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError};
use tokio::sync::Mutex;

use crate::config::RedisConfig;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Connection not available: {0}")]
    ConnectionUnavailable(String),
}

pub struct RedisPool {
    client: Client,
    cached: Mutex<Option<MultiplexedConnection>>,
    closed: AtomicBool,
    url: String,
}

impl RedisPool {
    /// Validates the URL; no connection is opened until the first publish.
    pub fn new(config: RedisConfig) -> Result<Self, PoolError> {
        Ok(Self {
            client: Client::open(config.url.as_str())?,
            cached: Mutex::new(None),
            closed: AtomicBool::new(false),
            url: config.url,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn connection(&self) -> Result<MultiplexedConnection, PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::ConnectionUnavailable("pool closed".into()));
        }

        let mut cached = self.cached.lock().await;
        if let Some(conn) = cached.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .inspect_err(|e| tracing::error!(error = %e, url = %self.url, "Failed to connect to Redis"))?;
        tracing::info!(url = %self.url, "Redis publish connection established");
        *cached = Some(conn.clone());
        Ok(conn)
    }

    /// Publish `payload` on `channel`; returns how many subscribers got it.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<usize, PoolError> {
        let mut conn = self.connection().await?;
        match conn.publish::<_, _, usize>(channel, payload).await {
            Ok(receivers) => Ok(receivers),
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    self.cached.lock().await.take();
                }
                Err(e.into())
            }
        }
    }

    /// Drop the cached connection and refuse further publishes.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.cached.lock().await.take();
    }
}

//! Storage and cross-replica fanout backends.
//!
//! # Backend Architecture
//!
//! Every backend implements [`NotificationBackend`]:
//!
//! - `MemoryBackend`: single process, DashMap storage, no fanout (default)
//! - `RedisBackend`: Postgres rows, Redis pub/sub fanout
//! - `PostgresBackend`: Postgres rows, LISTEN/NOTIFY fanout
//!
//! The two durable backends are [`DurableBackend`] over different
//! [`FanoutTransport`]s and share [`PgNotificationStore`]. Use
//! [`create_backend`] to build the one selected in configuration.

pub mod durable;
pub mod factory;
pub mod memory_backend;
pub mod postgres_backend;
pub mod redis_backend;
pub mod store;
pub mod sweep;
pub mod tasks;

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::metrics::FanoutMetrics;
use crate::notification::{FanoutMessage, Notification, NotificationMode, WireError};

pub use durable::{DurableBackend, FanoutTransport};
pub use factory::create_backend;
pub use memory_backend::MemoryBackend;
pub use postgres_backend::{PgNotifyTransport, PostgresBackend};
pub use redis_backend::{RedisBackend, RedisTransport};
pub use store::PgNotificationStore;
pub use sweep::{ExpirySweep, RetentionPolicy, SweepTask};
pub use tasks::BackgroundTasks;

/// Errors that can occur in backend operations
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("Fanout payload is {size} bytes, limit is {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl From<crate::redis::PoolError> for BackendError {
    fn from(err: crate::redis::PoolError) -> Self {
        match err {
            crate::redis::PoolError::Redis(e) => BackendError::Redis(e),
            crate::redis::PoolError::ConnectionUnavailable(msg) => BackendError::Unavailable(msg),
        }
    }
}

impl From<crate::postgres::PostgresPoolError> for BackendError {
    fn from(err: crate::postgres::PostgresPoolError) -> Self {
        match err {
            crate::postgres::PostgresPoolError::Sqlx(e) => BackendError::Postgres(e),
        }
    }
}

/// Unknown backend name in configuration
#[derive(Debug, Clone, Error)]
#[error("unknown notification backend '{0}' (expected memory, redis or postgres)")]
pub struct UnknownBackend(pub String);

/// Which backend implementation to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum BackendKind {
    #[default]
    Memory,
    Redis,
    Postgres,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Redis => "redis",
            Self::Postgres => "postgres",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            _ => Err(UnknownBackend(s.to_string())),
        }
    }
}

impl TryFrom<String> for BackendKind {
    type Error = UnknownBackend;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Callback invoked for every fanout message received from the transport.
pub type RemoteHandler = Arc<dyn Fn(FanoutMessage) + Send + Sync>;

/// Shared slot holding the registered [`RemoteHandler`].
///
/// Listener tasks hold a clone, so a handler registered after `start()`
/// is still picked up.
#[derive(Clone, Default)]
pub struct RemoteHandlerSlot(Arc<RwLock<Option<RemoteHandler>>>);

impl RemoteHandlerSlot {
    pub fn set(&self, handler: RemoteHandler) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Hand a message to the handler; false if none is registered.
    pub fn dispatch(&self, message: FanoutMessage) -> bool {
        let handler = self.0.read().unwrap_or_else(PoisonError::into_inner).clone();
        match handler {
            Some(handler) => {
                handler(message);
                true
            }
            None => false,
        }
    }

    /// Decode a raw transport payload and dispatch it. Malformed payloads
    /// are logged, counted and dropped.
    pub fn deliver_payload(&self, transport: &str, payload: &str) {
        match FanoutMessage::decode(payload) {
            Ok(message) => {
                FanoutMetrics::record_received();
                if !self.dispatch(message) {
                    tracing::debug!(transport = transport, "No remote handler registered, dropping message");
                }
            }
            Err(e) => {
                FanoutMetrics::record_malformed();
                tracing::warn!(
                    transport = transport,
                    error = %e,
                    payload_len = payload.len(),
                    "Dropping malformed fanout message"
                );
            }
        }
    }
}

/// Storage plus cross-replica fanout.
///
/// Implementations must be safe to share across tasks. Storage methods take
/// the `(scope, scope_id)` split of a source key.
#[async_trait]
pub trait NotificationBackend: Send + Sync {
    fn backend_type(&self) -> BackendKind;

    /// Open resources and spawn background tasks.
    async fn start(&self) -> Result<(), BackendError>;

    /// Signal background tasks, wait for them, and release resources.
    async fn stop(&self);

    /// Persist a notification. With a group, atomically replace the stored
    /// notification of the same `(scope, scope_id, group)` and return its id.
    async fn store(
        &self,
        scope: &str,
        scope_id: &str,
        notification: &Notification,
    ) -> Result<Option<Uuid>, BackendError>;

    async fn remove(&self, id: Uuid) -> Result<bool, BackendError>;

    async fn remove_by_group(
        &self,
        scope: &str,
        scope_id: &str,
        group: &str,
    ) -> Result<Option<Uuid>, BackendError>;

    async fn find_by_group(
        &self,
        scope: &str,
        scope_id: &str,
        group: &str,
    ) -> Result<Option<(Uuid, NotificationMode)>, BackendError>;

    /// QUEUED notifications, oldest first.
    async fn get_queued(&self, scope: &str, scope_id: &str)
        -> Result<Vec<Notification>, BackendError>;

    /// TIMESERIES notifications created strictly after `since`, oldest first.
    async fn get_since(
        &self,
        scope: &str,
        scope_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Notification>, BackendError>;

    async fn get_mode(&self, id: Uuid) -> Result<Option<NotificationMode>, BackendError>;

    async fn add_subscription(&self, subscriber: &str, source: &str) -> Result<(), BackendError>;

    async fn remove_subscription(&self, subscriber: &str, source: &str)
        -> Result<(), BackendError>;

    async fn get_subscriptions(&self, subscriber: &str) -> Result<Vec<String>, BackendError>;

    /// Delete notifications past their TTL; returns how many were removed.
    async fn cleanup_expired(&self) -> Result<usize, BackendError>;

    /// Send a message to the other replicas.
    async fn publish(&self, message: &FanoutMessage) -> Result<(), BackendError>;

    /// Register the callback for messages arriving from the transport.
    fn on_remote_message(&self, handler: RemoteHandler);
}

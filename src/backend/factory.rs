//! Backend factory

use std::sync::Arc;
use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::config::Settings;
use crate::postgres::PostgresPool;
use crate::redis::RedisPool;

use super::memory_backend::MemoryBackend;
use super::postgres_backend::{PgNotifyTransport, PostgresBackend};
use super::redis_backend::{RedisBackend, RedisTransport};
use super::store::PgNotificationStore;
use super::sweep::RetentionPolicy;
use super::{BackendError, BackendKind, NotificationBackend};

/// Create the notification backend selected by `settings.notifications.backend`.
///
/// - `memory` (default): single-process `MemoryBackend`
/// - `redis`: Postgres storage with Redis pub/sub fanout
/// - `postgres`: Postgres storage with LISTEN/NOTIFY fanout
///
/// Durable backends connect their pools here, so an unreachable database
/// fails at startup rather than on the first request.
///
/// # Example
///
/// ```rust,ignore
/// let backend = create_backend(&settings).await?;
/// let service = NotificationService::new(backend);
/// ```
pub async fn create_backend(settings: &Settings) -> Result<Arc<dyn NotificationBackend>, BackendError> {
    let config = &settings.notifications;
    let policy = RetentionPolicy::from(config);
    let backoff = BackoffConfig::from(config);

    match config.backend {
        BackendKind::Memory => {
            tracing::info!(backend = "memory", "Creating memory notification backend");
            Ok(Arc::new(MemoryBackend::new(policy)))
        }
        BackendKind::Redis => {
            let pg = PostgresPool::new(&settings.database).await?;
            let redis = Arc::new(RedisPool::new(settings.redis.clone())?);
            tracing::info!(
                backend = "redis",
                channel = %settings.redis.channel,
                database = %pg.database_url_masked(),
                "Creating Redis notification backend"
            );

            let store = PgNotificationStore::new(pg.pool().clone(), policy, "redis");
            let transport = RedisTransport::new(redis, settings.redis.channel.clone(), backoff);
            Ok(Arc::new(RedisBackend::new(store, transport)))
        }
        BackendKind::Postgres => {
            let pg = PostgresPool::new(&settings.database).await?;
            tracing::info!(
                backend = "postgres",
                channel = %config.notify_channel,
                database = %pg.database_url_masked(),
                "Creating PostgreSQL notification backend"
            );

            let store = PgNotificationStore::new(pg.pool().clone(), policy, "postgres");
            let transport = PgNotifyTransport::new(
                pg.pool().clone(),
                config.notify_channel.clone(),
                Duration::from_secs(config.keepalive_interval_seconds.max(1)),
                backoff,
            );
            Ok(Arc::new(PostgresBackend::new(store, transport)))
        }
    }
}

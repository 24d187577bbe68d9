//! PostgreSQL row store shared by the durable backends.
//!
//! Table structure:
//! - `notifications` - one row per stored notification, payload as JSONB
//! - `notification_subscriptions` - persistent `(subscriber_key, source_key)` edges

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::metrics::BackendMetrics;
use crate::notification::{Notification, NotificationMode, Payload};

use super::sweep::{ExpirySweep, RetentionPolicy};
use super::BackendError;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS notifications (
        id          UUID PRIMARY KEY,
        scope       TEXT NOT NULL,
        scope_id    TEXT NOT NULL,
        type        TEXT NOT NULL,
        payload     JSONB NOT NULL DEFAULT '{}'::jsonb,
        group_key   TEXT,
        mode        TEXT NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_notifications_scope ON notifications (scope, scope_id)",
    "CREATE INDEX IF NOT EXISTS idx_notifications_group ON notifications (scope, scope_id, group_key)",
    "CREATE INDEX IF NOT EXISTS idx_notifications_mode_time ON notifications (scope, scope_id, mode, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS notification_subscriptions (
        subscriber_key  TEXT NOT NULL,
        source_key      TEXT NOT NULL,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (subscriber_key, source_key)
    )
    "#,
];

type NotificationRow = (
    Uuid,
    String,
    serde_json::Value,
    Option<String>,
    String,
    DateTime<Utc>,
);

pub struct PgNotificationStore {
    pool: PgPool,
    policy: RetentionPolicy,
    /// Metric label of the owning backend
    backend: &'static str,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool, policy: RetentionPolicy, backend: &'static str) -> Self {
        Self {
            pool,
            policy,
            backend,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Create tables and indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), BackendError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::debug!(backend = self.backend, "Notification schema ensured");
        Ok(())
    }

    async fn timed<T, F>(&self, operation: &'static str, fut: F) -> Result<T, BackendError>
    where
        F: std::future::Future<Output = Result<T, BackendError>>,
    {
        let started = BackendMetrics::start();
        let result = fut.await;
        match &result {
            Ok(_) => BackendMetrics::observe(self.backend, operation, started),
            Err(e) => {
                BackendMetrics::record_error(self.backend, operation);
                tracing::warn!(backend = self.backend, operation = operation, error = %e, "Storage operation failed");
            }
        }
        result
    }

    pub async fn store(
        &self,
        scope: &str,
        scope_id: &str,
        notification: &Notification,
    ) -> Result<Option<Uuid>, BackendError> {
        self.timed("store", async {
            let payload = serde_json::Value::Object(notification.payload.clone());
            let mut tx = self.pool.begin().await?;

            let mut replaced = None;
            if let Some(group) = notification.group.as_deref() {
                // Serialize writers of the same group across replicas
                let lock_key = format!("{}\u{1f}{}\u{1f}{}", scope, scope_id, group);
                sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                    .bind(&lock_key)
                    .execute(&mut *tx)
                    .await?;

                let ids: Vec<(Uuid,)> = sqlx::query_as(
                    r#"
                    DELETE FROM notifications
                    WHERE scope = $1 AND scope_id = $2 AND group_key = $3
                    RETURNING id
                    "#,
                )
                .bind(scope)
                .bind(scope_id)
                .bind(group)
                .fetch_all(&mut *tx)
                .await?;
                replaced = ids.into_iter().next().map(|(id,)| id);
            }

            sqlx::query(
                r#"
                INSERT INTO notifications (id, scope, scope_id, type, payload, group_key, mode, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(notification.id)
            .bind(scope)
            .bind(scope_id)
            .bind(&notification.notification_type)
            .bind(&payload)
            .bind(notification.group.as_deref())
            .bind(notification.mode.as_str())
            .bind(notification.created_at)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            tracing::trace!(
                scope = %scope,
                scope_id = %scope_id,
                notification_id = %notification.id,
                replaced = ?replaced,
                "Notification stored in PostgreSQL"
            );
            Ok::<_, BackendError>(replaced)
        })
        .await
    }

    pub async fn remove(&self, id: Uuid) -> Result<bool, BackendError> {
        self.timed("remove", async {
            let result = sqlx::query("DELETE FROM notifications WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok::<_, BackendError>(result.rows_affected() > 0)
        })
        .await
    }

    pub async fn remove_by_group(
        &self,
        scope: &str,
        scope_id: &str,
        group: &str,
    ) -> Result<Option<Uuid>, BackendError> {
        self.timed("remove_by_group", async {
            let ids: Vec<(Uuid,)> = sqlx::query_as(
                r#"
                DELETE FROM notifications
                WHERE scope = $1 AND scope_id = $2 AND group_key = $3
                RETURNING id
                "#,
            )
            .bind(scope)
            .bind(scope_id)
            .bind(group)
            .fetch_all(&self.pool)
            .await?;
            Ok::<_, BackendError>(ids.into_iter().next().map(|(id,)| id))
        })
        .await
    }

    pub async fn find_by_group(
        &self,
        scope: &str,
        scope_id: &str,
        group: &str,
    ) -> Result<Option<(Uuid, NotificationMode)>, BackendError> {
        self.timed("find_by_group", async {
            let row: Option<(Uuid, String)> = sqlx::query_as(
                r#"
                SELECT id, mode FROM notifications
                WHERE scope = $1 AND scope_id = $2 AND group_key = $3
                LIMIT 1
                "#,
            )
            .bind(scope)
            .bind(scope_id)
            .bind(group)
            .fetch_optional(&self.pool)
            .await?;

            let Some((id, mode)) = row else {
                return Ok(None);
            };
            let mode: NotificationMode = mode.parse()?;
            Ok::<_, BackendError>(Some((id, mode)))
        })
        .await
    }

    pub async fn get_queued(
        &self,
        scope: &str,
        scope_id: &str,
    ) -> Result<Vec<Notification>, BackendError> {
        self.timed("get_queued", async {
            let rows: Vec<NotificationRow> = sqlx::query_as(
                r#"
                SELECT id, type, payload, group_key, mode, created_at
                FROM notifications
                WHERE scope = $1 AND scope_id = $2 AND mode = $3
                ORDER BY created_at ASC, id ASC
                "#,
            )
            .bind(scope)
            .bind(scope_id)
            .bind(NotificationMode::Queued.as_str())
            .fetch_all(&self.pool)
            .await?;
            Ok::<_, BackendError>(rows_to_notifications(rows))
        })
        .await
    }

    pub async fn get_since(
        &self,
        scope: &str,
        scope_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Notification>, BackendError> {
        self.timed("get_since", async {
            let rows: Vec<NotificationRow> = sqlx::query_as(
                r#"
                SELECT id, type, payload, group_key, mode, created_at
                FROM notifications
                WHERE scope = $1 AND scope_id = $2 AND mode = $3 AND created_at > $4
                ORDER BY created_at ASC, id ASC
                "#,
            )
            .bind(scope)
            .bind(scope_id)
            .bind(NotificationMode::Timeseries.as_str())
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
            Ok::<_, BackendError>(rows_to_notifications(rows))
        })
        .await
    }

    pub async fn get_mode(&self, id: Uuid) -> Result<Option<NotificationMode>, BackendError> {
        self.timed("get_mode", async {
            let row: Option<(String,)> = sqlx::query_as("SELECT mode FROM notifications WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            let Some((mode,)) = row else {
                return Ok(None);
            };
            let mode: NotificationMode = mode.parse()?;
            Ok::<_, BackendError>(Some(mode))
        })
        .await
    }

    pub async fn add_subscription(&self, subscriber: &str, source: &str) -> Result<(), BackendError> {
        self.timed("add_subscription", async {
            sqlx::query(
                r#"
                INSERT INTO notification_subscriptions (subscriber_key, source_key)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(subscriber)
            .bind(source)
            .execute(&self.pool)
            .await?;
            Ok::<_, BackendError>(())
        })
        .await
    }

    pub async fn remove_subscription(&self, subscriber: &str, source: &str) -> Result<(), BackendError> {
        self.timed("remove_subscription", async {
            sqlx::query(
                "DELETE FROM notification_subscriptions WHERE subscriber_key = $1 AND source_key = $2",
            )
            .bind(subscriber)
            .bind(source)
            .execute(&self.pool)
            .await?;
            Ok::<_, BackendError>(())
        })
        .await
    }

    pub async fn get_subscriptions(&self, subscriber: &str) -> Result<Vec<String>, BackendError> {
        self.timed("get_subscriptions", async {
            let rows: Vec<(String,)> = sqlx::query_as(
                r#"
                SELECT source_key FROM notification_subscriptions
                WHERE subscriber_key = $1
                ORDER BY created_at ASC, source_key ASC
                "#,
            )
            .bind(subscriber)
            .fetch_all(&self.pool)
            .await?;
            Ok::<_, BackendError>(rows.into_iter().map(|(source,)| source).collect::<Vec<_>>())
        })
        .await
    }

    pub async fn cleanup_expired(&self) -> Result<usize, BackendError> {
        self.sweep_expired().await
    }
}

#[async_trait]
impl ExpirySweep for PgNotificationStore {
    async fn sweep_expired(&self) -> Result<usize, BackendError> {
        let now = Utc::now();
        let queued_cutoff = now - Duration::seconds(self.policy.queued_ttl_seconds as i64);
        let timeseries_cutoff = now - Duration::seconds(self.policy.timeseries_ttl_seconds as i64);

        let result = sqlx::query(
            r#"
            DELETE FROM notifications
            WHERE (mode = $1 AND created_at < $2)
               OR (mode = $3 AND created_at < $4)
            "#,
        )
        .bind(NotificationMode::Queued.as_str())
        .bind(queued_cutoff)
        .bind(NotificationMode::Timeseries.as_str())
        .bind(timeseries_cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() as usize)
    }
}

fn rows_to_notifications(rows: Vec<NotificationRow>) -> Vec<Notification> {
    rows.into_iter()
        .filter_map(|(id, notification_type, payload, group, mode, created_at)| {
            let mode = match mode.parse() {
                Ok(mode) => mode,
                Err(e) => {
                    tracing::warn!(
                        notification_id = %id,
                        error = %e,
                        "Skipping stored notification with unknown mode"
                    );
                    return None;
                }
            };
            let payload = match payload {
                serde_json::Value::Object(map) => map,
                _ => Payload::new(),
            };
            Some(Notification {
                id,
                notification_type,
                created_at,
                payload,
                group,
                mode,
            })
        })
        .collect()
}

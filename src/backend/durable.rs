//! Durable backend: Postgres rows plus a pluggable fanout transport.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::metrics::FanoutMetrics;
use crate::notification::{FanoutMessage, Notification, NotificationMode};

use super::store::PgNotificationStore;
use super::sweep::SweepTask;
use super::tasks::BackgroundTasks;
use super::{BackendError, BackendKind, NotificationBackend, RemoteHandler, RemoteHandlerSlot};

/// Cross-replica channel used by a [`DurableBackend`].
#[async_trait]
pub trait FanoutTransport: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    /// Publish an encoded [`FanoutMessage`].
    async fn publish(&self, payload: String) -> Result<(), BackendError>;

    /// Spawn the long-running listener that feeds `handler`.
    fn spawn_listener(&self, tasks: &BackgroundTasks, handler: RemoteHandlerSlot);

    /// Release transport resources after listeners have stopped.
    async fn close(&self) {}
}

pub struct DurableBackend<T: FanoutTransport> {
    store: Arc<PgNotificationStore>,
    transport: T,
    handler: RemoteHandlerSlot,
    tasks: BackgroundTasks,
}

impl<T: FanoutTransport> DurableBackend<T> {
    pub fn new(store: PgNotificationStore, transport: T) -> Self {
        Self {
            store: Arc::new(store),
            transport,
            handler: RemoteHandlerSlot::default(),
            tasks: BackgroundTasks::new(),
        }
    }
}

#[async_trait]
impl<T: FanoutTransport> NotificationBackend for DurableBackend<T> {
    fn backend_type(&self) -> BackendKind {
        self.transport.kind()
    }

    async fn start(&self) -> Result<(), BackendError> {
        if !self.tasks.is_empty() {
            return Ok(());
        }
        let backend = self.transport.kind().as_str();

        self.store.ensure_schema().await?;

        self.transport.spawn_listener(&self.tasks, self.handler.clone());

        let sweep = SweepTask::new(
            self.store.clone(),
            backend,
            self.store.policy().sweep_interval,
            self.tasks.subscribe(),
        );
        self.tasks.spawn("durable-sweep", sweep.run());

        tracing::info!(backend = backend, "Notification backend started");
        Ok(())
    }

    async fn stop(&self) {
        self.tasks.shutdown().await;
        self.transport.close().await;
        self.store.pool().close().await;
        tracing::info!(backend = self.transport.kind().as_str(), "Notification backend stopped");
    }

    async fn store(
        &self,
        scope: &str,
        scope_id: &str,
        notification: &Notification,
    ) -> Result<Option<Uuid>, BackendError> {
        self.store.store(scope, scope_id, notification).await
    }

    async fn remove(&self, id: Uuid) -> Result<bool, BackendError> {
        self.store.remove(id).await
    }

    async fn remove_by_group(
        &self,
        scope: &str,
        scope_id: &str,
        group: &str,
    ) -> Result<Option<Uuid>, BackendError> {
        self.store.remove_by_group(scope, scope_id, group).await
    }

    async fn find_by_group(
        &self,
        scope: &str,
        scope_id: &str,
        group: &str,
    ) -> Result<Option<(Uuid, NotificationMode)>, BackendError> {
        self.store.find_by_group(scope, scope_id, group).await
    }

    async fn get_queued(
        &self,
        scope: &str,
        scope_id: &str,
    ) -> Result<Vec<Notification>, BackendError> {
        self.store.get_queued(scope, scope_id).await
    }

    async fn get_since(
        &self,
        scope: &str,
        scope_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Notification>, BackendError> {
        self.store.get_since(scope, scope_id, since).await
    }

    async fn get_mode(&self, id: Uuid) -> Result<Option<NotificationMode>, BackendError> {
        self.store.get_mode(id).await
    }

    async fn add_subscription(&self, subscriber: &str, source: &str) -> Result<(), BackendError> {
        self.store.add_subscription(subscriber, source).await
    }

    async fn remove_subscription(&self, subscriber: &str, source: &str) -> Result<(), BackendError> {
        self.store.remove_subscription(subscriber, source).await
    }

    async fn get_subscriptions(&self, subscriber: &str) -> Result<Vec<String>, BackendError> {
        self.store.get_subscriptions(subscriber).await
    }

    async fn cleanup_expired(&self) -> Result<usize, BackendError> {
        self.store.cleanup_expired().await
    }

    async fn publish(&self, message: &FanoutMessage) -> Result<(), BackendError> {
        let payload = message.encode()?;
        match self.transport.publish(payload).await {
            Ok(()) => {
                FanoutMetrics::record_published();
                Ok(())
            }
            Err(e) => {
                FanoutMetrics::record_publish_failed();
                Err(e)
            }
        }
    }

    fn on_remote_message(&self, handler: RemoteHandler) {
        self.handler.set(handler);
    }
}

//! In-memory notification backend using DashMap.
//!
//! Storage lives in this process only and is lost on restart. `publish` is
//! a no-op, so this backend is only correct for a single replica.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::notification::{FanoutMessage, Notification, NotificationMode};

use super::sweep::{ExpirySweep, RetentionPolicy, SweepTask};
use super::tasks::BackgroundTasks;
use super::{BackendError, BackendKind, NotificationBackend, RemoteHandler};

type ScopeKey = (String, String);

fn scope_key(scope: &str, scope_id: &str) -> ScopeKey {
    (scope.to_string(), scope_id.to_string())
}

/// Rows and subscriptions, shared with the sweep task.
#[derive(Default)]
struct MemoryStore {
    /// (scope, scope_id) -> notifications in insertion order
    notifications: DashMap<ScopeKey, Vec<Notification>>,
    /// id -> (scope, scope_id)
    index: DashMap<Uuid, ScopeKey>,
    /// subscriber -> sources
    subscriptions: DashMap<String, BTreeSet<String>>,
    policy: RetentionPolicy,
}

impl MemoryStore {
    fn remove_where<P>(&self, key: &ScopeKey, mut predicate: P) -> Vec<Uuid>
    where
        P: FnMut(&Notification) -> bool,
    {
        let mut removed = Vec::new();
        if let Some(mut rows) = self.notifications.get_mut(key) {
            rows.retain(|n| {
                if predicate(n) {
                    removed.push(n.id);
                    false
                } else {
                    true
                }
            });
        }
        self.notifications.remove_if(key, |_, rows| rows.is_empty());
        for id in &removed {
            self.index.remove(id);
        }
        removed
    }

    fn select<P>(&self, scope: &str, scope_id: &str, predicate: P) -> Vec<Notification>
    where
        P: Fn(&Notification) -> bool,
    {
        let mut rows: Vec<Notification> = self
            .notifications
            .get(&scope_key(scope, scope_id))
            .map(|rows| rows.iter().filter(|n| predicate(n)).cloned().collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        rows
    }
}

#[async_trait]
impl ExpirySweep for MemoryStore {
    async fn sweep_expired(&self) -> Result<usize, BackendError> {
        let queued_ttl = self.policy.queued_ttl_seconds;
        let timeseries_ttl = self.policy.timeseries_ttl_seconds;

        // Collect keys first to avoid holding shard locks across the scan
        let keys: Vec<ScopeKey> = self.notifications.iter().map(|r| r.key().clone()).collect();

        let mut removed = 0;
        for key in keys {
            removed += self
                .remove_where(&key, |n| n.is_expired(queued_ttl, timeseries_ttl))
                .len();
        }

        if removed > 0 {
            tracing::debug!(
                removed = removed,
                remaining_scopes = self.notifications.len(),
                "Removed expired in-memory notifications"
            );
        }
        Ok(removed)
    }
}

pub struct MemoryBackend {
    store: Arc<MemoryStore>,
    tasks: BackgroundTasks,
}

impl MemoryBackend {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            store: Arc::new(MemoryStore {
                policy,
                ..Default::default()
            }),
            tasks: BackgroundTasks::new(),
        }
    }

    /// Number of stored notifications across all scopes
    pub fn len(&self) -> usize {
        self.store.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}

#[async_trait]
impl NotificationBackend for MemoryBackend {
    fn backend_type(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn start(&self) -> Result<(), BackendError> {
        if !self.tasks.is_empty() {
            return Ok(());
        }
        let sweep = SweepTask::new(
            self.store.clone(),
            "memory",
            self.store.policy.sweep_interval,
            self.tasks.subscribe(),
        );
        self.tasks.spawn("memory-sweep", sweep.run());
        tracing::info!(backend = "memory", "Notification backend started");
        Ok(())
    }

    async fn stop(&self) {
        self.tasks.shutdown().await;
        tracing::info!(backend = "memory", "Notification backend stopped");
    }

    async fn store(
        &self,
        scope: &str,
        scope_id: &str,
        notification: &Notification,
    ) -> Result<Option<Uuid>, BackendError> {
        let key = scope_key(scope, scope_id);
        let mut replaced = None;

        {
            // The shard guard makes replace-then-insert atomic for this key
            let mut rows = self.store.notifications.entry(key.clone()).or_default();
            if let Some(group) = notification.group.as_deref() {
                if let Some(pos) = rows.iter().position(|n| n.group.as_deref() == Some(group)) {
                    replaced = Some(rows.remove(pos).id);
                }
            }
            rows.push(notification.clone());
        }

        if let Some(old) = replaced {
            self.store.index.remove(&old);
        }
        self.store.index.insert(notification.id, key);

        tracing::trace!(
            scope = %scope,
            scope_id = %scope_id,
            notification_id = %notification.id,
            replaced = ?replaced,
            "Notification stored in memory"
        );
        Ok(replaced)
    }

    async fn remove(&self, id: Uuid) -> Result<bool, BackendError> {
        let Some((_, key)) = self.store.index.remove(&id) else {
            return Ok(false);
        };
        Ok(!self.store.remove_where(&key, |n| n.id == id).is_empty())
    }

    async fn remove_by_group(
        &self,
        scope: &str,
        scope_id: &str,
        group: &str,
    ) -> Result<Option<Uuid>, BackendError> {
        let removed = self
            .store
            .remove_where(&scope_key(scope, scope_id), |n| n.group.as_deref() == Some(group));
        Ok(removed.into_iter().next())
    }

    async fn find_by_group(
        &self,
        scope: &str,
        scope_id: &str,
        group: &str,
    ) -> Result<Option<(Uuid, NotificationMode)>, BackendError> {
        Ok(self
            .store
            .notifications
            .get(&scope_key(scope, scope_id))
            .and_then(|rows| {
                rows.iter()
                    .find(|n| n.group.as_deref() == Some(group))
                    .map(|n| (n.id, n.mode))
            }))
    }

    async fn get_queued(
        &self,
        scope: &str,
        scope_id: &str,
    ) -> Result<Vec<Notification>, BackendError> {
        Ok(self
            .store
            .select(scope, scope_id, |n| n.mode == NotificationMode::Queued))
    }

    async fn get_since(
        &self,
        scope: &str,
        scope_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Notification>, BackendError> {
        Ok(self.store.select(scope, scope_id, |n| {
            n.mode == NotificationMode::Timeseries && n.created_at > since
        }))
    }

    async fn get_mode(&self, id: Uuid) -> Result<Option<NotificationMode>, BackendError> {
        let Some(key) = self.store.index.get(&id).map(|k| k.value().clone()) else {
            return Ok(None);
        };
        Ok(self
            .store
            .notifications
            .get(&key)
            .and_then(|rows| rows.iter().find(|n| n.id == id).map(|n| n.mode)))
    }

    async fn add_subscription(&self, subscriber: &str, source: &str) -> Result<(), BackendError> {
        self.store
            .subscriptions
            .entry(subscriber.to_string())
            .or_default()
            .insert(source.to_string());
        Ok(())
    }

    async fn remove_subscription(&self, subscriber: &str, source: &str) -> Result<(), BackendError> {
        if let Some(mut sources) = self.store.subscriptions.get_mut(subscriber) {
            sources.remove(source);
        }
        self.store
            .subscriptions
            .remove_if(subscriber, |_, sources| sources.is_empty());
        Ok(())
    }

    async fn get_subscriptions(&self, subscriber: &str) -> Result<Vec<String>, BackendError> {
        Ok(self
            .store
            .subscriptions
            .get(subscriber)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn cleanup_expired(&self) -> Result<usize, BackendError> {
        self.store.sweep_expired().await
    }

    async fn publish(&self, _message: &FanoutMessage) -> Result<(), BackendError> {
        Ok(())
    }

    /// No-op: a single process has no remote replicas to hear from.
    fn on_remote_message(&self, _handler: RemoteHandler) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn queued(t: &str) -> Notification {
        Notification::builder(t).build()
    }

    #[tokio::test]
    async fn test_store_and_get_queued_in_order() {
        let backend = MemoryBackend::default();
        let mut first = queued("a");
        let second = queued("b");
        first.created_at = second.created_at - ChronoDuration::seconds(1);

        backend.store("session", "s1", &second).await.unwrap();
        backend.store("session", "s1", &first).await.unwrap();

        let rows = backend.get_queued("session", "s1").await.unwrap();
        let types: Vec<_> = rows.iter().map(|n| n.notification_type.as_str()).collect();
        assert_eq!(types, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_group_replacement_returns_old_id() {
        let backend = MemoryBackend::default();
        let n1 = Notification::builder("deploy").group("deploy").field("step", "1").build();
        let n2 = Notification::builder("deploy").group("deploy").field("step", "2").build();

        assert_eq!(backend.store("session", "s1", &n1).await.unwrap(), None);
        assert_eq!(backend.store("session", "s1", &n2).await.unwrap(), Some(n1.id));

        let rows = backend.get_queued("session", "s1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, n2.id);
        assert_eq!(backend.get_mode(n1.id).await.unwrap(), None);
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_groups_are_scoped_per_key() {
        let backend = MemoryBackend::default();
        let a = Notification::builder("x").group("g").build();
        let b = Notification::builder("x").group("g").build();

        backend.store("session", "s1", &a).await.unwrap();
        assert_eq!(backend.store("session", "s2", &b).await.unwrap(), None);
        assert_eq!(backend.len(), 2);
    }

    #[tokio::test]
    async fn test_get_since_filters_mode_and_time() {
        let backend = MemoryBackend::default();
        let cutoff = Utc::now() - ChronoDuration::seconds(10);

        let mut old = Notification::builder("old").mode(NotificationMode::Timeseries).build();
        old.created_at = cutoff - ChronoDuration::seconds(5);
        let fresh = Notification::builder("fresh").mode(NotificationMode::Timeseries).build();

        backend.store("user", "u1", &old).await.unwrap();
        backend.store("user", "u1", &fresh).await.unwrap();
        backend.store("user", "u1", &queued("q")).await.unwrap();

        let rows = backend.get_since("user", "u1", cutoff).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, fresh.id);
        assert!(backend
            .get_queued("user", "u1")
            .await
            .unwrap()
            .iter()
            .all(|n| n.mode == NotificationMode::Queued));
    }

    #[tokio::test]
    async fn test_remove_and_remove_by_group() {
        let backend = MemoryBackend::default();
        let plain = queued("plain");
        let grouped = Notification::builder("g").group("build").build();
        backend.store("global", "", &plain).await.unwrap();
        backend.store("global", "", &grouped).await.unwrap();

        assert_eq!(
            backend.find_by_group("global", "", "build").await.unwrap(),
            Some((grouped.id, NotificationMode::Queued))
        );
        assert_eq!(
            backend.remove_by_group("global", "", "build").await.unwrap(),
            Some(grouped.id)
        );
        assert_eq!(backend.remove_by_group("global", "", "build").await.unwrap(), None);

        assert!(backend.remove(plain.id).await.unwrap());
        assert!(!backend.remove(plain.id).await.unwrap());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_subscriptions_idempotent() {
        let backend = MemoryBackend::default();
        backend.add_subscription("user:u1", "blog:tech").await.unwrap();
        backend.add_subscription("user:u1", "blog:tech").await.unwrap();
        assert_eq!(backend.get_subscriptions("user:u1").await.unwrap(), vec!["blog:tech"]);

        backend.remove_subscription("user:u1", "blog:tech").await.unwrap();
        backend.remove_subscription("user:u1", "blog:tech").await.unwrap();
        assert!(backend.get_subscriptions("user:u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_expired_by_mode() {
        let backend = MemoryBackend::new(RetentionPolicy {
            queued_ttl_seconds: 0,
            timeseries_ttl_seconds: 3_600,
            ..Default::default()
        });
        backend.store("session", "s1", &queued("q")).await.unwrap();
        let ts = Notification::builder("t").mode(NotificationMode::Timeseries).build();
        backend.store("session", "s1", &ts).await.unwrap();

        assert_eq!(backend.cleanup_expired().await.unwrap(), 1);
        assert_eq!(backend.get_mode(ts.id).await.unwrap(), Some(NotificationMode::Timeseries));
    }

    #[tokio::test]
    async fn test_start_stop() {
        let backend = MemoryBackend::default();
        backend.start().await.unwrap();
        backend.stop().await;
        assert_eq!(backend.backend_type(), BackendKind::Memory);
    }
}

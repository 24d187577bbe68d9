//! Notification orchestrator.
//!
//! Composes the process-local [`SourceRegistry`] with a pluggable
//! [`NotificationBackend`]. Sends are stored before they are pushed, so a
//! listener never sees a notification that failed to persist. Publishing to
//! other replicas happens after the local push and never fails a send.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use uuid::Uuid;

use crate::backend::NotificationBackend;
use crate::error::{NotifyError, Result};
use crate::metrics::{DeliveryMetrics, FanoutMetrics};

use super::hooks::{HookEvent, HookRegistry};
use super::listener::{ListenerId, ListenerQueue};
use super::registry::SourceRegistry;
use super::request::NotifyRequest;
use super::types::{
    session_key, split_source_key, user_key, Notification, NotificationMode, GLOBAL_KEY,
};
use super::wire::{FanoutAction, FanoutMessage};

/// Result of [`NotificationService::send`]
#[derive(Debug, Clone)]
pub enum SendOutcome {
    /// A pre-send filter vetoed the notification
    Cancelled,
    Sent {
        notification: Notification,
        /// Local listener enqueues
        delivered: usize,
    },
}

impl SendOutcome {
    pub fn notification(&self) -> Option<&Notification> {
        match self {
            Self::Sent { notification, .. } => Some(notification),
            Self::Cancelled => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

struct ServiceInner {
    registry: Mutex<SourceRegistry>,
    backend: Arc<dyn NotificationBackend>,
    hooks: HookRegistry,
    publisher_id: String,
    /// Subscriber keys whose persistent subscriptions are in the registry
    loaded: DashSet<String>,
}

impl ServiceInner {
    fn registry(&self) -> MutexGuard<'_, SourceRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_local(&self, source_key: &str, notification: &Notification) -> usize {
        let delivered = self.registry().push(source_key, notification);
        DeliveryMetrics::record_pushed(delivered);
        delivered
    }

    /// Apply a message from another replica. Never re-publishes, never runs hooks.
    fn handle_remote(&self, message: FanoutMessage) {
        if message.publisher_id == self.publisher_id {
            FanoutMetrics::record_self_echo();
            return;
        }

        match (message.action, message.notification, message.notification_id, message.subscriber) {
            (FanoutAction::Send, Some(wire), _, _) => match Notification::from_wire(&wire) {
                Ok(notification) => {
                    let delivered = self.push_local(&message.source_key, &notification);
                    tracing::debug!(
                        source_key = %message.source_key,
                        notification_id = %notification.id,
                        delivered = delivered,
                        "Delivered remote notification"
                    );
                }
                Err(e) => {
                    FanoutMetrics::record_malformed();
                    tracing::warn!(
                        source_key = %message.source_key,
                        error = %e,
                        "Dropping remote notification with invalid wire map"
                    );
                }
            },
            (FanoutAction::Dismiss, _, Some(id), _) => {
                self.push_local(&message.source_key, &Notification::dismissed(id));
            }
            (FanoutAction::Subscribe, _, _, Some(subscriber)) => {
                // Unloaded subscribers read the edge from storage when they load
                if self.loaded.contains(&subscriber) {
                    self.registry().subscribe(&subscriber, &message.source_key);
                }
            }
            (FanoutAction::Unsubscribe, _, _, Some(subscriber)) => {
                self.registry().unsubscribe(&subscriber, &message.source_key);
            }
            (action, ..) => {
                FanoutMetrics::record_malformed();
                tracing::warn!(action = ?action, "Dropping incomplete fanout message");
            }
        }
    }
}

/// Cheaply cloneable handle to the notification engine.
#[derive(Clone)]
pub struct NotificationService {
    inner: Arc<ServiceInner>,
}

impl NotificationService {
    pub fn new(backend: Arc<dyn NotificationBackend>) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                registry: Mutex::new(SourceRegistry::new()),
                backend,
                hooks: HookRegistry::new(),
                publisher_id: Uuid::new_v4().to_string(),
                loaded: DashSet::new(),
            }),
        }
    }

    /// Filter and action registry
    pub fn hooks(&self) -> &HookRegistry {
        &self.inner.hooks
    }

    pub fn backend(&self) -> &Arc<dyn NotificationBackend> {
        &self.inner.backend
    }

    /// Random per-process id stamped on published messages
    pub fn publisher_id(&self) -> &str {
        &self.inner.publisher_id
    }

    /// Register the remote handler and start the backend.
    pub async fn start(&self) -> Result<()> {
        let weak: Weak<ServiceInner> = Arc::downgrade(&self.inner);
        self.inner.backend.on_remote_message(Arc::new(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_remote(message);
            }
        }));
        self.inner.backend.start().await?;

        tracing::info!(
            backend = %self.inner.backend.backend_type(),
            publisher_id = %self.inner.publisher_id,
            "Notification service started"
        );
        Ok(())
    }

    pub async fn stop(&self) {
        self.inner.backend.stop().await;
        tracing::info!("Notification service stopped");
    }

    /// Store (unless ephemeral), push locally, publish, then run actions.
    #[tracing::instrument(
        name = "notification.send",
        skip(self, notification),
        fields(notification_id = %notification.id, mode = %notification.mode)
    )]
    pub async fn send(&self, source_key: &str, notification: Notification) -> Result<SendOutcome> {
        let Some(notification) = self.inner.hooks.apply_filters(source_key, notification).await else {
            DeliveryMetrics::record_cancelled();
            tracing::debug!(source_key = %source_key, "Notification cancelled by filter");
            return Ok(SendOutcome::Cancelled);
        };

        if notification.mode.is_stored() {
            let (scope, scope_id) = split_source_key(source_key);
            let replaced = self
                .inner
                .backend
                .store(scope, scope_id, &notification)
                .await?;

            if let Some(old_id) = replaced {
                DeliveryMetrics::record_replaced();
                tracing::debug!(
                    source_key = %source_key,
                    replaced_id = %old_id,
                    "Group replacement superseded stored notification"
                );
                self.inner
                    .push_local(source_key, &Notification::dismissed(old_id));
                self.publish(FanoutMessage::dismiss(self.publisher_id(), source_key, old_id))
                    .await;
            }
        }

        let delivered = self.inner.push_local(source_key, &notification);
        self.publish(FanoutMessage::send(self.publisher_id(), source_key, &notification))
            .await;
        DeliveryMetrics::record_sent(notification.mode.as_str());

        self.inner
            .hooks
            .run_actions(&HookEvent::Sent {
                source_key: source_key.to_string(),
                notification: notification.clone(),
            })
            .await;

        tracing::debug!(
            source_key = %source_key,
            delivered = delivered,
            "Notification sent"
        );
        Ok(SendOutcome::Sent {
            notification,
            delivered,
        })
    }

    pub async fn notify_session(&self, session_id: &str, notification: Notification) -> Result<SendOutcome> {
        self.send(&session_key(session_id), notification).await
    }

    pub async fn notify_user(&self, user_id: &str, notification: Notification) -> Result<SendOutcome> {
        self.send(&user_key(user_id), notification).await
    }

    pub async fn notify_broadcast(&self, notification: Notification) -> Result<SendOutcome> {
        self.send(GLOBAL_KEY, notification).await
    }

    pub async fn notify_source(&self, source_key: &str, notification: Notification) -> Result<SendOutcome> {
        self.send(source_key, notification).await
    }

    /// Route an ingress request body.
    pub async fn dispatch(&self, request: NotifyRequest) -> Result<SendOutcome> {
        let (source_key, notification) = request.into_parts()?;
        self.send(&source_key, notification).await
    }

    /// Persist `subscriber -> source` and apply it on every replica.
    pub async fn subscribe_source(&self, subscriber: &str, source: &str) -> Result<()> {
        self.inner.backend.add_subscription(subscriber, source).await?;
        self.inner.registry().subscribe(subscriber, source);
        self.publish(FanoutMessage::subscribe(self.publisher_id(), subscriber, source))
            .await;
        tracing::info!(subscriber = %subscriber, source = %source, "Persistent subscription added");
        Ok(())
    }

    pub async fn unsubscribe_source(&self, subscriber: &str, source: &str) -> Result<()> {
        self.inner
            .backend
            .remove_subscription(subscriber, source)
            .await?;
        self.inner.registry().unsubscribe(subscriber, source);
        self.publish(FanoutMessage::unsubscribe(self.publisher_id(), subscriber, source))
            .await;
        tracing::info!(subscriber = %subscriber, source = %source, "Persistent subscription removed");
        Ok(())
    }

    /// Dismiss by id, or by group at the session and user keys.
    ///
    /// Returns whether anything was removed. TIMESERIES notifications are
    /// rejected with [`NotifyError::DismissNotAllowed`].
    #[tracing::instrument(name = "notification.dismiss", skip(self))]
    pub async fn dismiss(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        id: Option<Uuid>,
        group: Option<&str>,
    ) -> Result<bool> {
        let announce_key = match user_id {
            Some(user_id) => user_key(user_id),
            None => session_key(session_id),
        };

        if let Some(id) = id {
            if self.inner.backend.get_mode(id).await? == Some(NotificationMode::Timeseries) {
                return Err(NotifyError::DismissNotAllowed { id });
            }
            let removed = self.inner.backend.remove(id).await?;
            if removed {
                self.announce_dismissal(&announce_key, id).await;
            }
            return Ok(removed);
        }

        let Some(group) = group else {
            return Ok(false);
        };

        let mut keys = vec![session_key(session_id)];
        if let Some(user_id) = user_id {
            keys.push(user_key(user_id));
        }

        // Every match is checked before anything is removed
        let mut matches = Vec::with_capacity(keys.len());
        for key in &keys {
            let (scope, scope_id) = split_source_key(key);
            if let Some((found, mode)) = self
                .inner
                .backend
                .find_by_group(scope, scope_id, group)
                .await?
            {
                if mode == NotificationMode::Timeseries {
                    return Err(NotifyError::DismissNotAllowed { id: found });
                }
                matches.push(found);
            }
        }

        let mut removed_any = false;
        for found in matches {
            if self.inner.backend.remove(found).await? {
                self.announce_dismissal(&announce_key, found).await;
                removed_any = true;
            }
        }
        Ok(removed_any)
    }

    async fn announce_dismissal(&self, source_key: &str, id: Uuid) {
        DeliveryMetrics::record_dismissed();
        self.inner.push_local(source_key, &Notification::dismissed(id));
        self.publish(FanoutMessage::dismiss(self.publisher_id(), source_key, id))
            .await;
        self.inner
            .hooks
            .run_actions(&HookEvent::Dismissed {
                source_key: source_key.to_string(),
                notification_id: id,
            })
            .await;
        tracing::debug!(source_key = %source_key, notification_id = %id, "Notification dismissed");
    }

    /// Stored QUEUED notifications relevant to a session, oldest first.
    pub async fn get_queued(&self, session_id: &str, user_id: Option<&str>) -> Result<Vec<Notification>> {
        let mut rows = Vec::new();
        for key in self.relevant_keys(session_id, user_id).await? {
            let (scope, scope_id) = split_source_key(&key);
            rows.extend(self.inner.backend.get_queued(scope, scope_id).await?);
        }
        Ok(merge_sorted(rows))
    }

    /// Stored TIMESERIES notifications newer than `since`, oldest first.
    pub async fn get_since(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<Notification>> {
        let mut rows = Vec::new();
        for key in self.relevant_keys(session_id, user_id).await? {
            let (scope, scope_id) = split_source_key(&key);
            rows.extend(self.inner.backend.get_since(scope, scope_id, since).await?);
        }
        Ok(merge_sorted(rows))
    }

    /// Session, user and global keys plus everything upstream of them.
    async fn relevant_keys(&self, session_id: &str, user_id: Option<&str>) -> Result<BTreeSet<String>> {
        let mut base = vec![session_key(session_id)];
        if let Some(user_id) = user_id {
            base.push(user_key(user_id));
        }
        self.ensure_subscriptions_loaded(&base).await?;
        base.push(GLOBAL_KEY.to_string());

        let registry = self.inner.registry();
        let mut keys = BTreeSet::new();
        for key in base {
            keys.extend(registry.resolve_upstream(&key));
            keys.insert(key);
        }
        Ok(keys)
    }

    /// Load persistent subscriptions for keys not loaded yet in this process.
    async fn ensure_subscriptions_loaded(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            if self.inner.loaded.contains(key) {
                continue;
            }
            let sources = self.inner.backend.get_subscriptions(key).await?;
            {
                let mut registry = self.inner.registry();
                for source in &sources {
                    registry.subscribe(key, source);
                }
            }
            self.inner.loaded.insert(key.clone());
            tracing::debug!(subscriber = %key, count = sources.len(), "Loaded persistent subscriptions");
        }
        Ok(())
    }

    /// Attach a new listener queue for a session.
    #[tracing::instrument(name = "notification.register", skip(self))]
    pub async fn register_connection(&self, session_id: &str, user_id: Option<&str>) -> Result<ListenerQueue> {
        let session = session_key(session_id);
        let user = user_id.map(user_key);

        let mut keys = vec![session.clone()];
        keys.extend(user.clone());
        self.ensure_subscriptions_loaded(&keys).await?;

        let (queue, sink) = ListenerQueue::new(session_id);
        {
            let mut registry = self.inner.registry();
            if let Some(user) = &user {
                registry.subscribe(&session, user);
                registry.subscribe(user, GLOBAL_KEY);
            }
            registry.subscribe(&session, GLOBAL_KEY);
            registry.add_listener(&session, sink);
        }
        DeliveryMetrics::listener_opened();

        tracing::info!(
            session_id = %session_id,
            listener_id = %queue.id(),
            "Connection registered"
        );
        Ok(queue)
    }

    /// Detach a listener. The last one for a session tears down all of the
    /// session's upstream edges. Returns whether the listener was registered.
    pub fn unregister_connection(&self, session_id: &str, listener_id: ListenerId) -> bool {
        let session = session_key(session_id);

        let (removed, torn_down) = {
            let mut registry = self.inner.registry();
            let removed = registry.remove_listener(&session, listener_id);
            let torn_down = removed && !registry.has_listeners(&session);
            if torn_down {
                registry.unsubscribe_all(&session);
            }
            (removed, torn_down)
        };

        if torn_down {
            self.inner.loaded.remove(&session);
        }
        if removed {
            DeliveryMetrics::listener_closed();
            tracing::info!(
                session_id = %session_id,
                listener_id = %listener_id,
                session_closed = torn_down,
                "Connection unregistered"
            );
        }
        removed
    }

    pub fn resolve_upstream(&self, source_key: &str) -> HashSet<String> {
        self.inner.registry().resolve_upstream(source_key)
    }

    pub fn resolve_downstream(&self, source_key: &str) -> HashSet<String> {
        self.inner.registry().resolve_downstream(source_key)
    }

    /// Live listener queues on this process
    pub fn listener_count(&self) -> usize {
        self.inner.registry().listener_count()
    }

    async fn publish(&self, message: FanoutMessage) {
        if let Err(e) = self.inner.backend.publish(&message).await {
            tracing::warn!(
                action = ?message.action,
                source_key = %message.source_key,
                error = %e,
                "Cross-replica publish failed"
            );
        }
    }
}

/// Dedupe by id and order by `(created_at, id)`.
fn merge_sorted(rows: Vec<Notification>) -> Vec<Notification> {
    let mut by_id: HashMap<Uuid, Notification> = HashMap::with_capacity(rows.len());
    for row in rows {
        by_id.entry(row.id).or_insert(row);
    }
    let mut merged: Vec<Notification> = by_id.into_values().collect();
    merged.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use chrono::Duration as ChronoDuration;

    fn service() -> NotificationService {
        NotificationService::new(Arc::new(MemoryBackend::default()))
    }

    #[test]
    fn test_merge_sorted_dedupes_and_orders() {
        let mut a = Notification::builder("a").build();
        let b = Notification::builder("b").build();
        a.created_at = b.created_at - ChronoDuration::seconds(1);

        let merged = merge_sorted(vec![b.clone(), a.clone(), b.clone()]);
        assert_eq!(merged.iter().map(|n| n.id).collect::<Vec<_>>(), vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn test_self_echo_is_dropped() {
        let svc = service();
        let mut queue = svc.register_connection("s1", None).await.unwrap();

        let n = Notification::builder("echo").build();
        svc.inner
            .handle_remote(FanoutMessage::send(svc.publisher_id(), "session:s1", &n));
        assert!(queue.try_recv().is_none());

        svc.inner
            .handle_remote(FanoutMessage::send("other-replica", "session:s1", &n));
        assert_eq!(queue.try_recv().map(|n| n.notification_type), Some("echo".into()));
    }

    #[tokio::test]
    async fn test_remote_subscription_changes_apply_locally() {
        let svc = service();
        let _queue = svc.register_connection("s1", Some("u1")).await.unwrap();
        svc.inner
            .handle_remote(FanoutMessage::subscribe("other", "user:u1", "blog:tech"));
        assert!(svc.resolve_upstream("user:u1").contains("blog:tech"));

        svc.inner
            .handle_remote(FanoutMessage::unsubscribe("other", "user:u1", "blog:tech"));
        assert!(svc.resolve_upstream("user:u1").is_empty());
    }

    #[tokio::test]
    async fn test_remote_subscribe_ignored_for_unloaded_subscriber() {
        let svc = service();
        svc.inner
            .handle_remote(FanoutMessage::subscribe("other", "session:gone", "blog:tech"));
        assert!(svc.resolve_upstream("session:gone").is_empty());
        assert!(svc.resolve_downstream("blog:tech").len() == 1);
    }

    #[tokio::test]
    async fn test_remote_dismiss_pushes_sentinel() {
        let svc = service();
        let mut queue = svc.register_connection("s1", Some("u1")).await.unwrap();
        let id = Uuid::new_v4();

        svc.inner
            .handle_remote(FanoutMessage::dismiss("other", "user:u1", id));

        let got = queue.try_recv().unwrap();
        assert!(got.is_dismissal());
        assert_eq!(got.id, id);
    }

    #[tokio::test]
    async fn test_remote_send_with_bad_wire_map_is_dropped() {
        let svc = service();
        let mut queue = svc.register_connection("s1", None).await.unwrap();

        let mut msg = FanoutMessage::send("other", "session:s1", &Notification::builder("x").build());
        if let Some(map) = msg.notification.as_mut() {
            map.remove("id");
        }
        svc.inner.handle_remote(msg);
        assert!(queue.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_start_registers_handler_without_cycle() {
        let backend = Arc::new(MemoryBackend::default());
        let svc = NotificationService::new(backend.clone());
        svc.start().await.unwrap();

        let weak = Arc::downgrade(&svc.inner);
        svc.stop().await;
        drop(svc);
        // The backend keeps only a weak reference to the service internals
        assert!(weak.upgrade().is_none());
    }
}

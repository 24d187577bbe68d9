//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use notify_engine::backend::{
    BackendError, BackendKind, MemoryBackend, NotificationBackend, RemoteHandler,
    RemoteHandlerSlot,
};
use notify_engine::notification::{
    FanoutMessage, ListenerQueue, Notification, NotificationMode, NotificationService,
};

/// In-process stand-in for a pub/sub channel. Every published payload is
/// handed to every attached replica, sender included, through the same
/// decode path the real transports use.
#[derive(Default)]
pub struct LoopbackHub {
    slots: Mutex<Vec<RemoteHandlerSlot>>,
    published: Mutex<Vec<String>>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Raw payloads seen so far
    pub fn published(&self) -> Vec<String> {
        self.published.lock().unwrap().clone()
    }

    /// Inject a raw payload as if it came from the transport
    pub fn inject(&self, payload: &str) {
        let slots = self.slots.lock().unwrap().clone();
        for slot in slots {
            slot.deliver_payload("loopback", payload);
        }
    }
}

/// Replica view of one shared store plus a shared hub
pub struct LoopbackBackend {
    store: Arc<MemoryBackend>,
    hub: Arc<LoopbackHub>,
}

impl LoopbackBackend {
    pub fn new(store: Arc<MemoryBackend>, hub: Arc<LoopbackHub>) -> Self {
        Self { store, hub }
    }
}

#[async_trait]
impl NotificationBackend for LoopbackBackend {
    fn backend_type(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn start(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn stop(&self) {}

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

    async fn get_queued(&self, scope: &str, scope_id: &str) -> Result<Vec<Notification>, BackendError> {
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
        self.hub.published.lock().unwrap().push(payload.clone());
        self.hub.inject(&payload);
        Ok(())
    }

    fn on_remote_message(&self, handler: RemoteHandler) {
        let slot = RemoteHandlerSlot::default();
        slot.set(handler);
        self.hub.slots.lock().unwrap().push(slot);
    }
}

/// Backend whose storage is down; reads succeed, writes fail
#[derive(Default)]
pub struct FailingStoreBackend {
    inner: MemoryBackend,
    publishes: AtomicUsize,
}

impl FailingStoreBackend {
    pub fn publishes(&self) -> usize {
        self.publishes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationBackend for FailingStoreBackend {
    fn backend_type(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn start(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn store(&self, _: &str, _: &str, _: &Notification) -> Result<Option<Uuid>, BackendError> {
        Err(BackendError::Unavailable("database is down".into()))
    }

    async fn remove(&self, id: Uuid) -> Result<bool, BackendError> {
        self.inner.remove(id).await
    }

    async fn remove_by_group(&self, scope: &str, scope_id: &str, group: &str) -> Result<Option<Uuid>, BackendError> {
        self.inner.remove_by_group(scope, scope_id, group).await
    }

    async fn find_by_group(
        &self,
        scope: &str,
        scope_id: &str,
        group: &str,
    ) -> Result<Option<(Uuid, NotificationMode)>, BackendError> {
        self.inner.find_by_group(scope, scope_id, group).await
    }

    async fn get_queued(&self, scope: &str, scope_id: &str) -> Result<Vec<Notification>, BackendError> {
        self.inner.get_queued(scope, scope_id).await
    }

    async fn get_since(
        &self,
        scope: &str,
        scope_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Notification>, BackendError> {
        self.inner.get_since(scope, scope_id, since).await
    }

    async fn get_mode(&self, id: Uuid) -> Result<Option<NotificationMode>, BackendError> {
        self.inner.get_mode(id).await
    }

    async fn add_subscription(&self, subscriber: &str, source: &str) -> Result<(), BackendError> {
        self.inner.add_subscription(subscriber, source).await
    }

    async fn remove_subscription(&self, subscriber: &str, source: &str) -> Result<(), BackendError> {
        self.inner.remove_subscription(subscriber, source).await
    }

    async fn get_subscriptions(&self, subscriber: &str) -> Result<Vec<String>, BackendError> {
        self.inner.get_subscriptions(subscriber).await
    }

    async fn cleanup_expired(&self) -> Result<usize, BackendError> {
        Ok(0)
    }

    async fn publish(&self, _message: &FanoutMessage) -> Result<(), BackendError> {
        self.publishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_remote_message(&self, _handler: RemoteHandler) {}
}

/// A started single-process service on a fresh memory backend
pub async fn memory_service() -> NotificationService {
    let service = NotificationService::new(Arc::new(MemoryBackend::default()));
    service.start().await.unwrap();
    service
}

/// Two started replicas sharing one store and one hub
pub async fn replica_pair() -> (NotificationService, NotificationService, Arc<LoopbackHub>) {
    let store = Arc::new(MemoryBackend::default());
    let hub = LoopbackHub::new();

    let a = NotificationService::new(Arc::new(LoopbackBackend::new(store.clone(), hub.clone())));
    let b = NotificationService::new(Arc::new(LoopbackBackend::new(store, hub.clone())));
    a.start().await.unwrap();
    b.start().await.unwrap();
    (a, b, hub)
}

/// Next queued item within a short bound
pub async fn recv_within(queue: &mut ListenerQueue, ms: u64) -> Option<Notification> {
    tokio::time::timeout(Duration::from_millis(ms), queue.recv())
        .await
        .ok()
        .flatten()
}

//! Per-connection delivery queue.
//!
//! The registry holds a [`ListenerSink`]; the connection layer owns the
//! matching [`ListenerQueue`] and turns it into an outbound stream.

use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use super::types::Notification;

/// Identifies one listener queue.
pub type ListenerId = Uuid;

/// Outcome of waiting on a listener queue
#[derive(Debug)]
pub enum QueueEvent {
    Notification(Notification),
    /// Nothing arrived within the keepalive window
    Keepalive,
    /// The sink side is gone; no more events will arrive
    Closed,
}

/// Sending half, registered at a source key.
#[derive(Debug, Clone)]
pub struct ListenerSink {
    id: ListenerId,
    tx: mpsc::UnboundedSender<Notification>,
}

impl ListenerSink {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Non-blocking enqueue. Returns false if the queue has been dropped.
    pub fn push(&self, notification: &Notification) -> bool {
        self.tx.send(notification.clone()).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half, owned by a live connection.
#[derive(Debug)]
pub struct ListenerQueue {
    id: ListenerId,
    session_id: String,
    rx: mpsc::UnboundedReceiver<Notification>,
}

impl ListenerQueue {
    /// Create a queue for a session together with its sink.
    pub fn new(session_id: impl Into<String>) -> (Self, ListenerSink) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let queue = Self {
            id,
            session_id: session_id.into(),
            rx,
        };
        (queue, ListenerSink { id, tx })
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Wait for the next notification. `None` once every sink is dropped.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next notification, giving up after `keepalive` so the
    /// caller can emit a liveness signal on idle connections.
    pub async fn next_event(&mut self, keepalive: Duration) -> QueueEvent {
        match tokio::time::timeout(keepalive, self.rx.recv()).await {
            Ok(Some(notification)) => QueueEvent::Notification(notification),
            Ok(None) => QueueEvent::Closed,
            Err(_) => QueueEvent::Keepalive,
        }
    }

    /// Drain everything currently queued without waiting.
    pub fn drain(&mut self) -> Vec<Notification> {
        let mut items = Vec::new();
        while let Ok(n) = self.rx.try_recv() {
            items.push(n);
        }
        items
    }
}

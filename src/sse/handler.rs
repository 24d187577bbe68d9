use std::collections::HashSet;
use std::convert::Infallible;
use std::time::{Duration, Instant};

use axum::{
    extract::{Query, State},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
};
use futures::stream::Stream;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::NotifyError;
use crate::notification::{ListenerId, ListenerQueue, Notification, NotificationService, QueueEvent};
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct SseQuery {
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[tracing::instrument(
    name = "sse.connect",
    skip(state, query),
    fields(session_id = %query.session_id, has_user = query.user_id.is_some())
)]
pub async fn sse_handler(State(state): State<AppState>, Query(query): Query<SseQuery>) -> Response {
    if query.session_id.trim().is_empty() {
        return NotifyError::Validation("session_id must be non-empty".to_string()).into_response();
    }
    let user_id = query.user_id.as_deref().filter(|u| !u.is_empty());

    // Register before replaying so nothing sent in between is lost
    let queue = match state
        .service
        .register_connection(&query.session_id, user_id)
        .await
    {
        Ok(queue) => queue,
        Err(e) => return e.into_response(),
    };
    let guard = CleanupGuard::new(state.service.clone(), query.session_id.clone(), queue.id());

    let backlog = match state.service.get_queued(&query.session_id, user_id).await {
        Ok(backlog) => backlog,
        // guard drops here and unregisters
        Err(e) => return e.into_response(),
    };

    tracing::info!(
        listener_id = %queue.id(),
        replayed = backlog.len(),
        "SSE stream established"
    );

    let keepalive = Duration::from_secs(state.settings.notifications.stream_keepalive_seconds.max(1));
    Sse::new(event_stream(queue, backlog, keepalive, guard)).into_response()
}

fn notification_event(notification: &Notification) -> Event {
    match serde_json::to_string(&notification.to_wire()) {
        Ok(json) => Event::default()
            .event("notification")
            .id(notification.id.to_string())
            .data(json),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize SSE notification");
            Event::default().event("error").data("serialization failed")
        }
    }
}

fn event_stream(
    mut queue: ListenerQueue,
    backlog: Vec<Notification>,
    keepalive: Duration,
    guard: CleanupGuard,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let _guard = guard;

        let mut replayed: HashSet<Uuid> = HashSet::with_capacity(backlog.len());
        for notification in &backlog {
            replayed.insert(notification.id);
            yield Ok(notification_event(notification));
        }
        yield Ok(Event::default().event("sync").data(backlog.len().to_string()));

        loop {
            match queue.next_event(keepalive).await {
                QueueEvent::Notification(notification) => {
                    // Already delivered by the replay, unless this is its dismissal
                    if !notification.is_dismissal() && replayed.remove(&notification.id) {
                        continue;
                    }
                    yield Ok(notification_event(&notification));
                }
                QueueEvent::Keepalive => {
                    yield Ok(Event::default().event("keepalive").data(""));
                }
                QueueEvent::Closed => break,
            }
        }
    }
}

/// Unregisters the listener when the stream is dropped
struct CleanupGuard {
    service: NotificationService,
    session_id: String,
    listener_id: ListenerId,
    opened: Instant,
}

impl CleanupGuard {
    fn new(service: NotificationService, session_id: String, listener_id: ListenerId) -> Self {
        Self {
            service,
            session_id,
            listener_id,
            opened: Instant::now(),
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.service
            .unregister_connection(&self.session_id, self.listener_id);
        tracing::info!(
            session_id = %self.session_id,
            listener_id = %self.listener_id,
            duration_secs = self.opened.elapsed().as_secs_f64(),
            "SSE stream closed"
        );
    }
}

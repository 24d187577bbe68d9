//! Control endpoints under `/api/v1`.

use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{NotifyError, Result};
use crate::notification::{NotifyRequest, SendOutcome};
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct NotifyResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_id: Option<Uuid>,
    pub delivered: usize,
}

/// POST /api/v1/notify
#[tracing::instrument(name = "api.notify", skip(state, request))]
pub async fn notify(
    State(state): State<AppState>,
    Json(request): Json<NotifyRequest>,
) -> Result<Json<NotifyResponse>> {
    let response = match state.service.dispatch(request).await? {
        SendOutcome::Cancelled => NotifyResponse {
            status: "cancelled",
            notification_id: None,
            delivered: 0,
        },
        SendOutcome::Sent {
            notification,
            delivered,
        } => NotifyResponse {
            status: "sent",
            notification_id: Some(notification.id),
            delivered,
        },
    };
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct DismissRequest {
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub group: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DismissResponse {
    pub dismissed: bool,
}

/// POST /api/v1/dismiss
pub async fn dismiss(
    State(state): State<AppState>,
    Json(request): Json<DismissRequest>,
) -> Result<Json<DismissResponse>> {
    if request.id.is_none() && request.group.is_none() {
        return Err(NotifyError::Validation(
            "either id or group is required".to_string(),
        ));
    }

    let dismissed = state
        .service
        .dismiss(
            &request.session_id,
            request.user_id.as_deref(),
            request.id,
            request.group.as_deref(),
        )
        .await?;
    Ok(Json(DismissResponse { dismissed }))
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionRequest {
    /// Child source key, e.g. `user:u1`
    pub subscriber: String,
    /// Parent source key, e.g. `blog:tech`
    pub source: String,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub subscriber: String,
    pub source: String,
    pub subscribed: bool,
}

impl SubscriptionRequest {
    fn validate(&self) -> Result<()> {
        if self.subscriber.trim().is_empty() || self.source.trim().is_empty() {
            return Err(NotifyError::Validation(
                "subscriber and source must be non-empty".to_string(),
            ));
        }
        if self.subscriber == self.source {
            return Err(NotifyError::Validation(
                "a source cannot subscribe to itself".to_string(),
            ));
        }
        Ok(())
    }
}

/// POST /api/v1/subscriptions
pub async fn subscribe(
    State(state): State<AppState>,
    Json(request): Json<SubscriptionRequest>,
) -> Result<Json<SubscriptionResponse>> {
    request.validate()?;
    state
        .service
        .subscribe_source(&request.subscriber, &request.source)
        .await?;
    Ok(Json(SubscriptionResponse {
        subscriber: request.subscriber,
        source: request.source,
        subscribed: true,
    }))
}

/// DELETE /api/v1/subscriptions
pub async fn unsubscribe(
    State(state): State<AppState>,
    Json(request): Json<SubscriptionRequest>,
) -> Result<Json<SubscriptionResponse>> {
    request.validate()?;
    state
        .service
        .unsubscribe_source(&request.subscriber, &request.source)
        .await?;
    Ok(Json(SubscriptionResponse {
        subscriber: request.subscriber,
        source: request.source,
        subscribed: false,
    }))
}

#[derive(Debug, Deserialize)]
pub struct NotificationsQuery {
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    /// Switches to the timeseries history newer than this instant
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct NotificationsResponse {
    pub notifications: Vec<Map<String, Value>>,
    pub count: usize,
}

/// GET /api/v1/notifications
pub async fn list_notifications(
    State(state): State<AppState>,
    Query(query): Query<NotificationsQuery>,
) -> Result<Json<NotificationsResponse>> {
    let user_id = query.user_id.as_deref();
    let rows = match query.since {
        Some(since) => state.service.get_since(&query.session_id, user_id, since).await?,
        None => state.service.get_queued(&query.session_id, user_id).await?,
    };

    let notifications: Vec<_> = rows.iter().map(|n| n.to_wire()).collect();
    Ok(Json(NotificationsResponse {
        count: notifications.len(),
        notifications,
    }))
}

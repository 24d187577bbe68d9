use axum::{
    routing::{get, post},
    Router,
};

use crate::server::AppState;

use super::handlers::{dismiss, list_notifications, notify, subscribe, unsubscribe};
use super::health::health;
use super::metrics::prometheus_metrics;

/// Unauthenticated operational endpoints
pub fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
}

/// Control endpoints, nested under `/api/v1` behind the API key check
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/notify", post(notify))
        .route("/dismiss", post(dismiss))
        .route("/subscriptions", post(subscribe).delete(unsubscribe))
        .route("/notifications", get(list_notifications))
}

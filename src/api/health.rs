//! Health endpoint.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub backend: String,
    pub publisher_id: String,
    pub listeners: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        backend: state.service.backend().backend_type().to_string(),
        publisher_id: state.service.publisher_id().to_string(),
        listeners: state.service.listener_count(),
    })
}

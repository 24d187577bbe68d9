use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::backend::BackendError;

/// Errors surfaced to callers of the notification service.
///
/// Transport failures never appear here: they are recovered inside the
/// backend listeners and only show up as delivery latency.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notification {id} is a timeseries entry and cannot be dismissed")]
    DismissNotAllowed { id: Uuid },

    #[error("Storage error: {0}")]
    Storage(#[from] BackendError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Check if running in production mode (based on RUN_MODE env var)
fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

impl IntoResponse for NotifyError {
    fn into_response(self) -> Response {
        let (status, code, client_message, log_message) = match &self {
            NotifyError::DismissNotAllowed { .. } => {
                let msg = self.to_string();
                (StatusCode::CONFLICT, "DISMISS_NOT_ALLOWED", msg.clone(), msg)
            }
            NotifyError::Storage(e) => {
                let log_msg = e.to_string();
                let client_msg = if is_production() {
                    "Storage temporarily unavailable".to_string()
                } else {
                    log_msg.clone()
                };
                (StatusCode::SERVICE_UNAVAILABLE, "STORAGE_ERROR", client_msg, log_msg)
            }
            NotifyError::Config(e) => {
                let log_msg = e.to_string();
                let client_msg = if is_production() {
                    "Configuration error".to_string()
                } else {
                    log_msg.clone()
                };
                (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR", client_msg, log_msg)
            }
            NotifyError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg.clone(),
                msg.clone(),
            ),
        };

        if status.is_server_error() {
            tracing::error!(
                code = %code,
                status = %status.as_u16(),
                message = %log_message,
                "API error"
            );
        } else {
            tracing::warn!(
                code = %code,
                status = %status.as_u16(),
                message = %log_message,
                "API request rejected"
            );
        }

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: client_message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, NotifyError>;

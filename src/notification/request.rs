//! Ingress request body turned into a routed notification.

use serde::Deserialize;

use super::types::{session_key, user_key, Notification, NotificationMode, Payload, GLOBAL_KEY};
use crate::error::NotifyError;

/// Fields shared by every target
#[derive(Debug, Clone, Deserialize)]
pub struct NotifyBody {
    #[serde(rename = "type")]
    pub notification_type: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub mode: NotificationMode,
    #[serde(default)]
    pub payload: Payload,
}

/// Request body, discriminated by `target`.
///
/// ```json
/// {"target": "user", "user_id": "u1", "type": "alert", "payload": {"level": "high"}}
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum NotifyRequest {
    Session {
        session_id: String,
        #[serde(flatten)]
        body: NotifyBody,
    },
    User {
        user_id: String,
        #[serde(flatten)]
        body: NotifyBody,
    },
    Broadcast {
        #[serde(flatten)]
        body: NotifyBody,
    },
}

impl NotifyRequest {
    pub fn source_key(&self) -> String {
        match self {
            Self::Session { session_id, .. } => session_key(session_id),
            Self::User { user_id, .. } => user_key(user_id),
            Self::Broadcast { .. } => GLOBAL_KEY.to_string(),
        }
    }

    /// Validate and split into the target source key and a fresh notification.
    pub fn into_parts(self) -> Result<(String, Notification), NotifyError> {
        let source_key = self.source_key();
        let body = match self {
            Self::Session { session_id, body } => {
                require_non_empty("session_id", &session_id)?;
                body
            }
            Self::User { user_id, body } => {
                require_non_empty("user_id", &user_id)?;
                body
            }
            Self::Broadcast { body } => body,
        };
        require_non_empty("type", &body.notification_type)?;

        let mut builder = Notification::builder(body.notification_type)
            .payload(body.payload)
            .mode(body.mode);
        if let Some(group) = body.group.filter(|g| !g.is_empty()) {
            builder = builder.group(group);
        }

        Ok((source_key, builder.build()))
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), NotifyError> {
    if value.trim().is_empty() {
        return Err(NotifyError::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Arbitrary key/value payload carried by a notification.
pub type Payload = Map<String, Value>;

/// Source key of the broadcast scope every session reaches.
pub const GLOBAL_KEY: &str = "global";

/// Type tag of the sentinel pushed when a stored notification goes away.
pub const DISMISSED_TYPE: &str = "dismissed";

/// Source key for a session.
pub fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

/// Source key for a user.
pub fn user_key(user_id: &str) -> String {
    format!("user:{}", user_id)
}

/// Split a source key into its storage `(scope, scope_id)`.
///
/// The split happens at the first `:`. A key without one (such as `global`)
/// maps to `(key, "")`.
pub fn split_source_key(key: &str) -> (&str, &str) {
    key.split_once(':').unwrap_or((key, ""))
}

/// Inverse of [`split_source_key`].
pub fn join_source_key(scope: &str, scope_id: &str) -> String {
    if scope_id.is_empty() {
        scope.to_string()
    } else {
        format!("{}:{}", scope, scope_id)
    }
}

/// Delivery mode, fixed when the notification is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotificationMode {
    /// Stored until dismissed, replaced or expired
    #[default]
    Queued,
    /// Stored permanently (until TTL), never dismissible
    Timeseries,
    /// Delivered live only, never stored
    Ephemeral,
}

impl NotificationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Timeseries => "timeseries",
            Self::Ephemeral => "ephemeral",
        }
    }

    /// Whether notifications in this mode are written to storage.
    pub fn is_stored(&self) -> bool {
        !matches!(self, Self::Ephemeral)
    }
}

impl fmt::Display for NotificationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationMode {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "timeseries" => Ok(Self::Timeseries),
            "ephemeral" => Ok(Self::Ephemeral),
            other => Err(WireError::InvalidField {
                field: "mode",
                reason: format!("unknown mode '{}'", other),
            }),
        }
    }
}

/// Errors decoding a notification or fanout message from its wire form.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// An immutable event record plus its delivery mode.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Unique identifier, stamped at creation
    pub id: Uuid,
    /// Type tag (e.g. "deploy.progress")
    pub notification_type: String,
    /// Creation time, truncated to microseconds
    pub created_at: DateTime<Utc>,
    /// Caller-supplied data
    pub payload: Payload,
    /// At most one stored notification per `(source, group)`
    pub group: Option<String>,
    pub mode: NotificationMode,
}

/// Builder for creating notifications
#[derive(Debug, Clone)]
pub struct NotificationBuilder {
    notification_type: String,
    payload: Payload,
    group: Option<String>,
    mode: NotificationMode,
}

impl NotificationBuilder {
    /// Create a new notification builder
    pub fn new(notification_type: impl Into<String>) -> Self {
        Self {
            notification_type: notification_type.into(),
            payload: Payload::new(),
            group: None,
            mode: NotificationMode::default(),
        }
    }

    /// Replace the payload
    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Set a single payload field
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Set the replacement group
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Set the delivery mode
    pub fn mode(mut self, mode: NotificationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Build the notification, stamping its id and creation time
    pub fn build(self) -> Notification {
        Notification {
            id: Uuid::new_v4(),
            notification_type: self.notification_type,
            created_at: Utc::now().trunc_subsecs(6),
            payload: self.payload,
            group: self.group,
            mode: self.mode,
        }
    }
}

impl Notification {
    /// Create a builder for this notification type
    pub fn builder(notification_type: impl Into<String>) -> NotificationBuilder {
        NotificationBuilder::new(notification_type)
    }

    /// Sentinel telling listeners that notification `id` no longer exists.
    pub fn dismissed(id: Uuid) -> Self {
        Self {
            id,
            notification_type: DISMISSED_TYPE.to_string(),
            created_at: Utc::now().trunc_subsecs(6),
            payload: Payload::new(),
            group: None,
            mode: NotificationMode::Ephemeral,
        }
    }

    pub fn is_dismissal(&self) -> bool {
        self.notification_type == DISMISSED_TYPE
    }

    /// Whether a stored notification has outlived its mode's TTL.
    pub fn is_expired(&self, queued_ttl_seconds: u64, timeseries_ttl_seconds: u64) -> bool {
        let ttl = match self.mode {
            NotificationMode::Queued => queued_ttl_seconds,
            NotificationMode::Timeseries => timeseries_ttl_seconds,
            NotificationMode::Ephemeral => return false,
        };
        let age = Utc::now().signed_duration_since(self.created_at);
        age.num_seconds() >= ttl as i64
    }

    /// Flat wire map: payload keys first, reserved keys written over them.
    pub fn to_wire(&self) -> Map<String, Value> {
        let mut map = self.payload.clone();
        map.insert("type".into(), Value::String(self.notification_type.clone()));
        map.insert("id".into(), Value::String(self.id.to_string()));
        map.insert("mode".into(), Value::String(self.mode.as_str().into()));
        map.insert(
            "created_at".into(),
            Value::String(self.created_at.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        match &self.group {
            Some(group) => {
                map.insert("group".into(), Value::String(group.clone()));
            }
            None => {
                map.remove("group");
            }
        }
        map
    }

    /// Rebuild a notification from its wire map.
    pub fn from_wire(map: &Map<String, Value>) -> Result<Self, WireError> {
        let mut payload = map.clone();

        let notification_type = take_str(&mut payload, "type")?;
        let id = take_str(&mut payload, "id")?;
        let id = Uuid::parse_str(&id).map_err(|e| WireError::InvalidField {
            field: "id",
            reason: e.to_string(),
        })?;
        let mode = take_str(&mut payload, "mode")?.parse()?;
        let created_at = take_str(&mut payload, "created_at")?;
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| WireError::InvalidField {
                field: "created_at",
                reason: e.to_string(),
            })?
            .with_timezone(&Utc);
        let group = match payload.remove("group") {
            None | Some(Value::Null) => None,
            Some(Value::String(g)) => Some(g),
            Some(_) => {
                return Err(WireError::InvalidField {
                    field: "group",
                    reason: "expected a string".into(),
                })
            }
        };

        Ok(Self {
            id,
            notification_type,
            created_at,
            payload,
            group,
            mode,
        })
    }
}

fn take_str(map: &mut Map<String, Value>, field: &'static str) -> Result<String, WireError> {
    match map.remove(field) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(WireError::InvalidField {
            field,
            reason: "expected a string".into(),
        }),
        None => Err(WireError::MissingField(field)),
    }
}

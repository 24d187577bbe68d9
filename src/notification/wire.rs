//! Cross-replica fanout message.
//!
//! Every replica publishes these on the shared transport channel and decodes
//! the ones it receives. The compact field names are part of the wire format.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::types::{Notification, WireError};

/// What a fanout message asks the receiving replica to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FanoutAction {
    #[serde(rename = "s")]
    Send,
    #[serde(rename = "d")]
    Dismiss,
    #[serde(rename = "sub")]
    Subscribe,
    #[serde(rename = "unsub")]
    Unsubscribe,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutMessage {
    #[serde(rename = "a")]
    pub action: FanoutAction,

    /// Source key the action applies to
    #[serde(rename = "sk")]
    pub source_key: String,

    /// Per-process id of the publishing replica
    #[serde(rename = "pid")]
    pub publisher_id: String,

    #[serde(rename = "n", default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<Map<String, Value>>,

    #[serde(rename = "nid", default, skip_serializing_if = "Option::is_none")]
    pub notification_id: Option<Uuid>,

    /// Subscriber key for subscription changes
    #[serde(rename = "sub", default, skip_serializing_if = "Option::is_none")]
    pub subscriber: Option<String>,
}

impl FanoutMessage {
    fn new(action: FanoutAction, publisher_id: &str, source_key: &str) -> Self {
        Self {
            action,
            source_key: source_key.to_string(),
            publisher_id: publisher_id.to_string(),
            notification: None,
            notification_id: None,
            subscriber: None,
        }
    }

    pub fn send(publisher_id: &str, source_key: &str, notification: &Notification) -> Self {
        Self {
            notification: Some(notification.to_wire()),
            ..Self::new(FanoutAction::Send, publisher_id, source_key)
        }
    }

    pub fn dismiss(publisher_id: &str, source_key: &str, notification_id: Uuid) -> Self {
        Self {
            notification_id: Some(notification_id),
            ..Self::new(FanoutAction::Dismiss, publisher_id, source_key)
        }
    }

    pub fn subscribe(publisher_id: &str, subscriber: &str, source_key: &str) -> Self {
        Self {
            subscriber: Some(subscriber.to_string()),
            ..Self::new(FanoutAction::Subscribe, publisher_id, source_key)
        }
    }

    pub fn unsubscribe(publisher_id: &str, subscriber: &str, source_key: &str) -> Self {
        Self {
            subscriber: Some(subscriber.to_string()),
            ..Self::new(FanoutAction::Unsubscribe, publisher_id, source_key)
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a payload and check that the field its action needs is present.
    pub fn decode(payload: &str) -> Result<Self, WireError> {
        let message: Self = serde_json::from_str(payload)?;

        let missing = match message.action {
            FanoutAction::Send if message.notification.is_none() => Some("n"),
            FanoutAction::Dismiss if message.notification_id.is_none() => Some("nid"),
            FanoutAction::Subscribe | FanoutAction::Unsubscribe if message.subscriber.is_none() => {
                Some("sub")
            }
            _ => None,
        };

        match missing {
            Some(field) => Err(WireError::MissingField(field)),
            None => Ok(message),
        }
    }
}

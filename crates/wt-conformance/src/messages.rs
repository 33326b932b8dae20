//! WebSocket message types
//!
//! Every frame is a JSON envelope `{"messageType": ..., "data": ...}`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{ConformanceError, ConformanceResult};

// =============================================================================
// Outgoing Commands
// =============================================================================

/// Command sent from the harness to the thing
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "messageType", content = "data", rename_all = "camelCase")]
pub enum Command {
    SetProperty(Map<String, Value>),
    RequestAction(Map<String, Value>),
    AddEventSubscription(Map<String, Value>),
}

impl Command {
    /// `{"brightness": 10}`
    pub fn set_property(name: &str, value: Value) -> Self {
        let mut data = Map::new();
        data.insert(name.to_string(), value);
        Command::SetProperty(data)
    }

    /// `{"fade": {"input": {...}}}`
    pub fn request_action(name: &str, input: Value) -> Self {
        let mut data = Map::new();
        data.insert(name.to_string(), json!({ "input": input }));
        Command::RequestAction(data)
    }

    /// `{"overheated": {}}` for each event name
    pub fn add_event_subscription<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let data = names
            .into_iter()
            .map(|name| (name.to_string(), json!({})))
            .collect();
        Command::AddEventSubscription(data)
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            Command::SetProperty(_) => "setProperty",
            Command::RequestAction(_) => "requestAction",
            Command::AddEventSubscription(_) => "addEventSubscription",
        }
    }

    pub fn to_json(&self) -> Value {
        // Serializing a map-backed enum cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// =============================================================================
// Incoming Notifications
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    message_type: String,
    #[serde(default)]
    data: Value,
}

/// Kind of a server-to-client notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NotificationKind {
    PropertyStatus,
    ActionStatus,
    Event,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::PropertyStatus => "propertyStatus",
            NotificationKind::ActionStatus => "actionStatus",
            NotificationKind::Event => "event",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification pushed by the thing
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub data: Value,
}

impl Notification {
    /// Parse a text frame; unknown message types are protocol violations
    pub fn parse(text: &str) -> ConformanceResult<Self> {
        let raw: RawMessage = serde_json::from_str(text).map_err(|e| {
            ConformanceError::shape("websocket frame", "a {messageType, data} envelope", e)
        })?;

        let kind = match raw.message_type.as_str() {
            "propertyStatus" => NotificationKind::PropertyStatus,
            "actionStatus" => NotificationKind::ActionStatus,
            "event" => NotificationKind::Event,
            _ => {
                return Err(ConformanceError::UnexpectedMessage {
                    message_type: raw.message_type,
                    detail: raw.data.to_string(),
                })
            }
        };

        Ok(Self {
            kind,
            data: raw.data,
        })
    }

    /// Turn a well-formed but unwanted notification into an error
    pub fn unexpected(&self, detail: impl Into<String>) -> ConformanceError {
        ConformanceError::UnexpectedMessage {
            message_type: self.kind.to_string(),
            detail: format!("{} ({})", detail.into(), self.data),
        }
    }
}

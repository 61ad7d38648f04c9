use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// A single entry of a channel's append-only log.
///
/// `id` is assigned by the event log when the event is appended to a
/// reliable channel; ids are strictly increasing per channel and id `0` is
/// reserved as the pre-history sentinel. Events fanned out on unreliable
/// channels carry no id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Event {
    /// Channel the event belongs to.
    pub channel: String,
    /// SSE event name written on the `event:` line.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Opaque JSON payload.
    #[schema(value_type = Object)]
    pub data: Value,
    /// Log position, absent for unreliable channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl Event {
    /// Creates an event that has not been assigned a log position yet.
    pub fn new(channel: impl Into<String>, event_type: impl Into<String>, data: Value) -> Self {
        Self {
            channel: channel.into(),
            event_type: event_type.into(),
            data,
            id: None,
        }
    }

    /// Returns the same event stamped with `id`.
    #[must_use]
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }
}

fn default_event_type() -> String {
    "message".to_string()
}

/// Body accepted by the publish endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct PublishEventRequest {
    /// Event name, `message` when omitted.
    #[serde(rename = "type", default = "default_event_type")]
    pub event_type: String,
    /// Payload delivered to subscribers.
    #[schema(value_type = Object)]
    pub data: Value,
}

/// Response of the publish endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct PublishEventResponse {
    /// The stored event.
    pub event: Event,
    /// Resumption cursor positioned at the stored event, when it has an id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// Resumption cursor positioned at the current head of each channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct CursorResponse {
    /// Encoded cursor suitable for the `Last-Event-ID` header.
    pub cursor: String,
}

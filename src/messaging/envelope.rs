//! # Wire Envelope
//!
//! Outbound requests carry `{correlationId, timestamp, destinationAction, ...payload}`; inbound
//! replies carry `{correlationId, ...result}`; inbound progress events carry
//! `{eventType: "status_update", taskId, status, result?, error?}`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::state_machine::StatusUpdateEvent;

/// Discriminator value for progress events
pub const STATUS_UPDATE_EVENT: &str = "status_update";

/// Discriminator used by older crawl workers in the `action` field
pub const LEGACY_STATUS_UPDATE_ACTION: &str = "task_status_update";

/// Outbound request body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    /// The payload's `action` when it has one, else the destination name
    pub destination_action: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl RequestEnvelope {
    /// Wrap a JSON object payload; `null` is treated as an empty object
    pub fn new(
        correlation_id: impl Into<String>,
        destination: &str,
        payload: Value,
    ) -> CoordinatorResult<Self> {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(CoordinatorError::invalid_payload(format!(
                    "request payload must be a JSON object, got {}",
                    json_type_name(&other)
                )))
            }
        };

        let destination_action = payload
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or(destination)
            .to_string();

        let mut envelope = Self {
            correlation_id: correlation_id.into(),
            timestamp: Utc::now(),
            destination_action,
            payload,
        };
        // Envelope fields win over anything the payload tried to set
        for key in ["correlationId", "timestamp", "destinationAction"] {
            envelope.payload.remove(key);
        }
        Ok(envelope)
    }

    /// Serialize to the JSON bytes put on the wire
    pub fn to_bytes(&self) -> CoordinatorResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CoordinatorError::invalid_payload(e.to_string()))
    }
}

/// A decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    body: Value,
}

impl InboundMessage {
    /// Decode delivery bytes as JSON
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let body = serde_json::from_slice(bytes)?;
        Ok(Self { body })
    }

    /// Correlation id carried in the body, if any
    pub fn correlation_id(&self) -> Option<String> {
        ["correlationId", "correlation_id"]
            .iter()
            .find_map(|key| self.body.get(*key).and_then(Value::as_str))
            .map(str::to_string)
    }

    /// Whether the message carries a status-update discriminator
    pub fn is_status_event(&self) -> bool {
        let event_type = self.body.get("eventType").and_then(Value::as_str);
        let action = self.body.get("action").and_then(Value::as_str);
        event_type == Some(STATUS_UPDATE_EVENT) || action == Some(LEGACY_STATUS_UPDATE_ACTION)
    }

    /// Parse the body as a status-update event
    pub fn to_status_event(&self) -> Result<StatusUpdateEvent, serde_json::Error> {
        StatusUpdateEvent::deserialize_from(&self.body)
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn into_body(self) -> Value {
        self.body
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

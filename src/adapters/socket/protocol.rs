//! Newline-delimited JSON wire format.
//!
//! Requests: `{"event": "ns:action", "data": {...}, "correlation_id"?: "..."}`.
//! Responses mirror the event name and carry either `data` or `error`.
//! Events pushed to subscribers carry `"push": true`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{validate_event_name, CorrelationId, Event};

/// One request line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

impl WireRequest {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            correlation_id: None,
        }
    }

    /// Parse and validate one request line.
    pub fn decode(line: &str) -> DomainResult<Self> {
        let request: Self = serde_json::from_str(line)
            .map_err(|e| DomainError::ValidationFailed(format!("malformed request: {e}")))?;
        validate_event_name(&request.event)?;
        Ok(request)
    }
}

/// `{"kind", "message"}` error object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: String,
    pub message: String,
}

impl From<&DomainError> for WireError {
    fn from(err: &DomainError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// One response or pushed-event line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireResponse {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub push: bool,
}

impl WireResponse {
    pub fn ok(event: impl Into<String>, data: Option<Value>, correlation_id: CorrelationId) -> Self {
        Self {
            event: event.into(),
            data: Some(data.unwrap_or(Value::Null)),
            correlation_id: Some(correlation_id),
            error: None,
            push: false,
        }
    }

    pub fn error(event: impl Into<String>, err: &DomainError) -> Self {
        Self {
            event: event.into(),
            data: None,
            correlation_id: None,
            error: Some(WireError::from(err)),
            push: false,
        }
    }

    /// A dispatched event forwarded to a subscriber.
    pub fn pushed(event: &Event) -> Self {
        Self {
            event: event.name.clone(),
            data: Some(event.to_wire()),
            correlation_id: Some(event.correlation_id),
            error: None,
            push: true,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Serialize as one line, without the trailing newline.
    pub fn encode(&self) -> DomainResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

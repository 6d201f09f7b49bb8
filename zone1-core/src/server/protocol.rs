//! Wire protocol: line-delimited JSON over TCP, one request and one
//! response per connection.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Status,
    ListActions,
    CapabilityRequest {
        action: String,
        params: Value,
        request_id: String,
    },
    CapabilityExecute {
        action: String,
        params: Value,
        #[serde(default)]
        approval_id: Option<String>,
    },
    ContentSanitized {
        source: String,
        content: Value,
        #[serde(default)]
        injection_detected: Option<bool>,
        #[serde(default)]
        warnings: Option<Vec<String>>,
    },
    ApprovalResponse {
        approval_id: String,
        approved: bool,
    },
    Kill {
        reason: String,
        #[serde(default)]
        details: Option<String>,
        #[serde(default)]
        triggered_by: Option<String>,
    },
}

/// Every `type` value `Request` knows how to deserialize, for distinguishing
/// "valid JSON, unrecognized type" from "malformed JSON" at the connection
/// layer.
pub const KNOWN_TYPES: &[&str] = &[
    "ping",
    "status",
    "list_actions",
    "capability_request",
    "capability_execute",
    "content_sanitized",
    "approval_response",
    "kill",
];

/// Closed set of response status values.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Approved,
    Denied,
    PendingApproval,
    Acknowledged,
    Success,
    Error,
    Killed,
}

/// Response envelope: a `type`, an optional `status`, and type-specific
/// fields flattened alongside them.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ResponseStatus>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ResponseEnvelope {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            status: None,
            fields: Map::new(),
        }
    }

    pub fn with_status(mut self, status: ResponseStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(kind).with_status(ResponseStatus::Error).with("message", message.into())
    }

    pub fn invalid_json() -> Self {
        Self::error("error", "Invalid JSON")
    }

    pub fn unknown_type(type_name: &str) -> Self {
        Self::error("error", format!("Unknown message type: {type_name}"))
    }
}

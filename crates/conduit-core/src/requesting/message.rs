//! Request/response envelopes exchanged between a requester and a receiver.
//!
//! A requester named `name` sends requests to the `"{name}::request"` service
//! and listens for responses on `"{name}::response"`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

const REQUEST_SUFFIX: &str = "::request";
const RESPONSE_SUFFIX: &str = "::response";

/// Service name requests of requester `name` are sent to.
pub fn request_service_name(name: &str) -> String {
    format!("{}{}", name, REQUEST_SUFFIX)
}

/// Service name responses for requester `name` are sent to.
pub fn response_service_name(name: &str) -> String {
    format!("{}{}", name, RESPONSE_SUFFIX)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestMessage {
    pub request_id: u64,
    pub payload: Value,
}

impl RequestMessage {
    pub fn new(request_id: u64, payload: Value) -> Self {
        Self {
            request_id,
            payload,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({ "request_id": self.request_id, "payload": self.payload })
    }

    pub fn parse(value: &Value) -> Option<Self> {
        Self::deserialize(value).ok()
    }
}

/// Success or failure of a request, tagged by `"status"` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum ResponseOutcome {
    #[serde(rename = "ok")]
    Success { value: Value },
    #[serde(rename = "error")]
    Failure { error: String },
}

/// `{"request_id": 1, "status": "ok", "value": ...}` or
/// `{"request_id": 1, "status": "error", "error": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub request_id: u64,
    #[serde(flatten)]
    pub outcome: ResponseOutcome,
}

impl ResponseMessage {
    pub fn success(request_id: u64, value: Value) -> Self {
        Self {
            request_id,
            outcome: ResponseOutcome::Success { value },
        }
    }

    pub fn failure(request_id: u64, error: impl Into<String>) -> Self {
        Self {
            request_id,
            outcome: ResponseOutcome::Failure {
                error: error.into(),
            },
        }
    }

    pub fn to_value(&self) -> Value {
        match &self.outcome {
            ResponseOutcome::Success { value } => serde_json::json!({
                "request_id": self.request_id,
                "status": "ok",
                "value": value,
            }),
            ResponseOutcome::Failure { error } => serde_json::json!({
                "request_id": self.request_id,
                "status": "error",
                "error": error,
            }),
        }
    }

    pub fn parse(value: &Value) -> Option<Self> {
        Self::deserialize(value).ok()
    }
}

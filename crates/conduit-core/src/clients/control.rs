//! Control messages announcing client handlers to the server.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sent once, right before the first request of a client handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateClientHandlerMessage {
    pub handler_id: u64,
    /// Empty for the application itself.
    pub client_name_for_log: String,
}

/// Sent when a client handler that announced itself goes away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteClientHandlerMessage {
    pub handler_id: u64,
}

impl CreateClientHandlerMessage {
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "handler_id": self.handler_id,
            "client_name_for_log": self.client_name_for_log,
        })
    }

    pub fn parse(value: &Value) -> Option<Self> {
        Self::deserialize(value).ok()
    }
}

impl DeleteClientHandlerMessage {
    pub fn to_value(&self) -> Value {
        serde_json::json!({ "handler_id": self.handler_id })
    }

    pub fn parse(value: &Value) -> Option<Self> {
        Self::deserialize(value).ok()
    }
}

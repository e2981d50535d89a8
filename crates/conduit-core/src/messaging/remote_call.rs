//! Remote call payloads: a function name plus positional arguments.

use super::debug_dump;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request to invoke `function_name(arguments...)` on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteCallMessage {
    pub function_name: String,
    pub arguments: Vec<Value>,
}

impl RemoteCallMessage {
    pub fn new(function_name: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            function_name: function_name.into(),
            arguments,
        }
    }

    /// Encode as a request payload.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "function_name": self.function_name,
            "arguments": self.arguments,
        })
    }

    /// Decode a request payload, `None` if it is not a remote call.
    pub fn parse(value: &Value) -> Option<Self> {
        Self::deserialize(value).ok()
    }

    /// `name(arg, ...)` for log lines; arguments go through [`debug_dump`].
    pub fn debug_representation(&self) -> String {
        let arguments: Vec<String> = self.arguments.iter().map(debug_dump).collect();
        format!("{}({})", self.function_name, arguments.join(", "))
    }
}

/// Build the request payload of a remote call.
pub fn encode_call(function_name: &str, arguments: Vec<Value>) -> Value {
    RemoteCallMessage::new(function_name, arguments).to_value()
}

pub fn decode_call(value: &Value) -> Option<RemoteCallMessage> {
    RemoteCallMessage::parse(value)
}

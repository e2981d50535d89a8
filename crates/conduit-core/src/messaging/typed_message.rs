//! The `{"type": <service>, "data": <payload>}` envelope used on the wire by
//! stream-backed channels.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message addressed to a named service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypedMessage {
    #[serde(rename = "type")]
    pub service: String,
    pub data: Value,
}

impl TypedMessage {
    pub fn new(service: impl Into<String>, data: Value) -> Self {
        Self {
            service: service.into(),
            data,
        }
    }

    /// Encode into the wire representation.
    pub fn to_value(&self) -> Value {
        serde_json::json!({ "type": self.service, "data": self.data })
    }

    /// Decode a wire value. Returns `None` if the value is not exactly a
    /// typed message with a non-empty service name.
    pub fn parse(value: &Value) -> Option<Self> {
        let message = Self::deserialize(value).ok()?;
        if message.service.is_empty() {
            return None;
        }
        Some(message)
    }
}

/// Wrap `data` into a typed message addressed to `service`.
pub fn encode_typed(service: &str, data: Value) -> Value {
    TypedMessage::new(service, data).to_value()
}

/// Inverse of [`encode_typed`].
pub fn decode_typed(value: &Value) -> Option<TypedMessage> {
    TypedMessage::parse(value)
}

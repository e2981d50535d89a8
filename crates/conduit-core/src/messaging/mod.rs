//! Wire-level message shapes shared by every layer.

pub mod origin;
pub mod remote_call;
pub mod typed_message;

pub use remote_call::{decode_call, encode_call, RemoteCallMessage};
pub use typed_message::{decode_typed, encode_typed, TypedMessage};

use serde_json::Value;

/// Render a payload for log lines.
///
/// Debug builds dump the full JSON. Release builds only show the shape of
/// the value so that client data (APDUs, PINs) never reaches the logs.
pub fn debug_dump(value: &Value) -> String {
    if cfg!(debug_assertions) {
        value.to_string()
    } else {
        sanitized_dump(value)
    }
}

/// Describe a value by its shape only.
pub fn sanitized_dump(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "<bool>".to_string(),
        Value::Number(_) => "<number>".to_string(),
        Value::String(s) => format!("<string len={}>", s.len()),
        Value::Array(items) => format!("<array len={}>", items.len()),
        Value::Object(map) => format!("<object keys={}>", map.len()),
    }
}

//! Known clients: display names for the permission prompt and an optional
//! auto-approve flag.
//!
//! Loaded from a JSON object keyed by origin (or bare extension id):
//!
//! ```json
//! { "https://app.example": { "name": "Example App", "autoapprove": true } }
//! ```

use crate::messaging::origin::normalize_identifier;
use crate::{ConduitError, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TrustedClientInfo {
    pub name: String,
    #[serde(default)]
    pub autoapprove: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TrustedClientsRegistry {
    clients: HashMap<String, TrustedClientInfo>,
}

impl TrustedClientsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let entries: HashMap<String, TrustedClientInfo> =
            serde_json::from_value(value.clone()).map_err(|e| ConduitError::Config {
                message: format!("invalid trusted clients list: {}", e),
            })?;
        let clients = entries
            .into_iter()
            .map(|(origin, info)| (normalize_identifier(&origin), info))
            .collect();
        Ok(Self { clients })
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&text)?;
        Self::from_json(&value)
    }

    pub fn insert(&mut self, origin: &str, info: TrustedClientInfo) {
        self.clients.insert(normalize_identifier(origin), info);
    }

    pub fn get_by_origin(&self, origin: &str) -> Option<&TrustedClientInfo> {
        self.clients.get(origin)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

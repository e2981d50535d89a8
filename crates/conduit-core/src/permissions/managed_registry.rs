//! Admin-managed allow-list of client origins.
//!
//! The list is reactive: it may still be loading when the first check
//! arrives, and it may change later. A check that started before an origin
//! was added resolves as granted as soon as it shows up.

use crate::messaging::origin::normalize_identifier;
use crate::{ConduitError, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowList {
    Loading,
    Loaded(HashSet<String>),
    /// Loading failed; no origin is granted through the list.
    Unavailable,
}

impl AllowList {
    pub fn contains(&self, origin: &str) -> bool {
        matches!(self, AllowList::Loaded(origins) if origins.contains(origin))
    }
}

pub struct ManagedRegistry {
    state: watch::Sender<AllowList>,
}

impl Default for ManagedRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagedRegistry {
    /// A registry whose list has not been loaded yet.
    pub fn new() -> Self {
        let (state, _) = watch::channel(AllowList::Loading);
        Self { state }
    }

    /// A registry already loaded with `origins`.
    pub fn with_origins<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let registry = Self::new();
        registry.set_allowed_origins(origins);
        registry
    }

    /// Replace the list. Bare extension ids are turned into origins.
    pub fn set_allowed_origins<I, S>(&self, origins: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let origins: HashSet<String> = origins
            .into_iter()
            .map(|origin| normalize_identifier(origin.as_ref()))
            .collect();
        info!(
            "ManagedRegistry: loaded the allow-list with {} origin(s)",
            origins.len()
        );
        self.state.send_replace(AllowList::Loaded(origins));
    }

    /// Load from a JSON array of strings. On error the list is left unchanged.
    pub fn load_from_json(&self, value: &Value) -> Result<()> {
        let Some(items) = value.as_array() else {
            warn!("ManagedRegistry: the allow-list is not an array: {}", value);
            return Err(ConduitError::Config {
                message: "the allow-list must be a JSON array".to_string(),
            });
        };
        let mut origins = Vec::with_capacity(items.len());
        for item in items {
            match item.as_str() {
                Some(origin) => origins.push(origin.to_string()),
                None => {
                    warn!("ManagedRegistry: the allow-list contains a non-string: {}", item);
                    return Err(ConduitError::Config {
                        message: "allow-list entries must be strings".to_string(),
                    });
                }
            }
        }
        self.set_allowed_origins(origins);
        Ok(())
    }

    /// Load from a JSON file; a missing or invalid file makes the list
    /// unavailable.
    pub fn load_from_file(&self, path: &Path) -> Result<()> {
        let outcome = std::fs::read_to_string(path)
            .map_err(ConduitError::from)
            .and_then(|text| serde_json::from_str::<Value>(&text).map_err(ConduitError::from))
            .and_then(|value| self.load_from_json(&value));
        if let Err(e) = &outcome {
            warn!(
                "ManagedRegistry: failed to load the allow-list from {}: {}",
                path.display(),
                e
            );
            self.mark_unavailable();
        }
        outcome
    }

    /// Record that the list could not be loaded.
    pub fn mark_unavailable(&self) {
        self.state.send_if_modified(|state| {
            if *state == AllowList::Loading {
                *state = AllowList::Unavailable;
                true
            } else {
                false
            }
        });
    }

    pub fn snapshot(&self) -> AllowList {
        self.state.borrow().clone()
    }

    /// Wait until the list is no longer loading.
    pub fn loaded(&self) -> impl Future<Output = AllowList> + Send + 'static {
        let mut receiver = self.state.subscribe();
        async move {
            match receiver.wait_for(|state| *state != AllowList::Loading).await {
                Ok(state) => state.clone(),
                Err(_) => AllowList::Unavailable,
            }
        }
    }

    /// Resolve once the list contains `origin`; stays pending otherwise.
    pub fn allowed_later(&self, origin: String) -> impl Future<Output = ()> + Send + 'static {
        let mut receiver = self.state.subscribe();
        async move {
            if receiver
                .wait_for(|state| state.contains(&origin))
                .await
                .is_err()
            {
                futures::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_loaded_with_origins() {
        let registry = ManagedRegistry::with_origins(["https://a.example"]);
        let list = registry.loaded().await;
        assert!(list.contains("https://a.example"));
        assert!(!list.contains("https://b.example"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loaded_waits_for_load() {
        let registry = ManagedRegistry::new();
        let waiter = tokio::spawn(registry.loaded());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());

        registry.load_from_json(&json!(["https://a.example"])).unwrap();
        assert!(waiter.await.unwrap().contains("https://a.example"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_allowed_later_resolves_on_update() {
        let registry = ManagedRegistry::with_origins(Vec::<String>::new());
        let waiter = tokio::spawn(registry.allowed_later("https://a.example".to_string()));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());

        registry.set_allowed_origins(["https://b.example"]);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());

        registry.set_allowed_origins(["https://a.example", "https://b.example"]);
        waiter.await.unwrap();
    }

    #[test]
    fn test_invalid_json_leaves_list_unchanged() {
        let registry = ManagedRegistry::with_origins(["https://a.example"]);
        assert!(registry.load_from_json(&json!({"a": 1})).is_err());
        assert!(registry.load_from_json(&json!(["ok", 5])).is_err());
        assert!(registry.snapshot().contains("https://a.example"));
    }

    #[test]
    fn test_extension_ids_are_normalized() {
        let registry = ManagedRegistry::with_origins(["khpfeaanjngmcnplbdlpegiifgpfgdco"]);
        assert!(registry
            .snapshot()
            .contains("chrome-extension://khpfeaanjngmcnplbdlpegiifgpfgdco"));
    }

    #[test]
    fn test_missing_file_marks_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ManagedRegistry::new();
        assert!(registry.load_from_file(&dir.path().join("missing.json")).is_err());
        assert_eq!(registry.snapshot(), AllowList::Unavailable);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(&path, r#"["https://a.example"]"#).unwrap();

        let registry = ManagedRegistry::new();
        registry.load_from_file(&path).unwrap();
        assert!(registry.snapshot().contains("https://a.example"));
    }
}

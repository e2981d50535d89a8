//! Persisted user decisions.
//!
//! Only grants are persisted: a rejected or dismissed prompt is remembered
//! for the lifetime of the process (through the permission cache) but asks
//! again after a restart.

use crate::messaging::origin::normalize_identifier;
use crate::{ConduitError, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// Storage of per-origin user decisions (`true` = granted).
#[async_trait::async_trait]
pub trait DecisionStore: Send + Sync {
    async fn load(&self) -> Result<HashMap<String, bool>>;

    /// Remember that the user granted `origin`.
    async fn store_grant(&self, origin: &str) -> Result<()>;
}

/// In-memory store, for tests and for running without persistence.
#[derive(Default)]
pub struct MemoryDecisionStore {
    decisions: Mutex<HashMap<String, bool>>,
}

impl MemoryDecisionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_decisions<I, S>(decisions: I) -> Self
    where
        I: IntoIterator<Item = (S, bool)>,
        S: AsRef<str>,
    {
        let decisions = decisions
            .into_iter()
            .map(|(origin, granted)| (normalize_identifier(origin.as_ref()), granted))
            .collect();
        Self {
            decisions: Mutex::new(decisions),
        }
    }

    pub fn snapshot(&self) -> HashMap<String, bool> {
        self.decisions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl DecisionStore for MemoryDecisionStore {
    async fn load(&self) -> Result<HashMap<String, bool>> {
        Ok(self.snapshot())
    }

    async fn store_grant(&self, origin: &str) -> Result<()> {
        self.decisions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(origin.to_string(), true);
        Ok(())
    }
}

/// Decisions persisted as a JSON object `{ "<origin>": true, ... }`.
pub struct JsonFileDecisionStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileDecisionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl DecisionStore for JsonFileDecisionStore {
    async fn load(&self) -> Result<HashMap<String, bool>> {
        let path = self.path.clone();
        let raw = run_blocking(move || atomic_read_json(&path)).await?;
        let Some(raw) = raw else {
            return Ok(HashMap::new());
        };
        parse_decisions(&raw)
    }

    async fn store_grant(&self, origin: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path.clone();
        let origin = origin.to_string();
        run_blocking(move || {
            let mut object = read_for_update(&path)?;
            object.insert(origin, Value::Bool(true));
            atomic_write_json(&path, &Value::Object(object))
        })
        .await
    }
}

fn parse_decisions(raw: &Value) -> Result<HashMap<String, bool>> {
    let Some(object) = raw.as_object() else {
        return Err(ConduitError::Storage {
            message: "stored decisions must be a JSON object".to_string(),
        });
    };
    let mut decisions = HashMap::with_capacity(object.len());
    for (key, value) in object {
        match value.as_bool() {
            Some(granted) => {
                decisions.insert(normalize_identifier(key), granted);
            }
            None => warn!("Ignoring corrupted stored decision for {}: {}", key, value),
        }
    }
    Ok(decisions)
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ConduitError::Other(format!("blocking task failed: {}", e)))?
}

/// Read and parse a JSON file; `None` if it does not exist.
fn atomic_read_json(path: &Path) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).map_err(|e| ConduitError::Storage {
        message: format!("failed to read {}: {}", path.display(), e),
    })?;
    let value = serde_json::from_str(&contents).map_err(|e| ConduitError::Storage {
        message: format!("failed to parse {}: {}", path.display(), e),
    })?;
    Ok(Some(value))
}

/// Current decisions to merge a new grant into.
///
/// A file that cannot be read fails the update. A file that is not a JSON
/// object is moved aside to `<path>.corrupted` before starting over.
fn read_for_update(path: &Path) -> Result<Map<String, Value>> {
    if !path.exists() {
        return Ok(Map::new());
    }
    let contents = fs::read_to_string(path).map_err(|e| ConduitError::Storage {
        message: format!("failed to read {}: {}", path.display(), e),
    })?;
    if let Ok(Value::Object(object)) = serde_json::from_str(&contents) {
        return Ok(object);
    }

    let backup = corrupted_path(path);
    fs::rename(path, &backup).map_err(|e| ConduitError::Storage {
        message: format!(
            "failed to move the unreadable {} aside: {}",
            path.display(),
            e
        ),
    })?;
    warn!(
        "Moved the unreadable decisions file {} to {}",
        path.display(),
        backup.display()
    );
    Ok(Map::new())
}

fn corrupted_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".corrupted");
    PathBuf::from(name)
}

/// Write `value` next to `path`, sync it, then rename it over `path`.
fn atomic_write_json(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    let temp_path = path.with_extension(format!("json.{}.tmp", std::process::id()));
    let serialized = serde_json::to_string_pretty(value)?;
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| ConduitError::Storage {
                message: format!("failed to create {}: {}", temp_path.display(), e),
            })?;
        file.write_all(serialized.as_bytes())?;
        file.flush()?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(ConduitError::Storage {
            message: format!("failed to replace {}: {}", path.display(), e),
        });
    }
    debug!("Persisted user decisions to {}", path.display());
    Ok(())
}

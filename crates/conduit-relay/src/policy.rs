//! Allow-list file loading and live reloading.

use anyhow::{Context, Result};
use conduit_core::permissions::ManagedRegistry;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Keeps a [`ManagedRegistry`] in sync with a JSON allow-list file.
///
/// The file is loaded once on creation and again whenever it changes on disk.
/// A reload that fails keeps the previous list.
pub struct PolicyWatcher {
    _watcher: RecommendedWatcher,
}

impl PolicyWatcher {
    pub fn new(path: impl AsRef<Path>, registry: Arc<ManagedRegistry>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if registry.load_from_file(&path).is_err() {
            warn!("Continuing without an allow-list until {} becomes valid", path.display());
        }

        // Editors usually replace the file, so watch its directory.
        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = path.file_name().map(|name| name.to_os_string());

        let reload_path = path.clone();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            match event {
                Ok(event) if is_relevant_change(&event, file_name.as_deref()) => {
                    debug!("Allow-list file changed, reloading");
                    // Errors are logged by the registry; the old list stays.
                    let _ = registry.load_from_file(&reload_path);
                }
                Ok(_) => {}
                Err(e) => warn!("Allow-list watcher error: {}", e),
            }
        })
        .context("failed to create the allow-list watcher")?;
        watcher
            .watch(&directory, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", directory.display()))?;

        info!("Watching the allow-list at {}", path.display());
        Ok(Self { _watcher: watcher })
    }
}

fn is_relevant_change(event: &Event, file_name: Option<&std::ffi::OsStr>) -> bool {
    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
    ) {
        return false;
    }
    event
        .paths
        .iter()
        .any(|changed| changed.file_name() == file_name)
}

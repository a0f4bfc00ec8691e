//! Polling-based config file watcher.
//!
//! Checks the config file's mtime every 2 seconds. When a change is detected,
//! debounces for 500ms (to handle partial writes from editors), then reloads
//! the file and swaps its facilities into the [`FacilityRegistry`]. Only
//! facility definitions are hot-reloaded; service, engine and publisher
//! settings need a restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::InventoryConfig;
use crate::facility::FacilityRegistry;

/// Events emitted by the config watcher.
#[derive(Debug)]
pub enum ConfigEvent {
    /// Facilities were reloaded; ids of those added, removed or changed.
    Reloaded(Vec<String>),
    /// Reload was attempted but failed (previous facilities remain active).
    Error(String),
}

/// Interval between mtime checks.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Debounce delay after detecting a change (editors often write in stages).
const DEBOUNCE_DELAY: Duration = Duration::from_millis(500);

/// Reload `path` and apply its facilities to `registry`.
pub fn reload_facilities(path: &Path, registry: &FacilityRegistry) -> ConfigEvent {
    match InventoryConfig::load_from_file(path) {
        Ok(config) => {
            let changed = registry.reload(&config);
            tracing::info!(path = %path.display(), changed = ?changed, "Facilities reloaded");
            ConfigEvent::Reloaded(changed)
        }
        Err(e) => {
            tracing::error!(error = %e, "Config hot-reload failed, keeping previous facilities");
            ConfigEvent::Error(e.to_string())
        }
    }
}

/// Run the config file watcher loop.
///
/// Returns when cancelled or when the event channel is closed.
pub async fn run_config_watcher(
    path: PathBuf,
    registry: Arc<FacilityRegistry>,
    tx: mpsc::Sender<ConfigEvent>,
    cancel: CancellationToken,
) {
    tracing::info!(path = %path.display(), "Config watcher started");

    let mut last_mtime = get_mtime(&path);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Config watcher cancelled");
                return;
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        // If we can't read mtime (file deleted, permissions), warn and keep polling
        let Some(current) = get_mtime(&path) else {
            if last_mtime.is_some() {
                tracing::warn!(
                    path = %path.display(),
                    "Config file not accessible, keeping current facilities, will retry"
                );
                last_mtime = None;
            }
            continue;
        };

        // A file that reappeared counts as changed
        let changed = last_mtime.map_or(true, |prev| current != prev);
        if !changed {
            continue;
        }

        // Debounce: wait, then re-check mtime to ensure write is complete
        tokio::time::sleep(DEBOUNCE_DELAY).await;
        if get_mtime(&path) != Some(current) {
            continue;
        }
        last_mtime = Some(current);

        let event = reload_facilities(&path, &registry);
        if tx.send(event).await.is_err() {
            tracing::debug!("Config watcher channel closed, stopping");
            return;
        }
    }
}

/// Read the modification time of a file, returning None on any error.
fn get_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path)
        .ok()
        .and_then(|m| m.modified().ok())
}

//! Polling-based config file watcher.
//!
//! Checks the config file's mtime every 2 seconds. When a change is
//! detected, debounces for 500ms (to handle partial writes from editors),
//! re-parses the TOML, and swaps it into the `ConfigSurface`. Consistent
//! with this codebase's existing watcher pattern elsewhere — no filesystem
//! notification crate needed for a file that changes a few times a day.

use std::path::PathBuf;
use std::time::SystemTime;

use tokio::sync::mpsc;
use tokio::time::Duration;

use super::{ConfigChange, ConfigSurface, PatrolConfig};

/// Events emitted by the config watcher.
#[derive(Debug)]
pub enum ConfigEvent {
    Reloaded(ConfigChange),
    Error(String),
}

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEBOUNCE_DELAY: Duration = Duration::from_millis(500);

/// Run the config file watcher loop until `tx` is closed or `cancel` fires.
pub async fn run_config_watcher(
    path: PathBuf,
    surface: ConfigSurface,
    tx: mpsc::Sender<ConfigEvent>,
    cancel: tokio_util::sync::CancellationToken,
) {
    tracing::info!(path = %path.display(), "[ConfigWatcher] started");

    let mut last_mtime = get_mtime(&path);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::info!("[ConfigWatcher] cancelled, stopping");
                return;
            }
            () = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        let Some(current) = get_mtime(&path) else {
            if last_mtime.is_some() {
                tracing::warn!(path = %path.display(), "[ConfigWatcher] file not accessible, keeping current config");
                last_mtime = None;
            }
            continue;
        };

        let changed = last_mtime != Some(current);
        if !changed {
            continue;
        }

        tokio::time::sleep(DEBOUNCE_DELAY).await;
        if get_mtime(&path) != Some(current) {
            continue; // still being written
        }
        last_mtime = Some(current);

        let event = match load_toml(&path) {
            Ok(new_config) => {
                let change = surface.store(new_config);
                tracing::info!(interval_changed = change.interval_changed, "[ConfigWatcher] reloaded");
                ConfigEvent::Reloaded(change)
            }
            Err(e) => {
                tracing::error!(error = %e, "[ConfigWatcher] reload failed, keeping previous config");
                ConfigEvent::Error(e)
            }
        };

        if tx.send(event).await.is_err() {
            tracing::debug!("[ConfigWatcher] channel closed, stopping");
            return;
        }
    }
}

fn load_toml(path: &PathBuf) -> Result<PatrolConfig, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    toml::from_str(&text).map_err(|e| e.to_string())
}

fn get_mtime(path: &PathBuf) -> Option<SystemTime> {
    std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
}

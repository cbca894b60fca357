// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Filesystem Change Watcher
//!
//! Watches the service root recursively and forwards filtered batches of
//! changed paths into a tokio channel. The restart debounce window is
//! applied downstream by the reload loop; the OS watcher only merges
//! events that arrive within a few milliseconds of each other.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Bridge `notify` (std thread) into async, owned by a cancellable subscription

use crate::domain::watch::{ChangeEvent, ChangeFilter};
use notify_debouncer_mini::notify::{RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, DebouncedEvent, DebouncedEventKind};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const NOTIFY_COALESCE: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Failed to watch {path}: {reason}")]
    Watch { path: PathBuf, reason: String },
}

/// Live watch on the service root. Dropping it stops the watcher.
pub struct WatchSubscription {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl WatchSubscription {
    /// Stop watching and wait for the watcher task to exit
    pub async fn cancel(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for WatchSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn to_change_events(root: &Path, filter: &ChangeFilter, events: Vec<DebouncedEvent>) -> Vec<ChangeEvent> {
    let changes: Vec<ChangeEvent> = events
        .into_iter()
        .filter(|e| matches!(e.kind, DebouncedEventKind::Any | DebouncedEventKind::AnyContinuous))
        .map(|e| {
            let relative = e.path.strip_prefix(root).map(Path::to_path_buf).ok();
            ChangeEvent::new(relative.unwrap_or(e.path))
        })
        .collect();
    let mut changes = filter.filter(changes);
    changes.dedup();
    changes
}

/// Start watching `root`. Filtered batches are sent to `changes`.
pub fn watch(
    root: &Path,
    filter: ChangeFilter,
    changes: mpsc::Sender<Vec<ChangeEvent>>,
) -> Result<WatchSubscription, WatchError> {
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let (watcher_tx, watcher_rx) = std_mpsc::channel::<DebounceEventResult>();
    let mut debouncer = new_debouncer(NOTIFY_COALESCE, watcher_tx)
        .map_err(|e| WatchError::Watch { path: root.clone(), reason: e.to_string() })?;
    debouncer
        .watcher()
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|e| WatchError::Watch { path: root.clone(), reason: e.to_string() })?;

    let (async_tx, mut async_rx) = mpsc::channel::<Vec<DebouncedEvent>>(32);

    // The std receiver ends when the debouncer (and its sender) is dropped
    tokio::task::spawn_blocking(move || {
        while let Ok(result) = watcher_rx.recv() {
            match result {
                Ok(events) => {
                    if async_tx.blocking_send(events).is_err() {
                        break;
                    }
                }
                Err(error) => warn!("File watcher error: {:?}", error),
            }
        }
        debug!("Watcher bridge exited");
    });

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    info!("Watching {:?} for changes", root);

    let task = tokio::spawn(async move {
        let _debouncer = debouncer;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                batch = async_rx.recv() => {
                    let Some(events) = batch else { break };
                    let relevant = to_change_events(&root, &filter, events);
                    if relevant.is_empty() {
                        continue;
                    }
                    debug!("{} relevant change(s): {:?}", relevant.len(), relevant);
                    match changes.try_send(relevant) {
                        Ok(()) => {}
                        // A restart is already queued and will pick these up
                        Err(mpsc::error::TrySendError::Full(_)) => debug!("Restart already pending, batch merged"),
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            debug!("Change channel closed, stopping watcher");
                            break;
                        }
                    }
                }
            }
        }
        info!("Stopped watching {:?}", root);
    });

    Ok(WatchSubscription { cancel, task: Some(task) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent_config::{HotReloadConfig, SchemaConfig};

    #[test]
    fn test_events_made_relative_and_filtered() {
        let root = Path::new("/srv/users");
        let filter = ChangeFilter::from_config(&HotReloadConfig::default(), &SchemaConfig::default());
        let events = vec![
            DebouncedEvent { path: root.join("src/main.py"), kind: DebouncedEventKind::Any },
            DebouncedEvent { path: root.join("openapi/api.json"), kind: DebouncedEventKind::Any },
            DebouncedEvent { path: root.join("src/pyproject.toml"), kind: DebouncedEventKind::Any },
        ];
        let changes = to_change_events(root, &filter, events);
        assert_eq!(changes, vec![ChangeEvent::new("src/pyproject.toml")]);
    }

    #[tokio::test]
    async fn test_watch_reports_manifest_change() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        let filter = ChangeFilter::from_config(&HotReloadConfig::default(), &SchemaConfig::default());
        let (tx, mut rx) = mpsc::channel(8);
        let subscription = watch(dir.path(), filter, tx).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(dir.path().join("src/pyproject.toml"), "[tool.poetry]").unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.unwrap().unwrap();
        assert!(batch.iter().any(|c| c.path.ends_with("pyproject.toml")));
        subscription.cancel().await;
    }
}

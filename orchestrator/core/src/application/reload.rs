// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Hot Reload Loop
//!
//! Turns a stream of change batches into restart requests. The first batch
//! opens a fixed window; every batch arriving before the window closes is
//! merged into the same restart. A burst of saves therefore produces one
//! restart no later than `window` after the first save.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Debounce change events and dispatch restarts

use crate::domain::watch::ChangeEvent;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[async_trait]
pub trait RestartHandler: Send + Sync {
    /// Called once per coalesced burst, with the distinct changed paths
    async fn restart(&self, changes: Vec<ChangeEvent>);
}

fn merge(pending: &mut Vec<ChangeEvent>, batch: Vec<ChangeEvent>) {
    for change in batch {
        if !pending.contains(&change) {
            pending.push(change);
        }
    }
}

/// Spawn the debounce loop. It exits when `cancel` fires or the sender side
/// of `changes` is dropped; a burst still pending at that point is discarded.
pub fn spawn_reload_loop(
    mut changes: mpsc::Receiver<Vec<ChangeEvent>>,
    window: Duration,
    handler: Arc<dyn RestartHandler>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => break,
                batch = changes.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };

            let mut pending = Vec::new();
            merge(&mut pending, first);
            let deadline = tokio::time::Instant::now() + window;

            let mut closed = false;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Reload loop cancelled with {} pending change(s)", pending.len());
                        return;
                    }
                    _ = tokio::time::sleep_until(deadline) => break,
                    batch = changes.recv() => match batch {
                        Some(batch) => merge(&mut pending, batch),
                        None => {
                            closed = true;
                            break;
                        }
                    },
                }
            }

            if closed {
                break;
            }
            info!("Restarting after {} change(s)", pending.len());
            handler.restart(pending).await;
        }
        debug!("Reload loop exited");
    })
}

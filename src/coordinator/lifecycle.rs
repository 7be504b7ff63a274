// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Layer lifecycle: start, gc loop, shutdown.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{LayerState, SyncLayer};
use crate::cache::store::QueryStore;

impl SyncLayer {
    /// Start background work. Returns `false` if already started or stopped.
    #[tracing::instrument(skip(self))]
    pub fn start(&self) -> bool {
        if self.state() != LayerState::Created {
            warn!(state = %self.state(), "Start ignored");
            return false;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_gc_loop(
            self.store.clone(),
            self.config.gc_interval(),
            stop_rx,
        ));
        *self.gc_task.lock() = Some((stop_tx, handle));

        let _ = self.state.send(LayerState::Running);
        crate::metrics::set_layer_state("Running");
        info!(gc_interval_ms = self.config.gc_interval_ms, "Sync layer running");
        true
    }

    /// Stop the gc loop and clear the store.
    ///
    /// Components built from the layer own their own tasks; stop them
    /// (or drop them) before shutting the layer down.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if matches!(self.state(), LayerState::ShuttingDown | LayerState::Stopped) {
            return;
        }
        info!("Initiating sync layer shutdown...");
        let _ = self.state.send(LayerState::ShuttingDown);
        crate::metrics::set_layer_state("ShuttingDown");

        let task = self.gc_task.lock().take();
        if let Some((stop_tx, handle)) = task {
            let _ = stop_tx.send(true);
            if let Err(e) = handle.await {
                warn!(error = %e, "GC loop ended abnormally");
            }
        }

        let entries = self.store.len();
        self.store.clear();

        let _ = self.state.send(LayerState::Stopped);
        crate::metrics::set_layer_state("Stopped");
        info!(cleared_entries = entries, "Sync layer shutdown complete");
    }
}

async fn run_gc_loop(
    store: Arc<QueryStore>,
    every: std::time::Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut gc_interval = interval_at(Instant::now() + every, every);
    gc_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = gc_interval.tick() => {
                let evicted = store.collect_garbage();
                if evicted > 0 {
                    debug!(evicted, "GC pass");
                }
            }

            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    debug!("GC loop stopping");
                    break;
                }
            }
        }
    }
}

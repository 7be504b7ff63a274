// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync layer coordinator.
//!
//! [`SyncLayer`] owns the process-wide [`QueryStore`] and the
//! [`SmartCache`] over it, and builds the realtime, refresh and auto-save
//! components wired to that cache. Nothing here is a global: the host
//! creates a layer at startup and shuts it down at teardown.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use query_sync::{
//!     fetcher, query_key, InMemoryBackend, QueryOptions, SubscriptionConfig, SyncLayer,
//!     SyncLayerConfig,
//! };
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let layer = SyncLayer::new(SyncLayerConfig::default());
//! layer.start();
//!
//! let backend = Arc::new(InMemoryBackend::new());
//! let orders = layer.query(
//!     query_key!["orders", 5],
//!     fetcher(|| async { Ok(json!({"id": 5})) }),
//!     QueryOptions::default(),
//! );
//! orders.fetch().await.expect("fetch failed");
//!
//! let realtime = layer
//!     .subscribe(backend.clone(), vec![SubscriptionConfig::new("orders", query_key!["orders", 5])])
//!     .await
//!     .expect("subscribe failed");
//!
//! realtime.stop().await;
//! layer.shutdown().await;
//! # }
//! ```

mod lifecycle;
mod types;

pub use types::LayerState;

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::autosave::AutoSaveReconciler;
use crate::cache::invalidation::{CacheInvalidator, InvalidateError};
use crate::cache::smart::{Fetcher, QueryError, QueryOptions, SmartCache, SmartQuery};
use crate::cache::store::{CacheStats, QueryStore};
use crate::config::SyncLayerConfig;
use crate::notify::{Notifier, TracingNotifier};
use crate::query_key::QueryKey;
use crate::realtime::{RealtimeMultiplexer, SubscribeError, SubscriptionConfig};
use crate::refresh::RefreshController;
use crate::storage::traits::{ChangeFeed, RecordWriter};

pub struct SyncLayer {
    pub(super) config: SyncLayerConfig,
    pub(super) store: Arc<QueryStore>,
    cache: SmartCache,
    notifier: Arc<dyn Notifier>,
    pub(super) state: watch::Sender<LayerState>,
    state_rx: watch::Receiver<LayerState>,
    /// Stop signal and handle for the gc loop, while running
    pub(super) gc_task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl SyncLayer {
    /// Layer that reports notices to the log.
    pub fn new(config: SyncLayerConfig) -> Self {
        Self::with_notifier(config, Arc::new(TracingNotifier))
    }

    pub fn with_notifier(config: SyncLayerConfig, notifier: Arc<dyn Notifier>) -> Self {
        let store = Arc::new(QueryStore::new());
        let cache = SmartCache::with_retry_budget(store.clone(), config.retry_budget());
        let (state_tx, state_rx) = watch::channel(LayerState::Created);
        crate::metrics::set_layer_state("Created");

        Self {
            config,
            store,
            cache,
            notifier,
            state: state_tx,
            state_rx,
            gc_task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SyncLayerConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<QueryStore> {
        &self.store
    }

    #[must_use]
    pub fn cache(&self) -> &SmartCache {
        &self.cache
    }

    #[must_use]
    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    #[must_use]
    pub fn state(&self) -> LayerState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<LayerState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == LayerState::Running
    }

    /// One-shot read through the cache.
    pub async fn get(
        &self,
        key: QueryKey,
        fetcher: Arc<dyn Fetcher>,
        options: QueryOptions,
    ) -> Result<Value, QueryError> {
        self.cache.get(key, fetcher, options).await
    }

    /// Observed query handle; see [`SmartCache::query`].
    pub fn query(&self, key: QueryKey, fetcher: Arc<dyn Fetcher>, options: QueryOptions) -> SmartQuery {
        self.cache.query(key, fetcher, options)
    }

    /// Invalidate `key` and everything under it, refetching observed keys.
    pub async fn invalidate(&self, key: &QueryKey) -> Result<(), InvalidateError> {
        self.cache.invalidate(key).await
    }

    /// The cache as an invalidation target for components.
    #[must_use]
    pub fn invalidator(&self) -> Arc<dyn CacheInvalidator> {
        Arc::new(self.cache.clone())
    }

    /// Multiplexer over `feed` that invalidates this layer's cache.
    pub fn multiplexer(&self, feed: Arc<dyn ChangeFeed>) -> RealtimeMultiplexer {
        RealtimeMultiplexer::new(self.config.realtime(), feed, self.invalidator())
    }

    /// Build a multiplexer and subscribe `configs` in one step.
    pub async fn subscribe(
        &self,
        feed: Arc<dyn ChangeFeed>,
        configs: Vec<SubscriptionConfig>,
    ) -> Result<RealtimeMultiplexer, SubscribeError> {
        let multiplexer = self.multiplexer(feed);
        multiplexer.start(configs).await?;
        Ok(multiplexer)
    }

    /// Refresh controller over `keys`. Call `start()` on it to begin polling.
    pub fn refresh_controller(&self, keys: Vec<QueryKey>) -> RefreshController {
        RefreshController::new(self.config.refresh(), keys, self.invalidator(), self.notifier.clone())
    }

    /// Auto-save reconciler for one record.
    pub fn auto_save(&self, record_id: impl Into<String>, writer: Arc<dyn RecordWriter>) -> AutoSaveReconciler {
        AutoSaveReconciler::new(record_id, self.config.autosave(), writer, self.notifier.clone())
    }

    /// Run one gc pass now.
    pub fn collect_garbage(&self) -> usize {
        self.store.collect_garbage()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.store.stats()
    }
}

impl Drop for SyncLayer {
    fn drop(&mut self) {
        if let Some((stop_tx, handle)) = self.gc_task.get_mut().take() {
            let _ = stop_tx.send(true);
            handle.abort();
        }
    }
}

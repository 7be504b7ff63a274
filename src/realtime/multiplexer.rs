// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Debounced realtime multiplexer.
//!
//! ```text
//!   ChangeFeed channel (one per config)
//!          │ ChangeEvent
//!          ▼
//!   reader task ──► Debouncer::schedule(table + key, D)
//!                          │ (quiet for D)
//!                          ▼
//!                 invalidate(query_key)
//!                 callback(last event of the burst)
//! ```
//!
//! Only the last event of a burst reaches the callback; earlier payloads in
//! the same window are discarded. Configs beyond the subscription budget are
//! not subscribed and do not fail the call.
//!
//! Teardown bumps an epoch shared with every reader and flush. A flush that
//! already fired may finish its invalidation, but it never runs a callback
//! once the epoch it was scheduled under has ended.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{SubscribeError, SubscriptionConfig};
use crate::cache::invalidation::{CacheInvalidator, InvalidateError};
use crate::config::RealtimeConfig;
use crate::debounce::Debouncer;
use crate::query_key::QueryKey;
use crate::storage::traits::{ChangeEvent, ChangeFeed, ChannelId};

struct ActiveSubscription {
    channel_id: ChannelId,
    config: Arc<SubscriptionConfig>,
    reader: JoinHandle<()>,
}

pub struct RealtimeMultiplexer {
    config: RealtimeConfig,
    feed: Arc<dyn ChangeFeed>,
    invalidator: Arc<dyn CacheInvalidator>,
    debouncer: Arc<Debouncer<String>>,
    subscriptions: Mutex<Vec<ActiveSubscription>>,
    started: AtomicBool,
    epoch: Arc<AtomicU64>,
}

impl RealtimeMultiplexer {
    pub fn new(
        config: RealtimeConfig,
        feed: Arc<dyn ChangeFeed>,
        invalidator: Arc<dyn CacheInvalidator>,
    ) -> Self {
        Self {
            config,
            feed,
            invalidator,
            debouncer: Arc::new(Debouncer::new()),
            subscriptions: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open one channel per enabled config, up to the subscription budget.
    ///
    /// Returns how many channels were opened. If any channel fails to open,
    /// the ones already opened are closed again and the error is returned.
    #[tracing::instrument(skip(self, configs), fields(requested = configs.len()))]
    pub async fn start(&self, configs: Vec<SubscriptionConfig>) -> Result<usize, SubscribeError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(SubscribeError::AlreadyStarted);
        }

        let mut accepted: Vec<SubscriptionConfig> = configs.into_iter().filter(|c| c.enabled).collect();
        if accepted.len() > self.config.max_subscriptions {
            let dropped = accepted.len() - self.config.max_subscriptions;
            accepted.truncate(self.config.max_subscriptions);
            debug!(
                dropped,
                budget = self.config.max_subscriptions,
                "Subscription budget reached, extra configs not subscribed"
            );
            crate::metrics::record_subscriptions_dropped(dropped);
        }

        let mut opened = Vec::with_capacity(accepted.len());
        for config in accepted {
            match self.feed.open_channel(&config.table, config.filter.as_ref()).await {
                Ok(channel) => {
                    crate::metrics::record_channel("opened");
                    let config = Arc::new(config);
                    let reader = self.spawn_reader(config.clone(), channel.events);
                    opened.push(ActiveSubscription {
                        channel_id: channel.id,
                        config,
                        reader,
                    });
                }
                Err(source) => {
                    warn!(table = %config.table, error = %source, "Failed to open change channel");
                    crate::metrics::record_channel("failed");
                    self.teardown(opened).await;
                    self.started.store(false, Ordering::Release);
                    return Err(SubscribeError::Open {
                        table: config.table,
                        source,
                    });
                }
            }
        }

        let count = opened.len();
        *self.subscriptions.lock() = opened;
        crate::metrics::set_active_subscriptions(count);
        info!(channels = count, "Realtime subscriptions active");
        Ok(count)
    }

    fn spawn_reader(
        &self,
        config: Arc<SubscriptionConfig>,
        mut events: mpsc::Receiver<ChangeEvent>,
    ) -> JoinHandle<()> {
        let debouncer = self.debouncer.clone();
        let invalidator = self.invalidator.clone();
        let delay = self.config.debounce;
        let debounce_key = config.debounce_key();
        let epoch = self.epoch.clone();
        let live = epoch.load(Ordering::Acquire);

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if epoch.load(Ordering::Acquire) != live {
                    break;
                }
                crate::metrics::record_change_event(&event.table, event.kind.as_str());
                let replaced = debouncer.schedule(
                    debounce_key.clone(),
                    delay,
                    flush(config.clone(), invalidator.clone(), event, epoch.clone(), live),
                );
                if replaced {
                    debug!(key = %debounce_key, "Coalesced change event");
                }
            }
            debug!(table = %config.table, "Change channel ended");
        })
    }

    /// Invalidate every subscribed key now, bypassing the debounce.
    ///
    /// Pending timers are left alone so their callbacks still fire.
    pub async fn force_refresh(&self) -> Vec<InvalidateError> {
        let keys = self.subscribed_keys();
        debug!(keys = keys.len(), "Forcing realtime refresh");
        for _ in &keys {
            crate::metrics::record_invalidation("force");
        }
        self.invalidator.invalidate_many(&keys).await
    }

    /// Distinct query keys of the open subscriptions, in subscription order.
    #[must_use]
    pub fn subscribed_keys(&self) -> Vec<QueryKey> {
        let mut seen = HashSet::new();
        self.subscriptions
            .lock()
            .iter()
            .map(|s| s.config.query_key.clone())
            .filter(|k| seen.insert(k.clone()))
            .collect()
    }

    #[must_use]
    pub fn active_subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Debounce timers waiting to fire.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.debouncer.pending_count()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn debounce(&self) -> Duration {
        self.config.debounce
    }

    /// Close every channel and clear every pending timer. Callbacks of
    /// flushes that are already running are suppressed.
    pub async fn stop(&self) -> usize {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        let count = subscriptions.len();
        let cancelled = self.teardown(subscriptions).await;
        self.started.store(false, Ordering::Release);
        crate::metrics::set_active_subscriptions(0);
        info!(channels = count, cancelled_timers = cancelled, "Realtime subscriptions stopped");
        count
    }

    /// Readers are halted before timers are cleared so none can schedule a
    /// new timer behind `cancel_all`.
    async fn teardown(&self, subscriptions: Vec<ActiveSubscription>) -> usize {
        for sub in &subscriptions {
            sub.reader.abort();
        }
        self.epoch.fetch_add(1, Ordering::AcqRel);

        let mut channel_ids = Vec::with_capacity(subscriptions.len());
        for sub in subscriptions {
            // Cancelled or finished; either way the reader is gone.
            let _ = sub.reader.await;
            channel_ids.push(sub.channel_id);
        }

        let cancelled = self.debouncer.cancel_all();
        for id in channel_ids {
            self.feed.close_channel(id).await;
            crate::metrics::record_channel("closed");
        }
        cancelled
    }
}

/// Debounced action for one burst: invalidate, then hand the last event to
/// the matching callback.
fn flush(
    config: Arc<SubscriptionConfig>,
    invalidator: Arc<dyn CacheInvalidator>,
    event: ChangeEvent,
    epoch: Arc<AtomicU64>,
    live: u64,
) -> impl FnOnce() -> futures::future::BoxFuture<'static, ()> + Send + 'static {
    move || {
        Box::pin(async move {
            if epoch.load(Ordering::Acquire) != live {
                return;
            }
            debug!(table = %config.table, key = %config.query_key, kind = event.kind.as_str(), "Debounce fired");
            crate::metrics::record_debounce_flush(&config.table);
            crate::metrics::record_invalidation("realtime");
            if let Err(e) = invalidator.invalidate(&config.query_key).await {
                warn!(key = %config.query_key, error = %e, "Invalidation after change event failed");
            }
            if epoch.load(Ordering::Acquire) != live {
                debug!(key = %config.query_key, "Stopped during flush, callback skipped");
                return;
            }
            if let Some(callback) = config.callback_for(event.kind) {
                callback(&event);
            }
        })
    }
}

impl Drop for RealtimeMultiplexer {
    fn drop(&mut self) {
        let subscriptions = std::mem::take(self.subscriptions.get_mut());
        let ids: Vec<ChannelId> = subscriptions
            .into_iter()
            .map(|s| {
                s.reader.abort();
                s.channel_id
            })
            .collect();
        // A reader caught mid-schedule can still add a timer after this; its
        // flush sees the new epoch and does nothing.
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.debouncer.cancel_all();
        if ids.is_empty() {
            return;
        }

        // Channels close asynchronously; without a runtime the backend's
        // senders just fail once their receivers are gone.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let feed = self.feed.clone();
            handle.spawn(async move {
                for id in ids {
                    feed.close_channel(id).await;
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::invalidation::testing::RecordingInvalidator;
    use crate::query_key;
    use crate::storage::memory::InMemoryBackend;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{sleep, sleep_until, Instant};

    fn setup(debounce_ms: u64, max: usize) -> (Arc<InMemoryBackend>, Arc<RecordingInvalidator>, RealtimeMultiplexer) {
        let backend = Arc::new(InMemoryBackend::new());
        let invalidator = Arc::new(RecordingInvalidator::default());
        let mux = RealtimeMultiplexer::new(
            RealtimeConfig {
                debounce: Duration::from_millis(debounce_ms),
                max_subscriptions: max,
            },
            backend.clone(),
            invalidator.clone(),
        );
        (backend, invalidator, mux)
    }

    fn payload_sink() -> (Arc<Mutex<Vec<Value>>>, impl Fn(&ChangeEvent) + Send + Sync + 'static) {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let s = sink.clone();
        (sink, move |e: &ChangeEvent| s.lock().push(e.new.clone().unwrap_or(Value::Null)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_into_one_invalidation() {
        let (backend, invalidator, mux) = setup(100, 10);
        let (payloads, on_update) = payload_sink();
        mux.start(vec![SubscriptionConfig::new("orders", query_key!["orders", 5]).on_update(on_update)])
            .await
            .unwrap();

        let origin = Instant::now();
        backend.emit(ChangeEvent::update("orders", None, json!({"id": 5, "status": "draft"})));
        sleep_until(origin + Duration::from_millis(50)).await;
        backend.emit(ChangeEvent::update("orders", None, json!({"id": 5, "status": "review"})));
        sleep_until(origin + Duration::from_millis(90)).await;
        backend.emit(ChangeEvent::update("orders", None, json!({"id": 5, "status": "final"})));

        sleep_until(origin + Duration::from_millis(189)).await;
        assert_eq!(invalidator.count(), 0);
        assert_eq!(mux.pending_count(), 1);

        sleep_until(origin + Duration::from_millis(191)).await;
        assert_eq!(invalidator.keys(), vec![query_key!["orders", 5]]);
        let at = invalidator.offsets(origin)[0];
        assert!(at >= Duration::from_millis(190) && at < Duration::from_millis(191), "fired at {:?}", at);
        assert_eq!(*payloads.lock(), vec![json!({"id": 5, "status": "final"})]);
        assert_eq!(mux.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_matches_last_event_kind() {
        let (backend, invalidator, mux) = setup(100, 10);
        let (inserts, on_insert) = payload_sink();
        let deletes = Arc::new(Mutex::new(Vec::new()));
        let d = deletes.clone();
        mux.start(vec![SubscriptionConfig::new("targets", query_key!["targets"])
            .on_insert(on_insert)
            .on_delete(move |e| d.lock().push(e.old.clone()))])
            .await
            .unwrap();

        backend.emit(ChangeEvent::insert("targets", json!({"id": 1})));
        sleep(Duration::from_millis(10)).await;
        backend.emit(ChangeEvent::delete("targets", json!({"id": 1})));
        sleep(Duration::from_millis(200)).await;

        assert_eq!(invalidator.count(), 1);
        assert!(inserts.lock().is_empty());
        assert_eq!(*deletes.lock(), vec![Some(json!({"id": 1}))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_keys_fire_independently() {
        let (backend, invalidator, mux) = setup(100, 10);
        mux.start(vec![
            SubscriptionConfig::new("orders", query_key!["orders"]),
            SubscriptionConfig::new("reports", query_key!["reports"]),
        ])
        .await
        .unwrap();

        backend.emit(ChangeEvent::insert("orders", json!({"id": 1})));
        backend.emit(ChangeEvent::insert("reports", json!({"id": 2})));
        sleep(Duration::from_millis(150)).await;

        let mut keys = invalidator.keys();
        keys.sort_by(|a, b| a.serialize().cmp(b.serialize()));
        assert_eq!(keys, vec![query_key!["orders"], query_key!["reports"]]);
    }

    #[tokio::test]
    async fn test_subscription_budget() {
        let (backend, _invalidator, mux) = setup(100, 10);
        let mut configs: Vec<SubscriptionConfig> = (0..12)
            .map(|i| SubscriptionConfig::new(format!("table_{}", i), query_key!["t", i]))
            .collect();
        configs.insert(0, SubscriptionConfig::new("disabled", query_key!["d"]).enabled(false));

        let opened = mux.start(configs).await.unwrap();
        assert_eq!(opened, 10);
        assert_eq!(backend.open_channel_count(), 10);
        assert_eq!(mux.active_subscription_count(), 10);
        // The first ten enabled configs win
        assert_eq!(mux.subscribed_keys()[0], query_key!["t", 0]);
        assert!(!mux.subscribed_keys().contains(&query_key!["t", 10]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_leaves_no_timers_or_channels() {
        let (backend, invalidator, mux) = setup(100, 10);
        mux.start(vec![
            SubscriptionConfig::new("orders", query_key!["orders"]),
            SubscriptionConfig::new("reports", query_key!["reports"]),
        ])
        .await
        .unwrap();

        backend.emit(ChangeEvent::insert("orders", json!({})));
        backend.emit(ChangeEvent::insert("reports", json!({})));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(mux.pending_count(), 2);

        assert_eq!(mux.stop().await, 2);
        assert_eq!(mux.pending_count(), 0);
        assert_eq!(backend.open_channel_count(), 0);
        assert!(!mux.is_running());

        sleep(Duration::from_millis(500)).await;
        assert_eq!(invalidator.count(), 0);
    }

    /// Invalidator that takes a while, so a flush can be caught mid-flight.
    struct SlowInvalidator {
        delay: Duration,
        completed: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl CacheInvalidator for SlowInvalidator {
        async fn invalidate(&self, _key: &QueryKey) -> Result<(), InvalidateError> {
            sleep(self.delay).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_flush_suppresses_callback() {
        let backend = Arc::new(InMemoryBackend::new());
        let invalidator = Arc::new(SlowInvalidator {
            delay: Duration::from_millis(100),
            completed: AtomicUsize::new(0),
        });
        let mux = RealtimeMultiplexer::new(
            RealtimeConfig {
                debounce: Duration::from_millis(100),
                max_subscriptions: 10,
            },
            backend.clone(),
            invalidator.clone(),
        );
        let (payloads, on_insert) = payload_sink();
        let config = SubscriptionConfig::new("orders", query_key!["orders"]).on_insert(on_insert);
        mux.start(vec![config.clone()]).await.unwrap();

        backend.emit(ChangeEvent::insert("orders", json!({"id": 1})));
        // Timer fires at 100ms, invalidation runs until 200ms
        sleep(Duration::from_millis(150)).await;
        assert_eq!(mux.pending_count(), 0);

        mux.stop().await;
        sleep(Duration::from_millis(300)).await;
        assert_eq!(invalidator.completed.load(Ordering::SeqCst), 1);
        assert!(payloads.lock().is_empty());

        // A fresh start delivers again
        mux.start(vec![config]).await.unwrap();
        backend.emit(ChangeEvent::insert("orders", json!({"id": 2})));
        sleep(Duration::from_millis(250)).await;
        assert_eq!(*payloads.lock(), vec![json!({"id": 2})]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_under_event_load_leaves_no_timers() {
        let (backend, invalidator, mux) = setup(50, 10);
        let (payloads, on_insert) = payload_sink();
        mux.start(vec![SubscriptionConfig::new("orders", query_key!["orders"]).on_insert(on_insert)])
            .await
            .unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let emitter = {
            let backend = backend.clone();
            let running = running.clone();
            tokio::spawn(async move {
                while running.load(Ordering::Acquire) {
                    backend.emit(ChangeEvent::insert("orders", json!({"id": 1})));
                    tokio::task::yield_now().await;
                }
            })
        };

        sleep(Duration::from_millis(20)).await;
        mux.stop().await;
        assert_eq!(mux.pending_count(), 0);
        let invalidations = invalidator.count();
        let callbacks = payloads.lock().len();

        sleep(Duration::from_millis(150)).await;
        running.store(false, Ordering::Release);
        emitter.await.unwrap();

        assert_eq!(mux.pending_count(), 0);
        assert_eq!(backend.open_channel_count(), 0);
        assert_eq!(invalidator.count(), invalidations);
        assert_eq!(payloads.lock().len(), callbacks);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_closes_channels() {
        let (backend, _invalidator, mux) = setup(100, 10);
        mux.start(vec![SubscriptionConfig::new("orders", query_key!["orders"])])
            .await
            .unwrap();
        assert_eq!(backend.open_channel_count(), 1);

        drop(mux);
        sleep(Duration::from_millis(1)).await;
        assert_eq!(backend.open_channel_count(), 0);
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_debounce() {
        let (_backend, invalidator, mux) = setup(60_000, 10);
        mux.start(vec![
            SubscriptionConfig::new("orders", query_key!["orders"]),
            SubscriptionConfig::new("order_lines", query_key!["orders"]),
            SubscriptionConfig::new("reports", query_key!["reports"]),
        ])
        .await
        .unwrap();

        assert!(mux.force_refresh().await.is_empty());
        assert_eq!(invalidator.keys(), vec![query_key!["orders"], query_key!["reports"]]);

        *invalidator.fail.lock() = true;
        assert_eq!(mux.force_refresh().await.len(), 2);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (_backend, _invalidator, mux) = setup(100, 10);
        mux.start(vec![]).await.unwrap();
        assert_eq!(mux.start(vec![]).await, Err(SubscribeError::AlreadyStarted));

        mux.stop().await;
        assert!(mux.start(vec![]).await.is_ok());
    }

    #[tokio::test]
    async fn test_open_failure_rolls_back() {
        let (backend, _invalidator, mux) = setup(100, 10);
        backend.fail_opens(Some(crate::storage::BackendError::Unavailable("realtime down".into())));

        let err = mux
            .start(vec![SubscriptionConfig::new("orders", query_key!["orders"])])
            .await
            .unwrap_err();
        assert!(matches!(err, SubscribeError::Open { ref table, .. } if table == "orders"));
        assert_eq!(backend.open_channel_count(), 0);
        assert!(!mux.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_limits_events() {
        let (backend, invalidator, mux) = setup(100, 10);
        mux.start(vec![SubscriptionConfig::new("esg_metrics", query_key!["esg_metrics", "c-1"])
            .filter("company_id", "c-1")])
            .await
            .unwrap();

        backend.emit(ChangeEvent::insert("esg_metrics", json!({"company_id": "c-2"})));
        sleep(Duration::from_millis(200)).await;
        assert_eq!(invalidator.count(), 0);

        backend.emit(ChangeEvent::insert("esg_metrics", json!({"company_id": "c-1"})));
        sleep(Duration::from_millis(200)).await;
        assert_eq!(invalidator.count(), 1);
    }
}

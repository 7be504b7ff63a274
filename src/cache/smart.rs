// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Smart cache wrapper.
//!
//! [`SmartCache`] wraps a remote fetch with priority-tiered freshness,
//! retry with backoff, optional background refetch, and opportunistic
//! prefetch of related keys.
//!
//! # Read flow
//!
//! ```text
//! get(key, fetcher, options)
//!       │
//!       ▼
//! ┌──────────────────────────────┐
//! │ store lookup                 │
//! └──────────────────────────────┘
//!       │
//!       ├─→ Fresh                        → return cached data
//!       │
//!       ├─→ Stale + background_refetch   → return cached data,
//!       │                                  refetch in background
//!       │
//!       └─→ Miss / Stale                 → fetch with tier retries
//!                                             │
//!                                             ├─→ Ok  → store, prefetch related (2× stale time)
//!                                             └─→ Err → QueryError, nothing substituted
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use query_sync::{fetcher, query_key, CachePriority, QueryOptions, QueryStore, SmartCache};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let cache = SmartCache::new(Arc::new(QueryStore::new()));
//! let rows = cache
//!     .get(
//!         query_key!["esg_metrics", "company-1"],
//!         fetcher(|| async { Ok(json!([{"scope": 1, "value": 12.5}])) }),
//!         QueryOptions::new(CachePriority::High),
//!     )
//!     .await
//!     .expect("fetch failed");
//! assert!(rows.is_array());
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::invalidation::{CacheInvalidator, InvalidateError};
use super::store::{CacheEntry, Lookup, QueryStore};
use crate::metrics::LatencyTimer;
use crate::priority::{CachePolicy, CachePriority};
use crate::query_key::QueryKey;
use crate::resilience::retry::{retry, RetryConfig, RetryError};
use crate::storage::traits::BackendError;

/// Error a fetcher reports; the cache retries on any of them.
pub type FetchError = BackendError;

/// Zero-argument async producer of a query's value.
///
/// Any `Fn() -> impl Future<Output = Result<Value, FetchError>>` closure
/// is a fetcher; see [`fetcher`].
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self) -> Result<Value, FetchError>;
}

#[async_trait]
impl<F, Fut> Fetcher for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
{
    async fn fetch(&self) -> Result<Value, FetchError> {
        (self)().await
    }
}

/// Box a closure as a shareable [`Fetcher`].
pub fn fetcher<F, Fut>(f: F) -> Arc<dyn Fetcher>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
{
    Arc::new(f)
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("Fetching {key} failed after {attempts} attempts: {source}")]
    Exhausted {
        key: QueryKey,
        attempts: u32,
        #[source]
        source: BackendError,
    },

    #[error("Fetching {key} abandoned after {attempts} attempts ({elapsed:?}), retry budget spent: {source}")]
    BudgetExceeded {
        key: QueryKey,
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: BackendError,
    },
}

impl QueryError {
    fn from_retry(key: QueryKey, err: RetryError<BackendError>) -> Self {
        match err {
            RetryError::Exhausted { attempts, source } => Self::Exhausted { key, attempts, source },
            RetryError::BudgetExceeded { attempts, elapsed, source } => Self::BudgetExceeded {
                key,
                attempts,
                elapsed,
                source,
            },
        }
    }

    #[must_use]
    pub fn key(&self) -> &QueryKey {
        match self {
            Self::Exhausted { key, .. } | Self::BudgetExceeded { key, .. } => key,
        }
    }
}

/// A related key to prefetch after a successful fetch.
#[derive(Clone)]
pub struct RelatedQuery {
    pub key: QueryKey,
    pub fetcher: Arc<dyn Fetcher>,
}

impl fmt::Debug for RelatedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelatedQuery").field("key", &self.key).finish_non_exhaustive()
    }
}

/// Per-call query options. Overrides beat tier defaults.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub priority: CachePriority,
    pub stale_time: Option<Duration>,
    pub gc_time: Option<Duration>,
    pub preload_related: Vec<RelatedQuery>,
    /// Serve stale data while refetching in the background.
    pub background_refetch: bool,
}

impl QueryOptions {
    #[must_use]
    pub fn new(priority: CachePriority) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    #[must_use]
    pub fn gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    #[must_use]
    pub fn preload(mut self, key: QueryKey, fetcher: Arc<dyn Fetcher>) -> Self {
        self.preload_related.push(RelatedQuery { key, fetcher });
        self
    }

    #[must_use]
    pub fn background_refetch(mut self, enabled: bool) -> Self {
        self.background_refetch = enabled;
        self
    }

    /// Tier policy with this call's overrides applied.
    #[must_use]
    pub fn policy(&self) -> CachePolicy {
        CachePolicy::resolve(self.priority, self.stale_time, self.gc_time)
    }
}

/// Snapshot of a query as seen by an observer.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState {
    pub data: Option<Value>,
    /// No data yet and a fetch is running.
    pub is_loading: bool,
    /// A fetch is running (possibly in the background).
    pub is_fetching: bool,
    pub error: Option<QueryError>,
    pub fetched_at: Option<Instant>,
}

struct ActiveQuery {
    fetcher: Arc<dyn Fetcher>,
    options: QueryOptions,
    observers: usize,
}

/// Counts a running fetch for its key until dropped.
struct InFlight {
    map: Arc<DashMap<QueryKey, usize>>,
    key: QueryKey,
}

impl InFlight {
    fn enter(map: &Arc<DashMap<QueryKey, usize>>, key: &QueryKey) -> Self {
        *map.entry(key.clone()).or_insert(0) += 1;
        Self {
            map: map.clone(),
            key: key.clone(),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(mut n) = self.map.get_mut(&self.key) {
            *n = n.saturating_sub(1);
        }
        self.map.remove_if(&self.key, |_, n| *n == 0);
    }
}

struct Inner {
    store: Arc<QueryStore>,
    active: DashMap<QueryKey, ActiveQuery>,
    in_flight: Arc<DashMap<QueryKey, usize>>,
    errors: DashMap<QueryKey, QueryError>,
    retry_budget: Option<Duration>,
}

/// Priority-aware query cache over a shared [`QueryStore`].
///
/// Cloning is cheap; clones share the same store and bookkeeping.
#[derive(Clone)]
pub struct SmartCache {
    inner: Arc<Inner>,
}

impl SmartCache {
    pub fn new(store: Arc<QueryStore>) -> Self {
        Self::with_retry_budget(store, None)
    }

    /// Cap the total time any single fetch may spend retrying.
    pub fn with_retry_budget(store: Arc<QueryStore>, budget: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                active: DashMap::new(),
                in_flight: Arc::new(DashMap::new()),
                errors: DashMap::new(),
                retry_budget: budget,
            }),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<QueryStore> {
        &self.inner.store
    }

    /// Read `key`, fetching when absent or stale.
    pub async fn get(
        &self,
        key: QueryKey,
        fetcher: Arc<dyn Fetcher>,
        options: QueryOptions,
    ) -> Result<Value, QueryError> {
        self.resolve(&key, &fetcher, &options).await
    }

    /// Register an observer for `key`. While the handle lives the entry is
    /// exempt from gc and invalidations refetch it.
    pub fn query(
        &self,
        key: QueryKey,
        fetcher: Arc<dyn Fetcher>,
        options: QueryOptions,
    ) -> SmartQuery {
        self.inner
            .active
            .entry(key.clone())
            .and_modify(|a| {
                a.observers += 1;
                a.fetcher = fetcher.clone();
                a.options = options.clone();
            })
            .or_insert_with(|| ActiveQuery {
                fetcher: fetcher.clone(),
                options: options.clone(),
                observers: 1,
            });
        self.inner.store.retain(&key);

        SmartQuery {
            cache: self.clone(),
            key,
            fetcher,
            options,
        }
    }

    /// Load `key` into the cache if it is not already there.
    pub async fn prefetch(
        &self,
        key: QueryKey,
        fetcher: Arc<dyn Fetcher>,
        options: QueryOptions,
    ) -> Result<(), QueryError> {
        if matches!(self.inner.store.lookup(&key), Lookup::Fresh(_)) {
            return Ok(());
        }
        self.fetch_and_store(&key, &fetcher, &options).await.map(|_| ())
    }

    /// Mark each related key stale; data stays until the next read refetches.
    pub fn invalidate_related(&self, options: &QueryOptions) -> usize {
        options
            .preload_related
            .iter()
            .filter(|r| self.inner.store.invalidate(&r.key))
            .count()
    }

    /// Replace the cached value for `key` with `updater(old)`, then mark
    /// related keys stale so they re-sync with the server.
    pub fn optimistic_update<U>(&self, key: &QueryKey, options: &QueryOptions, updater: U) -> Value
    where
        U: FnOnce(Option<&Value>) -> Value,
    {
        let current = self.inner.store.get(key);
        let data = updater(current.as_ref().and_then(|e| e.data.as_ref()));

        let entry = match current {
            Some(entry) => CacheEntry {
                data: Some(data.clone()),
                fetched_at: Instant::now(),
                invalidated: false,
                ..entry
            },
            None => CacheEntry::new(key.clone(), data.clone(), options.priority, &options.policy()),
        };
        self.inner.store.set(entry);

        let marked = self.invalidate_related(options);
        debug!(key = %key, related_marked = marked, "Applied optimistic update");
        data
    }

    /// Current view of `key` for an observer.
    #[must_use]
    pub fn state(&self, key: &QueryKey) -> QueryState {
        let entry = self.inner.store.get(key);
        let is_fetching = self.is_fetching(key);
        let data = entry.as_ref().and_then(|e| e.data.clone());
        QueryState {
            is_loading: is_fetching && data.is_none(),
            is_fetching,
            error: self.inner.errors.get(key).map(|e| e.value().clone()),
            fetched_at: entry.map(|e| e.fetched_at),
            data,
        }
    }

    #[must_use]
    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        self.inner.in_flight.get(key).is_some_and(|n| *n > 0)
    }

    /// Keys that currently have at least one observer.
    #[must_use]
    pub fn active_keys(&self) -> Vec<QueryKey> {
        self.inner.active.iter().map(|a| a.key().clone()).collect()
    }

    async fn resolve(
        &self,
        key: &QueryKey,
        fetcher: &Arc<dyn Fetcher>,
        options: &QueryOptions,
    ) -> Result<Value, QueryError> {
        match self.inner.store.lookup(key) {
            Lookup::Fresh(CacheEntry { data: Some(data), .. }) => {
                debug!(key = %key, "Cache hit");
                return Ok(data);
            }
            Lookup::Stale(CacheEntry { data: Some(data), .. }) if options.background_refetch => {
                debug!(key = %key, "Serving stale data, refetching in background");
                self.spawn_refetch(key.clone(), fetcher.clone(), options.clone());
                return Ok(data);
            }
            _ => {}
        }
        self.fetch_and_store(key, fetcher, options).await
    }

    #[tracing::instrument(skip(self, key, fetcher, options), fields(key = %key, priority = %options.priority))]
    async fn fetch_and_store(
        &self,
        key: &QueryKey,
        fetcher: &Arc<dyn Fetcher>,
        options: &QueryOptions,
    ) -> Result<Value, QueryError> {
        let policy = options.policy();
        let config = RetryConfig::for_policy(&policy).with_budget(self.inner.retry_budget);
        let _in_flight = InFlight::enter(&self.inner.in_flight, key);
        let _timer = LatencyTimer::new("fetch");

        let operation = format!("fetch {}", key);
        match retry(&operation, &config, || fetcher.fetch()).await {
            Ok(data) => {
                self.inner
                    .store
                    .set(CacheEntry::new(key.clone(), data.clone(), options.priority, &policy));
                self.inner.errors.remove(key);
                crate::metrics::record_fetch(options.priority.as_str(), "success");
                self.preload_related(options, &policy);
                Ok(data)
            }
            Err(err) => {
                let err = QueryError::from_retry(key.clone(), err);
                warn!(error = %err, "Query failed");
                crate::metrics::record_fetch(options.priority.as_str(), "error");
                self.inner.errors.insert(key.clone(), err.clone());
                Err(err)
            }
        }
    }

    fn spawn_refetch(&self, key: QueryKey, fetcher: Arc<dyn Fetcher>, options: QueryOptions) {
        if self.is_fetching(&key) {
            debug!(key = %key, "Refetch already in flight");
            return;
        }
        // Count the fetch before spawning so a second stale read does not
        // start another one.
        let guard = InFlight::enter(&self.inner.in_flight, &key);
        let cache = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = cache.fetch_and_store(&key, &fetcher, &options).await {
                debug!(key = %key, error = %e, "Background refetch failed");
            }
        });
    }

    /// Prefetched data was loaded opportunistically, not demanded, so it is
    /// kept fresh for twice the primary's stale time.
    fn preload_related(&self, options: &QueryOptions, policy: &CachePolicy) {
        for related in &options.preload_related {
            if self.inner.store.contains(&related.key) || self.is_fetching(&related.key) {
                continue;
            }

            let stale_time = policy.stale_time * 2;
            let related_policy = CachePolicy {
                stale_time,
                gc_time: policy.gc_time.max(stale_time),
                max_retries: 0,
            };
            let guard = InFlight::enter(&self.inner.in_flight, &related.key);
            let store = self.inner.store.clone();
            let related = related.clone();
            let priority = options.priority;

            tokio::spawn(async move {
                let _guard = guard;
                match retry("prefetch", &RetryConfig::none(), || related.fetcher.fetch()).await {
                    Ok(data) => {
                        store.set(CacheEntry::new(related.key.clone(), data, priority, &related_policy));
                        crate::metrics::record_fetch(priority.as_str(), "prefetch");
                        debug!(key = %related.key, "Prefetched related query");
                    }
                    Err(e) => {
                        debug!(key = %related.key, error = %e, "Prefetch failed");
                    }
                }
            });
        }
    }

    fn release(&self, key: &QueryKey) {
        if let Some(mut active) = self.inner.active.get_mut(key) {
            active.observers = active.observers.saturating_sub(1);
        }
        self.inner.active.remove_if(key, |_, a| a.observers == 0);
        self.inner.store.release(key);
    }
}

#[async_trait]
impl CacheInvalidator for SmartCache {
    /// Marks every key under `key` stale, then refetches the observed ones.
    async fn invalidate(&self, key: &QueryKey) -> Result<(), InvalidateError> {
        let marked = self.inner.store.invalidate_prefix(key);
        crate::metrics::record_invalidation("cache");

        let targets: Vec<(QueryKey, Arc<dyn Fetcher>, QueryOptions)> = self
            .inner
            .active
            .iter()
            .filter(|a| a.key().starts_with(key))
            .map(|a| (a.key().clone(), a.fetcher.clone(), a.options.clone()))
            .collect();
        debug!(key = %key, marked, observed = targets.len(), "Invalidated");

        for (target, fetcher, options) in targets {
            if self.is_fetching(&target) {
                continue;
            }
            self.fetch_and_store(&target, &fetcher, &options)
                .await
                .map_err(|source| InvalidateError::Refetch {
                    key: target.clone(),
                    source,
                })?;
        }
        Ok(())
    }
}

/// Observer handle for one query. Dropping it releases the observer.
pub struct SmartQuery {
    cache: SmartCache,
    key: QueryKey,
    fetcher: Arc<dyn Fetcher>,
    options: QueryOptions,
}

impl SmartQuery {
    #[must_use]
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Read through the cache (fresh hit, background refetch or fetch).
    pub async fn fetch(&self) -> Result<Value, QueryError> {
        self.cache.resolve(&self.key, &self.fetcher, &self.options).await
    }

    /// Fetch regardless of freshness.
    pub async fn refetch(&self) -> Result<Value, QueryError> {
        self.cache.fetch_and_store(&self.key, &self.fetcher, &self.options).await
    }

    #[must_use]
    pub fn state(&self) -> QueryState {
        self.cache.state(&self.key)
    }

    #[must_use]
    pub fn data(&self) -> Option<Value> {
        self.state().data
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.state().is_loading
    }

    #[must_use]
    pub fn error(&self) -> Option<QueryError> {
        self.state().error
    }

    pub fn invalidate_related(&self) -> usize {
        self.cache.invalidate_related(&self.options)
    }

    pub fn optimistic_update<U>(&self, updater: U) -> Value
    where
        U: FnOnce(Option<&Value>) -> Value,
    {
        self.cache.optimistic_update(&self.key, &self.options, updater)
    }
}

impl Drop for SmartQuery {
    fn drop(&mut self) {
        self.cache.release(&self.key);
    }
}

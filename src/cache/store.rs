// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query store.
//!
//! The [`QueryStore`] is the single keyed map behind every cached query.
//! It is created by the host (usually through [`crate::SyncLayer`]) and
//! handed to whatever needs it; nothing in the crate reaches for a global.
//!
//! Entries are always replaced whole: a reader sees either the previous
//! entry or the next one, never a mix.
//!
//! # Freshness and retention
//!
//! - An entry is **fresh** while it is younger than its `stale_time` and has
//!   not been invalidated.
//! - An entry with no observers becomes **collectable** once it has been
//!   idle for its `gc_time`. Observed entries are never collected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use super::invalidation::{CacheInvalidator, InvalidateError};
use crate::priority::{CachePolicy, CachePriority};
use crate::query_key::QueryKey;

/// One cached query result.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: QueryKey,
    pub data: Option<Value>,
    pub fetched_at: Instant,
    pub priority: CachePriority,
    pub stale_time: Duration,
    pub gc_time: Duration,
    /// Set by invalidation; cleared by the next successful fetch.
    pub invalidated: bool,
}

impl CacheEntry {
    pub fn new(key: QueryKey, data: Value, priority: CachePriority, policy: &CachePolicy) -> Self {
        Self {
            key,
            data: Some(data),
            fetched_at: Instant::now(),
            priority,
            stale_time: policy.stale_time,
            gc_time: policy.gc_time,
            invalidated: false,
        }
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    #[must_use]
    pub fn is_fresh(&self) -> bool {
        !self.invalidated && self.age() < self.stale_time
    }
}

/// Result of a store lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Fresh(CacheEntry),
    Stale(CacheEntry),
    Miss,
}

#[derive(Debug, Clone, Copy)]
struct Activity {
    observers: usize,
    idle_since: Instant,
}

/// Store statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Lookups that found an entry past its freshness window
    pub stale: u64,
    pub evictions: u64,
    pub entry_count: usize,
    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,
}

pub struct QueryStore {
    entries: DashMap<QueryKey, CacheEntry>,
    activity: DashMap<QueryKey, Activity>,
    hits: AtomicU64,
    misses: AtomicU64,
    stale: AtomicU64,
    evictions: AtomicU64,
}

impl QueryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            activity: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Raw read without touching statistics.
    #[must_use]
    pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    #[must_use]
    pub fn contains(&self, key: &QueryKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Read classifying the entry by freshness, recording hit/miss stats.
    pub fn lookup(&self, key: &QueryKey) -> Lookup {
        match self.get(key) {
            Some(entry) if entry.is_fresh() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_lookup(entry.priority.as_str(), "hit");
                Lookup::Fresh(entry)
            }
            Some(entry) => {
                self.stale.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_lookup(entry.priority.as_str(), "stale");
                Lookup::Stale(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_lookup("none", "miss");
                Lookup::Miss
            }
        }
    }

    /// Replace the entry for its key.
    pub fn set(&self, entry: CacheEntry) {
        let key = entry.key.clone();
        self.entries.insert(key.clone(), entry);
        self.activity
            .entry(key)
            .and_modify(|a| {
                if a.observers == 0 {
                    a.idle_since = Instant::now();
                }
            })
            .or_insert(Activity {
                observers: 0,
                idle_since: Instant::now(),
            });
        crate::metrics::set_cache_entries(self.entries.len());
    }

    /// Mark an entry stale without dropping its data.
    /// Returns whether an entry existed.
    pub fn invalidate(&self, key: &QueryKey) -> bool {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                let replacement = CacheEntry {
                    invalidated: true,
                    ..entry.value().clone()
                };
                *entry = replacement;
                true
            }
            None => false,
        }
    }

    /// Mark every entry whose key starts with `prefix` stale.
    pub fn invalidate_prefix(&self, prefix: &QueryKey) -> usize {
        let mut count = 0;
        for mut entry in self.entries.iter_mut() {
            if entry.key().starts_with(prefix) {
                let replacement = CacheEntry {
                    invalidated: true,
                    ..entry.value().clone()
                };
                *entry.value_mut() = replacement;
                count += 1;
            }
        }
        count
    }

    /// Remove an entry outright.
    pub fn evict(&self, key: &QueryKey) -> Option<CacheEntry> {
        let removed = self.entries.remove(key).map(|(_, e)| e);
        if removed.is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            crate::metrics::set_cache_entries(self.entries.len());
        }
        if self.activity.get(key).is_some_and(|a| a.observers == 0) {
            self.activity.remove(key);
        }
        removed
    }

    /// Register an observer on `key`; observed entries are never collected.
    pub fn retain(&self, key: &QueryKey) {
        self.activity
            .entry(key.clone())
            .and_modify(|a| a.observers += 1)
            .or_insert(Activity {
                observers: 1,
                idle_since: Instant::now(),
            });
    }

    /// Drop an observer; the last one out starts the gc idle clock.
    pub fn release(&self, key: &QueryKey) {
        if let Some(mut a) = self.activity.get_mut(key) {
            a.observers = a.observers.saturating_sub(1);
            if a.observers == 0 {
                a.idle_since = Instant::now();
            }
        }
    }

    #[must_use]
    pub fn observer_count(&self, key: &QueryKey) -> usize {
        self.activity.get(key).map_or(0, |a| a.observers)
    }

    /// Keys with at least one live observer.
    #[must_use]
    pub fn observed_keys(&self) -> Vec<QueryKey> {
        self.activity
            .iter()
            .filter(|a| a.observers > 0)
            .map(|a| a.key().clone())
            .collect()
    }

    /// Evict unobserved entries idle for longer than their `gc_time`.
    pub fn collect_garbage(&self) -> usize {
        let expired: Vec<QueryKey> = self
            .entries
            .iter()
            .filter(|e| match self.activity.get(e.key()) {
                Some(a) => a.observers == 0 && a.idle_since.elapsed() >= e.gc_time,
                None => e.fetched_at.elapsed() >= e.gc_time,
            })
            .map(|e| e.key().clone())
            .collect();

        let mut evicted = 0;
        for key in expired {
            // Re-check under the shard lock; an observer may have arrived.
            if self.observer_count(&key) > 0 {
                continue;
            }
            if self.entries.remove(&key).is_some() {
                self.activity.remove(&key);
                evicted += 1;
            }
        }

        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            crate::metrics::record_gc_evictions(evicted);
            crate::metrics::set_cache_entries(self.entries.len());
            debug!(evicted, remaining = self.entries.len(), "Collected idle cache entries");
        }
        evicted
    }

    #[must_use]
    pub fn keys(&self) -> Vec<QueryKey> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry and observer record.
    pub fn clear(&self) {
        self.entries.clear();
        self.activity.clear();
        crate::metrics::set_cache_entries(0);
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            hits,
            misses,
            stale: self.stale.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entry_count: self.entries.len(),
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

impl Default for QueryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheInvalidator for QueryStore {
    /// Marks `key` and every key under it stale.
    async fn invalidate(&self, key: &QueryKey) -> Result<(), InvalidateError> {
        self.invalidate_prefix(key);
        Ok(())
    }
}

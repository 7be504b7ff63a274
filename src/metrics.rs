// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for query-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `query_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `priority`: high, medium, low
//! - `operation`: fetch, refresh, save
//! - `status`: success, error, unchanged, dropped

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "query_sync_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// CACHE - Lookups, fetches and retention
// ═══════════════════════════════════════════════════════════════════════════

/// Record a store lookup (hit, stale, miss)
pub fn record_cache_lookup(priority: &str, outcome: &str) {
    counter!(
        "query_sync_cache_lookups_total",
        "priority" => priority.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set current cache entry count
pub fn set_cache_entries(count: usize) {
    gauge!("query_sync_cache_entries").set(count as f64);
}

/// Record entries removed by garbage collection
pub fn record_gc_evictions(count: usize) {
    counter!("query_sync_gc_evictions_total").increment(count as u64);
}

/// Record the final outcome of a fetch (after retries)
pub fn record_fetch(priority: &str, status: &str) {
    counter!(
        "query_sync_fetches_total",
        "priority" => priority.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a single failed fetch attempt
pub fn record_fetch_attempt(status: &str) {
    counter!(
        "query_sync_fetch_attempts_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a retry being scheduled
pub fn record_retry(operation: &str) {
    counter!(
        "query_sync_retries_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record an invalidation by origin (cache, realtime, refresh)
pub fn record_invalidation(source: &str) {
    counter!(
        "query_sync_invalidations_total",
        "source" => source.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// REALTIME - Change feed subscriptions
// ═══════════════════════════════════════════════════════════════════════════

/// Record a change event received from the backend
pub fn record_change_event(table: &str, kind: &str) {
    counter!(
        "query_sync_change_events_total",
        "table" => table.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a debounced burst being flushed
pub fn record_debounce_flush(table: &str) {
    counter!(
        "query_sync_debounce_flushes_total",
        "table" => table.to_string()
    )
    .increment(1);
}

/// Set the number of open change channels
pub fn set_active_subscriptions(count: usize) {
    gauge!("query_sync_active_subscriptions").set(count as f64);
}

/// Record subscription configs dropped by the budget
pub fn record_subscriptions_dropped(count: usize) {
    counter!("query_sync_subscriptions_dropped_total").increment(count as u64);
}

/// Record a channel lifecycle event (opened, closed, failed)
pub fn record_channel(event: &str) {
    counter!(
        "query_sync_channels_total",
        "event" => event.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// REFRESH - Polling and manual refresh
// ═══════════════════════════════════════════════════════════════════════════

/// Record a refresh cycle outcome
pub fn record_refresh(trigger: &str, status: &str) {
    counter!(
        "query_sync_refreshes_total",
        "trigger" => trigger.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Set whether a refresh is in progress (1 = refreshing)
pub fn set_refreshing(refreshing: bool) {
    gauge!("query_sync_refreshing").set(if refreshing { 1.0 } else { 0.0 });
}

// ═══════════════════════════════════════════════════════════════════════════
// AUTO-SAVE - Debounced writes
// ═══════════════════════════════════════════════════════════════════════════

/// Record an auto-save outcome (written, unchanged, dropped, error)
pub fn record_autosave(status: &str) {
    counter!(
        "query_sync_autosaves_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Set layer state (for monitoring state machine transitions)
pub fn set_layer_state(state: &str) {
    counter!(
        "query_sync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These verify the API doesn't panic without an installed recorder.

    #[test]
    fn test_cache_metrics() {
        record_cache_lookup("high", "hit");
        record_cache_lookup("none", "miss");
        set_cache_entries(42);
        record_gc_evictions(3);
        record_fetch("medium", "success");
        record_fetch_attempt("error");
        record_retry("fetch orders");
        record_invalidation("realtime");
    }

    #[test]
    fn test_realtime_metrics() {
        record_change_event("orders", "INSERT");
        record_debounce_flush("orders");
        set_active_subscriptions(10);
        record_subscriptions_dropped(2);
        record_channel("opened");
        record_channel("closed");
    }

    #[test]
    fn test_refresh_and_autosave_metrics() {
        record_refresh("interval", "success");
        record_refresh("manual", "error");
        set_refreshing(true);
        set_refreshing(false);
        record_autosave("written");
        record_autosave("unchanged");
        set_layer_state("Running");
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("fetch");
            std::thread::sleep(Duration::from_micros(10));
        }
        // Timer recorded on drop
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the sync layer.
//!
//! # Example
//!
//! ```
//! use query_sync::SyncLayerConfig;
//! use std::time::Duration;
//!
//! // Minimal config (uses defaults)
//! let config = SyncLayerConfig::default();
//! assert_eq!(config.max_subscriptions, 10);
//!
//! // Partial JSON, everything else defaulted
//! let config: SyncLayerConfig =
//!     serde_json::from_str(r#"{"realtime_debounce_ms": 250, "retry_budget_ms": 0}"#).unwrap();
//! assert_eq!(config.realtime().debounce, Duration::from_millis(250));
//! assert_eq!(config.retry_budget(), None);
//! ```

use std::time::Duration;

use serde::Deserialize;

/// Configuration for the sync layer.
///
/// All fields have sensible defaults; durations are in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncLayerConfig {
    /// Quiet period before a burst of change events invalidates (default: 1s)
    #[serde(default = "default_realtime_debounce_ms")]
    pub realtime_debounce_ms: u64,

    /// Concurrent realtime subscription budget
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions: usize,

    /// Polling interval for the refresh controller (0 = manual only)
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,

    /// Auto-save debounce
    #[serde(default = "default_autosave_debounce_ms")]
    pub autosave_debounce_ms: u64,

    /// How long Saved / Error stay visible before returning to Idle
    #[serde(default = "default_saved_display_ms")]
    pub saved_display_ms: u64,
    #[serde(default = "default_error_display_ms")]
    pub error_display_ms: u64,

    /// How often idle cache entries are collected
    #[serde(default = "default_gc_interval_ms")]
    pub gc_interval_ms: u64,

    /// Overall time one fetch may spend retrying (0 = unbounded)
    #[serde(default = "default_retry_budget_ms")]
    pub retry_budget_ms: u64,

    /// Per-channel buffer of undelivered change events
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
}

fn default_realtime_debounce_ms() -> u64 { 1000 }
fn default_max_subscriptions() -> usize { 10 }
fn default_refresh_interval_ms() -> u64 { 30_000 }
fn default_autosave_debounce_ms() -> u64 { 2000 }
fn default_saved_display_ms() -> u64 { 2000 }
fn default_error_display_ms() -> u64 { 5000 }
fn default_gc_interval_ms() -> u64 { 60_000 }
fn default_retry_budget_ms() -> u64 { 60_000 }
fn default_channel_buffer() -> usize { 256 }

impl Default for SyncLayerConfig {
    fn default() -> Self {
        Self {
            realtime_debounce_ms: default_realtime_debounce_ms(),
            max_subscriptions: default_max_subscriptions(),
            refresh_interval_ms: default_refresh_interval_ms(),
            autosave_debounce_ms: default_autosave_debounce_ms(),
            saved_display_ms: default_saved_display_ms(),
            error_display_ms: default_error_display_ms(),
            gc_interval_ms: default_gc_interval_ms(),
            retry_budget_ms: default_retry_budget_ms(),
            channel_buffer: default_channel_buffer(),
        }
    }
}

impl SyncLayerConfig {
    #[must_use]
    pub fn realtime(&self) -> RealtimeConfig {
        RealtimeConfig {
            debounce: Duration::from_millis(self.realtime_debounce_ms),
            max_subscriptions: self.max_subscriptions,
        }
    }

    #[must_use]
    pub fn refresh(&self) -> RefreshConfig {
        RefreshConfig {
            interval: Duration::from_millis(self.refresh_interval_ms),
        }
    }

    #[must_use]
    pub fn autosave(&self) -> AutoSaveConfig {
        AutoSaveConfig {
            debounce: Duration::from_millis(self.autosave_debounce_ms),
            saved_display: Duration::from_millis(self.saved_display_ms),
            error_display: Duration::from_millis(self.error_display_ms),
        }
    }

    #[must_use]
    pub fn retry_budget(&self) -> Option<Duration> {
        (self.retry_budget_ms > 0).then(|| Duration::from_millis(self.retry_budget_ms))
    }

    #[must_use]
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms.max(1))
    }
}

/// Realtime multiplexer settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealtimeConfig {
    pub debounce: Duration,
    pub max_subscriptions: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        SyncLayerConfig::default().realtime()
    }
}

/// Refresh controller settings. A zero interval disables polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshConfig {
    pub interval: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        SyncLayerConfig::default().refresh()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoSaveConfig {
    pub debounce: Duration,
    pub saved_display: Duration,
    pub error_display: Duration,
}

impl Default for AutoSaveConfig {
    fn default() -> Self {
        SyncLayerConfig::default().autosave()
    }
}

//! # Query Sync
//!
//! An in-process data-synchronization layer for applications that read
//! remote tables through a query cache.
//!
//! ## Architecture
//!
//! Reads go through a priority-tiered cache; remote change notifications
//! and a polling fallback invalidate it; drafts are written back through a
//! debounced auto-save that runs independently of the read side:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Smart Cache                           │
//! │  • get / query with High / Medium / Low freshness tiers     │
//! │  • Tier retries with capped exponential backoff             │
//! │  • Related-key prefetch, optimistic updates                 │
//! └─────────────────────────────────────────────────────────────┘
//!               ▲ invalidate                ▲ invalidate
//!               │                           │
//! ┌─────────────────────────────┐ ┌─────────────────────────────┐
//! │   Realtime Multiplexer      │ │   Refresh Controller        │
//! │  • One channel per config   │ │  • Interval invalidation    │
//! │  • Per-key debounce         │ │  • Manual refresh()         │
//! │  • Subscription budget      │ │  • Failure notices          │
//! └─────────────────────────────┘ └─────────────────────────────┘
//!               ▲ change events
//!               │
//! ┌─────────────────────────────────────────────────────────────┐
//! │            Backend (ChangeFeed + RecordWriter)              │
//! └─────────────────────────────────────────────────────────────┘
//!               ▲ debounced writes
//!               │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Auto-Save Reconciler                       │
//! │  • Debounced, one write in flight per record                │
//! │  • Content hash skips no-op writes                          │
//! │  • Idle → Saving → Saved / Error → Idle                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use query_sync::{
//!     fetcher, query_key, CachePriority, InMemoryBackend, QueryOptions, SyncLayer,
//!     SyncLayerConfig,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let layer = SyncLayer::new(SyncLayerConfig::default());
//!     layer.start();
//!
//!     // Read through the cache
//!     let metrics = layer
//!         .get(
//!             query_key!["esg_metrics", "company-1"],
//!             fetcher(|| async { Ok(json!([{"scope": 1, "value": 12.5}])) }),
//!             QueryOptions::new(CachePriority::High),
//!         )
//!         .await
//!         .expect("Failed to fetch");
//!     println!("Metrics: {}", metrics);
//!
//!     // Auto-save a draft
//!     let backend = Arc::new(InMemoryBackend::new());
//!     let draft = layer.auto_save("report-2025", backend);
//!     draft.schedule_auto_save(json!({"title": "Annual report"}));
//!     draft.flush().await.expect("Failed to save");
//!
//!     layer.shutdown().await;
//! }
//! ```
//!
//! ## Configuration
//!
//! See [`SyncLayerConfig`] for all configuration options.
//!
//! ## Modules
//!
//! - [`coordinator`]: The [`SyncLayer`] owning the store and building components
//! - [`cache`]: Query store, invalidation seam and smart cache
//! - [`priority`]: Cache policy table
//! - [`realtime`]: Debounced change-feed multiplexer
//! - [`refresh`]: Polling and manual refresh
//! - [`autosave`]: Debounced draft auto-save
//! - [`storage`]: Backend seams and the in-memory backend
//! - [`resilience`]: Retry with backoff

pub mod autosave;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod debounce;
pub mod metrics;
pub mod notify;
pub mod priority;
pub mod query_key;
pub mod realtime;
pub mod refresh;
pub mod resilience;
pub mod storage;

pub use autosave::{content_hash, AutoSaveReconciler, DraftSaveState, SaveError, SaveOutcome, SaveStatus};
pub use cache::{
    fetcher, CacheEntry, CacheInvalidator, CacheStats, FetchError, Fetcher, InvalidateError, Lookup, QueryError,
    QueryOptions, QueryState, QueryStore, RelatedQuery, SmartCache, SmartQuery,
};
pub use config::{AutoSaveConfig, RealtimeConfig, RefreshConfig, SyncLayerConfig};
pub use coordinator::{LayerState, SyncLayer};
pub use debounce::Debouncer;
pub use notify::{CollectingNotifier, Notice, NoticeLevel, Notifier, TracingNotifier};
pub use priority::{retry_delay, CachePolicy, CachePriority};
pub use query_key::{KeySegment, QueryKey};
pub use realtime::{ChangeCallback, RealtimeMultiplexer, SubscribeError, SubscriptionConfig};
pub use refresh::{RefreshController, RefreshError, RefreshState};
pub use resilience::retry::{RetryConfig, RetryError};
pub use storage::{
    BackendError, ChangeChannel, ChangeEvent, ChangeFeed, ChangeKind, ColumnFilter, InMemoryBackend,
    RecordWriter,
};
pub use metrics::LatencyTimer;

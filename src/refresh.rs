// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Polling and manual refresh.
//!
//! The [`RefreshController`] invalidates a fixed set of keys on an interval,
//! independent of realtime events, and offers a user-triggered
//! [`RefreshController::refresh`]. A failed cycle produces a notice for the
//! user and the interval keeps ticking.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cache::invalidation::CacheInvalidator;
use crate::config::RefreshConfig;
use crate::notify::{Notice, Notifier};
use crate::query_key::QueryKey;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("{failed} of {total} queries could not be refreshed")]
    Invalidate { failed: usize, total: usize },
}

/// Observable refresh state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefreshState {
    pub is_refreshing: bool,
    /// Completion time of the last successful refresh.
    pub last_refresh: Option<Instant>,
}

struct RefreshInner {
    keys: Vec<QueryKey>,
    invalidator: Arc<dyn CacheInvalidator>,
    notifier: Arc<dyn Notifier>,
    state: watch::Sender<RefreshState>,
    in_flight: AtomicUsize,
}

/// Clears `is_refreshing` when the last concurrent refresh finishes, however
/// it finishes.
struct RefreshingGuard<'a> {
    inner: &'a RefreshInner,
}

impl<'a> RefreshingGuard<'a> {
    fn enter(inner: &'a RefreshInner) -> Self {
        inner.in_flight.fetch_add(1, Ordering::AcqRel);
        inner.state.send_modify(|s| s.is_refreshing = true);
        crate::metrics::set_refreshing(true);
        Self { inner }
    }
}

impl Drop for RefreshingGuard<'_> {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.state.send_modify(|s| s.is_refreshing = false);
            crate::metrics::set_refreshing(false);
        }
    }
}

impl RefreshInner {
    async fn run(&self, trigger: &'static str) -> Result<(), RefreshError> {
        let _refreshing = RefreshingGuard::enter(self);
        let total = self.keys.len();
        debug!(trigger, keys = total, "Refreshing");

        let failures = self.invalidator.invalidate_many(&self.keys).await;
        if failures.is_empty() {
            self.state.send_modify(|s| s.last_refresh = Some(Instant::now()));
            crate::metrics::record_refresh(trigger, "success");
            return Ok(());
        }

        for e in &failures {
            warn!(trigger, error = %e, "Refresh invalidation failed");
        }
        crate::metrics::record_refresh(trigger, "error");
        let err = RefreshError::Invalidate {
            failed: failures.len(),
            total,
        };
        self.notifier.notify(Notice::error("Refresh failed", err.to_string()));
        Err(err)
    }
}

pub struct RefreshController {
    config: RefreshConfig,
    inner: Arc<RefreshInner>,
    state_rx: watch::Receiver<RefreshState>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshController {
    pub fn new(
        config: RefreshConfig,
        keys: Vec<QueryKey>,
        invalidator: Arc<dyn CacheInvalidator>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(RefreshState::default());
        Self {
            config,
            inner: Arc::new(RefreshInner {
                keys,
                invalidator,
                notifier,
                state: state_tx,
                in_flight: AtomicUsize::new(0),
            }),
            state_rx,
            ticker: Mutex::new(None),
        }
    }

    /// Start the polling interval. The first tick is one interval from now.
    /// Returns `false` if polling is disabled or already running.
    pub fn start(&self) -> bool {
        let interval = self.config.interval;
        if interval.is_zero() {
            debug!("Refresh interval is zero, polling disabled");
            return false;
        }

        let mut ticker = self.ticker.lock();
        if ticker.as_ref().is_some_and(|t| !t.is_finished()) {
            return false;
        }

        let inner = self.inner.clone();
        *ticker = Some(tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + interval, interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                // Failures were already reported; keep polling.
                let _ = inner.run("interval").await;
            }
        }));
        info!(interval_ms = interval.as_millis() as u64, keys = self.inner.keys.len(), "Refresh polling started");
        true
    }

    pub fn stop(&self) {
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.abort();
            info!("Refresh polling stopped");
        }
    }

    /// User-initiated refresh of every configured key, in parallel.
    pub async fn refresh(&self) -> Result<(), RefreshError> {
        self.inner.run("manual").await
    }

    #[must_use]
    pub fn state(&self) -> RefreshState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.state().is_refreshing
    }

    #[must_use]
    pub fn last_refresh(&self) -> Option<Instant> {
        self.state().last_refresh
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<RefreshState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_polling(&self) -> bool {
        self.ticker.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    #[must_use]
    pub fn keys(&self) -> &[QueryKey] {
        &self.inner.keys
    }
}

impl Drop for RefreshController {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.get_mut().take() {
            ticker.abort();
        }
    }
}

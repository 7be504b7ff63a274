// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Realtime change subscriptions.
//!
//! A [`SubscriptionConfig`] declares interest in one table's change feed and
//! names the query key that feed keeps fresh. The [`RealtimeMultiplexer`]
//! opens one channel per config and turns bursts of change events into a
//! single debounced invalidation per `(table, query key)` pair.

pub mod multiplexer;

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::query_key::QueryKey;
use crate::storage::traits::{BackendError, ChangeEvent, ChangeKind, ColumnFilter};

pub use multiplexer::RealtimeMultiplexer;

/// Callback invoked with the last event of a debounced burst.
pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubscribeError {
    #[error("Failed to open change channel for table '{table}': {source}")]
    Open {
        table: String,
        #[source]
        source: BackendError,
    },

    #[error("Multiplexer is already subscribed; stop it before subscribing again")]
    AlreadyStarted,
}

/// Interest in one table's change feed.
#[derive(Clone)]
pub struct SubscriptionConfig {
    pub table: String,
    pub query_key: QueryKey,
    pub filter: Option<ColumnFilter>,
    pub enabled: bool,
    pub on_insert: Option<ChangeCallback>,
    pub on_update: Option<ChangeCallback>,
    pub on_delete: Option<ChangeCallback>,
}

impl SubscriptionConfig {
    pub fn new(table: impl Into<String>, query_key: QueryKey) -> Self {
        Self {
            table: table.into(),
            query_key,
            filter: None,
            enabled: true,
            on_insert: None,
            on_update: None,
            on_delete: None,
        }
    }

    #[must_use]
    pub fn filter(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter = Some(ColumnFilter::new(column, value));
        self
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn on_insert(mut self, f: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_insert = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_update(mut self, f: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_delete(mut self, f: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_delete = Some(Arc::new(f));
        self
    }

    /// Timer key: table name followed by the serialized query key.
    #[must_use]
    pub fn debounce_key(&self) -> String {
        format!("{}{}", self.table, self.query_key.serialize())
    }

    #[must_use]
    pub fn callback_for(&self, kind: ChangeKind) -> Option<&ChangeCallback> {
        match kind {
            ChangeKind::Insert => self.on_insert.as_ref(),
            ChangeKind::Update => self.on_update.as_ref(),
            ChangeKind::Delete => self.on_delete.as_ref(),
        }
    }
}

impl fmt::Debug for SubscriptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionConfig")
            .field("table", &self.table)
            .field("query_key", &self.query_key)
            .field("filter", &self.filter)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

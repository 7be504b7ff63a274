// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backend seams.
//!
//! The remote data backend is an opaque collaborator: something that can
//! write a record by id and emit row-level change events filtered by table
//! and, optionally, one column value. Reads go through caller-supplied
//! fetchers (see [`crate::cache::Fetcher`]), so no read trait lives here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("Change channel closed")]
    ChannelClosed,
    #[error("Backend error: {0}")]
    Other(String),
}

/// Kind of row-level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

/// `column = value` filter applied to a change channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnFilter {
    pub column: String,
    pub value: Value,
}

impl ColumnFilter {
    pub fn new(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Whether a row passes this filter. Deletes are matched on the old row.
    #[must_use]
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        let row = match event.kind {
            ChangeKind::Delete => event.old.as_ref(),
            _ => event.new.as_ref(),
        };
        row.and_then(|r| r.get(&self.column))
            .is_some_and(|v| v == &self.value)
    }
}

/// One row-level change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    /// Row after the change (absent for deletes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
    /// Row before the change (absent for inserts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    /// Commit timestamp (epoch millis)
    pub committed_at: i64,
}

impl ChangeEvent {
    pub fn insert(table: impl Into<String>, row: Value) -> Self {
        Self::build(table.into(), ChangeKind::Insert, Some(row), None)
    }

    pub fn update(table: impl Into<String>, old: Option<Value>, new: Value) -> Self {
        Self::build(table.into(), ChangeKind::Update, Some(new), old)
    }

    pub fn delete(table: impl Into<String>, old: Value) -> Self {
        Self::build(table.into(), ChangeKind::Delete, None, Some(old))
    }

    fn build(table: String, kind: ChangeKind, new: Option<Value>, old: Option<Value>) -> Self {
        Self {
            table,
            kind,
            new,
            old,
            committed_at: now_millis(),
        }
    }
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Identifier of an open change channel.
pub type ChannelId = u64;

/// An open change-feed channel: a stream of events until closed.
#[derive(Debug)]
pub struct ChangeChannel {
    pub id: ChannelId,
    pub events: mpsc::Receiver<ChangeEvent>,
}

/// Push subscription to row-level changes.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a channel receiving INSERT/UPDATE/DELETE events for `table`,
    /// narrowed by `filter` when given.
    async fn open_channel(
        &self,
        table: &str,
        filter: Option<&ColumnFilter>,
    ) -> Result<ChangeChannel, BackendError>;

    /// Close a channel. Closing an unknown or already closed id is a no-op.
    async fn close_channel(&self, id: ChannelId);
}

/// Write path for long-lived draft records.
#[async_trait]
pub trait RecordWriter: Send + Sync {
    async fn write(&self, record_id: &str, update: &Value) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matches_new_row() {
        let filter = ColumnFilter::new("company_id", "c-1");
        let hit = ChangeEvent::update("orders", None, json!({"company_id": "c-1"}));
        let miss = ChangeEvent::update("orders", None, json!({"company_id": "c-2"}));
        let absent = ChangeEvent::update("orders", None, json!({"other": 1}));

        assert!(filter.matches(&hit));
        assert!(!filter.matches(&miss));
        assert!(!filter.matches(&absent));
    }

    #[test]
    fn test_filter_matches_old_row_for_delete() {
        let filter = ColumnFilter::new("id", 5);
        let delete = ChangeEvent::delete("orders", json!({"id": 5}));
        assert!(filter.matches(&delete));
    }

    #[test]
    fn test_change_kind_wire_names() {
        assert_eq!(ChangeKind::Update.as_str(), "UPDATE");
        let json = serde_json::to_string(&ChangeEvent::insert("t", json!({}))).unwrap();
        assert!(json.contains("\"INSERT\""));
        assert!(!json.contains("\"old\""));
    }
}

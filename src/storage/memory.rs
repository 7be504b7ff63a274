// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process backend.
//!
//! [`InMemoryBackend`] implements both backend seams against local maps.
//! It keeps counters for open channels and write calls, and can inject
//! write latency and failures, which makes it the harness for timing and
//! teardown properties as well as a usable offline backend.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::SyncLayerConfig;

use super::traits::{
    BackendError, ChangeChannel, ChangeEvent, ChangeFeed, ChannelId, ColumnFilter, RecordWriter,
};

const DEFAULT_CHANNEL_BUFFER: usize = 256;

struct Subscriber {
    table: String,
    filter: Option<ColumnFilter>,
    tx: mpsc::Sender<ChangeEvent>,
}

pub struct InMemoryBackend {
    records: DashMap<String, Value>,
    channels: DashMap<ChannelId, Subscriber>,
    next_channel: AtomicU64,
    channels_opened: AtomicU64,
    write_calls: AtomicUsize,
    write_latency: Mutex<Duration>,
    write_failure: Mutex<Option<BackendError>>,
    open_failure: Mutex<Option<BackendError>>,
    buffer: usize,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_CHANNEL_BUFFER)
    }

    /// Backend whose channels buffer at most `buffer` undelivered events.
    #[must_use]
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            records: DashMap::new(),
            channels: DashMap::new(),
            next_channel: AtomicU64::new(1),
            channels_opened: AtomicU64::new(0),
            write_calls: AtomicUsize::new(0),
            write_latency: Mutex::new(Duration::ZERO),
            write_failure: Mutex::new(None),
            open_failure: Mutex::new(None),
            buffer: buffer.max(1),
        }
    }

    /// Backend sized by the layer's `channel_buffer`.
    #[must_use]
    pub fn from_config(config: &SyncLayerConfig) -> Self {
        Self::with_buffer(config.channel_buffer)
    }

    /// Push a change to every open channel whose table and filter match.
    /// Returns how many channels received it.
    pub fn emit(&self, event: ChangeEvent) -> usize {
        let mut delivered = 0;
        for entry in self.channels.iter() {
            let sub = entry.value();
            if sub.table != event.table {
                continue;
            }
            if let Some(ref filter) = sub.filter {
                if !filter.matches(&event) {
                    continue;
                }
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(channel = *entry.key(), error = %e, "Dropped change event"),
            }
        }
        delivered
    }

    /// Channels currently open.
    #[must_use]
    pub fn open_channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Channels opened over the backend's lifetime.
    #[must_use]
    pub fn channels_opened(&self) -> u64 {
        self.channels_opened.load(Ordering::Acquire)
    }

    /// Number of `write` calls, including failed ones.
    #[must_use]
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::Acquire)
    }

    /// Current stored content of a record.
    #[must_use]
    pub fn record(&self, record_id: &str) -> Option<Value> {
        self.records.get(record_id).map(|r| r.value().clone())
    }

    /// Seed a record without counting a write.
    pub fn insert_record(&self, record_id: impl Into<String>, content: Value) {
        self.records.insert(record_id.into(), content);
    }

    pub fn set_write_latency(&self, latency: Duration) {
        *self.write_latency.lock() = latency;
    }

    /// Make every subsequent write fail with `error` (`None` restores writes).
    pub fn fail_writes(&self, error: Option<BackendError>) {
        *self.write_failure.lock() = error;
    }

    /// Make every subsequent channel open fail with `error`.
    pub fn fail_opens(&self, error: Option<BackendError>) {
        *self.open_failure.lock() = error;
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeFeed for InMemoryBackend {
    async fn open_channel(
        &self,
        table: &str,
        filter: Option<&ColumnFilter>,
    ) -> Result<ChangeChannel, BackendError> {
        if let Some(err) = self.open_failure.lock().clone() {
            return Err(err);
        }

        let id = self.next_channel.fetch_add(1, Ordering::AcqRel);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.channels.insert(
            id,
            Subscriber {
                table: table.to_string(),
                filter: filter.cloned(),
                tx,
            },
        );
        self.channels_opened.fetch_add(1, Ordering::AcqRel);
        debug!(channel = id, table = %table, "Opened change channel");

        Ok(ChangeChannel { id, events: rx })
    }

    async fn close_channel(&self, id: ChannelId) {
        if self.channels.remove(&id).is_some() {
            debug!(channel = id, "Closed change channel");
        }
    }
}

#[async_trait]
impl RecordWriter for InMemoryBackend {
    async fn write(&self, record_id: &str, update: &Value) -> Result<(), BackendError> {
        self.write_calls.fetch_add(1, Ordering::AcqRel);

        let latency = *self.write_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if let Some(err) = self.write_failure.lock().clone() {
            return Err(err);
        }

        let mut record = self
            .records
            .entry(record_id.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        match (record.value_mut(), update) {
            (Value::Object(existing), Value::Object(fields)) => {
                for (k, v) in fields {
                    existing.insert(k.clone(), v.clone());
                }
            }
            (slot, other) => *slot = other.clone(),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_new_backend_is_empty() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.open_channel_count(), 0);
        assert_eq!(backend.write_calls(), 0);
        assert!(backend.record("r-1").is_none());
    }

    #[test]
    fn test_from_config_uses_channel_buffer() {
        let config = SyncLayerConfig {
            channel_buffer: 4,
            ..Default::default()
        };
        assert_eq!(InMemoryBackend::from_config(&config).buffer, 4);
    }

    #[tokio::test]
    async fn test_emit_respects_table_and_filter() {
        let backend = InMemoryBackend::new();
        let mut all_orders = backend.open_channel("orders", None).await.unwrap();
        let filter = ColumnFilter::new("company_id", "c-1");
        let mut company = backend.open_channel("orders", Some(&filter)).await.unwrap();
        let mut other = backend.open_channel("reports", None).await.unwrap();

        let delivered = backend.emit(ChangeEvent::insert("orders", json!({"company_id": "c-2"})));
        assert_eq!(delivered, 1);
        assert!(all_orders.events.try_recv().is_ok());
        assert!(company.events.try_recv().is_err());
        assert!(other.events.try_recv().is_err());

        let delivered = backend.emit(ChangeEvent::insert("orders", json!({"company_id": "c-1"})));
        assert_eq!(delivered, 2);
        assert!(company.events.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_close_channel_ends_stream() {
        let backend = InMemoryBackend::new();
        let mut channel = backend.open_channel("orders", None).await.unwrap();
        assert_eq!(backend.open_channel_count(), 1);

        backend.close_channel(channel.id).await;
        assert_eq!(backend.open_channel_count(), 0);
        assert!(channel.events.recv().await.is_none());

        // Closing twice is fine
        backend.close_channel(channel.id).await;
        assert_eq!(backend.channels_opened(), 1);
    }

    #[tokio::test]
    async fn test_write_merges_object_fields() {
        let backend = InMemoryBackend::new();
        backend.write("draft-1", &json!({"title": "A"})).await.unwrap();
        backend.write("draft-1", &json!({"body": "B"})).await.unwrap();

        assert_eq!(backend.record("draft-1"), Some(json!({"title": "A", "body": "B"})));
        assert_eq!(backend.write_calls(), 2);
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let backend = InMemoryBackend::new();
        backend.fail_writes(Some(BackendError::Unavailable("offline".into())));

        let err = backend.write("draft-1", &json!({"title": "A"})).await.unwrap_err();
        assert_eq!(err, BackendError::Unavailable("offline".into()));
        assert_eq!(backend.write_calls(), 1);
        assert!(backend.record("draft-1").is_none());

        backend.fail_writes(None);
        assert!(backend.write("draft-1", &json!({"title": "A"})).await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_open_failure() {
        let backend = InMemoryBackend::new();
        backend.fail_opens(Some(BackendError::Other("quota".into())));
        assert!(backend.open_channel("orders", None).await.is_err());
        assert_eq!(backend.open_channel_count(), 0);
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Debounced auto-save for a long-lived draft record.
//!
//! ```text
//!            schedule_auto_save / force_save
//!                        │
//!   ┌──────┐   write   ┌────────┐  ok   ┌───────┐  saved_display  ┌──────┐
//!   │ Idle │ ────────► │ Saving │ ────► │ Saved │ ──────────────► │ Idle │
//!   └──────┘           └────────┘       └───────┘                 └──────┘
//!       │                   │ err
//!       │ same hash         ▼
//!       └──► Saved      ┌───────┐  error_display  ┌──────┐
//!                       │ Error │ ──────────────► │ Idle │
//!                       └───────┘                 └──────┘
//! ```
//!
//! At most one write per record runs at a time. A save requested while one
//! is running is dropped, not queued; the next edit schedules another.

pub mod hash;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::AutoSaveConfig;
use crate::debounce::Debouncer;
use crate::notify::{Notice, Notifier};
use crate::storage::traits::{now_millis, BackendError, RecordWriter};

pub use hash::content_hash;

const SAVE_TIMER: &str = "save";
const STATUS_TIMER: &str = "status";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SaveError {
    #[error("Saving record {record_id} failed: {source}")]
    Write {
        record_id: String,
        #[source]
        source: BackendError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveStatus {
    #[default]
    Idle,
    Saving,
    Saved,
    Error,
}

impl fmt::Display for SaveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Saving => write!(f, "Saving"),
            Self::Saved => write!(f, "Saved"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// What a save request ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Content was written to the backend.
    Written,
    /// Content matched the last saved hash; nothing was written.
    Unchanged,
    /// Another save was in flight; this request was discarded.
    Dropped,
}

/// Save state of one draft record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DraftSaveState {
    pub record_id: String,
    pub last_saved_hash: Option<String>,
    pub is_saving: bool,
    pub status: SaveStatus,
    /// Epoch milliseconds of the last successful write.
    pub last_save_time: Option<i64>,
}

pub type ErrorCallback = Arc<dyn Fn(&SaveError) + Send + Sync>;

struct Inner {
    record_id: String,
    config: AutoSaveConfig,
    writer: Arc<dyn RecordWriter>,
    notifier: Arc<dyn Notifier>,
    on_error: Mutex<Option<ErrorCallback>>,
    state: watch::Sender<DraftSaveState>,
    saving: AtomicBool,
    pending: Mutex<Option<Value>>,
    timers: Debouncer<&'static str>,
}

/// Clears the in-flight flag when the save finishes, however it finishes.
struct SavingFlag<'a>(&'a AtomicBool);

impl Drop for SavingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Inner {
    async fn save(self: &Arc<Self>, update: Value) -> Result<SaveOutcome, SaveError> {
        if self.saving.swap(true, Ordering::AcqRel) {
            warn!(record_id = %self.record_id, "Save already in progress, dropping request");
            crate::metrics::record_autosave("dropped");
            return Ok(SaveOutcome::Dropped);
        }
        let _flag = SavingFlag(&self.saving);

        let hash = content_hash(&update);
        let unchanged = self.state.borrow().last_saved_hash.as_deref() == Some(hash.as_str());
        if unchanged {
            debug!(record_id = %self.record_id, "Content unchanged, skipping write");
            self.state.send_modify(|s| s.status = SaveStatus::Saved);
            self.reset_status_after(SaveStatus::Saved, self.config.saved_display);
            crate::metrics::record_autosave("unchanged");
            return Ok(SaveOutcome::Unchanged);
        }

        self.state.send_modify(|s| {
            s.status = SaveStatus::Saving;
            s.is_saving = true;
        });

        match self.writer.write(&self.record_id, &update).await {
            Ok(()) => {
                self.state.send_modify(|s| {
                    s.last_saved_hash = Some(hash);
                    s.last_save_time = Some(now_millis());
                    s.status = SaveStatus::Saved;
                    s.is_saving = false;
                });
                self.reset_status_after(SaveStatus::Saved, self.config.saved_display);
                crate::metrics::record_autosave("written");
                debug!(record_id = %self.record_id, "Draft saved");
                Ok(SaveOutcome::Written)
            }
            Err(source) => {
                let err = SaveError::Write {
                    record_id: self.record_id.clone(),
                    source,
                };
                warn!(error = %err, "Auto-save failed");
                self.state.send_modify(|s| {
                    s.status = SaveStatus::Error;
                    s.is_saving = false;
                });
                self.reset_status_after(SaveStatus::Error, self.config.error_display);
                crate::metrics::record_autosave("error");

                let callback = self.on_error.lock().clone();
                match callback {
                    Some(cb) => cb(&err),
                    None => self.notifier.notify(Notice::warning(
                        "Auto-save failed",
                        format!("{}. Your changes may be lost; save again to retry.", err),
                    )),
                }
                Err(err)
            }
        }
    }

    /// Return to Idle after `delay`, unless the status moved on meanwhile.
    fn reset_status_after(self: &Arc<Self>, status: SaveStatus, delay: Duration) {
        let weak: Weak<Inner> = Arc::downgrade(self);
        self.timers.schedule(STATUS_TIMER, delay, move || async move {
            if let Some(inner) = weak.upgrade() {
                inner.state.send_if_modified(|s| {
                    if s.status == status {
                        s.status = SaveStatus::Idle;
                        true
                    } else {
                        false
                    }
                });
            }
        });
    }

    fn take_pending(&self) -> Option<Value> {
        self.pending.lock().take()
    }
}

/// Shallow-merge object partials; anything else replaces.
fn merge(pending: Option<Value>, update: Value) -> Value {
    match (pending, update) {
        (Some(Value::Object(mut base)), Value::Object(fields)) => {
            base.extend(fields);
            Value::Object(base)
        }
        (_, update) => update,
    }
}

pub struct AutoSaveReconciler {
    inner: Arc<Inner>,
    state_rx: watch::Receiver<DraftSaveState>,
}

impl AutoSaveReconciler {
    pub fn new(
        record_id: impl Into<String>,
        config: AutoSaveConfig,
        writer: Arc<dyn RecordWriter>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let record_id = record_id.into();
        let (state_tx, state_rx) = watch::channel(DraftSaveState {
            record_id: record_id.clone(),
            ..Default::default()
        });
        Self {
            inner: Arc::new(Inner {
                record_id,
                config,
                writer,
                notifier,
                on_error: Mutex::new(None),
                state: state_tx,
                saving: AtomicBool::new(false),
                pending: Mutex::new(None),
                timers: Debouncer::new(),
            }),
            state_rx,
        }
    }

    /// Treat `content` as already saved, so saving it again is a no-op.
    #[must_use]
    pub fn with_saved_content(self, content: &Value) -> Self {
        let hash = content_hash(content);
        self.inner.state.send_modify(|s| s.last_saved_hash = Some(hash));
        self
    }

    /// Replace the default "changes may be lost" notice on write failure.
    #[must_use]
    pub fn with_on_error(self, callback: impl Fn(&SaveError) + Send + Sync + 'static) -> Self {
        *self.inner.on_error.lock() = Some(Arc::new(callback));
        self
    }

    /// Queue `partial` and (re)start the debounce timer. Partials queued in
    /// the same window are shallow-merged.
    pub fn schedule_auto_save(&self, partial: Value) {
        {
            let mut pending = self.inner.pending.lock();
            let merged = merge(pending.take(), partial);
            *pending = Some(merged);
        }

        let weak = Arc::downgrade(&self.inner);
        let restarted = self.inner.timers.schedule(SAVE_TIMER, self.inner.config.debounce, move || async move {
            let Some(inner) = weak.upgrade() else { return };
            if let Some(update) = inner.take_pending() {
                // Errors already reached the user through the notice path.
                let _ = inner.save(update).await;
            }
        });
        debug!(record_id = %self.inner.record_id, restarted, "Auto-save scheduled");
    }

    /// Save `update` now, bypassing the debounce.
    pub async fn save(&self, update: Value) -> Result<SaveOutcome, SaveError> {
        self.inner.save(update).await
    }

    /// Cancel the pending timer and save immediately, folding any queued
    /// edits in underneath `update`.
    pub async fn force_save(&self, update: Value) -> Result<SaveOutcome, SaveError> {
        self.inner.timers.cancel(&SAVE_TIMER);
        let update = merge(self.inner.take_pending(), update);
        info!(record_id = %self.inner.record_id, "Forcing save");
        self.inner.save(update).await
    }

    /// Flush queued edits, if any. Used when the editor goes away.
    pub async fn flush(&self) -> Result<Option<SaveOutcome>, SaveError> {
        self.inner.timers.cancel(&SAVE_TIMER);
        match self.inner.take_pending() {
            Some(update) => self.inner.save(update).await.map(Some),
            None => Ok(None),
        }
    }

    #[must_use]
    pub fn record_id(&self) -> &str {
        &self.inner.record_id
    }

    #[must_use]
    pub fn state(&self) -> DraftSaveState {
        self.state_rx.borrow().clone()
    }

    #[must_use]
    pub fn status(&self) -> SaveStatus {
        self.state_rx.borrow().status
    }

    #[must_use]
    pub fn last_save_time(&self) -> Option<i64> {
        self.state_rx.borrow().last_save_time
    }

    #[must_use]
    pub fn is_saving(&self) -> bool {
        self.inner.saving.load(Ordering::Acquire)
    }

    /// Whether edits are waiting on the debounce timer.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.inner.timers.is_pending(&SAVE_TIMER)
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<DraftSaveState> {
        self.state_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{CollectingNotifier, NoticeLevel};
    use crate::storage::memory::InMemoryBackend;
    use serde_json::json;
    use tokio::time::sleep;

    const DEBOUNCE: Duration = Duration::from_millis(2000);

    fn reconciler() -> (Arc<InMemoryBackend>, Arc<CollectingNotifier>, AutoSaveReconciler) {
        let backend = Arc::new(InMemoryBackend::new());
        let notifier = Arc::new(CollectingNotifier::new());
        let reconciler = AutoSaveReconciler::new(
            "report-1",
            AutoSaveConfig {
                debounce: DEBOUNCE,
                saved_display: Duration::from_millis(2000),
                error_display: Duration::from_millis(5000),
            },
            backend.clone(),
            notifier.clone(),
        );
        (backend, notifier, reconciler)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_edits_writes_once() {
        let (backend, _, reconciler) = reconciler();
        reconciler.schedule_auto_save(json!({"title": "Draft"}));
        sleep(Duration::from_millis(500)).await;
        reconciler.schedule_auto_save(json!({"summary": "Scope 1 down 4%"}));
        assert!(reconciler.has_pending());

        sleep(Duration::from_millis(1999)).await;
        assert_eq!(backend.write_calls(), 0);

        sleep(Duration::from_millis(2)).await;
        assert_eq!(backend.write_calls(), 1);
        assert_eq!(
            backend.record("report-1"),
            Some(json!({"title": "Draft", "summary": "Scope 1 down 4%"}))
        );
        assert_eq!(reconciler.status(), SaveStatus::Saved);
        assert!(reconciler.last_save_time().is_some());
        assert!(!reconciler.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_schedules_skip_write() {
        let (backend, _, reconciler) = reconciler();
        let reconciler = reconciler.with_saved_content(&json!({"title": "A"}));

        reconciler.schedule_auto_save(json!({"title": "A"}));
        reconciler.schedule_auto_save(json!({"title": "A"}));
        sleep(DEBOUNCE + Duration::from_millis(1)).await;

        assert_eq!(backend.write_calls(), 0);
        assert_eq!(reconciler.status(), SaveStatus::Saved);
        assert!(reconciler.last_save_time().is_none());
    }

    #[tokio::test]
    async fn test_saving_last_saved_content_is_noop() {
        let (backend, _, reconciler) = reconciler();
        assert_eq!(reconciler.save(json!({"title": "A"})).await, Ok(SaveOutcome::Written));
        assert_eq!(reconciler.save(json!({"title": "A"})).await, Ok(SaveOutcome::Unchanged));
        assert_eq!(reconciler.status(), SaveStatus::Saved);
        assert_eq!(backend.write_calls(), 1);

        assert_eq!(reconciler.save(json!({"title": "B"})).await, Ok(SaveOutcome::Written));
        assert_eq!(backend.write_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_goes_to_error_then_idle() {
        let (backend, notifier, reconciler) = reconciler();
        backend.set_write_latency(Duration::from_millis(100));
        backend.fail_writes(Some(BackendError::Rejected {
            status: 409,
            message: "conflict".into(),
        }));

        reconciler.schedule_auto_save(json!({"title": "A"}));
        assert_eq!(reconciler.status(), SaveStatus::Idle);

        sleep(DEBOUNCE + Duration::from_millis(50)).await;
        assert_eq!(reconciler.status(), SaveStatus::Saving);
        assert!(reconciler.state().is_saving);

        sleep(Duration::from_millis(60)).await;
        assert_eq!(reconciler.status(), SaveStatus::Error);
        assert!(!reconciler.is_saving());

        // Error shown from t=2100 until t=7100
        sleep(Duration::from_millis(4980)).await;
        assert_eq!(reconciler.status(), SaveStatus::Error);
        sleep(Duration::from_millis(20)).await;
        assert_eq!(reconciler.status(), SaveStatus::Idle);

        // No retry of its own
        sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.write_calls(), 1);

        let notices = notifier.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].level, NoticeLevel::Warning);
        assert!(notices[0].message.contains("may be lost"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_saved_returns_to_idle() {
        let (_, _, reconciler) = reconciler();
        reconciler.save(json!({"title": "A"})).await.unwrap();
        assert_eq!(reconciler.status(), SaveStatus::Saved);

        sleep(Duration::from_millis(2001)).await;
        assert_eq!(reconciler.status(), SaveStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_save_is_dropped() {
        let (backend, _, reconciler) = reconciler();
        backend.set_write_latency(Duration::from_millis(500));
        let reconciler = Arc::new(reconciler);

        let r = reconciler.clone();
        let first = tokio::spawn(async move { r.force_save(json!({"title": "A"})).await });
        sleep(Duration::from_millis(100)).await;
        assert!(reconciler.is_saving());

        assert_eq!(reconciler.save(json!({"title": "B"})).await, Ok(SaveOutcome::Dropped));
        assert_eq!(first.await.unwrap(), Ok(SaveOutcome::Written));
        assert_eq!(backend.write_calls(), 1);
        assert_eq!(backend.record("report-1"), Some(json!({"title": "A"})));
        assert!(!reconciler.is_saving());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_save_cancels_timer_and_keeps_edits() {
        let (backend, _, reconciler) = reconciler();
        reconciler.schedule_auto_save(json!({"title": "A", "body": "draft"}));

        let outcome = reconciler.force_save(json!({"title": "B"})).await.unwrap();
        assert_eq!(outcome, SaveOutcome::Written);
        assert!(!reconciler.has_pending());
        assert_eq!(backend.record("report-1"), Some(json!({"title": "B", "body": "draft"})));

        sleep(DEBOUNCE * 2).await;
        assert_eq!(backend.write_calls(), 1);
    }

    #[tokio::test]
    async fn test_error_callback_replaces_notice() {
        let (backend, notifier, reconciler) = reconciler();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let reconciler = reconciler.with_on_error(move |e| s.lock().push(e.to_string()));
        backend.fail_writes(Some(BackendError::Unavailable("offline".into())));

        let err = reconciler.save(json!({"title": "A"})).await.unwrap_err();
        assert!(matches!(err, SaveError::Write { ref record_id, .. } if record_id == "report-1"));
        assert_eq!(seen.lock().len(), 1);
        assert!(notifier.is_empty());
        // Failed content is not remembered as saved
        backend.fail_writes(None);
        assert_eq!(reconciler.save(json!({"title": "A"})).await, Ok(SaveOutcome::Written));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_and_drop() {
        let (backend, _, reconciler) = reconciler();
        assert_eq!(reconciler.flush().await, Ok(None));

        reconciler.schedule_auto_save(json!({"title": "A"}));
        assert_eq!(reconciler.flush().await, Ok(Some(SaveOutcome::Written)));

        reconciler.schedule_auto_save(json!({"title": "B"}));
        drop(reconciler);
        sleep(DEBOUNCE * 2).await;
        assert_eq!(backend.write_calls(), 1);
    }

    #[test]
    fn test_merge() {
        assert_eq!(merge(None, json!({"a": 1})), json!({"a": 1}));
        assert_eq!(merge(Some(json!({"a": 1, "b": 1})), json!({"b": 2})), json!({"a": 1, "b": 2}));
        assert_eq!(merge(Some(json!({"a": 1})), json!("text")), json!("text"));
    }
}

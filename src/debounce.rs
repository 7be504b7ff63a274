// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-key debounce timers.
//!
//! A [`Debouncer`] owns at most one pending timer per key. Scheduling a key
//! that already has a timer cancels the old one and starts a fresh one, so
//! a burst of triggers collapses into a single action after the burst goes
//! quiet.
//!
//! ```text
//! schedule(k) ──► Pending(k) ──(delay elapses)──► action runs ──► Idle
//!                    │  ▲
//!                    └──┘ schedule(k) again: cancel + restart
//! ```
//!
//! Once a timer fires it removes its own record before running the action,
//! so an action that is already running is never aborted by a later
//! `schedule` or `cancel`.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

struct PendingDebounce {
    generation: u64,
    handle: JoinHandle<()>,
    scheduled_at: Instant,
}

/// Map from key to its single cancellable scheduled task.
pub struct Debouncer<K> {
    pending: Arc<Mutex<HashMap<K, PendingDebounce>>>,
    next_generation: AtomicU64,
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Run `action` after `delay` unless `key` is rescheduled or cancelled
    /// first. Returns `true` when an earlier pending timer was replaced.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F, Fut>(&self, key: K, delay: Duration, action: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let registry = self.pending.clone();
        let task_key = key.clone();

        // Hold the lock across spawn + insert so the task cannot look itself
        // up before it is registered.
        let mut pending = self.pending.lock();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            {
                let mut pending = registry.lock();
                match pending.get(&task_key) {
                    Some(p) if p.generation == generation => {
                        pending.remove(&task_key);
                    }
                    _ => return,
                }
            }
            action().await;
        });

        let previous = pending.insert(
            key,
            PendingDebounce {
                generation,
                handle,
                scheduled_at: Instant::now(),
            },
        );
        match previous {
            Some(old) => {
                old.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel the pending timer for `key`. Returns whether one existed.
    pub fn cancel(&self, key: &K) -> bool {
        match self.pending.lock().remove(key) {
            Some(old) => {
                old.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending timer. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingDebounce> = self.pending.lock().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for p in drained {
            p.handle.abort();
        }
        count
    }

    #[must_use]
    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.lock().contains_key(key)
    }

    /// When the current timer for `key` was (re)started.
    #[must_use]
    pub fn scheduled_at(&self, key: &K) -> Option<Instant> {
        self.pending.lock().get(key).map(|p| p.scheduled_at)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl<K> Default for Debouncer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Drop for Debouncer<K> {
    fn drop(&mut self) {
        for (_, p) in self.pending.lock().drain() {
            p.handle.abort();
        }
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache invalidation seam.
//!
//! The realtime multiplexer and the refresh controller never touch the
//! store directly; they invalidate through a [`CacheInvalidator`]. The
//! [`crate::QueryStore`] only marks entries stale, while
//! [`crate::SmartCache`] additionally refetches keys that are being
//! observed, which is where invalidation can fail.

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;

use crate::cache::smart::QueryError;
use crate::query_key::QueryKey;

#[derive(Error, Debug, Clone)]
pub enum InvalidateError {
    #[error("Refetch after invalidating {key} failed: {source}")]
    Refetch {
        key: QueryKey,
        #[source]
        source: QueryError,
    },
}

/// Something that can mark cached data for a key as outdated.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn invalidate(&self, key: &QueryKey) -> Result<(), InvalidateError>;

    /// Invalidate several keys concurrently, returning every failure.
    async fn invalidate_many(&self, keys: &[QueryKey]) -> Vec<InvalidateError> {
        join_all(keys.iter().map(|k| self.invalidate(k)))
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Invalidator that records calls, for component tests.

    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    #[derive(Default)]
    pub struct RecordingInvalidator {
        pub calls: Mutex<Vec<(QueryKey, Instant)>>,
        pub fail: Mutex<bool>,
    }

    impl RecordingInvalidator {
        pub fn keys(&self) -> Vec<QueryKey> {
            self.calls.lock().iter().map(|(k, _)| k.clone()).collect()
        }

        pub fn count(&self) -> usize {
            self.calls.lock().len()
        }

        /// Time of each invalidation relative to `origin`.
        pub fn offsets(&self, origin: Instant) -> Vec<Duration> {
            self.calls.lock().iter().map(|(_, at)| *at - origin).collect()
        }
    }

    #[async_trait]
    impl CacheInvalidator for RecordingInvalidator {
        async fn invalidate(&self, key: &QueryKey) -> Result<(), InvalidateError> {
            self.calls.lock().push((key.clone(), Instant::now()));
            if *self.fail.lock() {
                return Err(InvalidateError::Refetch {
                    key: key.clone(),
                    source: QueryError::Exhausted {
                        key: key.clone(),
                        attempts: 1,
                        source: crate::storage::BackendError::Unavailable("test".into()),
                    },
                });
            }
            Ok(())
        }
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Remote fetches are retried according to their cache tier: the tier fixes
//! how many retries are allowed, and every retry waits
//! `min(1000 * 2^n, 30000)` ms. On top of the per-attempt ceiling an optional
//! overall budget bounds the total time spent retrying one operation.
//!
//! # Example
//!
//! ```
//! use query_sync::{CachePriority, RetryConfig};
//! use std::time::Duration;
//!
//! let high = RetryConfig::for_policy(&CachePriority::High.policy());
//! assert_eq!(high.max_retries, 3);
//! assert_eq!(high.initial_delay, Duration::from_secs(1));
//!
//! let once = RetryConfig::none();
//! assert_eq!(once.max_retries, 0);
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::priority::{CachePolicy, RETRY_BASE_DELAY_MS, RETRY_MAX_DELAY_MS};

/// Configuration for operation retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Retries after the first attempt; total attempts is `max_retries + 1`.
    pub max_retries: u32,
    /// Upper bound on total time spent across all attempts and waits.
    pub budget: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryConfig {
    /// Tier-driven backoff: 1s doubling, capped at 30s per wait.
    #[must_use]
    pub fn for_policy(policy: &CachePolicy) -> Self {
        Self {
            initial_delay: Duration::from_millis(RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(RETRY_MAX_DELAY_MS),
            factor: 2.0,
            max_retries: policy.max_retries,
            budget: None,
        }
    }

    /// Single attempt, no retries. Used for opportunistic prefetches.
    #[must_use]
    pub fn none() -> Self {
        Self {
            initial_delay: Duration::from_millis(RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(RETRY_MAX_DELAY_MS),
            factor: 2.0,
            max_retries: 0,
            budget: None,
        }
    }

    /// Wait before retry `attempt` (0-indexed):
    /// `min(initial_delay * factor^attempt, max_delay)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        Duration::try_from_secs_f64(secs).map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Bound the total retry time. `None` leaves it unbounded.
    #[must_use]
    pub fn with_budget(mut self, budget: Option<Duration>) -> Self {
        self.budget = budget;
        self
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            max_retries: 3,
            budget: None,
        }
    }
}

/// Why a retried operation gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },

    #[error("retry budget exceeded after {attempts} attempts ({elapsed:?}): {source}")]
    BudgetExceeded {
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E> {
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::BudgetExceeded { attempts, .. } => *attempts,
        }
    }

    /// The last error the operation returned.
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { source, .. } | Self::BudgetExceeded { source, .. } => source,
        }
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let started = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;
                crate::metrics::record_fetch_attempt("error");

                if attempts > config.max_retries {
                    return Err(RetryError::Exhausted { attempts, source: err });
                }
                let delay = config.delay_for(attempts - 1);

                if let Some(budget) = config.budget {
                    let elapsed = started.elapsed();
                    if elapsed + delay > budget {
                        warn!(
                            "Operation '{}' abandoned after {} attempts: next wait {:?} would exceed budget {:?}",
                            operation_name, attempts, delay, budget
                        );
                        return Err(RetryError::BudgetExceeded { attempts, elapsed, source: err });
                    }
                }

                warn!(
                    "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name, attempts, config.max_retries + 1, err, delay
                );
                crate::metrics::record_retry(operation_name);

                sleep(delay).await;
            }
        }
    }
}

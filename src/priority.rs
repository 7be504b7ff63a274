// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache priority tiers.
//!
//! Every cached query carries a [`CachePriority`]. The tier decides how long
//! data stays fresh, how long an unobserved entry survives before garbage
//! collection, and how many times a failing fetch is retried.
//!
//! | priority | stale time | gc time | max retries |
//! |----------|------------|---------|-------------|
//! | High     | 5 min      | 30 min  | 3           |
//! | Medium   | 10 min     | 20 min  | 2           |
//! | Low      | 15 min     | 10 min  | 1           |
//!
//! # Example
//!
//! ```
//! use query_sync::{CachePriority, retry_delay};
//! use std::time::Duration;
//!
//! let policy = CachePriority::High.policy();
//! assert_eq!(policy.stale_time, Duration::from_secs(5 * 60));
//! assert_eq!(policy.max_retries, 3);
//!
//! assert_eq!(retry_delay(0), Duration::from_millis(1000));
//! assert_eq!(retry_delay(10), Duration::from_millis(30_000));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resilience::retry::RetryConfig;

/// Base delay for the first retry.
pub const RETRY_BASE_DELAY_MS: u64 = 1_000;

/// Ceiling for any single retry delay.
pub const RETRY_MAX_DELAY_MS: u64 = 30_000;

const MINUTE: u64 = 60;

/// Priority tier of a cached query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePriority {
    High,
    #[default]
    Medium,
    Low,
}

impl CachePriority {
    /// Tier defaults from the policy table.
    #[must_use]
    pub const fn policy(self) -> CachePolicy {
        match self {
            Self::High => CachePolicy {
                stale_time: Duration::from_secs(5 * MINUTE),
                gc_time: Duration::from_secs(30 * MINUTE),
                max_retries: 3,
            },
            Self::Medium => CachePolicy {
                stale_time: Duration::from_secs(10 * MINUTE),
                gc_time: Duration::from_secs(20 * MINUTE),
                max_retries: 2,
            },
            Self::Low => CachePolicy {
                stale_time: Duration::from_secs(15 * MINUTE),
                gc_time: Duration::from_secs(10 * MINUTE),
                max_retries: 1,
            },
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    /// All tiers, highest first.
    pub const ALL: [CachePriority; 3] = [Self::High, Self::Medium, Self::Low];
}

impl std::fmt::Display for CachePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved freshness, retention and retry settings for one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// Data older than this is stale.
    pub stale_time: Duration,
    /// Unobserved entries older than this may be evicted.
    pub gc_time: Duration,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
}

impl CachePolicy {
    /// Tier defaults with optional per-call overrides applied on top.
    #[must_use]
    pub fn resolve(
        priority: CachePriority,
        stale_time: Option<Duration>,
        gc_time: Option<Duration>,
    ) -> Self {
        let tier = priority.policy();
        Self {
            stale_time: stale_time.unwrap_or(tier.stale_time),
            gc_time: gc_time.unwrap_or(tier.gc_time),
            max_retries: tier.max_retries,
        }
    }

    /// Whether data this old is still within its freshness window.
    #[must_use]
    pub fn is_fresh(&self, age: Duration) -> bool {
        age < self.stale_time
    }

    /// Whether this policy could evict data that is still fresh.
    ///
    /// True for the Low tier as tabled: its gc window is shorter than its
    /// stale window.
    #[must_use]
    pub fn evicts_before_stale(&self) -> bool {
        self.gc_time < self.stale_time
    }
}

/// Delay before retry `attempt` (0-indexed): `min(1000 * 2^attempt, 30000)` ms.
///
/// The tier backoff curve; [`RetryConfig::delay_for`] computes it.
#[must_use]
pub fn retry_delay(attempt: u32) -> Duration {
    RetryConfig::none().delay_for(attempt)
}

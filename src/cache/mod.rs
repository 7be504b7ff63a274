// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query cache: the shared store, the invalidation seam and the smart
//! read-through wrapper on top of both.

pub mod invalidation;
pub mod smart;
pub mod store;

pub use invalidation::{CacheInvalidator, InvalidateError};
pub use smart::{
    fetcher, FetchError, Fetcher, QueryError, QueryOptions, QueryState, RelatedQuery, SmartCache, SmartQuery,
};
pub use store::{CacheEntry, CacheStats, Lookup, QueryStore};

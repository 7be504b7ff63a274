// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query keys.
//!
//! A [`QueryKey`] is an ordered tuple of primitive segments naming one
//! logical remote resource, e.g. `["orders", 5]`. Keys are the join point
//! between cache entries, realtime subscriptions and invalidation requests.
//!
//! Two keys are equal iff their canonical serialized form is equal, so
//! `["orders", 5]` and `["orders", "5"]` are different keys.
//!
//! # Example
//!
//! ```
//! use query_sync::QueryKey;
//!
//! let key = QueryKey::new("orders").with(5);
//! assert_eq!(key.serialize(), r#"["orders",5]"#);
//! assert_eq!(key.table(), Some("orders"));
//! assert!(key.starts_with(&QueryKey::new("orders")));
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// One segment of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySegment {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<&str> for KeySegment {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for KeySegment {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for KeySegment {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<i32> for KeySegment {
    fn from(n: i32) -> Self {
        Self::Int(i64::from(n))
    }
}

impl From<u32> for KeySegment {
    fn from(n: u32) -> Self {
        Self::Int(i64::from(n))
    }
}

impl From<f64> for KeySegment {
    fn from(n: f64) -> Self {
        Self::Float(n)
    }
}

impl From<bool> for KeySegment {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl<T: Into<KeySegment>> From<Option<T>> for KeySegment {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Stable identifier for one logical remote resource.
///
/// Equality and hashing go through the canonical serialized form, which is
/// computed once at construction.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "Vec<KeySegment>", into = "Vec<KeySegment>")]
pub struct QueryKey {
    segments: Vec<KeySegment>,
    serialized: String,
}

impl QueryKey {
    /// Start a key from its first segment (usually the table name).
    pub fn new(first: impl Into<KeySegment>) -> Self {
        Self::from_segments(vec![first.into()])
    }

    /// Build a key from a list of segments.
    pub fn from_segments(segments: Vec<KeySegment>) -> Self {
        let serialized = canonical(&segments);
        Self { segments, serialized }
    }

    /// Append a segment, returning the extended key.
    #[must_use]
    pub fn with(mut self, segment: impl Into<KeySegment>) -> Self {
        self.segments.push(segment.into());
        self.serialized = canonical(&self.segments);
        self
    }

    #[must_use]
    pub fn segments(&self) -> &[KeySegment] {
        &self.segments
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Canonical serialized form (compact JSON array).
    #[must_use]
    pub fn serialize(&self) -> &str {
        &self.serialized
    }

    /// First segment when it is a string; by convention the table name.
    #[must_use]
    pub fn table(&self) -> Option<&str> {
        match self.segments.first() {
            Some(KeySegment::Str(s)) => Some(s),
            _ => None,
        }
    }

    /// True when `prefix`'s segments are a leading slice of this key's.
    #[must_use]
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        prefix.segments.len() <= self.segments.len()
            && prefix
                .segments
                .iter()
                .zip(&self.segments)
                .all(|(a, b)| canonical_segment(a) == canonical_segment(b))
    }
}

fn canonical(segments: &[KeySegment]) -> String {
    serde_json::to_string(segments).unwrap_or_else(|_| {
        // Only non-finite floats fail to serialize; fall back to Debug so the
        // key stays deterministic.
        format!("{:?}", segments)
    })
}

fn canonical_segment(segment: &KeySegment) -> String {
    serde_json::to_string(segment).unwrap_or_else(|_| format!("{:?}", segment))
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.serialized == other.serialized
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.serialized.hash(state);
    }
}

impl From<Vec<KeySegment>> for QueryKey {
    fn from(segments: Vec<KeySegment>) -> Self {
        Self::from_segments(segments)
    }
}

impl From<QueryKey> for Vec<KeySegment> {
    fn from(key: QueryKey) -> Self {
        key.segments
    }
}

impl From<&str> for QueryKey {
    fn from(table: &str) -> Self {
        Self::new(table)
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKey({})", self.serialized)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialized)
    }
}

/// Build a [`QueryKey`] from a list of segment expressions.
///
/// ```
/// use query_sync::query_key;
///
/// let key = query_key!["reports", 2024, "draft"];
/// assert_eq!(key.serialize(), r#"["reports",2024,"draft"]"#);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($seg:expr),+ $(,)?) => {
        $crate::QueryKey::from_segments(vec![$($crate::KeySegment::from($seg)),+])
    };
}

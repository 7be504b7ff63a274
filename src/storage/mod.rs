// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backend seams and the in-process backend.

pub mod memory;
pub mod traits;

pub use memory::InMemoryBackend;
pub use traits::{
    BackendError, ChangeChannel, ChangeEvent, ChangeFeed, ChangeKind, ChannelId, ColumnFilter,
    RecordWriter,
};

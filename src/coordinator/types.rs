// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the sync layer coordinator.

/// Layer lifecycle state.
///
/// Use [`super::SyncLayer::state()`] to check the current state or
/// [`super::SyncLayer::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerState {
    /// Just created, background tasks not running
    Created,
    /// GC loop running, components can be built and used
    Running,
    /// Shutdown in progress
    ShuttingDown,
    /// Background tasks stopped and the store cleared
    Stopped,
}

impl std::fmt::Display for LayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

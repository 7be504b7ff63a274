// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! User-visible notifications.
//!
//! Refresh failures and auto-save errors need to reach the user as a
//! transient message. The host decides how to present them by supplying a
//! [`Notifier`]; the crate only produces [`Notice`] values.

use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// A toast-equivalent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub message: String,
}

impl Notice {
    pub fn new(level: NoticeLevel, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            message: message.into(),
        }
    }

    pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Warning, title, message)
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Error, title, message)
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.title, self.message)
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Writes notices to the log. The default when the host supplies nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Info | NoticeLevel::Success => {
                info!(title = %notice.title, "{}", notice.message)
            }
            NoticeLevel::Warning => warn!(title = %notice.title, "{}", notice.message),
            NoticeLevel::Error => error!(title = %notice.title, "{}", notice.message),
        }
    }
}

/// Keeps every notice in memory, for hosts that poll for messages to show.
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl CollectingNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().clone()
    }

    /// Take and clear the collected notices.
    pub fn drain(&self) -> Vec<Notice> {
        std::mem::take(&mut *self.notices.lock())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.notices.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.notices.lock().is_empty()
    }
}

impl Notifier for CollectingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices.lock().push(notice);
    }
}

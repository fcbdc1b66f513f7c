//! User-facing notices.
//!
//! The sync core never renders anything itself. It publishes `Notice`
//! values on a broadcast channel and the host decides how to show them
//! (toast, status line, log). Every notice is also written to the log.

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::ErrorCode;

const NOTICE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    /// Operation the notice is about, e.g. `"update"`.
    pub action: &'static str,
    pub message: String,
    /// Stable error code when the notice reports a failure.
    pub code: Option<&'static str>,
}

#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notice>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTICE_CAPACITY);
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    pub fn info(&self, action: &'static str, message: impl Into<String>) {
        let message = message.into();
        info!(action, %message, "notice");
        self.publish(Notice { level: NoticeLevel::Info, action, message, code: None });
    }

    pub fn error(&self, action: &'static str, message: impl Into<String>) {
        let message = message.into();
        warn!(action, %message, "notice");
        self.publish(Notice { level: NoticeLevel::Error, action, message, code: None });
    }

    /// Publish an error notice carrying the failure's stable code.
    pub fn error_from(&self, action: &'static str, summary: &str, err: &dyn ErrorCode) {
        let code = err.error_code();
        let message = format!("{summary}: {err}");
        warn!(action, code, %message, "notice");
        self.publish(Notice { level: NoticeLevel::Error, action, message, code: Some(code) });
    }

    fn publish(&self, notice: Notice) {
        if self.tx.send(notice).is_err() {
            debug!("notice dropped: no subscribers");
        }
    }
}

#[cfg(test)]
#[path = "notice_test.rs"]
mod tests;

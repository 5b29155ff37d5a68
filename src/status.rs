//! Operator status notifications.
//!
//! Free-text messages for whatever surface the operator is looking at (the interactive
//! console, a status bar). Every message is also emitted as a `tracing` event, so log
//! files carry the same history.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Severity of a status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatusLevel {
    /// Normal progress
    Info,
    /// Degraded but usable
    Warning,
    /// An operation failed
    Error,
}

/// One notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusMessage {
    /// Severity
    pub level: StatusLevel,
    /// Message text
    pub text: String,
    /// When it was posted
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.level {
            StatusLevel::Info => write!(f, "{}", self.text),
            StatusLevel::Warning => write!(f, "warning: {}", self.text),
            StatusLevel::Error => write!(f, "error: {}", self.text),
        }
    }
}

/// Broadcast hub for status messages. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StatusBoard {
    sender: broadcast::Sender<StatusMessage>,
}

impl StatusBoard {
    /// Board keeping up to `capacity` unread messages per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive messages posted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<StatusMessage> {
        self.sender.subscribe()
    }

    /// Post a message at `level`
    pub fn post(&self, level: StatusLevel, text: impl Into<String>) {
        let text = text.into();
        match level {
            StatusLevel::Info => info!(target: "status", "{text}"),
            StatusLevel::Warning => warn!(target: "status", "{text}"),
            StatusLevel::Error => error!(target: "status", "{text}"),
        }
        // No subscribers is not an error
        let _ = self.sender.send(StatusMessage {
            level,
            text,
            timestamp: Utc::now(),
        });
    }

    /// Post an informational message
    pub fn info(&self, text: impl Into<String>) {
        self.post(StatusLevel::Info, text);
    }

    /// Post a warning
    pub fn warn(&self, text: impl Into<String>) {
        self.post(StatusLevel::Warning, text);
    }

    /// Post an error
    pub fn error(&self, text: impl Into<String>) {
        self.post(StatusLevel::Error, text);
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_posts_in_order() {
        let board = StatusBoard::default();
        let mut rx = board.subscribe();

        board.info("Moved HOME to: 0");
        board.warn("rotator-only mode");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.level, StatusLevel::Info);
        assert_eq!(first.to_string(), "Moved HOME to: 0");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.to_string(), "warning: rotator-only mode");
    }

    #[test]
    fn posting_without_subscribers_is_fine() {
        StatusBoard::new(0).error("nobody is listening");
    }
}

//! Progress Sink
//!
//! User-visible progress of an operation. Kept apart from the diagnostic
//! `log` output so tests can inspect exactly what a user would see.

use std::fmt;
use std::sync::Mutex;

use log::Level;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Debug,
    Info,
    Warning,
    Error,
}

impl MessageKind {
    fn level(self) -> Level {
        match self {
            MessageKind::Debug => Level::Debug,
            MessageKind::Info => Level::Info,
            MessageKind::Warning => Level::Warn,
            MessageKind::Error => Level::Error,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MessageKind::Debug => "DEBUG",
            MessageKind::Info => "INFO",
            MessageKind::Warning => "WARNING",
            MessageKind::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

/// Receives progress messages for operations.
pub trait ProgressSink: Send + Sync {
    fn record(&self, process_id: &str, kind: MessageKind, text: &str);
}

/// Forwards progress to the `log` facade under the `progress` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgressSink;

impl ProgressSink for LogProgressSink {
    fn record(&self, process_id: &str, kind: MessageKind, text: &str) {
        log::log!(target: "progress", kind.level(), "[{}] {}", process_id, text);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressMessage {
    pub process_id: String,
    pub kind: MessageKind,
    pub text: String,
}

/// Keeps every message in memory.
#[derive(Debug, Default)]
pub struct CapturingSink {
    messages: Mutex<Vec<ProgressMessage>>,
}

impl CapturingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<ProgressMessage> {
        match self.messages.lock() {
            Ok(messages) => messages.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// True if some message of `kind` contains `fragment`.
    pub fn contains(&self, kind: MessageKind, fragment: &str) -> bool {
        self.messages()
            .iter()
            .any(|message| message.kind == kind && message.text.contains(fragment))
    }
}

impl ProgressSink for CapturingSink {
    fn record(&self, process_id: &str, kind: MessageKind, text: &str) {
        let message = ProgressMessage {
            process_id: process_id.to_string(),
            kind,
            text: text.to_string(),
        };
        match self.messages.lock() {
            Ok(mut messages) => messages.push(message),
            Err(poisoned) => poisoned.into_inner().push(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capturing_sink_records_in_order() {
        let sink = CapturingSink::new();
        sink.record("p1", MessageKind::Info, "Uploading application \"web\"...");
        sink.record("p1", MessageKind::Error, "Upload failed");

        let messages = sink.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].kind, MessageKind::Info);
        assert!(sink.contains(MessageKind::Error, "failed"));
        assert!(!sink.contains(MessageKind::Warning, "failed"));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(MessageKind::Warning.to_string(), "WARNING");
        assert_eq!(MessageKind::Error.level(), Level::Error);
    }
}

//! Session Log
//!
//! Append-only diagnostic trace of the session. The in-memory copy is a
//! bounded ring; every entry is also streamed to the presentation feed so a
//! consumer can keep the full history if it wants to.

use crate::domain::models::{AppEvent, MessageSeverity};
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::mpsc;

pub const DEFAULT_LOG_CAPACITY: usize = 500;

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub seq: u64,
    pub timestamp: DateTime<Local>,
    pub severity: MessageSeverity,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.timestamp.format("%H:%M:%S%.3f"), self.message)
    }
}

pub struct SessionLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    next_seq: u64,
    dropped: u64,
    feed: Option<mpsc::UnboundedSender<AppEvent>>,
}

impl SessionLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_LOG_CAPACITY)),
            capacity,
            next_seq: 0,
            dropped: 0,
            feed: None,
        }
    }

    pub fn with_feed(mut self, feed: mpsc::UnboundedSender<AppEvent>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn append(&mut self, severity: MessageSeverity, message: impl Into<String>) -> u64 {
        let entry = LogEntry {
            seq: self.next_seq,
            timestamp: Local::now(),
            severity,
            message: message.into(),
        };
        self.next_seq += 1;

        match severity {
            MessageSeverity::Debug => tracing::debug!("{}", entry.message),
            MessageSeverity::Info | MessageSeverity::Success => tracing::info!("{}", entry.message),
            MessageSeverity::Warning => tracing::warn!("{}", entry.message),
            MessageSeverity::Error => tracing::error!("{}", entry.message),
        }

        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.dropped += 1;
        }

        if let Some(feed) = &self.feed {
            let _ = feed.send(AppEvent::LogMessage(entry.clone()));
        }

        let seq = entry.seq;
        self.entries.push_back(entry);
        seq
    }

    pub fn info(&mut self, message: impl Into<String>) -> u64 {
        self.append(MessageSeverity::Info, message)
    }

    pub fn success(&mut self, message: impl Into<String>) -> u64 {
        self.append(MessageSeverity::Success, message)
    }

    pub fn warn(&mut self, message: impl Into<String>) -> u64 {
        self.append(MessageSeverity::Warning, message)
    }

    pub fn error(&mut self, message: impl Into<String>) -> u64 {
        self.append(MessageSeverity::Error, message)
    }

    /// Explicit user action; sequence numbers keep counting
    pub fn clear(&mut self) {
        self.entries.clear();
        self.dropped = 0;
        if let Some(feed) = &self.feed {
            let _ = feed.send(AppEvent::LogCleared);
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries evicted by the capacity bound since the last clear
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn render(&self) -> String {
        if self.is_empty() {
            return "No logs yet".to_string();
        }
        self.entries()
            .map(|entry| entry.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for SessionLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

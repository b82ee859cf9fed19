//! Append-only store for messages that will not be delivered.
//!
//! Entries are never mutated or evicted; `all` hands out a copy so callers
//! cannot reach the live store. Growth is unbounded for the lifetime of the
//! broker.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::broker::message::Message;
use crate::broker::subscription::SubscriptionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeadLetterReason {
    /// Every retry failed with a handler error.
    MaxRetriesExceeded,
    /// The subscription's circuit was open when the message was dequeued.
    CircuitOpen,
    /// Retries were exhausted and the last failure was a missing ack.
    AckTimeout,
    /// The subscription queue was full at publish time.
    QueueFull,
    /// The worker was stopped while the message was queued or retrying.
    Shutdown,
}

impl DeadLetterReason {
    /// Stable kebab-case label, as used in logs and JSON.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxRetriesExceeded => "max-retries-exceeded",
            Self::CircuitOpen => "circuit-open",
            Self::AckTimeout => "ack-timeout",
            Self::QueueFull => "queue-full",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    pub message: Arc<Message>,
    pub subscription_id: SubscriptionId,
    pub reason: DeadLetterReason,
    /// Number of handler invocations made before giving up.
    pub attempts: u32,
    /// Text of the last handler error, when there was one.
    pub last_error: Option<String>,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct DeadLetterSink {
    entries: Mutex<Vec<DeadLetterEntry>>,
}

impl DeadLetterSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.
    pub fn insert(&self, entry: DeadLetterEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    /// Snapshot of every entry in insertion order.
    pub fn all(&self) -> Vec<DeadLetterEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of entries recorded so far.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// True while nothing has been dead-lettered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

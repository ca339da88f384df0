//! Core types for the embedded broker.
//!
//! Contains the stored message type, configuration, and the internal queue
//! data structure backing each topic backlog and channel.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::path::PathBuf;

/// Separator between topic and channel in queue keys.
///
/// Cannot appear in a valid topic or channel name.
pub(crate) const CHANNEL_SEPARATOR: char = ':';

/// Queue key for a channel of a topic.
pub(crate) fn channel_key(topic: &str, channel: &str) -> String {
    format!("{topic}{CHANNEL_SEPARATOR}{channel}")
}

/// Message held by the broker.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BrokerMessage {
    /// Unique message identifier (UUID v4), shared by all channel copies.
    pub id: String,
    /// Message payload.
    pub data: Vec<u8>,
    /// Timestamp when the message was published.
    pub created_at: DateTime<Utc>,
    /// Number of times the message was handed to a subscriber.
    #[serde(default)]
    pub attempts: u16,
}

/// A single FIFO queue (internal).
#[derive(Debug)]
pub(crate) struct Queue {
    pub(crate) messages: VecDeque<BrokerMessage>,
    max_size: Option<usize>,
}

impl Queue {
    pub(crate) fn new(max_size: Option<usize>) -> Self {
        Self {
            messages: VecDeque::new(),
            max_size,
        }
    }

    /// Push a message to the back of the queue.
    pub(crate) fn push(&mut self, message: BrokerMessage) -> anyhow::Result<()> {
        if let Some(max) = self.max_size
            && self.messages.len() >= max
        {
            anyhow::bail!("Queue is full (max size: {max})");
        }
        self.messages.push_back(message);
        Ok(())
    }

    /// Put a message back at the front. Ignores the size limit since the
    /// message was already counted.
    pub(crate) fn requeue(&mut self, message: BrokerMessage) {
        self.messages.push_front(message);
    }

    pub(crate) fn pop(&mut self) -> Option<BrokerMessage> {
        self.messages.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }
}

/// Configuration for the embedded broker.
#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    /// Path to the redb database file. `None` keeps everything in memory.
    pub db_path: Option<PathBuf>,
    /// Maximum messages per queue (None = unlimited).
    pub max_queue_size: Option<usize>,
}

impl BrokerConfig {
    /// Persistent broker backed by `path`.
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: Some(path.into()),
            max_queue_size: None,
        }
    }
}

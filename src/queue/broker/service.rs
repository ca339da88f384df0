//! Embedded broker implementation.
//!
//! Topics fan out to channels: every channel of a topic receives its own
//! copy of each message, and subscribers on the same channel compete for
//! messages. A topic with no channels keeps its messages in a backlog which
//! the first channel created on the topic inherits.

use super::persistence::Journal;
use super::types::{BrokerConfig, BrokerMessage, CHANNEL_SEPARATOR, Queue, channel_key};
use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

/// Internal state for the broker.
pub(crate) struct BrokerInner {
    /// Topic backlogs and channel queues, indexed by queue key.
    pub(crate) queues: RwLock<HashMap<String, Queue>>,
    /// Channels registered per topic.
    pub(crate) channels: RwLock<HashMap<String, Vec<String>>>,
    /// Wakes subscribers waiting on a channel queue.
    pub(crate) notifiers: RwLock<HashMap<String, Arc<Notify>>>,
    pub(crate) config: BrokerConfig,
    pub(crate) journal: Option<Journal>,
}

/// In-process NSQ-style broker with optional redb persistence.
#[derive(Clone)]
pub struct EmbeddedBroker {
    pub(crate) inner: Arc<BrokerInner>,
}

impl EmbeddedBroker {
    /// Create a new broker.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The database directory cannot be created
    /// - The database file cannot be opened or created
    /// - Persisted queue data cannot be loaded (corruption)
    pub fn new(config: BrokerConfig) -> Result<Self> {
        let journal = config.db_path.as_deref().map(Journal::open).transpose()?;
        let mut queues = HashMap::new();
        if let Some(journal) = &journal {
            for (key, messages) in journal.load()? {
                let mut queue = Queue::new(config.max_queue_size);
                queue.messages = messages;
                queues.insert(key, queue);
            }
        }

        let broker = Self {
            inner: Arc::new(BrokerInner {
                queues: RwLock::new(queues),
                channels: RwLock::new(HashMap::new()),
                notifiers: RwLock::new(HashMap::new()),
                config,
                journal,
            }),
        };
        broker.restore_channels();
        Ok(broker)
    }

    /// Create a broker that keeps everything in memory.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                queues: RwLock::new(HashMap::new()),
                channels: RwLock::new(HashMap::new()),
                notifiers: RwLock::new(HashMap::new()),
                config: BrokerConfig::default(),
                journal: None,
            }),
        }
    }

    /// Rebuilds the channel registry from loaded queue keys.
    fn restore_channels(&self) {
        let keys: Vec<String> = self.inner.queues.read().keys().cloned().collect();
        let mut channels = self.inner.channels.write();
        for key in &keys {
            if let Some((topic, channel)) = key.split_once(CHANNEL_SEPARATOR) {
                channels
                    .entry(topic.to_string())
                    .or_default()
                    .push(channel.to_string());
            }
        }
    }

    fn persist(&self, key: &str) -> Result<()> {
        let Some(journal) = &self.inner.journal else {
            return Ok(());
        };
        let queues = self.inner.queues.read();
        journal.save(key, queues.get(key).map(|queue| &queue.messages))
    }

    pub(crate) fn notifier(&self, key: &str) -> Arc<Notify> {
        if let Some(notify) = self.inner.notifiers.read().get(key) {
            return Arc::clone(notify);
        }
        Arc::clone(
            self.inner
                .notifiers
                .write()
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Notify::new())),
        )
    }

    /// Registers `channel` on `topic`.
    ///
    /// The first channel of a topic takes over the topic backlog.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn ensure_channel(&self, topic: &str, channel: &str) -> Result<()> {
        let key = channel_key(topic, channel);
        let inherited = {
            let mut channels = self.inner.channels.write();
            let registered = channels.entry(topic.to_string()).or_default();
            if registered.iter().any(|c| c == channel) {
                return Ok(());
            }
            let first = registered.is_empty();
            registered.push(channel.to_string());

            let mut queues = self.inner.queues.write();
            let backlog = if first { queues.remove(topic) } else { None };
            let queue = queues
                .entry(key.clone())
                .or_insert_with(|| Queue::new(self.inner.config.max_queue_size));
            match backlog {
                Some(backlog) => {
                    let count = backlog.len();
                    queue.messages.extend(backlog.messages);
                    count
                },
                None => 0,
            }
        };

        if inherited > 0 {
            tracing::debug!(topic, channel, inherited, "channel took over topic backlog");
            self.persist(topic)?;
            self.notifier(&key).notify_one();
        }
        self.persist(&key)
    }

    /// Publish a message to every channel of `topic`.
    ///
    /// Returns the number of channels that received a copy; zero means the
    /// message went to the topic backlog.
    ///
    /// # Errors
    ///
    /// Returns an error if a queue is full or persistence fails.
    pub fn publish(&self, topic: &str, body: &[u8]) -> Result<usize> {
        let message = BrokerMessage {
            id: Uuid::new_v4().to_string(),
            data: body.to_vec(),
            created_at: Utc::now(),
            attempts: 0,
        };

        let channels = self
            .inner
            .channels
            .read()
            .get(topic)
            .cloned()
            .unwrap_or_default();

        if channels.is_empty() {
            {
                let mut queues = self.inner.queues.write();
                queues
                    .entry(topic.to_string())
                    .or_insert_with(|| Queue::new(self.inner.config.max_queue_size))
                    .push(message)?;
            }
            self.persist(topic)?;
            return Ok(0);
        }

        for channel in &channels {
            let key = channel_key(topic, channel);
            {
                let mut queues = self.inner.queues.write();
                queues
                    .entry(key.clone())
                    .or_insert_with(|| Queue::new(self.inner.config.max_queue_size))
                    .push(message.clone())?;
            }
            self.persist(&key)?;
            self.notifier(&key).notify_one();
        }

        Ok(channels.len())
    }

    /// Take the next message from a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn pop(&self, topic: &str, channel: &str) -> Result<Option<BrokerMessage>> {
        let key = channel_key(topic, channel);
        let message = {
            let mut queues = self.inner.queues.write();
            queues.get_mut(&key).and_then(Queue::pop)
        };

        if message.is_some() {
            self.persist(&key)?;
        }
        Ok(message.map(|mut m| {
            m.attempts = m.attempts.saturating_add(1);
            m
        }))
    }

    /// Put a message that could not be delivered back at the head of its channel.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn requeue(&self, topic: &str, channel: &str, message: BrokerMessage) -> Result<()> {
        let key = channel_key(topic, channel);
        {
            let mut queues = self.inner.queues.write();
            queues
                .entry(key.clone())
                .or_insert_with(|| Queue::new(self.inner.config.max_queue_size))
                .requeue(message);
        }
        self.persist(&key)?;
        self.notifier(&key).notify_one();
        Ok(())
    }

    /// Messages waiting on a channel.
    pub fn depth(&self, topic: &str, channel: &str) -> usize {
        self.inner
            .queues
            .read()
            .get(&channel_key(topic, channel))
            .map_or(0, Queue::len)
    }

    /// Messages waiting on a topic with no channels yet.
    pub fn backlog(&self, topic: &str) -> usize {
        self.inner.queues.read().get(topic).map_or(0, Queue::len)
    }

    /// Channels registered on `topic`.
    pub fn channels(&self, topic: &str) -> Vec<String> {
        self.inner
            .channels
            .read()
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }
}

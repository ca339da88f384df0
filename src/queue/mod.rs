//! Message transport adapters and work item codecs.
//!
//! The engine talks to its queue through three capabilities:
//!
//! - [`Publisher`] - publish a body to a topic, stop when done
//! - [`Subscriber`] - a live subscription that can be torn down
//! - [`Transport`] - creates subscriptions and publishers
//!
//! A subscription pushes raw message bodies into a [`MessageSink`]. When
//! [`Subscriber::unsubscribe`] returns, the subscription has flushed any
//! message it had taken from the queue (handed over or re-queued) and has
//! dropped its sink, so the receiving side observes channel closure.
//!
//! Two transports are provided:
//!
//! - [`nsq`] - NSQ over TCP with nsqlookupd discovery
//! - [`broker`] - an embedded in-process broker with optional redb persistence

pub mod broker;
pub mod messages;
pub mod nsq;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use broker::{BrokerConfig, EmbeddedBroker};
pub use messages::{PinRequest, WebhookMessage, WebhookRequest, WebhookStatus};
pub use nsq::{NsqConfig, NsqTransport};

/// Channel half a subscription delivers message bodies into.
pub type MessageSink = mpsc::Sender<Bytes>;

/// Queue transport errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum QueueError {
    /// Socket level failure talking to the queue.
    #[error("queue I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent something the protocol does not allow.
    #[error("queue protocol error: {0}")]
    Protocol(String),

    /// The queue rejected a command.
    #[error("queue rejected command: {0}")]
    Rejected(String),

    /// Discovery lookup failed.
    #[error("lookup failed: {0}")]
    Lookup(#[from] reqwest::Error),

    /// Topic or channel name is not acceptable.
    #[error("invalid name '{0}'")]
    InvalidName(String),

    /// The publisher or subscription was already stopped.
    #[error("transport is stopped")]
    Stopped,

    /// Embedded broker storage failure.
    #[error(transparent)]
    Broker(#[from] anyhow::Error),
}

/// Publishes message bodies to named topics.
#[async_trait]
pub trait Publisher: Send + Sync + 'static {
    /// Publishes `body` to `topic`.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic name is invalid, the publisher was
    /// stopped, or the queue could not accept the message.
    async fn publish(&self, topic: &str, body: &[u8]) -> Result<(), QueueError>;

    /// Releases connections. Later publishes fail with [`QueueError::Stopped`].
    async fn stop(&self);
}

/// A live subscription.
#[async_trait]
pub trait Subscriber: Send + 'static {
    /// Stops delivery, flushes buffered messages and drops the sink.
    async fn unsubscribe(self: Box<Self>);
}

/// Creates subscriptions and publishers for one queue deployment.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Subscribes `channel` on `topic`, delivering bodies into `sink`.
    ///
    /// # Errors
    ///
    /// Returns an error if the names are invalid or the queue cannot be reached.
    async fn subscribe(
        &self,
        topic: &str,
        channel: &str,
        sink: MessageSink,
    ) -> Result<Box<dyn Subscriber>, QueueError>;

    /// Returns a publisher for this deployment.
    ///
    /// # Errors
    ///
    /// Returns an error if the publisher cannot be constructed.
    async fn publisher(&self) -> Result<Arc<dyn Publisher>, QueueError>;
}

/// Checks a topic or channel name.
///
/// Names are 1-64 characters of `[.a-zA-Z0-9_-]`, optionally suffixed with
/// `#ephemeral`, which is what nsqd accepts. The embedded broker applies the
/// same rule so configurations stay portable between transports.
///
/// # Errors
///
/// Returns [`QueueError::InvalidName`] when the name is not acceptable.
pub fn validate_name(name: &str) -> Result<(), QueueError> {
    let base = name.strip_suffix("#ephemeral").unwrap_or(name);
    let valid = !base.is_empty()
        && name.len() <= 64
        && base
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(QueueError::InvalidName(name.to_string()))
    }
}

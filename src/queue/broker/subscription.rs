//! Transport adapter over [`EmbeddedBroker`].

use super::service::EmbeddedBroker;
use super::types::{BrokerMessage, channel_key};
use crate::queue::{MessageSink, Publisher, QueueError, Subscriber, Transport, validate_name};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Back-off after a broker storage error before polling again.
const POP_ERROR_BACKOFF: Duration = Duration::from_millis(200);

/// Live subscription on one channel.
pub struct BrokerSubscription {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[async_trait]
impl Subscriber for BrokerSubscription {
    async fn unsubscribe(self: Box<Self>) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "broker delivery task panicked");
        }
    }
}

/// Moves messages from a channel queue into the sink until cancelled.
///
/// A message that was popped but could not be handed over is re-queued, so
/// nothing is lost when the subscription stops.
async fn deliver(
    broker: EmbeddedBroker,
    topic: String,
    channel: String,
    sink: MessageSink,
    cancel: CancellationToken,
) {
    let notify = broker.notifier(&channel_key(&topic, &channel));
    loop {
        let message = match broker.pop(&topic, &channel) {
            Ok(Some(message)) => message,
            Ok(None) => {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = notify.notified() => continue,
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "failed to take message from channel");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(POP_ERROR_BACKOFF) => continue,
                }
            },
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                put_back(&broker, &topic, &channel, message);
                break;
            },
            permit = sink.reserve() => match permit {
                Ok(permit) => {
                    tracing::trace!(id = %message.id, attempts = message.attempts, "delivered");
                    permit.send(Bytes::from(message.data));
                },
                Err(_) => {
                    put_back(&broker, &topic, &channel, message);
                    break;
                },
            },
        }
    }
    tracing::debug!("delivery stopped");
}

fn put_back(broker: &EmbeddedBroker, topic: &str, channel: &str, message: BrokerMessage) {
    let id = message.id.clone();
    if let Err(e) = broker.requeue(topic, channel, message) {
        tracing::error!(error = %e, %id, "failed to re-queue message");
    }
}

/// Publisher handle over the broker.
pub struct BrokerPublisher {
    broker: EmbeddedBroker,
    stopped: AtomicBool,
}

#[async_trait]
impl Publisher for BrokerPublisher {
    async fn publish(&self, topic: &str, body: &[u8]) -> Result<(), QueueError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(QueueError::Stopped);
        }
        validate_name(topic)?;
        let channels = self.broker.publish(topic, body)?;
        tracing::trace!(topic, channels, bytes = body.len(), "published");
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

#[async_trait]
impl Transport for EmbeddedBroker {
    async fn subscribe(
        &self,
        topic: &str,
        channel: &str,
        sink: MessageSink,
    ) -> Result<Box<dyn Subscriber>, QueueError> {
        validate_name(topic)?;
        validate_name(channel)?;
        self.ensure_channel(topic, channel)?;

        let cancel = CancellationToken::new();
        let span = tracing::info_span!("broker_subscription", topic, channel);
        let task = tokio::spawn(
            deliver(
                self.clone(),
                topic.to_string(),
                channel.to_string(),
                sink,
                cancel.clone(),
            )
            .instrument(span),
        );
        Ok(Box::new(BrokerSubscription { cancel, task }))
    }

    async fn publisher(&self) -> Result<Arc<dyn Publisher>, QueueError> {
        Ok(Arc::new(BrokerPublisher {
            broker: self.clone(),
            stopped: AtomicBool::new(false),
        }))
    }
}

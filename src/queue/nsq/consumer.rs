//! NSQ consumer: discovers nsqd producers and feeds their messages into a sink.

use super::NsqConfig;
use super::connection::{Connection, Writer};
use super::lookup::Lookup;
use super::protocol::{CLOSE_WAIT, Command, Frame, Message};
use crate::queue::{MessageSink, QueueError, Subscriber};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// How long a closing connection waits for in-flight frames to drain.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Live NSQ subscription.
pub struct NsqSubscription {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl NsqSubscription {
    pub(crate) fn spawn(
        config: Arc<NsqConfig>,
        lookup: Lookup,
        topic: String,
        channel: String,
        sink: MessageSink,
    ) -> Self {
        let cancel = CancellationToken::new();
        let span = tracing::info_span!("nsq_subscription", %topic, %channel);
        let task = tokio::spawn(
            supervise(config, lookup, topic, channel, sink, cancel.clone()).instrument(span),
        );
        Self { cancel, task }
    }
}

#[async_trait]
impl Subscriber for NsqSubscription {
    async fn unsubscribe(self: Box<Self>) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "nsq subscription task panicked");
        }
    }
}

/// Keeps one connection per discovered nsqd until cancelled.
async fn supervise(
    config: Arc<NsqConfig>,
    lookup: Lookup,
    topic: String,
    channel: String,
    sink: MessageSink,
    cancel: CancellationToken,
) {
    let mut connections: HashMap<String, JoinHandle<()>> = HashMap::new();
    let mut poll = tokio::time::interval(config.lookupd_poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = poll.tick() => {},
        }

        connections.retain(|_, handle| !handle.is_finished());

        let addresses = if lookup.is_empty() {
            BTreeSet::from([config.nsqd_address.clone()])
        } else {
            let found = tokio::select! {
                () = cancel.cancelled() => break,
                found = lookup.producers(&topic) => found,
            };
            match found {
                Ok(addresses) => addresses,
                Err(e) => {
                    tracing::warn!(error = %e, "producer discovery failed");
                    continue;
                },
            }
        };

        for address in addresses {
            if connections.contains_key(&address) {
                continue;
            }
            tracing::info!(nsqd = %address, "connecting");
            let span = tracing::info_span!("nsq_connection", nsqd = %address);
            let handle = tokio::spawn(
                consume(
                    Arc::clone(&config),
                    address.clone(),
                    topic.clone(),
                    channel.clone(),
                    sink.clone(),
                    cancel.clone(),
                )
                .instrument(span),
            );
            connections.insert(address, handle);
        }
    }

    for (address, handle) in connections {
        if let Err(e) = handle.await {
            tracing::error!(nsqd = %address, error = %e, "connection task panicked");
        }
    }
    tracing::debug!("subscription stopped");
}

async fn consume(
    config: Arc<NsqConfig>,
    address: String,
    topic: String,
    channel: String,
    sink: MessageSink,
    cancel: CancellationToken,
) {
    match run_connection(&config, &address, &topic, &channel, &sink, &cancel).await {
        Ok(()) => tracing::debug!("connection closed"),
        Err(e) => tracing::warn!(error = %e, "connection failed"),
    }
}

async fn run_connection(
    config: &NsqConfig,
    address: &str,
    topic: &str,
    channel: &str,
    sink: &MessageSink,
    cancel: &CancellationToken,
) -> Result<(), QueueError> {
    let mut conn = Connection::open(address, &config.identify()).await?;
    conn.send(&Command::Sub { topic, channel }).await?;
    conn.expect_ok().await?;
    tracing::info!(nsqd = conn.address(), "subscribed");

    let (mut writer, mut frames, reader) = conn.split();
    let mut held = VecDeque::new();
    let result = pump(config, &mut writer, &mut frames, &mut held, sink, cancel).await;
    if result.is_ok() {
        close(&mut writer, &mut frames, held).await;
    }
    reader.abort();
    result
}

type Frames = mpsc::Receiver<Result<Frame, QueueError>>;

/// Handles frames until cancelled or the connection ends.
///
/// Frames that arrive while a message waits for sink capacity are parked in
/// `held` and handled in order afterwards; whatever is left there when the
/// loop stops is re-queued by [`close`].
async fn pump(
    config: &NsqConfig,
    writer: &mut Writer,
    frames: &mut Frames,
    held: &mut VecDeque<Frame>,
    sink: &MessageSink,
    cancel: &CancellationToken,
) -> Result<(), QueueError> {
    writer.send(&Command::Rdy(config.max_in_flight)).await?;
    loop {
        let frame = match held.pop_front() {
            Some(frame) => Some(Ok(frame)),
            None => tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                frame = frames.recv() => frame,
            },
        };
        match frame {
            None => return Ok(()),
            Some(Err(e)) => return Err(e),
            Some(Ok(frame)) if frame.is_heartbeat() => writer.send(&Command::Nop).await?,
            Some(Ok(Frame::Message(message))) => {
                if !hand_over(writer, frames, held, sink, cancel, message).await? {
                    return Ok(());
                }
            },
            Some(Ok(Frame::Error(data))) => {
                tracing::warn!(error = %String::from_utf8_lossy(&data), "nsqd reported error");
            },
            Some(Ok(Frame::Response(_))) => {},
        }
    }
}

/// Passes a message to the sink and finishes it, or re-queues it when the
/// sink is gone or the subscription is stopping. Returns false to stop.
///
/// Keeps reading the socket while the sink is full: heartbeats are answered
/// so nsqd does not drop a connection that is only applying backpressure.
async fn hand_over(
    writer: &mut Writer,
    frames: &mut Frames,
    held: &mut VecDeque<Frame>,
    sink: &MessageSink,
    cancel: &CancellationToken,
    message: Message,
) -> Result<bool, QueueError> {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                requeue(writer, &message).await?;
                return Ok(false);
            },
            permit = sink.reserve() => {
                let Ok(permit) = permit else {
                    requeue(writer, &message).await?;
                    return Ok(false);
                };
                tracing::trace!(id = %message.id_str(), attempts = message.attempts, "delivered");
                permit.send(message.body.clone());
                writer.send(&Command::Fin(&message.id)).await?;
                return Ok(true);
            },
            frame = frames.recv() => match frame {
                // nsqd redelivers the message once the connection is gone
                None => return Ok(false),
                Some(Err(e)) => return Err(e),
                Some(Ok(frame)) if frame.is_heartbeat() => writer.send(&Command::Nop).await?,
                Some(Ok(frame)) => held.push_back(frame),
            },
        }
    }
}

async fn requeue(writer: &mut Writer, message: &Message) -> Result<(), QueueError> {
    tracing::debug!(id = %message.id_str(), "re-queueing undelivered message");
    writer
        .send(&Command::Req {
            id: &message.id,
            timeout_ms: 0,
        })
        .await
}

/// Stops the flow of messages and re-queues anything held or still arriving.
async fn close(writer: &mut Writer, frames: &mut Frames, held: VecDeque<Frame>) {
    let drain = async {
        for frame in held {
            if let Frame::Message(message) = frame {
                requeue(writer, &message).await?;
            }
        }
        writer.send(&Command::Rdy(0)).await?;
        writer.send(&Command::Cls).await?;
        while let Some(frame) = frames.recv().await {
            match frame? {
                frame if frame.is_heartbeat() => writer.send(&Command::Nop).await?,
                Frame::Message(message) => requeue(writer, &message).await?,
                Frame::Response(data) if data.as_ref() == CLOSE_WAIT => break,
                _ => {},
            }
        }
        Ok::<(), QueueError>(())
    };
    match tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, drain).await {
        Ok(Ok(())) => {},
        Ok(Err(e)) => tracing::debug!(error = %e, "error while closing"),
        Err(_) => tracing::debug!("timed out waiting for CLOSE_WAIT"),
    }
}

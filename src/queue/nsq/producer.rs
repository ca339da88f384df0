//! NSQ producer holding one lazily opened connection.

use super::connection::Connection;
use super::protocol::{Command, Identify};
use crate::queue::{Publisher, QueueError, validate_name};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Longest a connection may sit unused before it is replaced.
///
/// nsqd heartbeats every 30s and drops clients that miss two in a row. An
/// idle connection is never read, so it is retired before the second one.
const MAX_IDLE: Duration = Duration::from_secs(25);

struct Idle {
    conn: Connection,
    last_used: Instant,
}

/// Publishes to a single nsqd.
///
/// The connection is opened on first use, replaced after a socket error and
/// dropped once it has been idle for longer than the heartbeat window. A
/// publish that fails on a reused connection is retried once on a fresh one,
/// since nsqd may have restarted since the last publish.
pub struct NsqProducer {
    address: String,
    identify: Identify,
    conn: Mutex<Option<Idle>>,
    max_idle: Duration,
    stopped: AtomicBool,
}

impl NsqProducer {
    pub fn new(address: impl Into<String>, identify: Identify) -> Self {
        Self {
            address: address.into(),
            identify,
            conn: Mutex::new(None),
            max_idle: MAX_IDLE,
            stopped: AtomicBool::new(false),
        }
    }

    /// Overrides how long an unused connection is kept.
    #[must_use]
    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    async fn open(&self) -> Result<Connection, QueueError> {
        Connection::open(&self.address, &self.identify).await
    }
}

async fn publish_on(conn: &mut Connection, topic: &str, body: &[u8]) -> Result<(), QueueError> {
    conn.send(&Command::Pub { topic, body }).await?;
    conn.expect_ok().await
}

#[async_trait]
impl Publisher for NsqProducer {
    async fn publish(&self, topic: &str, body: &[u8]) -> Result<(), QueueError> {
        validate_name(topic)?;
        let mut guard = self.conn.lock().await;
        if self.stopped.load(Ordering::Acquire) {
            return Err(QueueError::Stopped);
        }

        if guard
            .as_ref()
            .is_some_and(|idle| idle.last_used.elapsed() > self.max_idle)
        {
            tracing::debug!(nsqd = %self.address, "replacing idle producer connection");
            *guard = None;
        }

        let (mut conn, reused) = match guard.take() {
            Some(idle) => (idle.conn, true),
            None => (self.open().await?, false),
        };

        let conn = match publish_on(&mut conn, topic, body).await {
            Ok(()) => conn,
            Err(e @ QueueError::Rejected(_)) => {
                *guard = Some(Idle {
                    conn,
                    last_used: Instant::now(),
                });
                return Err(e);
            },
            Err(e) if !reused => return Err(e),
            Err(e) => {
                tracing::debug!(nsqd = %self.address, error = %e, "reconnecting producer");
                let mut fresh = self.open().await?;
                publish_on(&mut fresh, topic, body).await?;
                fresh
            },
        };
        *guard = Some(Idle {
            conn,
            last_used: Instant::now(),
        });
        Ok(())
    }

    async fn stop(&self) {
        let mut guard = self.conn.lock().await;
        self.stopped.store(true, Ordering::Release);
        if let Some(idle) = guard.take() {
            idle.conn.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::nsq::fake::FakeNsqd;
    use crate::queue::nsq::protocol::OK;
    use std::sync::Arc;
    use tokio::task::JoinHandle;

    fn producer(nsqd: &FakeNsqd, max_idle: Duration) -> Arc<NsqProducer> {
        Arc::new(
            NsqProducer::new(nsqd.address(), Identify::new("test")).with_max_idle(max_idle),
        )
    }

    fn publish(
        producer: &Arc<NsqProducer>,
        body: &'static [u8],
    ) -> JoinHandle<Result<(), QueueError>> {
        let producer = Arc::clone(producer);
        tokio::spawn(async move { producer.publish("webhooks", body).await })
    }

    #[tokio::test]
    async fn test_reuses_connection_while_fresh() {
        let nsqd = FakeNsqd::bind().await;
        let producer = producer(&nsqd, Duration::from_secs(60));

        let first = publish(&producer, b"a");
        let mut peer = nsqd.accept().await;
        assert_eq!(peer.command().await, "PUB webhooks");
        peer.respond(OK).await;
        first.await.unwrap().unwrap();

        let second = publish(&producer, b"b");
        assert_eq!(peer.command().await, "PUB webhooks");
        peer.respond(OK).await;
        second.await.unwrap().unwrap();
        assert!(!nsqd.connects_within(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_idle_connection_is_replaced() {
        let nsqd = FakeNsqd::bind().await;
        let producer = producer(&nsqd, Duration::from_millis(20));

        let first = publish(&producer, b"a");
        let mut stale = nsqd.accept().await;
        assert_eq!(stale.command().await, "PUB webhooks");
        stale.respond(OK).await;
        first.await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let second = publish(&producer, b"b");
        let mut fresh = nsqd.accept().await;
        assert_eq!(fresh.command().await, "PUB webhooks");
        fresh.respond(OK).await;
        second.await.unwrap().unwrap();
        assert!(stale.closed_within(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_rejected_publish_keeps_connection() {
        let nsqd = FakeNsqd::bind().await;
        let producer = producer(&nsqd, Duration::from_secs(60));

        let first = publish(&producer, b"a");
        let mut peer = nsqd.accept().await;
        assert_eq!(peer.command().await, "PUB webhooks");
        peer.reject(b"E_BAD_MESSAGE").await;
        assert!(matches!(first.await.unwrap(), Err(QueueError::Rejected(_))));

        let second = publish(&producer, b"b");
        assert_eq!(peer.command().await, "PUB webhooks");
        peer.respond(OK).await;
        second.await.unwrap().unwrap();
    }
}

//! Tests for the embedded broker.

use super::*;
use crate::queue::{QueueError, Transport};
use anyhow::Result;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

#[test]
fn test_channel_fifo() -> Result<()> {
    let broker = EmbeddedBroker::in_memory();
    broker.ensure_channel("jobs", "workers")?;

    broker.publish("jobs", b"message 1")?;
    broker.publish("jobs", b"message 2")?;
    assert_eq!(broker.depth("jobs", "workers"), 2);

    let msg1 = broker.pop("jobs", "workers")?.unwrap();
    assert_eq!(msg1.data, b"message 1");
    assert_eq!(msg1.attempts, 1);
    assert!(Uuid::parse_str(&msg1.id).is_ok());

    let msg2 = broker.pop("jobs", "workers")?.unwrap();
    assert_eq!(msg2.data, b"message 2");
    assert!(broker.pop("jobs", "workers")?.is_none());

    Ok(())
}

#[test]
fn test_backlog_goes_to_first_channel_only() -> Result<()> {
    let broker = EmbeddedBroker::in_memory();
    assert_eq!(broker.publish("jobs", b"early")?, 0);
    assert_eq!(broker.backlog("jobs"), 1);

    broker.ensure_channel("jobs", "a")?;
    broker.ensure_channel("jobs", "b")?;
    assert_eq!(broker.backlog("jobs"), 0);
    assert_eq!(broker.depth("jobs", "a"), 1);
    assert_eq!(broker.depth("jobs", "b"), 0);

    // Registering again is a no-op
    broker.ensure_channel("jobs", "a")?;
    assert_eq!(broker.channels("jobs"), vec!["a", "b"]);

    Ok(())
}

#[test]
fn test_requeue_goes_to_front() -> Result<()> {
    let broker = EmbeddedBroker::in_memory();
    broker.ensure_channel("jobs", "w")?;
    broker.publish("jobs", b"one")?;
    broker.publish("jobs", b"two")?;

    let first = broker.pop("jobs", "w")?.unwrap();
    broker.requeue("jobs", "w", first)?;

    let again = broker.pop("jobs", "w")?.unwrap();
    assert_eq!(again.data, b"one");
    assert_eq!(again.attempts, 2);

    Ok(())
}

#[test]
fn test_max_queue_size() -> Result<()> {
    let broker = EmbeddedBroker::new(BrokerConfig {
        db_path: None,
        max_queue_size: Some(1),
    })?;
    broker.ensure_channel("jobs", "w")?;
    broker.publish("jobs", b"one")?;

    let err = broker.publish("jobs", b"two").unwrap_err();
    assert!(err.to_string().contains("Queue is full"));

    Ok(())
}

#[test]
fn test_persistence() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let db_path = temp_dir.path().join("broker.db");

    {
        let broker = EmbeddedBroker::new(BrokerConfig::persistent(&db_path))?;
        broker.publish("orphan", b"held")?;
        broker.ensure_channel("jobs", "w")?;
        broker.publish("jobs", b"message 1")?;
        broker.publish("jobs", b"message 2")?;
        broker.pop("jobs", "w")?;
    }

    {
        let broker = EmbeddedBroker::new(BrokerConfig::persistent(&db_path))?;
        assert_eq!(broker.channels("jobs"), vec!["w"]);
        assert_eq!(broker.depth("jobs", "w"), 1);
        assert_eq!(broker.backlog("orphan"), 1);

        let msg = broker.pop("jobs", "w")?.unwrap();
        assert_eq!(msg.data, b"message 2");
    }

    Ok(())
}

#[tokio::test]
async fn test_subscription_delivers_and_fans_out() -> Result<()> {
    let broker = EmbeddedBroker::in_memory();
    let (tx_a, mut rx_a) = mpsc::channel(4);
    let (tx_b, mut rx_b) = mpsc::channel(4);

    let sub_a = broker.subscribe("events", "a", tx_a).await?;
    let sub_b = broker.subscribe("events", "b", tx_b).await?;

    let publisher = broker.publisher().await?;
    publisher.publish("events", b"hello").await?;

    let got_a = timeout(Duration::from_secs(1), rx_a.recv()).await?.unwrap();
    let got_b = timeout(Duration::from_secs(1), rx_b.recv()).await?.unwrap();
    assert_eq!(&got_a[..], b"hello");
    assert_eq!(&got_b[..], b"hello");

    sub_a.unsubscribe().await;
    sub_b.unsubscribe().await;

    // Sinks were dropped
    assert!(rx_a.recv().await.is_none());
    assert!(rx_b.recv().await.is_none());

    Ok(())
}

#[tokio::test]
async fn test_competing_subscribers_share_channel() -> Result<()> {
    let broker = EmbeddedBroker::in_memory();
    let (tx, mut rx) = mpsc::channel(16);

    let sub1 = broker.subscribe("jobs", "w", tx.clone()).await?;
    let sub2 = broker.subscribe("jobs", "w", tx).await?;

    for i in 0..6u8 {
        broker.publish("jobs", &[i])?;
    }

    let mut seen = Vec::new();
    for _ in 0..6 {
        let body = timeout(Duration::from_secs(1), rx.recv()).await?.unwrap();
        seen.push(body[0]);
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);

    sub1.unsubscribe().await;
    sub2.unsubscribe().await;
    assert_eq!(broker.depth("jobs", "w"), 0);

    Ok(())
}

#[tokio::test]
async fn test_unsubscribe_requeues_undelivered() -> Result<()> {
    let broker = EmbeddedBroker::in_memory();
    let (tx, mut rx) = mpsc::channel(1);

    let sub = broker.subscribe("jobs", "w", tx).await?;
    broker.publish("jobs", b"one")?;
    broker.publish("jobs", b"two")?;

    // First fills the sink, second is held waiting for capacity
    tokio::time::sleep(Duration::from_millis(50)).await;
    sub.unsubscribe().await;

    assert_eq!(&rx.recv().await.unwrap()[..], b"one");
    assert!(rx.recv().await.is_none());
    assert_eq!(broker.depth("jobs", "w"), 1);
    assert_eq!(broker.pop("jobs", "w")?.unwrap().data, b"two");

    Ok(())
}

#[tokio::test]
async fn test_publisher_validation_and_stop() -> Result<()> {
    let broker = EmbeddedBroker::in_memory();
    let publisher = broker.publisher().await?;

    assert!(matches!(
        publisher.publish("bad topic", b"x").await,
        Err(QueueError::InvalidName(_))
    ));

    publisher.stop().await;
    assert!(matches!(
        publisher.publish("jobs", b"x").await,
        Err(QueueError::Stopped)
    ));
    assert_eq!(broker.backlog("jobs"), 0);

    Ok(())
}

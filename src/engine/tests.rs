use super::*;
use crate::model::{Stage, StorageRecord};
use crate::network::MemoryNetwork;
use crate::queue::{EmbeddedBroker, PinRequest, WebhookMessage, WebhookStatus};
use crate::storage::MemoryObjectStore;
use crate::store::MemoryRecordStore;

struct Fixture {
    broker: EmbeddedBroker,
    objects: MemoryObjectStore,
    network: MemoryNetwork,
    records: MemoryRecordStore,
    engine: Engine,
    _scratch: tempfile::TempDir,
}

fn fixture(max_concurrent_requests: usize) -> Fixture {
    let broker = EmbeddedBroker::in_memory();
    // fan-out copy of every webhook for assertions
    broker.ensure_channel("webhooks", "observer").unwrap();
    let objects = MemoryObjectStore::new();
    let network = MemoryNetwork::new("Qm123");
    let records = MemoryRecordStore::new();
    let scratch = tempfile::tempdir().unwrap();

    let config = EngineConfig {
        max_concurrent_requests,
        retry_base_url: "https://api.example.com".into(),
        persist_retries: 0,
        scratch: ScratchDirs::new(scratch.path(), "engine-"),
        ..EngineConfig::default()
    };
    let engine = Engine::new(
        config,
        Collaborators {
            transport: Arc::new(broker.clone()),
            objects: Arc::new(objects.clone()),
            network: Arc::new(network.clone()),
            records: Arc::new(records.clone()),
        },
    );
    Fixture {
        broker,
        objects,
        network,
        records,
        engine,
        _scratch: scratch,
    }
}

fn publish(broker: &EmbeddedBroker, request: &PinRequest) {
    broker
        .publish("pin_requests", &request.encode().unwrap())
        .unwrap();
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn observed_webhooks(broker: &EmbeddedBroker) -> Vec<WebhookMessage> {
    std::iter::from_fn(|| broker.pop("webhooks", "observer").unwrap())
        .map(|m| WebhookMessage::decode(&m.data).unwrap())
        .collect()
}

#[tokio::test]
async fn test_single_object_add_success() {
    let mut f = fixture(5);
    f.objects.put("1/a.txt", "hello").unwrap();
    let record = StorageRecord::new(1, 1, "1/a.txt");
    f.records.insert(record.clone());

    f.engine.start().await.unwrap();
    publish(&f.broker, &PinRequest::add(&record));
    wait_until("the update", || !f.records.updates().is_empty()).await;
    f.engine.stop().await;

    let updates = f.records.updates();
    assert_eq!(updates.len(), 1);
    let stored = &updates[0].record;
    assert_eq!(stored.content_id.as_deref(), Some("Qm123"));
    assert!(stored.pinned);
    assert_eq!(stored.stage, Stage::Network);

    let webhooks = observed_webhooks(&f.broker);
    assert_eq!(webhooks.len(), 1);
    assert_eq!(webhooks[0].status, WebhookStatus::Success);
    assert_eq!(webhooks[0].content_id.as_deref(), Some("Qm123"));
}

#[tokio::test]
async fn test_single_object_add_failure_publishes_failed_webhook() {
    let mut f = fixture(5);
    f.objects.put("1/a.txt", "hello").unwrap();
    let record = StorageRecord::new(1, 1, "1/a.txt");
    f.records.insert(record.clone());
    f.network.fail_with(Some("daemon offline"));

    f.engine.start().await.unwrap();
    publish(&f.broker, &PinRequest::add(&record));
    wait_until("the failure webhook", || {
        f.broker.depth("webhooks", "observer") == 1
    })
    .await;
    f.engine.stop().await;

    assert!(f.records.updates().is_empty());
    let webhooks = observed_webhooks(&f.broker);
    assert_eq!(webhooks[0].status, WebhookStatus::Failed);
    assert_eq!(webhooks[0].storage_id, 1);
    assert!(!webhooks[0].pinned);
}

#[tokio::test]
async fn test_unpin_without_content_id_is_rejected() {
    let mut f = fixture(5);
    let mut record = StorageRecord::new(2, 1, "1/b.txt");
    record.mark_pinned("QmB".into(), chrono::Utc::now());
    f.records.insert(record.clone());

    f.engine.start().await.unwrap();
    let request = PinRequest {
        content_id: Some(String::new()),
        ..PinRequest::remove(&record)
    };
    publish(&f.broker, &request);
    // a later valid request proves the first was consumed
    publish(&f.broker, &PinRequest::remove(&record));
    wait_until("the valid unpin", || f.network.unpins().len() == 1).await;
    f.engine.stop().await;

    assert_eq!(f.network.unpins(), vec!["QmB"]);
    assert_eq!(f.records.updates().len(), 1);
}

#[tokio::test]
async fn test_malformed_payload_does_not_stop_intake() {
    let mut f = fixture(5);
    f.objects.put("1/a.txt", "hello").unwrap();
    let record = StorageRecord::new(1, 1, "1/a.txt");
    f.records.insert(record.clone());

    f.engine.start().await.unwrap();
    f.broker.publish("pin_requests", b"{not json").unwrap();
    f.broker
        .publish("pin_requests", br#"{"storage_id":0,"key":"x"}"#)
        .unwrap();
    publish(&f.broker, &PinRequest::add(&record));
    wait_until("the valid add", || f.records.updates().len() == 1).await;
    f.engine.stop().await;

    assert_eq!(f.network.adds().len(), 1);
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let mut f = fixture(2);
    f.network.set_delay(Duration::from_millis(40));
    for id in 1..=6 {
        let key = format!("1/f{id}.txt");
        f.objects.put(&key, "x").unwrap();
        f.records.insert(StorageRecord::new(id, 1, key));
    }

    f.engine.start().await.unwrap();
    for id in 1..=6 {
        let record = f.records.record(id).unwrap();
        publish(&f.broker, &PinRequest::add(&record));
    }
    wait_until("all adds", || f.records.updates().len() == 6).await;
    f.engine.stop().await;

    assert_eq!(f.network.peak_in_flight(), 2);
    assert_eq!(f.network.in_flight(), 0);
}

#[tokio::test]
async fn test_stop_drains_in_flight_work() {
    let mut f = fixture(5);
    f.network.set_delay(Duration::from_millis(100));
    f.objects.put("1/a.txt", "x").unwrap();
    let record = StorageRecord::new(1, 1, "1/a.txt");
    f.records.insert(record.clone());

    f.engine.start().await.unwrap();
    publish(&f.broker, &PinRequest::add(&record));
    wait_until("the add to begin", || f.network.in_flight() == 1).await;
    f.engine.stop().await;

    assert_eq!(f.records.updates().len(), 1);
    assert!(!f.engine.is_running());
}

#[tokio::test]
async fn test_lifecycle_errors() {
    let mut f = fixture(5);
    f.engine.stop().await;

    f.engine.start().await.unwrap();
    assert!(matches!(
        f.engine.start().await,
        Err(EngineError::AlreadyRunning)
    ));
    f.engine.stop().await;
    f.engine.stop().await;

    f.engine.start().await.unwrap();
    f.engine.stop().await;
}

#[tokio::test]
async fn test_invalid_topic_fails_start_cleanly() {
    let broker = EmbeddedBroker::in_memory();
    let mut engine = Engine::new(
        EngineConfig {
            webhook_topic: "bad topic".into(),
            ..EngineConfig::default()
        },
        Collaborators {
            transport: Arc::new(broker.clone()),
            objects: Arc::new(MemoryObjectStore::new()),
            network: Arc::new(MemoryNetwork::default()),
            records: Arc::new(MemoryRecordStore::new()),
        },
    );
    assert!(matches!(engine.start().await, Err(EngineError::Queue(_))));
    assert!(!engine.is_running());
}

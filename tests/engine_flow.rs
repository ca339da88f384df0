//! End-to-end engine runs against the embedded broker, a filesystem bucket,
//! a SQLite record store and a local HTTP server standing in for user
//! webhook endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use pinnerd::network::MemoryNetwork;
use pinnerd::queue::{EmbeddedBroker, PinRequest};
use pinnerd::storage::{FilesystemStore, ScratchDirs};
use pinnerd::store::{RecordStore, SqliteRecordStore};
use pinnerd::{Collaborators, Engine, EngineConfig, Stage, StorageRecord, UserWebhookPreference};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const RETRY_BASE: &str = "https://api.example.com";

async fn hook(
    State(tx): State<mpsc::UnboundedSender<Value>>,
    Json(body): Json<Value>,
) -> StatusCode {
    let _ = tx.send(body);
    StatusCode::OK
}

/// Starts a receiver on an ephemeral port; every POSTed body lands on the channel.
async fn webhook_receiver() -> (SocketAddr, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new().route("/hook", post(hook)).with_state(tx);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, rx)
}

struct Stack {
    broker: EmbeddedBroker,
    bucket: FilesystemStore,
    network: MemoryNetwork,
    records: SqliteRecordStore,
    engine: Engine,
    scratch: tempfile::TempDir,
    _root: tempfile::TempDir,
}

fn stack() -> Stack {
    let root = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let broker = EmbeddedBroker::in_memory();
    let bucket = FilesystemStore::open(root.path(), "uploads").unwrap();
    let network = MemoryNetwork::new("bafyflow");
    let records = SqliteRecordStore::memory().unwrap();

    let config = EngineConfig {
        max_concurrent_requests: 1,
        max_concurrent_webhooks: 1,
        persist_retries: 1,
        retry_base_url: RETRY_BASE.into(),
        webhook_timeout: Duration::from_secs(5),
        scratch: ScratchDirs::new(scratch.path(), "flow-"),
        ..EngineConfig::default()
    };
    let engine = Engine::new(
        config,
        Collaborators {
            transport: Arc::new(broker.clone()),
            objects: Arc::new(bucket.clone()),
            network: Arc::new(network.clone()),
            records: Arc::new(records.clone()),
        },
    );
    Stack {
        broker,
        bucket,
        network,
        records,
        engine,
        scratch,
        _root: root,
    }
}

impl Stack {
    fn put(&self, key: &str, body: &str) {
        let path = self.bucket.base_dir().join(key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    async fn record(&self, user: i64, key: &str, dir: bool) -> StorageRecord {
        let mut record = StorageRecord::new(0, user, key);
        if dir {
            record = record.directory();
        }
        record.id = self.records.insert_record(&record).await.unwrap();
        record
    }

    fn publish(&self, request: &PinRequest) {
        let topic = self.engine.config().request_topic.clone();
        self.broker
            .publish(&topic, &request.encode().unwrap())
            .unwrap();
    }
}

async fn next_post(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no webhook arrived")
        .expect("receiver closed")
}

#[tokio::test]
async fn test_add_persists_record_and_posts_success_webhook() {
    let (addr, mut posts) = webhook_receiver().await;
    let mut s = stack();
    s.records
        .upsert_user(
            7,
            &UserWebhookPreference {
                webhooks_active: true,
                webhooks_url: Some(format!("http://{addr}/hook")),
            },
        )
        .await
        .unwrap();
    s.put("7/report.pdf", "%PDF-1.7");
    let record = s.record(7, "7/report.pdf", false).await;

    s.engine.start().await.unwrap();
    s.publish(&PinRequest::add(&record));
    let body = next_post(&mut posts).await;
    s.engine.stop().await;

    assert_eq!(body["status"], "success");
    assert_eq!(body["object"]["id"], record.id);
    assert_eq!(body["object"]["cid"], "bafyflow");
    assert_eq!(body["object"]["pinned"], true);
    assert!(body.get("retry_url").is_none());

    let stored = s.records.get(record.id, Some(7)).await.unwrap();
    assert_eq!(stored.content_id.as_deref(), Some("bafyflow"));
    assert!(stored.pinned);
    assert_eq!(stored.stage, Stage::Network);
}

#[tokio::test]
async fn test_failed_add_posts_retry_url_and_leaves_record() {
    let (addr, mut posts) = webhook_receiver().await;
    let mut s = stack();
    s.records
        .upsert_user(
            3,
            &UserWebhookPreference {
                webhooks_active: true,
                webhooks_url: Some(format!("http://{addr}/hook")),
            },
        )
        .await
        .unwrap();
    s.put("3/photo.jpg", "jpeg");
    let record = s.record(3, "3/photo.jpg", false).await;
    s.network.fail_with(Some("node unreachable"));

    s.engine.start().await.unwrap();
    s.publish(&PinRequest::add(&record));
    let body = next_post(&mut posts).await;
    s.engine.stop().await;

    assert_eq!(body["status"], "failed");
    assert_eq!(
        body["retry_url"],
        format!("{RETRY_BASE}/auth/storage/pin/id/{}", record.id)
    );
    let stored = s.records.get(record.id, None).await.unwrap();
    assert!(!stored.pinned);
    assert_eq!(stored.content_id, None);
    assert_eq!(stored.stage, Stage::Storage);
}

#[tokio::test]
async fn test_disabled_webhooks_are_not_posted() {
    let (addr, mut posts) = webhook_receiver().await;
    let url = format!("http://{addr}/hook");
    let mut s = stack();
    s.records
        .upsert_user(
            1,
            &UserWebhookPreference {
                webhooks_active: false,
                webhooks_url: Some(url.clone()),
            },
        )
        .await
        .unwrap();
    s.records
        .upsert_user(
            2,
            &UserWebhookPreference {
                webhooks_active: true,
                webhooks_url: Some(url),
            },
        )
        .await
        .unwrap();
    s.put("1/quiet.txt", "a");
    s.put("2/loud.txt", "b");
    let quiet = s.record(1, "1/quiet.txt", false).await;
    let loud = s.record(2, "2/loud.txt", false).await;

    s.engine.start().await.unwrap();
    // single-slot loops keep both topics in publish order
    s.publish(&PinRequest::add(&quiet));
    s.publish(&PinRequest::add(&loud));
    let body = next_post(&mut posts).await;
    s.engine.stop().await;

    assert_eq!(body["object"]["id"], loud.id);
    assert!(posts.try_recv().is_err());
    assert!(s.records.get(quiet.id, None).await.unwrap().pinned);
}

#[tokio::test]
async fn test_directory_add_cleans_scratch() {
    let mut s = stack();
    s.put("5/site/index.html", "<html>");
    s.put("5/site/assets/app.js", "main()");
    s.put("5/other/skip.txt", "no");
    let record = s.record(5, "5/site", true).await;

    s.engine.start().await.unwrap();
    s.publish(&PinRequest::add(&record));
    for _ in 0..200 {
        if s.records.get(record.id, None).await.unwrap().pinned {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    s.engine.stop().await;

    assert!(s.records.get(record.id, None).await.unwrap().pinned);
    let adds = s.network.adds();
    assert_eq!(adds.len(), 1);
    match &adds[0].kind {
        pinnerd::network::AddKind::Directory { files, .. } => {
            let mut files = files.clone();
            files.sort();
            assert_eq!(files, vec!["site/assets/app.js", "site/index.html"]);
        },
        other => panic!("expected a directory add, got {other:?}"),
    }
    assert_eq!(std::fs::read_dir(s.scratch.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_unpin_clears_pinned_state() {
    let mut s = stack();
    let mut record = StorageRecord::new(0, 4, "4/old.bin");
    record.mark_pinned("bafyold".into(), chrono::Utc::now());
    record.id = s.records.insert_record(&record).await.unwrap();

    s.engine.start().await.unwrap();
    s.publish(&PinRequest::remove(&record));
    for _ in 0..200 {
        if !s.network.unpins().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    s.engine.stop().await;

    assert_eq!(s.network.unpins(), vec!["bafyold"]);
    let stored = s.records.get(record.id, None).await.unwrap();
    assert!(!stored.pinned);
    assert_eq!(stored.stage, Stage::Storage);
}

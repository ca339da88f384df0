//! Daemon bootstrap: builds real collaborators from [`Config`] and runs the
//! engine until SIGINT or SIGTERM.

use crate::config::{Config, StorageBackend, TransportKind};
use crate::engine::{Collaborators, Engine};
use crate::network::{ContentNetwork, IpfsClient};
use crate::queue::{BrokerConfig, EmbeddedBroker, NsqConfig, NsqTransport, PinRequest, Transport};
use crate::reliability::{RetryPolicy, retry_anyhow};
use crate::storage::{FilesystemStore, ObjectStore};
use crate::store::SqliteRecordStore;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

fn nsq_config(config: &Config) -> NsqConfig {
    let queue = &config.queue;
    let lookupd_addresses = Some(queue.lookupd_address.trim())
        .filter(|address| !address.is_empty())
        .map(str::to_string)
        .into_iter()
        .collect();
    NsqConfig {
        lookupd_addresses,
        nsqd_address: queue.nsqd_address.clone(),
        max_in_flight: queue.max_in_flight,
        lookupd_poll_interval: Duration::from_secs(queue.lookupd_poll_interval_secs),
        client_id: format!("pinnerd-{}", uuid::Uuid::new_v4().simple()),
    }
}

/// Builds the configured queue transport.
///
/// For NSQ with a lookupd address, discovery is probed (with retries) so a
/// wrong address fails startup instead of silently consuming nothing.
///
/// # Errors
///
/// Returns an error if the embedded broker database cannot be opened or
/// nsqlookupd stays unreachable.
pub async fn build_transport(config: &Config) -> Result<Arc<dyn Transport>> {
    match config.queue.transport {
        TransportKind::Embedded => {
            let broker = EmbeddedBroker::new(BrokerConfig {
                db_path: config.queue.embedded_db.clone(),
                ..BrokerConfig::default()
            })
            .context("Failed to open embedded broker")?;
            Ok(Arc::new(broker))
        },
        TransportKind::Nsq => {
            let http = reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .context("Failed to build lookupd HTTP client")?;
            let transport = NsqTransport::new(nsq_config(config), http);
            if !transport.lookup().is_empty() {
                let topic = config.queue.subscribe_topic.as_str();
                let lookup = transport.lookup();
                let producers =
                    retry_anyhow(RetryPolicy::network(), "nsqlookupd discovery", || async move {
                        Ok::<_, anyhow::Error>(lookup.producers(topic).await?)
                    })
                    .await
                    .with_context(|| {
                        format!(
                            "Failed to reach nsqlookupd at {}",
                            config.queue.lookupd_address
                        )
                    })?;
                tracing::info!(topic, producers = producers.len(), "nsqlookupd reachable");
            }
            Ok(Arc::new(transport))
        },
    }
}

/// Builds the configured object store.
///
/// # Errors
///
/// Returns an error if the filesystem bucket cannot be opened or S3 support
/// was not compiled in.
pub async fn build_object_store(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    let storage = &config.storage;
    match storage.backend {
        StorageBackend::Filesystem => {
            let root = storage
                .root
                .as_ref()
                .context("storage.root is required for the filesystem backend")?;
            let store = FilesystemStore::open(root, &storage.bucket)
                .with_context(|| format!("Failed to open bucket under {}", root.display()))?;
            Ok(Arc::new(store))
        },
        #[cfg(feature = "s3")]
        StorageBackend::S3 => {
            let settings = crate::storage::S3Settings {
                bucket: storage.bucket.clone(),
                region: storage.region.clone(),
                endpoint: storage.endpoint.clone(),
                access_key_id: storage.access_key_id.clone(),
                access_key_secret: storage.access_key_secret.clone(),
                force_path_style: storage.force_path_style,
            };
            Ok(Arc::new(crate::storage::S3Store::connect(&settings).await))
        },
        #[cfg(not(feature = "s3"))]
        StorageBackend::S3 => anyhow::bail!("this build does not include S3 support"),
    }
}

/// Builds the content network client.
///
/// # Errors
///
/// Returns an error if the API address is invalid or, in local mode, the
/// local repo's api file cannot be read.
pub fn build_network(config: &Config) -> Result<Arc<dyn ContentNetwork>> {
    let timeout = Duration::from_secs(config.network.timeout_secs);
    let client = if config.network.local {
        IpfsClient::local(timeout).context("Failed to locate local IPFS node")?
    } else {
        IpfsClient::new(&config.network.api_url, timeout)
            .context("Failed to create IPFS client")?
    };
    tracing::info!(api = %client.base_url(), "content network client ready");
    Ok(Arc::new(client))
}

/// Builds every collaborator the engine needs.
///
/// # Errors
///
/// Returns the first construction error.
pub async fn collaborators(config: &Config) -> Result<Collaborators> {
    let records = SqliteRecordStore::open(&config.database.path).with_context(|| {
        format!(
            "Failed to open database: {}",
            config.database.path.display()
        )
    })?;
    Ok(Collaborators {
        transport: build_transport(config).await?,
        objects: build_object_store(config).await?,
        network: build_network(config)?,
        records: Arc::new(records),
    })
}

/// Runs the daemon until a shutdown signal, then drains and stops.
///
/// # Errors
///
/// Returns an error if startup fails.
pub async fn run(config: Config) -> Result<()> {
    if let Some(listen) = config.metrics.listen {
        crate::metrics::install(listen)?;
    }

    let collaborators = collaborators(&config).await?;
    let mut engine = Engine::new(config.engine_config(), collaborators);
    engine.start().await.context("Failed to start engine")?;

    shutdown_signal().await?;
    tracing::info!("shutdown signal received, draining");
    engine.stop().await;
    Ok(())
}

/// Publishes one request onto the request topic, for operators re-driving
/// items by hand.
///
/// # Errors
///
/// Returns an error for the embedded transport (its queue lives inside the
/// daemon) or if publishing fails.
pub async fn publish_request(config: &Config, request: &PinRequest) -> Result<()> {
    if config.queue.transport == TransportKind::Embedded {
        anyhow::bail!(
            "publishing requires queue.transport = \"nsq\"; \
             the embedded queue lives inside the daemon"
        );
    }
    request.validate()?;
    let body = request.encode()?;

    let transport = NsqTransport::new(nsq_config(config), reqwest::Client::new());
    let publisher = transport.publisher().await?;
    let result = publisher.publish(&config.queue.request_topic, &body).await;
    publisher.stop().await;
    result.with_context(|| {
        format!(
            "Failed to publish to {} on {}",
            config.queue.request_topic, config.queue.nsqd_address
        )
    })?;
    tracing::info!(
        storage_id = request.storage_id,
        op = request.operation(),
        topic = %config.queue.request_topic,
        "request published"
    );
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl+C")?,
            _ = terminate.recv() => {},
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nsq_config_without_lookupd() {
        let mut config = Config::default();
        config.queue.lookupd_address = "  ".into();
        let nsq = nsq_config(&config);
        assert!(nsq.lookupd_addresses.is_empty());
        assert!(nsq.client_id.starts_with("pinnerd-"));
    }

    #[tokio::test]
    async fn test_embedded_transport_refuses_cli_publish() {
        let mut config = Config::default();
        config.queue.transport = TransportKind::Embedded;
        let request = PinRequest {
            storage_id: 1,
            storage_key: "1/a".into(),
            ..PinRequest::default()
        };
        assert!(publish_request(&config, &request).await.is_err());
    }

    #[tokio::test]
    async fn test_filesystem_store_requires_root() {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Filesystem;
        config.storage.bucket = "b".into();
        assert!(build_object_store(&config).await.is_err());

        let root = tempfile::tempdir().unwrap();
        config.storage.root = Some(root.path().to_path_buf());
        assert!(build_object_store(&config).await.is_ok());
    }
}

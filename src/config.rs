//! Configuration for the pinnerd daemon.
//!
//! Loaded from a TOML file. Every section is optional and falls back to the
//! defaults in [`crate::constants`]:
//!
//! - [`EngineSection`] - concurrency, buffering, persistence retries
//! - [`QueueSection`] - transport, topics, NSQ addresses
//! - [`StorageSection`] - object storage backend and scratch directories
//! - [`NetworkSection`] - content network API
//! - [`DatabaseSection`] - SQLite path
//! - [`WebhooksSection`] - retry URL base and delivery timeout
//! - [`LoggingSection`], [`MetricsSection`] - ambient concerns

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants;
use crate::engine::EngineConfig;
use crate::queue::validate_name;
use crate::storage::ScratchDirs;

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Non-fatal warnings that should be logged but don't prevent operation.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if there are any warnings.
    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// pinnerd.toml configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineSection,
    pub queue: QueueSection,
    pub storage: StorageSection,
    pub network: NetworkSection,
    pub database: DatabaseSection,
    pub webhooks: WebhooksSection,
    pub logging: LoggingSection,
    pub metrics: MetricsSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// In-flight pin/unpin operations. `0` falls back to the default.
    pub max_concurrent_requests: usize,
    pub max_concurrent_webhooks: usize,
    pub intake_buffer: usize,
    pub persist_retries: u32,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_concurrent_requests: constants::DEFAULT_MAX_CONCURRENT_REQUESTS,
            max_concurrent_webhooks: constants::DEFAULT_MAX_CONCURRENT_WEBHOOKS,
            intake_buffer: constants::DEFAULT_INTAKE_BUFFER,
            persist_retries: constants::DEFAULT_PERSIST_RETRIES,
        }
    }
}

/// Which queue the daemon talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Nsq,
    Embedded,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub transport: TransportKind,
    pub lookupd_address: String,
    pub nsqd_address: String,
    /// Topic consumed for pin/unpin requests.
    pub subscribe_topic: String,
    pub channel: String,
    /// Topic `pinnerd pin`/`unpin` publish to.
    pub request_topic: String,
    pub webhook_topic: String,
    pub max_in_flight: u32,
    pub lookupd_poll_interval_secs: u64,
    /// redb file for the embedded broker; in-memory when unset.
    pub embedded_db: Option<PathBuf>,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            lookupd_address: constants::DEFAULT_LOOKUPD_ADDRESS.to_string(),
            nsqd_address: constants::DEFAULT_NSQD_ADDRESS.to_string(),
            subscribe_topic: constants::DEFAULT_REQUEST_TOPIC.to_string(),
            channel: constants::DEFAULT_CHANNEL.to_string(),
            request_topic: constants::DEFAULT_REQUEST_TOPIC.to_string(),
            webhook_topic: constants::DEFAULT_WEBHOOK_TOPIC.to_string(),
            max_in_flight: constants::DEFAULT_MAX_IN_FLIGHT,
            lookupd_poll_interval_secs: constants::DEFAULT_LOOKUPD_POLL_INTERVAL_SECS,
            embedded_db: None,
        }
    }
}

/// Object storage backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    S3,
    Filesystem,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub backend: StorageBackend,
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key_id: Option<String>,
    pub access_key_secret: Option<String>,
    pub force_path_style: bool,
    /// Directory holding buckets for the filesystem backend.
    pub root: Option<PathBuf>,
    /// Parent of scratch directories; the system temp dir when unset.
    pub scratch_dir: Option<PathBuf>,
    pub scratch_prefix: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            bucket: String::new(),
            endpoint: None,
            region: constants::DEFAULT_S3_REGION.to_string(),
            access_key_id: None,
            access_key_secret: None,
            force_path_style: false,
            root: None,
            scratch_dir: None,
            scratch_prefix: constants::DEFAULT_SCRATCH_PREFIX.to_string(),
        }
    }
}

impl StorageSection {
    pub fn scratch(&self) -> ScratchDirs {
        match &self.scratch_dir {
            Some(dir) => ScratchDirs::new(dir, self.scratch_prefix.clone()),
            None => ScratchDirs::in_temp_dir(self.scratch_prefix.clone()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub api_url: String,
    /// Read the API address from the local IPFS repo instead of `api_url`.
    pub local: bool,
    pub timeout_secs: u64,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            api_url: constants::DEFAULT_NETWORK_API_URL.to_string(),
            local: false,
            timeout_secs: constants::DEFAULT_NETWORK_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from(constants::DEFAULT_DATABASE_PATH),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhooksSection {
    pub retry_base_url: String,
    pub timeout_secs: u64,
}

impl Default for WebhooksSection {
    fn default() -> Self {
        Self {
            retry_base_url: String::new(),
            timeout_secs: constants::DEFAULT_WEBHOOK_TIMEOUT_SECS,
        }
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub debug: bool,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    /// Prometheus listener address; no exporter when unset.
    pub listen: Option<SocketAddr>,
}

fn check_http_url(errors: &mut Vec<String>, field: &str, value: &str) {
    match url::Url::parse(value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {},
        Ok(url) => errors.push(format!(
            "{field} must be an http(s) URL (got scheme '{}')",
            url.scheme()
        )),
        Err(e) => errors.push(format!("{field} is not a valid URL '{value}': {e}")),
    }
}

impl Config {
    /// Load configuration from the specified path.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read (IO error)
    /// - The file contains invalid TOML syntax
    /// - A field has an invalid type or value
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration with comprehensive checks.
    ///
    /// Returns a `ValidationResult` containing any non-fatal warnings.
    ///
    /// # Errors
    ///
    /// Returns an error listing every problem found, for example:
    /// - Missing bucket or filesystem root
    /// - Malformed URLs
    /// - Topic or channel names the queue would reject
    pub fn validate(&self) -> Result<ValidationResult> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        // 1. Engine
        if self.engine.max_concurrent_requests == 0 {
            warnings.push(format!(
                "engine.max_concurrent_requests is 0, using {}",
                constants::DEFAULT_MAX_CONCURRENT_REQUESTS
            ));
        }
        if self.engine.max_concurrent_webhooks == 0 {
            warnings.push(format!(
                "engine.max_concurrent_webhooks is 0, using {}",
                constants::DEFAULT_MAX_CONCURRENT_WEBHOOKS
            ));
        }
        if self.engine.intake_buffer == 0 {
            errors.push("engine.intake_buffer must be at least 1".to_string());
        }

        // 2. Queue
        let queue = &self.queue;
        for (field, name) in [
            ("queue.subscribe_topic", &queue.subscribe_topic),
            ("queue.request_topic", &queue.request_topic),
            ("queue.webhook_topic", &queue.webhook_topic),
            ("queue.channel", &queue.channel),
        ] {
            if validate_name(name).is_err() {
                errors.push(format!(
                    "{field} '{name}' must be 1-64 characters of [.a-zA-Z0-9_-], \
                     optionally ending in #ephemeral"
                ));
            }
        }
        if queue.subscribe_topic == queue.webhook_topic {
            errors.push("queue.subscribe_topic and queue.webhook_topic must differ".to_string());
        }
        match queue.transport {
            TransportKind::Nsq => {
                if queue.lookupd_address.trim().is_empty() {
                    warnings.push(
                        "queue.lookupd_address is empty, consuming directly from queue.nsqd_address"
                            .to_string(),
                    );
                } else {
                    check_http_url(&mut errors, "queue.lookupd_address", &queue.lookupd_address);
                }
                if queue.nsqd_address.trim().is_empty() {
                    errors.push("queue.nsqd_address cannot be empty".to_string());
                }
                if queue.max_in_flight == 0 {
                    errors.push("queue.max_in_flight must be at least 1".to_string());
                }
                if queue.lookupd_poll_interval_secs == 0 {
                    errors.push("queue.lookupd_poll_interval_secs must be at least 1".to_string());
                }
                if queue.embedded_db.is_some() {
                    warnings.push(
                        "queue.embedded_db is ignored unless queue.transport = \"embedded\""
                            .to_string(),
                    );
                }
            },
            TransportKind::Embedded => {
                if queue.embedded_db.is_none() {
                    warnings.push(
                        "embedded queue has no embedded_db, messages are lost on restart"
                            .to_string(),
                    );
                }
            },
        }

        // 3. Storage
        let storage = &self.storage;
        if storage.bucket.trim().is_empty() {
            errors.push("storage.bucket cannot be empty".to_string());
        }
        match storage.backend {
            StorageBackend::S3 => {
                if !cfg!(feature = "s3") {
                    errors.push(
                        "storage.backend = \"s3\" needs a build with the s3 feature".to_string(),
                    );
                }
                if let Some(endpoint) = &storage.endpoint {
                    check_http_url(&mut errors, "storage.endpoint", endpoint);
                }
                if storage.access_key_id.is_some() != storage.access_key_secret.is_some() {
                    errors.push(
                        "storage.access_key_id and storage.access_key_secret must be set together"
                            .to_string(),
                    );
                }
            },
            StorageBackend::Filesystem => match &storage.root {
                None => {
                    errors.push("storage.root is required for the filesystem backend".to_string());
                },
                Some(root) if !root.is_dir() => warnings.push(format!(
                    "storage.root does not exist: {}",
                    root.display()
                )),
                Some(_) => {},
            },
        }
        if let Some(dir) = &storage.scratch_dir
            && dir.exists()
            && !dir.is_dir()
        {
            errors.push(format!(
                "storage.scratch_dir is not a directory: {}",
                dir.display()
            ));
        }

        // 4. Network
        if !self.network.local {
            check_http_url(&mut errors, "network.api_url", &self.network.api_url);
        }
        if self.network.timeout_secs == 0 {
            errors.push("network.timeout_secs must be at least 1".to_string());
        }

        // 5. Database
        if self.database.path.as_os_str().is_empty() {
            errors.push("database.path cannot be empty".to_string());
        }

        // 6. Webhooks
        if self.webhooks.retry_base_url.trim().is_empty() {
            warnings.push(
                "webhooks.retry_base_url is empty, failure webhooks will carry a relative retry_url"
                    .to_string(),
            );
        } else {
            check_http_url(&mut errors, "webhooks.retry_base_url", &self.webhooks.retry_base_url);
        }
        if self.webhooks.timeout_secs == 0 {
            errors.push("webhooks.timeout_secs must be at least 1".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }

        Ok(ValidationResult { warnings })
    }

    /// Engine settings with zero concurrency replaced by the defaults.
    pub fn engine_config(&self) -> EngineConfig {
        let or_default = |value: usize, default: usize| if value == 0 { default } else { value };
        EngineConfig {
            max_concurrent_requests: or_default(
                self.engine.max_concurrent_requests,
                constants::DEFAULT_MAX_CONCURRENT_REQUESTS,
            ),
            max_concurrent_webhooks: or_default(
                self.engine.max_concurrent_webhooks,
                constants::DEFAULT_MAX_CONCURRENT_WEBHOOKS,
            ),
            intake_buffer: self.engine.intake_buffer.max(1),
            persist_retries: self.engine.persist_retries,
            request_topic: self.queue.subscribe_topic.clone(),
            webhook_topic: self.queue.webhook_topic.clone(),
            channel: self.queue.channel.clone(),
            retry_base_url: self.webhooks.retry_base_url.clone(),
            webhook_timeout: Duration::from_secs(self.webhooks.timeout_secs),
            scratch: self.storage.scratch(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        toml::from_str(
            r#"
[queue]
transport = "embedded"
embedded_db = "/tmp/queue.redb"

[storage]
backend = "filesystem"
bucket = "uploads"
root = "/"

[webhooks]
retry_base_url = "https://api.example.com"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.engine.max_concurrent_requests, 5);
        assert_eq!(config.engine.max_concurrent_webhooks, 10);
        assert_eq!(config.engine.persist_retries, 2);
        assert_eq!(config.queue.transport, TransportKind::Nsq);
        assert_eq!(config.queue.subscribe_topic, "pin_requests");
        assert_eq!(config.queue.webhook_topic, "webhooks");
        assert_eq!(config.storage.backend, StorageBackend::S3);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.metrics.listen.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
[engine]
max_concurrent_requests = 8
persist_retries = 0

[queue]
lookupd_address = "http://nsqlookupd:4161"
nsqd_address = "nsqd:4150"
channel = "pinner-eu"

[storage]
bucket = "uploads"
endpoint = "http://minio:9000"
access_key_id = "key"
access_key_secret = "secret"
force_path_style = true
scratch_prefix = "pin-"

[network]
local = true

[logging]
debug = true
format = "text"

[metrics]
listen = "127.0.0.1:9464"
"#,
        )
        .unwrap();
        assert_eq!(config.engine.max_concurrent_requests, 8);
        assert_eq!(config.queue.channel, "pinner-eu");
        assert!(config.storage.force_path_style);
        assert!(config.network.local);
        assert_eq!(config.logging.format, LogFormat::Text);
        assert_eq!(
            config.metrics.listen,
            Some("127.0.0.1:9464".parse().unwrap())
        );

        let engine = config.engine_config();
        assert_eq!(engine.max_concurrent_requests, 8);
        assert_eq!(engine.persist_retries, 0);
    }

    #[test]
    fn test_validate_valid_config() {
        let result = valid().validate().unwrap();
        assert!(!result.has_warnings(), "{:?}", result.warnings);
    }

    #[test]
    fn test_zero_concurrency_falls_back_with_warning() {
        let mut config = valid();
        config.engine.max_concurrent_requests = 0;
        let result = config.validate().unwrap();
        assert!(result.warnings[0].contains("max_concurrent_requests"));
        assert_eq!(config.engine_config().max_concurrent_requests, 5);
    }

    #[test]
    fn test_validate_collects_every_error() {
        let mut config = valid();
        config.storage.bucket = String::new();
        config.webhooks.retry_base_url = "not a url".into();
        config.queue.channel = "bad channel".into();
        config.storage.root = None;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("storage.bucket"));
        assert!(err.contains("webhooks.retry_base_url"));
        assert!(err.contains("queue.channel"));
        assert!(err.contains("storage.root"));
    }

    #[test]
    fn test_validate_nsq_settings() {
        let mut config = valid();
        config.queue.transport = TransportKind::Nsq;
        config.queue.embedded_db = None;
        config.queue.lookupd_address = "ftp://lookup".into();
        config.queue.max_in_flight = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("queue.lookupd_address"));
        assert!(err.contains("queue.max_in_flight"));
    }

    #[test]
    fn test_unknown_transport_is_a_parse_error() {
        let result: Result<Config, _> = toml::from_str("[queue]\ntransport = \"kafka\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pinnerd.toml");
        fs::write(&path, "[storage]\nbucket = \"b\"\n").unwrap();
        assert_eq!(Config::load_from(&path).unwrap().storage.bucket, "b");
        assert!(Config::load_from(dir.path().join("missing.toml")).is_err());
    }
}

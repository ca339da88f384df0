//! Webhook notifications: publishing outcomes and delivering them over HTTP.

use crate::constants::RETRY_PIN_PATH;
use crate::error::Result;
use crate::model::StorageRecord;
use crate::queue::{Publisher, WebhookMessage, WebhookRequest, WebhookStatus};
use crate::store::RecordStore;
use std::sync::Arc;
use std::time::Duration;

/// Publishes add outcomes onto the webhook topic.
#[derive(Clone)]
pub struct Notifier {
    publisher: Arc<dyn Publisher>,
    topic: String,
}

impl Notifier {
    pub fn new(publisher: Arc<dyn Publisher>, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
        }
    }

    /// Publishes a notification built from `record`.
    ///
    /// Failures are logged; the outcome itself has already happened.
    pub async fn notify(&self, record: &StorageRecord, status: WebhookStatus) {
        if let Err(e) = self.publish(record, status).await {
            tracing::error!(
                storage_id = record.id,
                %status,
                topic = %self.topic,
                error = %e,
                "failed to publish webhook"
            );
        }
    }

    async fn publish(&self, record: &StorageRecord, status: WebhookStatus) -> Result<()> {
        let body = WebhookMessage::from_record(record, status).encode()?;
        self.publisher.publish(&self.topic, &body).await?;
        tracing::debug!(storage_id = record.id, %status, "webhook published");
        Ok(())
    }
}

/// What happened to one webhook message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// POSTed; the receiver answered with this status.
    Sent { status: u16 },
    /// The owner does not exist.
    UnknownUser,
    /// The owner has webhooks switched off or no URL.
    Disabled,
}

impl Delivery {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent { .. } => "sent",
            Self::UnknownUser => "unknown_user",
            Self::Disabled => "disabled",
        }
    }
}

/// Builds the manual re-pin URL for a storage record.
pub fn retry_url(base: &str, storage_id: i64) -> String {
    format!("{}{RETRY_PIN_PATH}/{storage_id}", base.trim_end_matches('/'))
}

/// Delivers webhook messages to their owners' endpoints.
#[derive(Clone)]
pub struct WebhookSender {
    records: Arc<dyn RecordStore>,
    http: reqwest::Client,
    retry_base_url: String,
}

impl WebhookSender {
    /// Creates a sender whose POSTs time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        records: Arc<dyn RecordStore>,
        retry_base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pinnerd/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            records,
            http,
            retry_base_url: retry_base_url.into(),
        })
    }

    /// Delivers one message, at most one POST.
    ///
    /// Any HTTP status counts as delivered.
    ///
    /// # Errors
    ///
    /// Returns an error if the preference lookup or the request fails.
    pub async fn deliver(&self, message: &WebhookMessage) -> Result<Delivery> {
        let Some(preference) = self.records.webhook_preference(message.user_id).await? else {
            tracing::warn!(
                user_id = message.user_id,
                storage_id = message.storage_id,
                "webhook owner not found, dropping"
            );
            return Ok(Delivery::UnknownUser);
        };
        let Some(url) = preference.delivery_url() else {
            tracing::debug!(user_id = message.user_id, "webhooks disabled for user");
            return Ok(Delivery::Disabled);
        };

        let retry_url = (message.status == WebhookStatus::Failed)
            .then(|| retry_url(&self.retry_base_url, message.storage_id));
        let body = WebhookRequest {
            object: message,
            status: message.status,
            retry_url,
        };

        let response = self.http.post(url).json(&body).send().await?;
        let status = response.status().as_u16();
        tracing::debug!(
            storage_id = message.storage_id,
            url,
            status,
            "webhook delivered"
        );
        Ok(Delivery::Sent { status })
    }
}

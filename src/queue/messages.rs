//! Wire formats for queue messages.
//!
//! Both message types travel as JSON. Decoding validates the fields the
//! engine depends on, so anything that comes out of [`PinRequest::decode`]
//! can be dispatched without further checks.

use crate::error::PinError;
use crate::model::{Stage, StorageRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

fn is_false(value: &bool) -> bool {
    !*value
}

/// Request to add or remove a stored upload on the content network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinRequest {
    /// Primary key of the storage record.
    pub storage_id: i64,
    /// Content identifier; required when `unpin` is set.
    #[serde(rename = "cid", default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    /// Whether `key` is a directory prefix.
    #[serde(rename = "dir", default, skip_serializing_if = "is_false")]
    pub is_directory: bool,
    /// Object storage key or prefix.
    #[serde(rename = "key", default)]
    pub storage_key: String,
    /// Free-form provenance tag.
    #[serde(rename = "src", default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unpin: bool,
    /// Owner of the record; scopes the record lookup when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    /// Unpin even if the record says it is not pinned.
    #[serde(default, skip_serializing_if = "is_false")]
    pub force: bool,
}

impl PinRequest {
    /// Builds an add request for a record.
    pub fn add(record: &StorageRecord) -> Self {
        Self {
            storage_id: record.id,
            is_directory: record.is_directory,
            storage_key: record.storage_key.clone(),
            user_id: Some(record.owner_user_id),
            ..Self::default()
        }
    }

    /// Builds an unpin request for a record.
    pub fn remove(record: &StorageRecord) -> Self {
        Self {
            content_id: record.content_id.clone(),
            unpin: true,
            ..Self::add(record)
        }
    }

    /// Sets the provenance tag.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Decodes and validates a queue payload.
    ///
    /// # Errors
    ///
    /// Returns [`PinError::Decode`] for malformed JSON and
    /// [`PinError::Invalid`] when required fields are missing.
    pub fn decode(raw: &[u8]) -> Result<Self, PinError> {
        let request: Self = serde_json::from_slice(raw)?;
        request.validate()?;
        Ok(request)
    }

    /// Encodes the request as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, PinError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Checks the fields the engine relies on.
    ///
    /// The content id of an unpin is deliberately not checked here: a
    /// missing id is a precondition failure of the unpin itself.
    ///
    /// # Errors
    ///
    /// Returns [`PinError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), PinError> {
        if self.storage_id <= 0 {
            return Err(PinError::invalid(format!(
                "storage_id must be positive (got {})",
                self.storage_id
            )));
        }
        if !self.unpin && self.storage_key.trim().is_empty() {
            return Err(PinError::invalid(format!(
                "key is required to add storage record {}",
                self.storage_id
            )));
        }
        Ok(())
    }

    /// Operation label for logs and metrics.
    pub fn operation(&self) -> &'static str {
        if self.unpin { "unpin" } else { "add" }
    }
}

/// Outcome carried by a webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Success,
    Failed,
}

impl WebhookStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification describing the outcome of an add.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookMessage {
    /// Storage record id.
    #[serde(rename = "id")]
    pub storage_id: i64,
    /// Owner; used downstream to look up the delivery preference.
    pub user_id: i64,
    #[serde(rename = "cid", default)]
    pub content_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "meta", default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub stage: Option<Stage>,
    #[serde(default)]
    pub pinned: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub status: WebhookStatus,
}

impl WebhookMessage {
    /// Builds a notification from the record state at the time of the outcome.
    pub fn from_record(record: &StorageRecord, status: WebhookStatus) -> Self {
        Self {
            storage_id: record.id,
            user_id: record.owner_user_id,
            content_id: record.content_id.clone(),
            name: record.name.clone(),
            metadata: record.metadata.clone(),
            stage: Some(record.stage),
            pinned: record.pinned,
            created_at: record.created_at,
            updated_at: record.updated_at,
            deleted_at: record.deleted_at,
            status,
        }
    }

    /// Decodes a queue payload.
    ///
    /// # Errors
    ///
    /// Returns [`PinError::Decode`] for malformed JSON and
    /// [`PinError::Invalid`] for a non-positive id.
    pub fn decode(raw: &[u8]) -> Result<Self, PinError> {
        let message: Self = serde_json::from_slice(raw)?;
        if message.storage_id <= 0 {
            return Err(PinError::invalid(format!(
                "webhook id must be positive (got {})",
                message.storage_id
            )));
        }
        Ok(message)
    }

    /// Encodes the message as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, PinError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Body POSTed to a user's webhook URL.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookRequest<'a> {
    pub object: &'a WebhookMessage,
    pub status: WebhookStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_url: Option<String>,
}

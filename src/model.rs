//! Storage records and the facts the engine reads about their owners.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where a record's authoritative bytes currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Only in object storage (before a pin, or after an unpin).
    #[default]
    Storage,
    /// Added to the content network.
    Network,
}

impl Stage {
    /// Wire and column representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Storage => "storage",
            Self::Network => "network",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "storage" => Ok(Self::Storage),
            "network" => Ok(Self::Network),
            other => Err(format!("unknown stage '{other}'")),
        }
    }
}

/// A stored upload and its replication state.
///
/// Created by the upload flow; the engine only reads and updates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRecord {
    pub id: i64,
    pub owner_user_id: i64,
    /// Set only after a successful add.
    pub content_id: Option<String>,
    pub is_directory: bool,
    pub storage_key: String,
    pub stage: Stage,
    pub pinned: bool,
    pub name: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl StorageRecord {
    /// Creates a fresh, unpinned record as the upload flow would.
    pub fn new(id: i64, owner_user_id: i64, storage_key: impl Into<String>) -> Self {
        let storage_key = storage_key.into();
        let now = Utc::now();
        let name = storage_key
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        Self {
            id,
            owner_user_id,
            content_id: None,
            is_directory: false,
            storage_key,
            stage: Stage::Storage,
            pinned: false,
            name,
            metadata: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Marks the record as a directory upload.
    #[must_use]
    pub fn directory(mut self) -> Self {
        self.is_directory = true;
        self
    }

    /// Returns true when `pinned` implies a content id and the network stage.
    pub fn is_consistent(&self) -> bool {
        !self.pinned
            || (self.content_id.as_deref().is_some_and(|cid| !cid.is_empty())
                && self.stage == Stage::Network)
    }

    /// Applies a successful add.
    pub fn mark_pinned(&mut self, content_id: String, at: DateTime<Utc>) {
        self.content_id = Some(content_id);
        self.stage = Stage::Network;
        self.pinned = true;
        self.updated_at = at;
    }

    /// Applies a successful unpin. The content id is kept for history.
    pub fn mark_unpinned(&mut self, at: DateTime<Utc>) {
        self.stage = Stage::Storage;
        self.pinned = false;
        self.updated_at = at;
    }
}

/// Columns the engine is allowed to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    ContentId,
    Stage,
    Pinned,
    UpdatedAt,
}

impl Column {
    /// Columns written after a successful add.
    pub const PINNED: &'static [Self] = &[
        Self::Stage,
        Self::ContentId,
        Self::UpdatedAt,
        Self::Pinned,
    ];

    /// Columns written after a successful unpin.
    pub const UNPINNED: &'static [Self] = &[Self::Stage, Self::UpdatedAt, Self::Pinned];

    /// SQL column name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::ContentId => "cid",
            Self::Stage => "upload_stage",
            Self::Pinned => "pinned",
            Self::UpdatedAt => "updated_at",
        }
    }
}

/// A user's webhook delivery preference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserWebhookPreference {
    pub webhooks_active: bool,
    pub webhooks_url: Option<String>,
}

impl UserWebhookPreference {
    /// Returns the delivery URL if webhooks are active and a URL is configured.
    pub fn delivery_url(&self) -> Option<&str> {
        if !self.webhooks_active {
            return None;
        }
        self.webhooks_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

//! Executes pin and unpin requests against storage and the content network.

use super::notifier::Notifier;
use super::updater::StateUpdater;
use crate::error::{PinError, Result};
use crate::model::StorageRecord;
use crate::network::ContentNetwork;
use crate::queue::{PinRequest, WebhookStatus};
use crate::storage::{ObjectStore, ScratchDirs, scratch};
use crate::store::RecordStore;
use std::sync::Arc;

/// Result of a request that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Content was added and the record marked pinned.
    Pinned { content_id: String },
    /// Content was unpinned and the record marked unpinned.
    Unpinned,
    /// The record was already unpinned; nothing was done.
    Skipped,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pinned { .. } => "pinned",
            Self::Unpinned => "unpinned",
            Self::Skipped => "skipped",
        }
    }
}

/// Runs one [`PinRequest`] end to end.
pub struct PinExecutor {
    objects: Arc<dyn ObjectStore>,
    network: Arc<dyn ContentNetwork>,
    records: Arc<dyn RecordStore>,
    updater: StateUpdater,
    notifier: Notifier,
    scratch: ScratchDirs,
}

impl PinExecutor {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        network: Arc<dyn ContentNetwork>,
        records: Arc<dyn RecordStore>,
        updater: StateUpdater,
        notifier: Notifier,
        scratch: ScratchDirs,
    ) -> Self {
        Self {
            objects,
            network,
            records,
            updater,
            notifier,
            scratch,
        }
    }

    /// Runs the request.
    ///
    /// # Errors
    ///
    /// Returns the error that ended processing. A failed add has already
    /// published its failure webhook by the time this returns.
    pub async fn execute(&self, request: &PinRequest) -> Result<Outcome> {
        if request.unpin {
            self.unpin(request).await
        } else {
            self.add(request).await
        }
    }

    async fn add(&self, request: &PinRequest) -> Result<Outcome> {
        let record = self
            .records
            .get(request.storage_id, request.user_id)
            .await?;

        let content_id = match self.add_content(request).await {
            Ok(content_id) => content_id,
            Err(e) => {
                tracing::warn!(
                    key = %request.storage_key,
                    dir = request.is_directory,
                    source = request.source.as_deref().unwrap_or_default(),
                    error = %e,
                    "add failed"
                );
                self.notifier.notify(&record, WebhookStatus::Failed).await;
                return Err(e);
            },
        };

        let record = match self.updater.mark_pinned(record, content_id.clone()).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(
                    cid = %content_id,
                    error = %e,
                    "content pinned but record update failed; needs reconciliation"
                );
                return Err(e);
            },
        };

        tracing::info!(cid = %content_id, "pinned");
        self.notifier.notify(&record, WebhookStatus::Success).await;
        Ok(Outcome::Pinned { content_id })
    }

    async fn add_content(&self, request: &PinRequest) -> Result<String> {
        let key = request.storage_key.as_str();
        if request.is_directory {
            let dir = self.scratch.materialize(self.objects.as_ref(), key).await?;
            let added = self.network.add_dir(dir.path()).await;
            scratch::remove(dir);
            Ok(added?)
        } else {
            let reader = self.objects.open(key).await?;
            let name = key.rsplit('/').next().unwrap_or(key);
            Ok(self.network.add_stream(name, reader).await?)
        }
    }

    async fn unpin(&self, request: &PinRequest) -> Result<Outcome> {
        let id = request.storage_id;
        let content_id = request
            .content_id
            .as_deref()
            .map(str::trim)
            .filter(|cid| !cid.is_empty())
            .ok_or(PinError::MissingContentId { id })?;

        let record = match self.records.get(id, request.user_id).await {
            Ok(record) if !record.pinned && !request.force => {
                tracing::info!(cid = content_id, "record already unpinned, skipping");
                return Ok(Outcome::Skipped);
            },
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(error = %e, "record lookup failed, unpinning anyway");
                None
            },
        };

        self.network.unpin(content_id).await?;
        let record: StorageRecord = match record {
            Some(record) => record,
            None => self.records.get(id, request.user_id).await?,
        };
        self.updater.mark_unpinned(record).await?;

        tracing::info!(cid = content_id, "unpinned");
        Ok(Outcome::Unpinned)
    }
}

//! Writes operation outcomes back to the storage record.

use crate::error::Result;
use crate::model::{Column, StorageRecord};
use crate::reliability::{RetryPolicy, retry_async};
use crate::store::{RecordStore, StoreError};
use chrono::Utc;
use std::sync::Arc;

/// Applies add and unpin outcomes as partial column updates.
#[derive(Clone)]
pub struct StateUpdater {
    records: Arc<dyn RecordStore>,
    retry: RetryPolicy,
}

impl StateUpdater {
    /// `persist_retries` extra attempts are made for transient failures
    /// after an add; unpin updates are attempted once.
    pub fn new(records: Arc<dyn RecordStore>, persist_retries: u32) -> Self {
        Self {
            records,
            retry: RetryPolicy::persistence(persist_retries),
        }
    }

    /// Records a successful add and returns the updated record.
    ///
    /// # Errors
    ///
    /// Returns the store error once retries are exhausted or the error is
    /// not transient.
    pub async fn mark_pinned(
        &self,
        mut record: StorageRecord,
        content_id: String,
    ) -> Result<StorageRecord> {
        record.mark_pinned(content_id, Utc::now());
        let records = &self.records;
        let pinned = &record;
        retry_async(
            self.retry,
            "record update",
            || async move { records.update_columns(pinned, Column::PINNED).await },
            StoreError::is_transient,
        )
        .await?;
        Ok(record)
    }

    /// Records a successful unpin and returns the updated record.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn mark_unpinned(&self, mut record: StorageRecord) -> Result<StorageRecord> {
        record.mark_unpinned(Utc::now());
        self.records
            .update_columns(&record, Column::UNPINNED)
            .await?;
        Ok(record)
    }
}

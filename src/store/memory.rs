//! In-memory record store.
//!
//! Keeps every applied update so tests can assert exactly which columns the
//! engine wrote, and can be told to fail the next few updates transiently.

use super::{RecordStore, StoreError};
use crate::model::{Column, StorageRecord, UserWebhookPreference};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// One successful `update_columns` call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpdate {
    pub id: i64,
    pub columns: Vec<Column>,
    /// The stored record after the update.
    pub record: StorageRecord,
}

#[derive(Default)]
struct Inner {
    records: Mutex<HashMap<i64, StorageRecord>>,
    users: Mutex<HashMap<i64, UserWebhookPreference>>,
    updates: Mutex<Vec<RecordUpdate>>,
    failing_updates: AtomicU32,
}

/// HashMap-backed store. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    inner: Arc<Inner>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `record` under its id, replacing any previous one.
    pub fn insert(&self, record: StorageRecord) {
        self.inner.records.lock().insert(record.id, record);
    }

    pub fn set_user(&self, user_id: i64, preference: UserWebhookPreference) {
        self.inner.users.lock().insert(user_id, preference);
    }

    /// Current stored copy of a record.
    pub fn record(&self, id: i64) -> Option<StorageRecord> {
        self.inner.records.lock().get(&id).cloned()
    }

    pub fn updates(&self) -> Vec<RecordUpdate> {
        self.inner.updates.lock().clone()
    }

    /// Makes the next `count` updates fail with [`StoreError::Unavailable`].
    pub fn fail_next_updates(&self, count: u32) {
        self.inner.failing_updates.store(count, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.inner
            .failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn copy_column(target: &mut StorageRecord, source: &StorageRecord, column: Column) {
    match column {
        Column::ContentId => target.content_id.clone_from(&source.content_id),
        Column::Stage => target.stage = source.stage,
        Column::Pinned => target.pinned = source.pinned,
        Column::UpdatedAt => target.updated_at = source.updated_at,
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, id: i64, owner: Option<i64>) -> Result<StorageRecord, StoreError> {
        self.inner
            .records
            .lock()
            .get(&id)
            .filter(|r| r.deleted_at.is_none())
            .filter(|r| owner.is_none_or(|owner| r.owner_user_id == owner))
            .cloned()
            .ok_or(StoreError::NotFound { id })
    }

    async fn update_columns(
        &self,
        record: &StorageRecord,
        columns: &[Column],
    ) -> Result<(), StoreError> {
        if self.take_failure() {
            return Err(StoreError::Unavailable("injected failure".into()));
        }

        let mut records = self.inner.records.lock();
        let stored = records
            .get_mut(&record.id)
            .filter(|r| r.deleted_at.is_none())
            .ok_or(StoreError::NotFound { id: record.id })?;

        let mut updated = stored.clone();
        for column in columns {
            copy_column(&mut updated, record, *column);
        }
        if !updated.is_consistent() {
            return Err(StoreError::Rejected(format!(
                "record {} would be pinned without a content id on the network stage",
                record.id
            )));
        }
        *stored = updated.clone();
        drop(records);

        self.inner.updates.lock().push(RecordUpdate {
            id: record.id,
            columns: columns.to_vec(),
            record: updated,
        });
        Ok(())
    }

    async fn webhook_preference(
        &self,
        user_id: i64,
    ) -> Result<Option<UserWebhookPreference>, StoreError> {
        Ok(self.inner.users.lock().get(&user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Stage;
    use chrono::Utc;

    #[tokio::test]
    async fn test_update_writes_only_named_columns() {
        let store = MemoryRecordStore::new();
        let mut original = StorageRecord::new(1, 9, "9/a.txt");
        original.name = "kept".into();
        store.insert(original.clone());

        let mut changed = original.clone();
        changed.mark_pinned("Qm1".into(), Utc::now());
        changed.name = "ignored".into();
        store.update_columns(&changed, Column::PINNED).await.unwrap();

        let stored = store.record(1).unwrap();
        assert_eq!(stored.name, "kept");
        assert_eq!(stored.stage, Stage::Network);
        assert_eq!(stored.content_id.as_deref(), Some("Qm1"));
        assert_eq!(store.updates().len(), 1);
        assert_eq!(store.updates()[0].columns, Column::PINNED.to_vec());
    }

    #[tokio::test]
    async fn test_inconsistent_update_rejected() {
        let store = MemoryRecordStore::new();
        let record = StorageRecord::new(1, 9, "9/a.txt");
        store.insert(record.clone());

        let mut bad = record.clone();
        bad.pinned = true;
        let err = store
            .update_columns(&bad, &[Column::Pinned])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert!(!store.record(1).unwrap().pinned);
        assert!(store.updates().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient_and_counted() {
        let store = MemoryRecordStore::new();
        let record = StorageRecord::new(1, 9, "9/a.txt");
        store.insert(record.clone());
        store.fail_next_updates(2);

        for _ in 0..2 {
            let err = store
                .update_columns(&record, Column::UNPINNED)
                .await
                .unwrap_err();
            assert!(err.is_transient());
        }
        assert!(store.update_columns(&record, Column::UNPINNED).await.is_ok());
    }

    #[tokio::test]
    async fn test_owner_scope_and_missing_user() {
        let store = MemoryRecordStore::new();
        store.insert(StorageRecord::new(3, 9, "9/a.txt"));
        assert!(store.get(3, Some(9)).await.is_ok());
        assert!(matches!(
            store.get(3, Some(1)).await,
            Err(StoreError::NotFound { id: 3 })
        ));
        assert_eq!(store.webhook_preference(9).await.unwrap(), None);
    }
}

//! Persistence for storage records and user webhook preferences.
//!
//! The engine reads a record, runs the operation, and writes back an explicit
//! list of [`Column`]s. Backends:
//!
//! - [`SqliteRecordStore`] - rusqlite, one connection behind a mutex
//! - [`MemoryRecordStore`] - HashMap-backed, records every update for tests

mod memory;
mod sqlite;

pub use memory::{MemoryRecordStore, RecordUpdate};
pub use sqlite::SqliteRecordStore;

use crate::model::{Column, StorageRecord, UserWebhookPreference};
use async_trait::async_trait;

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// No live record with this id (for this owner, when one was given).
    #[error("storage record {id} not found")]
    NotFound { id: i64 },

    /// SQLite failure.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored value could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// The update would leave the record inconsistent.
    #[error("update rejected: {0}")]
    Rejected(String),

    /// The store is temporarily unreachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Returns true if retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Record and preference access used by the engine.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Fetches a live record, optionally scoped to its owner.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when no such record exists.
    async fn get(&self, id: i64, owner: Option<i64>) -> Result<StorageRecord, StoreError>;

    /// Writes only `columns` of `record`, keyed by `record.id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the record no longer exists.
    async fn update_columns(
        &self,
        record: &StorageRecord,
        columns: &[Column],
    ) -> Result<(), StoreError>;

    /// Looks up a user's webhook preference. `None` means the user is unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    async fn webhook_preference(
        &self,
        user_id: i64,
    ) -> Result<Option<UserWebhookPreference>, StoreError>;
}

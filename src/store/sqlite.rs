//! SQLite-backed record store.
//!
//! Uses a single connection behind a mutex; every call runs on the blocking
//! pool. Tables are created on open if missing. Timestamps are RFC 3339 text.

use super::{RecordStore, StoreError};
use crate::model::{Column, Stage, StorageRecord, UserWebhookPreference};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::path::Path;
use std::sync::Arc;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id              INTEGER PRIMARY KEY,
    webhooks_url    TEXT,
    webhooks_active INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS storage (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id      INTEGER NOT NULL,
    cid          TEXT,
    dir          INTEGER NOT NULL DEFAULT 0,
    name         TEXT NOT NULL DEFAULT '',
    metadata     TEXT,
    storage_key  TEXT NOT NULL,
    upload_stage TEXT NOT NULL DEFAULT 'storage',
    pinned       INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    deleted_at   TEXT
);
CREATE INDEX IF NOT EXISTS storage_user_id ON storage (user_id);
";

const SELECT_RECORD: &str = "SELECT id, user_id, cid, dir, name, metadata, storage_key, \
     upload_stage, pinned, created_at, updated_at, deleted_at FROM storage \
     WHERE id = ?1 AND deleted_at IS NULL";

fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn parse_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("{column} '{raw}': {e}")))
}

/// Raw row as stored, decoded into a record outside the row callback.
struct RawRecord {
    id: i64,
    user_id: i64,
    cid: Option<String>,
    dir: bool,
    name: String,
    metadata: Option<String>,
    storage_key: String,
    stage: String,
    pinned: bool,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            cid: row.get(2)?,
            dir: row.get(3)?,
            name: row.get(4)?,
            metadata: row.get(5)?,
            storage_key: row.get(6)?,
            stage: row.get(7)?,
            pinned: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
            deleted_at: row.get(11)?,
        })
    }

    fn decode(self) -> Result<StorageRecord, StoreError> {
        let metadata = self
            .metadata
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|e| StoreError::Corrupt(format!("metadata of record {}: {e}", self.id)))?;
        Ok(StorageRecord {
            id: self.id,
            owner_user_id: self.user_id,
            content_id: self.cid,
            is_directory: self.dir,
            storage_key: self.storage_key,
            stage: self.stage.parse::<Stage>().map_err(StoreError::Corrupt)?,
            pinned: self.pinned,
            name: self.name,
            metadata,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
            deleted_at: self
                .deleted_at
                .as_deref()
                .map(|raw| parse_timestamp("deleted_at", raw))
                .transpose()?,
        })
    }
}

fn column_value(record: &StorageRecord, column: Column) -> Value {
    match column {
        Column::ContentId => record
            .content_id
            .clone()
            .map_or(Value::Null, Value::Text),
        Column::Stage => Value::Text(record.stage.as_str().to_string()),
        Column::Pinned => Value::Integer(i64::from(record.pinned)),
        Column::UpdatedAt => Value::Text(timestamp(&record.updated_at)),
    }
}

/// Builds `UPDATE storage SET a = ?1, b = ?2 WHERE id = ?3 AND deleted_at IS NULL`.
fn update_statement(record: &StorageRecord, columns: &[Column]) -> (String, Vec<Value>) {
    let mut assignments = Vec::with_capacity(columns.len());
    let mut values = Vec::with_capacity(columns.len() + 1);
    for (i, column) in columns.iter().enumerate() {
        assignments.push(format!("{} = ?{}", column.name(), i + 1));
        values.push(column_value(record, *column));
    }
    values.push(Value::Integer(record.id));
    let sql = format!(
        "UPDATE storage SET {} WHERE id = ?{} AND deleted_at IS NULL",
        assignments.join(", "),
        columns.len() + 1
    );
    (sql, values)
}

/// SQLite record store.
///
/// `Clone` shares the same connection.
#[derive(Clone)]
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    /// Opens or creates the database file and its tables.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    /// Creates a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` with the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&conn.lock()))
            .await
            .map_err(|e| StoreError::Unavailable(format!("database task failed: {e}")))?
    }

    /// Inserts a record as the upload flow would, returning its new id.
    ///
    /// The record's `id` is ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert_record(&self, record: &StorageRecord) -> Result<i64, StoreError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let metadata = record
                .metadata
                .as_ref()
                .map(serde_json::Value::to_string);
            conn.execute(
                "INSERT INTO storage (user_id, cid, dir, name, metadata, storage_key, \
                 upload_stage, pinned, created_at, updated_at, deleted_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.owner_user_id,
                    record.content_id,
                    record.is_directory,
                    record.name,
                    metadata,
                    record.storage_key,
                    record.stage.as_str(),
                    record.pinned,
                    timestamp(&record.created_at),
                    timestamp(&record.updated_at),
                    record.deleted_at.as_ref().map(timestamp),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Creates or replaces a user's webhook preference.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn upsert_user(
        &self,
        user_id: i64,
        preference: &UserWebhookPreference,
    ) -> Result<(), StoreError> {
        let preference = preference.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO users (id, webhooks_url, webhooks_active) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(id) DO UPDATE SET webhooks_url = excluded.webhooks_url, \
                 webhooks_active = excluded.webhooks_active",
                params![user_id, preference.webhooks_url, preference.webhooks_active],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn get(&self, id: i64, owner: Option<i64>) -> Result<StorageRecord, StoreError> {
        let raw = self
            .with_conn(move |conn| {
                let raw = match owner {
                    Some(owner) => conn
                        .query_row(
                            &format!("{SELECT_RECORD} AND user_id = ?2"),
                            params![id, owner],
                            RawRecord::from_row,
                        )
                        .optional()?,
                    None => conn
                        .query_row(SELECT_RECORD, params![id], RawRecord::from_row)
                        .optional()?,
                };
                Ok(raw)
            })
            .await?;
        raw.ok_or(StoreError::NotFound { id })?.decode()
    }

    async fn update_columns(
        &self,
        record: &StorageRecord,
        columns: &[Column],
    ) -> Result<(), StoreError> {
        if columns.is_empty() {
            return Ok(());
        }
        let id = record.id;
        let (sql, values) = update_statement(record, columns);
        let changed = self
            .with_conn(move |conn| Ok(conn.execute(&sql, params_from_iter(values))?))
            .await?;
        if changed == 0 {
            return Err(StoreError::NotFound { id });
        }
        Ok(())
    }

    async fn webhook_preference(
        &self,
        user_id: i64,
    ) -> Result<Option<UserWebhookPreference>, StoreError> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT webhooks_active, webhooks_url FROM users WHERE id = ?1",
                    params![user_id],
                    |row| {
                        Ok(UserWebhookPreference {
                            webhooks_active: row.get(0)?,
                            webhooks_url: row.get(1)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }
}

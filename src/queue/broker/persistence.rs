//! redb journal for the embedded broker.
//!
//! One row per queue (topic backlog or channel): the queue key maps to the
//! JSON-encoded list of pending messages. A row is rewritten whole after
//! every change to its queue and removed once the queue is gone.

use super::types::BrokerMessage;
use anyhow::{Context, Result};
use redb::{ReadableDatabase, ReadableTable};
use std::collections::{HashMap, VecDeque};
use std::path::Path;

const QUEUES: redb::TableDefinition<'static, &'static str, &'static [u8]> =
    redb::TableDefinition::new("broker_queues");

pub(crate) struct Journal {
    db: redb::Database,
}

impl Journal {
    /// Opens or creates the journal file, creating its directory if needed.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create broker directory: {}", parent.display())
            })?;
        }
        let db = redb::Database::create(path)
            .with_context(|| format!("Failed to open broker journal: {}", path.display()))?;
        Ok(Self { db })
    }

    /// Writes the pending messages of `key`, or drops the row for `None`.
    pub(crate) fn save(&self, key: &str, messages: Option<&VecDeque<BrokerMessage>>) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(QUEUES)?;
            match messages {
                Some(messages) => {
                    let encoded = serde_json::to_vec(messages)
                        .with_context(|| format!("Failed to encode queue '{key}'"))?;
                    table.insert(key, encoded.as_slice())?;
                },
                None => {
                    table.remove(key)?;
                },
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Reads every saved queue.
    pub(crate) fn load(&self) -> Result<HashMap<String, VecDeque<BrokerMessage>>> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(QUEUES) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };

        let mut queues = HashMap::new();
        for row in table.iter()? {
            let (key, data) = row?;
            let key = key.value().to_string();
            let messages = serde_json::from_slice(data.value())
                .with_context(|| format!("Corrupt broker queue '{key}'"))?;
            queues.insert(key, messages);
        }
        Ok(queues)
    }
}

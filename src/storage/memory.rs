//! In-memory object store.
//!
//! Non-persistent store using DashMap for concurrent access. Used by tests
//! and by the engine integration suite.

use super::validation::validate_key;
use super::{ObjectInfo, ObjectReader, ObjectStore, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;

/// In-memory object store.
///
/// `Clone` shares the same objects, so a test can keep a handle while the
/// engine owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<DashMap<String, Bytes>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an object, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not a valid relative path.
    pub fn put(&self, key: &str, data: impl Into<Bytes>) -> Result<(), StorageError> {
        validate_key(key)?;
        self.objects.insert(key.to_string(), data.into());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn open(&self, key: &str) -> Result<ObjectReader, StorageError> {
        validate_key(key)?;
        let data = self
            .objects
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(Box::pin(std::io::Cursor::new(data)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        let mut objects: Vec<ObjectInfo> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| ObjectInfo {
                key: entry.key().clone(),
                size: entry.value().len() as u64,
            })
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_put_open_list() {
        let store = MemoryObjectStore::new();
        store.put("1/b.txt", "bee").unwrap();
        store.put("1/a.txt", "ay").unwrap();
        store.put("2/a.txt", "other").unwrap();
        assert_eq!(store.len(), 3);

        let mut content = Vec::new();
        store
            .open("1/a.txt")
            .await
            .unwrap()
            .read_to_end(&mut content)
            .await
            .unwrap();
        assert_eq!(content, b"ay");

        let keys: Vec<_> = store
            .list("1/")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(keys, vec!["1/a.txt", "1/b.txt"]);
    }

    #[tokio::test]
    async fn test_missing_object() {
        let store = MemoryObjectStore::new();
        assert!(matches!(
            store.open("1/none").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(store.put("../x", "nope").is_err());
        assert!(store.is_empty());
    }
}

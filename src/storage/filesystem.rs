//! Filesystem-backed object store.
//!
//! Objects live at `<root>/<bucket>/<key>`. Useful for single-host
//! deployments and for local development against a copied bucket.

use super::validation::validate_key;
use super::{ObjectInfo, ObjectReader, ObjectStore, StorageError};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Bucket directory on local disk.
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    base_dir: Arc<PathBuf>,
}

impl FilesystemStore {
    /// Opens the bucket directory at `<root>/<bucket>`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket name is not a single path segment or
    /// the directory cannot be created.
    pub fn open(root: impl AsRef<Path>, bucket: &str) -> Result<Self, StorageError> {
        let bucket_path = validate_key(bucket)?;
        if bucket_path.components().count() != 1 {
            return Err(StorageError::invalid_key(bucket, "bucket must be one segment"));
        }
        let base_dir = root.as_ref().join(bucket_path);
        fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir: Arc::new(base_dir),
        })
    }

    /// Directory holding the bucket's objects.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        Ok(self.base_dir.join(validate_key(key)?))
    }

    fn list_sync(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        let mut objects = Vec::new();
        let mut pending = vec![self.base_dir.to_path_buf()];

        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let file_type = entry.file_type()?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }
                let Ok(relative) = path.strip_prefix(self.base_dir.as_path()) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    objects.push(ObjectInfo {
                        key,
                        size: entry.metadata()?.len(),
                    });
                }
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}

#[async_trait]
impl ObjectStore for FilesystemStore {
    async fn open(&self, key: &str) -> Result<ObjectReader, StorageError> {
        let path = self.object_path(key)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        let store = self.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || store.list_sync(&prefix))
            .await
            .map_err(|e| StorageError::Backend(format!("list task failed: {e}")))?
    }
}

//! Scratch directories for directory adds.

use super::validation::relative_path;
use super::{ObjectStore, StorageError};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Creates and removes scratch directories under a configured root.
#[derive(Debug, Clone)]
pub struct ScratchDirs {
    root: PathBuf,
    prefix: String,
}

impl ScratchDirs {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
        }
    }

    /// Scratch directories under the system temp dir.
    pub fn in_temp_dir(prefix: impl Into<String>) -> Self {
        Self::new(std::env::temp_dir(), prefix)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates a fresh, empty scratch directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create(&self) -> Result<TempDir, StorageError> {
        std::fs::create_dir_all(&self.root)?;
        Ok(tempfile::Builder::new()
            .prefix(&self.prefix)
            .tempdir_in(&self.root)?)
    }

    /// Downloads every object under `prefix` into a new scratch directory.
    ///
    /// Each object lands at its key minus the leading namespace segment. On
    /// failure the partially filled directory is removed before returning.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::EmptyPrefix`] if nothing is stored under the
    /// prefix, [`StorageError::InvalidKey`] for keys that cannot be mapped to
    /// a safe relative path, or the first download error.
    pub async fn materialize(
        &self,
        store: &dyn ObjectStore,
        prefix: &str,
    ) -> Result<TempDir, StorageError> {
        let objects = store.list(prefix).await?;
        if objects.is_empty() {
            return Err(StorageError::EmptyPrefix(prefix.to_string()));
        }

        let dir = self.create()?;
        for object in &objects {
            let result = match relative_path(&object.key) {
                Ok(relative) => store.download(&object.key, &dir.path().join(relative)).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                remove(dir);
                return Err(e);
            }
        }

        tracing::debug!(
            prefix,
            objects = objects.len(),
            path = %dir.path().display(),
            "materialized directory"
        );
        Ok(dir)
    }
}

/// Deletes a scratch directory, logging instead of failing.
pub fn remove(dir: TempDir) {
    let path = dir.path().to_path_buf();
    if let Err(e) = dir.close() {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove scratch directory");
    }
}

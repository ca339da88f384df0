//! Object storage access.
//!
//! The engine reads uploads through the [`ObjectStore`] trait: a streaming
//! reader for single objects and prefix listing plus download for
//! directories. Backends:
//!
//! - [`FilesystemStore`] - a bucket directory on local disk
//! - [`MemoryObjectStore`] - DashMap-backed, for tests
//! - `S3Store` - any S3-compatible service (feature `s3`)
//!
//! [`scratch`] materialises a prefix into a temporary directory for
//! directory adds.

mod filesystem;
mod memory;
#[cfg(feature = "s3")]
mod s3;
pub mod scratch;
mod validation;

pub use filesystem::FilesystemStore;
pub use memory::MemoryObjectStore;
#[cfg(feature = "s3")]
pub use s3::{S3Settings, S3Store};
pub use scratch::ScratchDirs;
pub use validation::{relative_path, validate_key};

use async_trait::async_trait;
use std::path::Path;
use std::pin::Pin;
use tokio::io::AsyncRead;

/// Streaming reader over an object's bytes.
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send + Sync>>;

/// Object storage errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StorageError {
    /// Key is empty, absolute or escapes its namespace.
    #[error("invalid object key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// No object under this key.
    #[error("object '{0}' not found")]
    NotFound(String),

    /// Nothing stored under a directory prefix.
    #[error("no objects under prefix '{0}'")]
    EmptyPrefix(String),

    /// Local I/O failure (reading a bucket file or writing a scratch file).
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote backend failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub(crate) fn invalid_key(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Listed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

/// Read access to the upload bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Opens a streaming reader on `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the object does not exist, or a
    /// backend error.
    async fn open(&self, key: &str) -> Result<ObjectReader, StorageError>;

    /// Lists every object whose key starts with `prefix`, sorted by key.
    ///
    /// # Errors
    ///
    /// Returns an error if listing fails.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError>;

    /// Copies an object into a local file, creating parent directories.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns an error if the object cannot be read or the file written.
    async fn download(&self, key: &str, dest: &Path) -> Result<u64, StorageError> {
        let mut reader = self.open(key).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        Ok(written)
    }
}

//! Content network clients.
//!
//! [`ContentNetwork`] adds a stream or a local directory to the network and
//! returns its content identifier, and unpins identifiers. Implementations:
//!
//! - [`IpfsClient`] - IPFS Kubo RPC API over HTTP
//! - [`MemoryNetwork`] - instrumented fake for tests

mod ipfs;
mod memory;

pub use ipfs::{IpfsClient, multiaddr_to_url};
pub use memory::{AddCall, AddKind, MemoryNetwork};

use crate::storage::ObjectReader;
use async_trait::async_trait;
use std::path::Path;

/// Content network errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum NetworkError {
    /// The API answered with an error status.
    #[error("content network returned {status}: {message}")]
    Api { status: u16, message: String },

    /// Request could not be sent or the response not read.
    #[error("content network request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Reading local input failed.
    #[error("content network I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The API answered but the body made no sense.
    #[error("unexpected content network response: {0}")]
    InvalidResponse(String),

    /// Client could not be configured.
    #[error("content network configuration: {0}")]
    Config(String),
}

/// Add and unpin operations on the content network.
#[async_trait]
pub trait ContentNetwork: Send + Sync + 'static {
    /// Adds and pins a single stream, returning its content identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be read or the add fails.
    async fn add_stream(&self, name: &str, reader: ObjectReader) -> Result<String, NetworkError>;

    /// Adds and pins a local directory tree, returning the root identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read or the add fails.
    async fn add_dir(&self, path: &Path) -> Result<String, NetworkError>;

    /// Removes the recursive pin on `content_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the unpin fails, including when the identifier
    /// was not pinned.
    async fn unpin(&self, content_id: &str) -> Result<(), NetworkError>;
}

//! Engine error types for typed error handling.
//!
//! Every failure the engine can hit while processing one work item maps to
//! a [`PinError`]. None of them propagate past the item: the intake loops log
//! them and move on. Collaborator modules have their own error enums which
//! convert into `PinError` via `?`.

use crate::network::NetworkError;
use crate::queue::QueueError;
use crate::storage::StorageError;
use crate::store::StoreError;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, PinError>;

/// Failure while processing a single pin, unpin or webhook item.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PinError {
    /// Queue payload is not valid JSON for the expected message.
    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),

    /// Queue payload decoded but failed validation.
    #[error("invalid message: {0}")]
    Invalid(String),

    /// Referenced storage record does not exist.
    #[error("storage record {id} not found")]
    NotFound { id: i64 },

    /// Unpin requested without a content identifier.
    #[error("missing content identifier for storage record {id}")]
    MissingContentId { id: i64 },

    /// Object storage call failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Content network call failed.
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// Persistence store call failed.
    #[error(transparent)]
    Store(StoreError),

    /// Publishing to the queue failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Webhook HTTP delivery failed at the transport level.
    #[error("webhook delivery failed: {0}")]
    Delivery(#[from] reqwest::Error),
}

impl From<StoreError> for PinError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { id } => Self::NotFound { id },
            other => Self::Store(other),
        }
    }
}

impl PinError {
    /// Create a validation error.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid(reason.into())
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) | Self::Invalid(_) => "decode",
            Self::NotFound { .. } => "not_found",
            Self::MissingContentId { .. } => "precondition",
            Self::Storage(_) | Self::Network(_) => "io",
            Self::Store(_) => "persistence",
            Self::Queue(_) => "queue",
            Self::Delivery(_) => "delivery",
        }
    }
}

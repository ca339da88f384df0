//! Reliability primitives.
//!
//! - [`retry`] - exponential backoff for transient failures

pub mod retry;

pub use retry::{RetryPolicy, retry_anyhow, retry_async};

//! Bounded exponential backoff on top of `backon`.
//!
//! Two callers: the column update that follows a successful add
//! ([`RetryPolicy::persistence`]) and the nsqlookupd probe at startup
//! ([`RetryPolicy::network`]).
//!
//! ```rust,ignore
//! use pinnerd::reliability::{RetryPolicy, retry_async};
//!
//! let updated = retry_async(
//!     RetryPolicy::persistence(2),
//!     "record update",
//!     || store.update_columns(&record, Column::PINNED),
//!     StoreError::is_transient,
//! )
//! .await?;
//! ```

use backon::{ExponentialBuilder, Retryable};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// How many times to retry and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub retries: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Growth of the delay per attempt.
    pub factor: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::network()
    }
}

impl RetryPolicy {
    /// The record update after an add. The webhook waits on it, so delays stay short.
    #[must_use]
    pub const fn persistence(retries: u32) -> Self {
        Self {
            retries,
            min_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            factor: 2.0,
        }
    }

    /// Remote services that may still be coming up.
    #[must_use]
    pub const fn network() -> Self {
        Self {
            retries: 3,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(20),
            factor: 2.0,
        }
    }

    #[must_use]
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub const fn with_min_delay(mut self, delay: Duration) -> Self {
        self.min_delay = delay;
        self
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.retries as usize)
            .with_factor(self.factor)
            .with_jitter()
    }
}

/// Runs `operation` until it succeeds, `should_retry` rejects the error or
/// the policy runs out.
///
/// # Errors
///
/// Returns the last error.
pub async fn retry_async<F, Fut, T, E, R>(
    policy: RetryPolicy,
    what: &str,
    operation: F,
    should_retry: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    R: Fn(&E) -> bool,
{
    let mut failures = 0u32;
    operation
        .retry(policy.backoff())
        .when(should_retry)
        .notify(|err: &E, wait: Duration| {
            failures += 1;
            tracing::warn!(
                what,
                failures,
                retries = policy.retries,
                wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "retrying"
            );
        })
        .await
}

/// [`retry_async`] for `anyhow` errors, retrying what [`is_transient_error`] accepts.
///
/// # Errors
///
/// Returns the last error.
pub async fn retry_anyhow<F, Fut, T>(
    policy: RetryPolicy,
    what: &str,
    operation: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    retry_async(policy, what, operation, is_transient_error).await
}

const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection closed",
    "error sending request",
    "broken pipe",
    "timed out",
    "timeout",
    "service unavailable",
    "bad gateway",
    "too many requests",
    "database is locked",
    "busy",
];

const TRANSIENT_STATUSES: &[&str] = &["408", "429", "500", "502", "503", "504"];

/// Whether anything in the error chain looks like a temporary condition:
/// connection trouble, timeouts, retryable HTTP statuses or lock contention.
pub fn is_transient_error(error: &anyhow::Error) -> bool {
    let text = format!("{error:#}").to_lowercase();
    let transient = TRANSIENT_MARKERS.iter().any(|m| text.contains(m))
        || TRANSIENT_STATUSES.iter().any(|code| text.contains(code));
    if transient {
        tracing::debug!(error = %text, "treating error as transient");
    }
    transient
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(retries: u32) -> RetryPolicy {
        RetryPolicy::persistence(retries).with_min_delay(Duration::from_millis(2))
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient_error(&anyhow::anyhow!("operation timed out")));
        assert!(is_transient_error(&anyhow::anyhow!("connection refused")));
        assert!(is_transient_error(&anyhow::anyhow!("lookupd returned 503")));
        assert!(!is_transient_error(&anyhow::anyhow!("invalid topic name")));
        assert!(!is_transient_error(&anyhow::anyhow!("HTTP status: 404")));

        let wrapped = anyhow::anyhow!("connection reset by peer").context("probing nsqlookupd");
        assert!(is_transient_error(&wrapped));
    }

    #[tokio::test]
    async fn test_recovers_within_budget() {
        let calls = &AtomicU32::new(0);
        let result: Result<u32, String> = retry_async(
            fast(2),
            "flaky",
            || async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err("not yet".to_string()),
                    _ => Ok(42),
                }
            },
            |_| true,
        )
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), String> = retry_async(
            fast(2),
            "broken",
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("still down".to_string())
            },
            |_| true,
        )
        .await;
        assert_eq!(result, Err("still down".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), String> = retry_async(
            fast(3),
            "rejected",
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("constraint violated".to_string())
            },
            |e| e.contains("locked"),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_anyhow_uses_classifier() {
        let calls = &AtomicU32::new(0);
        let result = retry_anyhow(fast(1), "probe", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("connection refused")
            }
            Ok(())
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

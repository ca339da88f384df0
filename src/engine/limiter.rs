//! Semaphore-based concurrency limiter.
//!
//! Bounds how many work items run at once. A [`Slot`] is owned, so it can move
//! into the spawned task and is released when that task ends, however it ends.
//!
//! ```
//! # tokio_test::block_on(async {
//! use pinnerd::engine::ConcurrencyLimiter;
//!
//! let limiter = ConcurrencyLimiter::new(2, "pin");
//! let slot = limiter.acquire().await.unwrap();
//! assert_eq!(limiter.in_use(), 1);
//! drop(slot);
//! assert_eq!(limiter.available(), 2);
//! # });
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// The limiter was closed while waiting or before acquiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("concurrency limiter is closed")]
pub struct LimiterClosed;

/// Counting limiter for in-flight work items.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_use: Arc<AtomicUsize>,
    label: String,
}

impl ConcurrencyLimiter {
    /// Creates a limiter with `capacity` slots.
    ///
    /// A capacity of 0 is raised to 1 so the limiter can make progress;
    /// configuration applies the real default before this point.
    pub fn new(capacity: usize, label: impl Into<String>) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_use: Arc::new(AtomicUsize::new(0)),
            label: label.into(),
        }
    }

    /// Waits for a free slot.
    ///
    /// # Errors
    ///
    /// Returns [`LimiterClosed`] if the limiter is closed.
    pub async fn acquire(&self) -> Result<Slot, LimiterClosed> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| LimiterClosed)?;
        let now = self.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        crate::metrics::set_in_flight(&self.label, now);
        Ok(Slot {
            _permit: permit,
            in_use: Arc::clone(&self.in_use),
            label: self.label.clone(),
        })
    }

    /// Stops handing out slots. Held slots stay valid until dropped.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// A held slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
    in_use: Arc<AtomicUsize>,
    label: String,
}

impl Drop for Slot {
    fn drop(&mut self) {
        let now = self.in_use.fetch_sub(1, Ordering::SeqCst) - 1;
        crate::metrics::set_in_flight(&self.label, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_blocks_at_capacity() {
        let limiter = Arc::new(ConcurrencyLimiter::new(2, "test"));
        let a = limiter.acquire().await.unwrap();
        let _b = limiter.acquire().await.unwrap();
        assert_eq!(limiter.available(), 0);
        assert_eq!(limiter.in_use(), 2);

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire().await.map(drop) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(a);
        waiter.await.unwrap().unwrap();
        assert_eq!(limiter.in_use(), 1);
    }

    #[tokio::test]
    async fn test_slot_released_when_task_panics() {
        let limiter = ConcurrencyLimiter::new(1, "test");
        let slot = limiter.acquire().await.unwrap();
        let result = tokio::spawn(async move {
            let _slot = slot;
            panic!("boom");
        })
        .await;
        assert!(result.is_err());
        assert_eq!(limiter.available(), 1);
        assert_eq!(limiter.in_use(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_waiters_and_new_acquires() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1, "test"));
        let held = limiter.acquire().await.unwrap();
        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire().await.map(drop) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        limiter.close();
        assert_eq!(waiter.await.unwrap(), Err(LimiterClosed));
        assert_eq!(limiter.acquire().await.map(drop), Err(LimiterClosed));
        assert!(limiter.is_closed());
        drop(held);
        assert_eq!(limiter.in_use(), 0);
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        assert_eq!(ConcurrencyLimiter::new(0, "test").capacity(), 1);
    }
}

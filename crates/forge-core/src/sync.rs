//! Synchronization primitives for the execution core.
//!
//! [`ExecutionLock`] and [`ExecutionSemaphore`] wrap tokio's FIFO-fair mutex
//! and semaphore so that waiters are served in arrival order. [`IgnoreLock`]
//! covers the short synchronous critical sections that guard in-memory tables.

use crate::error::{ExecutionError, Result};
use core::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};

/// Extension trait for `Mutex` that ignores lock poisoning.
///
/// A panic while holding one of the in-memory tables leaves the table in a
/// consistent state between operations, so the poison flag carries no
/// information worth propagating.
pub trait IgnoreLock<T> {
    /// Lock the mutex, ignoring any poison error.
    fn lock_ignore_poison(&self) -> MutexGuard<'_, T>;
}

impl<T> IgnoreLock<T> for Mutex<T> {
    fn lock_ignore_poison(&self) -> MutexGuard<'_, T> {
        match self.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// FIFO async mutex that runs one operation at a time.
#[derive(Debug, Default)]
pub struct ExecutionLock {
    mutex: AsyncMutex<()>,
}

impl ExecutionLock {
    /// Create an unlocked mutex.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` while holding the lock.
    ///
    /// The lock is released when the operation's future completes, returns an
    /// error or is dropped.
    pub async fn run_exclusive<F, Fut, T>(&self, operation: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.mutex.lock().await;
        operation().await
    }

    /// Whether an operation currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.mutex.try_lock().is_err()
    }
}

/// Counting semaphore handing out RAII permits.
///
/// A semaphore created with zero permits never grants one.
#[derive(Debug)]
pub struct ExecutionSemaphore {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ExecutionSemaphore {
    /// Create a semaphore with `permits` permits.
    pub fn new(permits: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            capacity: permits,
        }
    }

    /// Wait for a permit.
    ///
    /// # Errors
    /// Returns an error if the semaphore was closed
    pub async fn acquire(&self) -> Result<SemaphoreRelease> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|error| ExecutionError::Other(format!("Semaphore closed: {error}")))?;
        Ok(SemaphoreRelease { permit })
    }

    /// Take a permit if one is free right now.
    pub fn try_acquire(&self) -> Option<SemaphoreRelease> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| SemaphoreRelease { permit })
    }

    /// Number of free permits.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Total number of permits.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether every permit is taken.
    pub fn is_locked(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

/// Permit of an [`ExecutionSemaphore`]; returned to the semaphore on drop.
#[derive(Debug)]
#[must_use = "the permit is released as soon as it is dropped"]
pub struct SemaphoreRelease {
    permit: OwnedSemaphorePermit,
}

impl SemaphoreRelease {
    /// Return the permit now.
    pub fn release(self) {
        drop(self.permit);
    }
}

#[cfg(test)]
#[allow(
    clippy::assertions_on_result_states,
    reason = "Test code asserts on results directly"
)]
mod tests {
    use super::*;
    use core::time::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use tokio::task::JoinSet;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn test_run_exclusive_serializes_operations() {
        let lock = Arc::new(ExecutionLock::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let mut tasks = JoinSet::new();

        for _ in 0..8 {
            let task_lock = Arc::clone(&lock);
            let task_active = Arc::clone(&active);
            let task_max = Arc::clone(&max_active);
            tasks.spawn(async move {
                task_lock
                    .run_exclusive(|| async {
                        let now = task_active.fetch_add(1, Ordering::SeqCst) + 1;
                        task_max.fetch_max(now, Ordering::SeqCst);
                        sleep(Duration::from_millis(5)).await;
                        task_active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            });
        }
        while tasks.join_next().await.is_some() {}

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn test_run_exclusive_releases_on_error() {
        let lock = ExecutionLock::new();
        let outcome: Result<()> = lock
            .run_exclusive(|| async { Err(ExecutionError::Other("boom".to_owned())) })
            .await;
        assert!(matches!(outcome, Err(ExecutionError::Other(_))));
        assert!(!lock.is_locked());

        let value = lock.run_exclusive(|| async { 7 }).await;
        assert_eq!(value, 7);
    }

    /// Tests permit accounting and release.
    ///
    /// # Errors
    /// Returns an error if a permit cannot be acquired.
    #[tokio::test]
    async fn test_semaphore_permits() -> Result<()> {
        let semaphore = ExecutionSemaphore::new(2);
        let first = semaphore.acquire().await?;
        let second = semaphore.acquire().await?;
        assert!(semaphore.is_locked());
        assert!(semaphore.try_acquire().is_none());

        first.release();
        assert_eq!(semaphore.available_permits(), 1);
        drop(second);
        assert_eq!(semaphore.available_permits(), semaphore.capacity());
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_permit_semaphore_blocks_forever() {
        let semaphore = ExecutionSemaphore::new(0);
        assert!(semaphore.is_locked());
        let waited = timeout(Duration::from_millis(50), semaphore.acquire()).await;
        assert!(waited.is_err(), "zero-permit semaphore granted a permit");
    }

    /// Tests that a released permit wakes the oldest waiter.
    ///
    /// # Errors
    /// Returns an error if a permit cannot be acquired.
    #[tokio::test]
    async fn test_semaphore_wakes_waiter() -> Result<()> {
        let semaphore = Arc::new(ExecutionSemaphore::new(1));
        let held = semaphore.acquire().await?;

        let waiter_semaphore = Arc::clone(&semaphore);
        let waiter = tokio::spawn(async move { waiter_semaphore.acquire().await.is_ok() });

        sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        held.release();

        let acquired = timeout(Duration::from_secs(1), waiter)
            .await
            .map_err(|error| ExecutionError::Other(error.to_string()))?
            .map_err(|error| ExecutionError::Other(error.to_string()))?;
        assert!(acquired);
        Ok(())
    }

    #[test]
    fn test_lock_ignore_poison() {
        let mutex = Arc::new(Mutex::new(1));
        let poisoner = Arc::clone(&mutex);
        let joined = thread::spawn(move || {
            let _guard = poisoner.lock_ignore_poison();
            panic!("poison the lock");
        })
        .join();
        assert!(joined.is_err());
        assert_eq!(*mutex.lock_ignore_poison(), 1);
    }
}

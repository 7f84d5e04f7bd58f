//! Fixed-size pool of broker producers

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Non-blocking acquire found no free item
    #[error("pool exhausted")]
    Exhausted,

    #[error("pool closed")]
    Closed,
}

struct PoolInner<T> {
    items: Mutex<VecDeque<T>>,
    available: Arc<Semaphore>,
    size: usize,
}

/// Shared pool; clones refer to the same items
pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Pool<T> {
    pub fn new(items: Vec<T>) -> Self {
        let size = items.len();
        Self {
            inner: Arc::new(PoolInner {
                items: Mutex::new(items.into()),
                available: Arc::new(Semaphore::new(size)),
                size,
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Items not currently checked out
    pub fn idle(&self) -> usize {
        self.inner.available.available_permits()
    }

    /// Check an item out
    ///
    /// With `block = false` an empty pool fails with [`PoolError::Exhausted`]
    /// instead of waiting for a release.
    pub async fn acquire(&self, block: bool) -> Result<PoolGuard<T>, PoolError> {
        let permit = if block {
            self.inner
                .available
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| PoolError::Closed)?
        } else {
            self.inner
                .available
                .clone()
                .try_acquire_owned()
                .map_err(|e| match e {
                    tokio::sync::TryAcquireError::NoPermits => PoolError::Exhausted,
                    tokio::sync::TryAcquireError::Closed => PoolError::Closed,
                })?
        };

        let item = self.inner.items.lock().pop_front().ok_or(PoolError::Exhausted)?;
        Ok(PoolGuard {
            item: Some(item),
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Stop handing out items; waiting acquirers fail with `Closed`
    pub fn close(&self) {
        self.inner.available.close();
    }
}

/// Checked-out item, returned to the pool on drop
pub struct PoolGuard<T> {
    item: Option<T>,
    pool: Arc<PoolInner<T>>,
    _permit: OwnedSemaphorePermit,
}

impl<T> Deref for PoolGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only None while dropping
        self.item.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T> DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            // Item goes back before the permit is released
            self.pool.items.lock().push_back(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let pool = Pool::new(vec![1, 2]);
        assert_eq!(pool.idle(), 2);

        let a = pool.acquire(true).await.unwrap();
        let b = pool.acquire(true).await.unwrap();
        assert_eq!(*a + *b, 3);
        assert_eq!(pool.idle(), 0);

        drop(a);
        assert_eq!(pool.idle(), 1);
        let c = pool.acquire(false).await.unwrap();
        assert_eq!(*c, 1);
    }

    #[tokio::test]
    async fn test_non_blocking_acquire_exhausted() {
        let pool = Pool::new(vec!["producer"]);
        let _held = pool.acquire(false).await.unwrap();
        assert_eq!(pool.acquire(false).await.err(), Some(PoolError::Exhausted));
    }

    #[tokio::test]
    async fn test_blocking_acquire_waits_for_release() {
        let pool = Pool::new(vec![7u8]);
        let held = pool.acquire(true).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { *pool.acquire(true).await.unwrap() })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(held);
        assert_eq!(waiter.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_closed_pool() {
        let pool = Pool::new(vec![1]);
        pool.close();
        assert_eq!(pool.acquire(true).await.err(), Some(PoolError::Closed));
    }
}

//! Per-key async lock table.
//!
//! Serializes the reconcile, mutate, write-through and publish sequence of
//! one key against itself and against incoming staleness markers, while
//! leaving unrelated keys free to proceed.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default, Clone)]
pub struct KeyLocks {
    inner: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn acquire(&self, key: &str) -> KeyGuard {
        // The Arc is cloned under the shard lock, which is what makes the
        // strong-count check in `KeyGuard::drop` race-free.
        let lock = Arc::clone(self.inner.entry(key.to_string()).or_default().value());
        let guard = lock.lock_owned().await;
        KeyGuard {
            key: key.to_string(),
            locks: Arc::clone(&self.inner),
            guard: Some(guard),
        }
    }

    /// Number of keys currently locked or awaited.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Exclusive access to one key; released on drop.
pub struct KeyGuard {
    key: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn entry_is_removed_once_released() {
        let locks = KeyLocks::new();

        let guard = locks.acquire("k").await;
        assert_eq!(locks.len(), 1);

        drop(guard);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block_each_other() {
        let locks = KeyLocks::new();

        let _a = locks.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("b")).await;

        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks = KeyLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let locks = locks.clone();
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            tasks.push(tokio::spawn(async move {
                let _guard = locks.acquire("hot").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.expect("task completes");
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn waiter_keeps_entry_alive() {
        let locks = KeyLocks::new();
        let first = locks.acquire("k").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("k").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(first);
        waiter.await.expect("waiter acquires after release");
        assert!(locks.is_empty());
    }
}

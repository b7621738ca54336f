//! Keyed async locks with automatic cleanup.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per key, created on first use and removed once no
/// task holds or waits on it.
pub struct KeyedLocks<K>
where
    K: Hash + Eq + Clone,
{
    locks: Arc<DashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Clone for KeyedLocks<K>
where
    K: Hash + Eq + Clone,
{
    fn clone(&self) -> Self {
        Self {
            locks: Arc::clone(&self.locks),
        }
    }
}

impl<K> Default for KeyedLocks<K>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedLocks<K>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Waits for exclusive access to `key`.
    pub async fn lock(&self, key: K) -> KeyedLockGuard<K> {
        // Cloned under the shard lock, so cleanup can't race the clone.
        let mutex = Arc::clone(self.locks.entry(key.clone()).or_default().value());
        let guard = mutex.lock_owned().await;
        KeyedLockGuard {
            locks: Arc::clone(&self.locks),
            key,
            guard: Some(guard),
        }
    }

    /// Keys currently locked or awaited.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// RAII guard releasing the key lock on drop, including on panic.
pub struct KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    locks: Arc<DashMap<K, Arc<Mutex<()>>>>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K> Drop for KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: nobody waits on this key.
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks: KeyedLocks<&'static str> = KeyedLocks::new();
        let first = locks.lock("pair").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("pair").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks: KeyedLocks<&'static str> = KeyedLocks::new();
        let _a = locks.lock("a").await;

        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("b")).await;

        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }
}

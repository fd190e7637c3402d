//! Per-key async exclusive lock with automatic cleanup using weak references.
//!
//! Used to serialize state transitions of a single hardware region while
//! letting unrelated regions proceed in parallel.

use std::hash::Hash;
use std::sync::Arc;
use std::sync::Weak;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::sync::OwnedMutexGuard;

type LockMap<K> = Arc<DashMap<K, Weak<Mutex<()>>>>;

/// Exclusive hold on one key.
///
/// Dropping the guard releases the key. When no one else is waiting on it,
/// the entry is removed from the map right away.
pub struct KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    guard: Option<OwnedMutexGuard<()>>,
    arc: Arc<Mutex<()>>,
    key: K,
    locks: LockMap<K>,
}

#[cfg(test)]
impl<K> KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    fn key(&self) -> &K {
        &self.key
    }
}

impl<K> Drop for KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    fn drop(&mut self) {
        drop(self.guard.take());

        // Only `self.arc` left means nobody holds or waits for this key.
        if Arc::strong_count(&self.arc) == 1 {
            self.locks
                .remove_if(&self.key, |_, weak| weak.strong_count() <= 1);
        }
    }
}

/// A per-key async lock manager.
///
/// ```rust,ignore
/// let locks = KeyedAsyncLock::<String>::new();
///
/// // waits until the region is free
/// let guard = locks.lock(&"intel-fpga-port.0".to_string()).await;
///
/// // skips the region if another transition holds it
/// assert!(locks.try_lock(&"intel-fpga-port.0".to_string()).is_none());
/// drop(guard);
/// ```
pub struct KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    locks: LockMap<K>,
}

impl<K> KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Acquires the lock for `key`, waiting behind any current holder.
    pub async fn lock(&self, key: &K) -> KeyedLockGuard<K> {
        let arc = self.get_or_create_lock(key);
        let guard = Arc::clone(&arc).lock_owned().await;
        self.guard(guard, arc, key)
    }

    /// Acquires the lock for `key` only if nobody holds it right now.
    pub fn try_lock(&self, key: &K) -> Option<KeyedLockGuard<K>> {
        let arc = self.get_or_create_lock(key);
        match Arc::clone(&arc).try_lock_owned() {
            Ok(guard) => Some(self.guard(guard, arc, key)),
            Err(_) => None,
        }
    }

    /// True while some task holds (or waits for) `key`.
    pub fn is_locked(&self, key: &K) -> bool {
        self.locks
            .get(key)
            .and_then(|weak| weak.upgrade())
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    fn guard(&self, guard: OwnedMutexGuard<()>, arc: Arc<Mutex<()>>, key: &K) -> KeyedLockGuard<K> {
        KeyedLockGuard {
            guard: Some(guard),
            arc,
            key: key.clone(),
            locks: Arc::clone(&self.locks),
        }
    }

    fn get_or_create_lock(&self, key: &K) -> Arc<Mutex<()>> {
        loop {
            match self.locks.entry(key.clone()) {
                Entry::Occupied(occupied) => {
                    if let Some(strong) = occupied.get().upgrade() {
                        return strong;
                    }
                    // stale weak reference, drop it and retry
                    occupied.remove();
                }
                Entry::Vacant(vacant) => {
                    let strong = Arc::new(Mutex::new(()));
                    vacant.insert(Arc::downgrade(&strong));
                    return strong;
                }
            }
        }
    }

    #[cfg(test)]
    fn active_locks(&self) -> usize {
        self.locks
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }
}

impl<K> Default for KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use similar_asserts::assert_eq;
    use tokio::time::sleep;

    use super::*;

    #[tokio::test]
    async fn lock_serializes_same_key() {
        let locks = Arc::new(KeyedAsyncLock::<String>::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..10 {
            let locks = Arc::clone(&locks);
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(&"port.0".to_string()).await;
                let val = counter.load(Ordering::SeqCst);
                sleep(Duration::from_millis(1)).await;
                counter.store(val + 1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn try_lock_skips_held_key() {
        let locks = KeyedAsyncLock::<String>::new();
        let port0 = "port.0".to_string();
        let port1 = "port.1".to_string();

        let held = locks.try_lock(&port0).expect("free key should lock");
        assert!(locks.is_locked(&port0));
        assert!(locks.try_lock(&port0).is_none());

        // other keys are unaffected
        let other = locks.try_lock(&port1).expect("unrelated key should lock");
        assert_eq!(other.key(), &port1);

        drop(held);
        assert!(!locks.is_locked(&port0));
        assert!(locks.try_lock(&port0).is_some());
    }

    #[tokio::test]
    async fn released_keys_are_cleaned_up() {
        let locks = KeyedAsyncLock::<u32>::new();

        let mut guards = vec![];
        for i in 0..10 {
            guards.push(locks.lock(&i).await);
        }
        assert_eq!(locks.active_locks(), 10);

        drop(guards);
        assert_eq!(locks.active_locks(), 0);
        assert!(locks.locks.is_empty());
    }

    #[tokio::test]
    async fn waiter_gets_key_after_holder_releases() {
        let locks = Arc::new(KeyedAsyncLock::<u32>::new());
        let guard = locks.lock(&7).await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock(&7).await;
            })
        };

        sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
        assert_eq!(locks.active_locks(), 0);
    }
}

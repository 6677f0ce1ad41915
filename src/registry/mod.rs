//! Cross-boundary object registry.
//!
//! Hands out opaque, monotonically increasing integer handles to long-lived
//! objects so an out-of-process or foreign evaluator can refer to them
//! without holding a native reference it could outlive.
//!
//! Two lock levels:
//!   - the directory (`RwLock`) guards allocation, insertion, deletion and
//!     lookup, and is only held for the structural operation itself;
//!   - each entry carries its own lock, taken with [`ObjectRegistry::get_locked`]
//!     and released with [`ObjectRegistry::unlock`], so unrelated objects can
//!     be locked and unlocked concurrently.
//!
//! Deleting an entry while it is locked is a caller contract violation; the
//! registry does not detect it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::types::{Error, Result};

/// Number of ids at the top of the id space kept as an exhaustion canary.
const RESERVED_TAIL: u64 = 10;

/// Registry entry: the stored value plus its per-entry lock.
#[derive(Debug)]
struct Entry<T> {
    value: Arc<T>,
    lock: Arc<Mutex<()>>,
    /// Guard parked here between `get_locked` and `unlock`.
    held: StdMutex<Option<OwnedMutexGuard<()>>>,
}

#[derive(Debug)]
struct Directory<T> {
    next_id: u64,
    entries: HashMap<u64, Arc<Entry<T>>>,
}

/// Thread-safe id → object table.
#[derive(Debug)]
pub struct ObjectRegistry<T> {
    directory: RwLock<Directory<T>>,
}

impl<T> ObjectRegistry<T> {
    pub fn new() -> Self {
        Self::starting_after(0)
    }

    /// Registry whose first allocated id is `last_id + 1`.
    pub(crate) fn starting_after(last_id: u64) -> Self {
        Self {
            directory: RwLock::new(Directory {
                next_id: last_id,
                entries: HashMap::new(),
            }),
        }
    }

    /// Store `value` and return its new id (ids start at 1).
    ///
    /// Fails with [`Error::RegistryExhausted`] once the id space, minus the
    /// reserved tail, is used up.
    pub fn store(&self, value: T) -> Result<u64> {
        let mut dir = self.write_directory();
        if dir.next_id >= u64::MAX - RESERVED_TAIL {
            tracing::error!("Object registry exhausted at id {}", dir.next_id);
            return Err(Error::RegistryExhausted);
        }
        dir.next_id += 1;
        let id = dir.next_id;
        dir.entries.insert(
            id,
            Arc::new(Entry {
                value: Arc::new(value),
                lock: Arc::new(Mutex::new(())),
                held: StdMutex::new(None),
            }),
        );
        Ok(id)
    }

    /// Look up `id` without taking its entry lock. Id `0` is never valid.
    pub fn get(&self, id: u64) -> Option<Arc<T>> {
        self.entry(id).map(|entry| entry.value.clone())
    }

    /// Look up `id` and take its entry lock, waiting until it is free.
    ///
    /// The caller must release the lock with [`ObjectRegistry::unlock`].
    pub async fn get_locked(&self, id: u64) -> Option<Arc<T>> {
        let entry = self.entry(id)?;
        let guard = entry.lock.clone().lock_owned().await;
        *lock_held(&entry.held) = Some(guard);
        Some(entry.value.clone())
    }

    /// Release the entry lock taken by `get_locked`. A no-op for unlocked,
    /// deleted or unknown ids.
    pub fn unlock(&self, id: u64) {
        if let Some(entry) = self.entry(id) {
            lock_held(&entry.held).take();
        }
    }

    /// Remove `id` if present. Deleting an absent id is a no-op.
    pub fn delete(&self, id: u64) {
        if self.write_directory().entries.remove(&id).is_some() {
            tracing::trace!("Registry entry {} deleted", id);
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.read_directory().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, id: u64) -> Option<Arc<Entry<T>>> {
        if id == 0 {
            return None;
        }
        self.read_directory().entries.get(&id).cloned()
    }

    fn read_directory(&self) -> std::sync::RwLockReadGuard<'_, Directory<T>> {
        // A poisoned directory still holds a consistent map: every mutation
        // is a single insert/remove.
        self.directory.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_directory(&self) -> std::sync::RwLockWriteGuard<'_, Directory<T>> {
        self.directory.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T> Default for ObjectRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_held(
    held: &StdMutex<Option<OwnedMutexGuard<()>>>,
) -> std::sync::MutexGuard<'_, Option<OwnedMutexGuard<()>>> {
    held.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_store_get_delete() {
        let registry = ObjectRegistry::new();

        let id = registry.store("this is a test".to_string()).unwrap();
        assert_eq!(id, 1);

        let value = registry.get(id).unwrap();
        assert_eq!(value.as_str(), "this is a test");

        registry.delete(id);
        assert!(registry.get(id).is_none());

        // Deleting twice is fine.
        registry.delete(id);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_ids_are_monotonic_and_never_reused() {
        let registry = ObjectRegistry::new();
        let a = registry.store(1).unwrap();
        registry.delete(a);
        let b = registry.store(2).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_zero_is_always_absent() {
        let registry = ObjectRegistry::new();
        registry.store(42u32).unwrap();
        assert!(registry.get(0).is_none());
        registry.delete(0);
        registry.unlock(0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_exhaustion_detected_before_wraparound() {
        let registry = ObjectRegistry::starting_after(u64::MAX - RESERVED_TAIL - 1);
        let last = registry.store("last").unwrap();
        assert_eq!(last, u64::MAX - RESERVED_TAIL);

        let err = registry.store("one too many").unwrap_err();
        assert!(matches!(err, Error::RegistryExhausted));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_unlock_without_lock_is_noop() {
        let registry = ObjectRegistry::new();
        let id = registry.store(()).unwrap();
        registry.unlock(id);
        registry.unlock(999);

        assert!(registry.get_locked(id).await.is_some());
        registry.unlock(id);
        assert!(registry.get_locked(id).await.is_some());
        registry.unlock(id);
    }

    #[tokio::test]
    async fn test_get_locked_serializes_holders() {
        let registry = Arc::new(ObjectRegistry::new());
        let id = registry.store(AtomicUsize::new(0)).unwrap();
        let inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let inside = inside.clone();
            tasks.push(tokio::spawn(async move {
                let counter = registry.get_locked(id).await.unwrap();
                let holders = inside.fetch_add(1, Ordering::SeqCst);
                assert_eq!(holders, 0, "two holders inside the entry lock");
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                registry.unlock(id);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.get(id).unwrap().load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_entry_locks_are_independent() {
        let registry = ObjectRegistry::new();
        let a = registry.store("a").unwrap();
        let b = registry.store("b").unwrap();

        assert!(registry.get_locked(a).await.is_some());
        // Locking `b` must not wait on `a`.
        let got_b = tokio::time::timeout(Duration::from_millis(100), registry.get_locked(b)).await;
        assert!(got_b.unwrap().is_some());

        registry.unlock(a);
        registry.unlock(b);
    }

    #[tokio::test]
    async fn test_get_locked_waits_for_unlock() {
        let registry = Arc::new(ObjectRegistry::new());
        let id = registry.store("shared").unwrap();

        assert!(registry.get_locked(id).await.is_some());
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_locked(id).await.is_some() })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        registry.unlock(id);
        assert!(waiter.await.unwrap());
        registry.unlock(id);
    }

    #[test]
    fn test_get_locked_pending_until_unlock() {
        use tokio_test::{assert_pending, assert_ready, task};

        let registry = ObjectRegistry::new();
        let id = registry.store(7u32).unwrap();

        let mut first = task::spawn(registry.get_locked(id));
        let value = assert_ready!(first.poll());
        assert_eq!(value.as_deref(), Some(&7));
        drop(first);

        let mut second = task::spawn(registry.get_locked(id));
        assert_pending!(second.poll());

        registry.unlock(id);
        assert!(second.is_woken());
        assert!(assert_ready!(second.poll()).is_some());
        registry.unlock(id);
    }
}

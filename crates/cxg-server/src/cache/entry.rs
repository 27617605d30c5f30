// SPDX-License-Identifier: Apache-2.0

use crate::sync::rwlock::{DemotingRwLock, ReadGuard};
use cxg_core::CxgError;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use tracing::warn;

/// Values held by the cache. `cleanup` runs once, under the writer lock,
/// when the value is dropped from its entry.
pub trait CacheValue: Send + Sync + 'static {
    fn cleanup(&self) -> Result<(), CxgError> {
        Ok(())
    }
}

#[derive(Debug)]
pub enum EntryState<V> {
    Empty,
    Loaded(Arc<V>),
    /// Terminal load failure, replayed to every later reader.
    Failed(CxgError),
}

impl<V> Default for EntryState<V> {
    fn default() -> Self {
        Self::Empty
    }
}

/// A loaded value plus the reader lock that keeps it from being evicted.
/// Dropping the lease releases the lock.
pub struct CacheLease<V> {
    value: Arc<V>,
    _guard: ReadGuard<EntryState<V>>,
}

impl<V> CacheLease<V> {
    #[must_use]
    pub fn value(&self) -> &Arc<V> {
        &self.value
    }
}

impl<V> Deref for CacheLease<V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.value
    }
}

pub struct CacheEntry<V> {
    lock: DemotingRwLock<EntryState<V>>,
}

impl<V: CacheValue> CacheEntry<V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lock: DemotingRwLock::new(EntryState::Empty),
        }
    }

    /// Returns the value with a reader lock held, loading it first if the
    /// entry is empty. Concurrent callers wait on the writer lock, so the
    /// loader runs at most once per entry.
    pub async fn get<F, Fut>(&self, key: &str, loader: F) -> Result<CacheLease<V>, CxgError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, CxgError>>,
    {
        let read = self.lock.read().await;
        if let Some(lease) = Self::lease(read)? {
            return Ok(lease);
        }

        let mut write = self.lock.write().await;
        if matches!(*write, EntryState::Empty) {
            match loader().await {
                Ok(value) => *write = EntryState::Loaded(Arc::new(value)),
                Err(e) if e.is_terminal() => {
                    warn!(key, error = %e, "cache entry load failed; storing negative entry");
                    *write = EntryState::Failed(e);
                }
                Err(e) => {
                    // demote before returning so the caller sees the same lock
                    // state as on success
                    drop(write.demote());
                    return Err(e);
                }
            }
        }
        match Self::lease(write.demote())? {
            Some(lease) => Ok(lease),
            None => Err(CxgError::compute(format!("cache entry {key} is empty after load"))),
        }
    }

    /// The loaded value, if any, without loading.
    pub async fn peek(&self) -> Result<Option<CacheLease<V>>, CxgError> {
        Self::lease(self.lock.read().await)
    }

    fn lease(read: ReadGuard<EntryState<V>>) -> Result<Option<CacheLease<V>>, CxgError> {
        let value = match &*read {
            EntryState::Loaded(v) => Arc::clone(v),
            EntryState::Failed(e) => return Err(e.clone()),
            EntryState::Empty => return Ok(None),
        };
        Ok(Some(CacheLease {
            value,
            _guard: read,
        }))
    }

    /// Waits for every reader to leave, then clears the value.
    pub async fn delete(&self) {
        let mut write = self.lock.write().await;
        Self::clear(&mut write);
    }

    /// Clears the value only if nobody holds the entry. Returns false and
    /// leaves the entry untouched otherwise.
    pub fn try_delete(&self) -> bool {
        match self.lock.try_write() {
            Some(mut write) => {
                Self::clear(&mut write);
                true
            }
            None => false,
        }
    }

    fn clear(state: &mut EntryState<V>) {
        if let EntryState::Loaded(value) = std::mem::take(state) {
            if let Err(e) = value.cleanup() {
                warn!(error = %e, "cache value cleanup failed");
            }
        }
    }

    #[must_use]
    pub fn readers(&self) -> usize {
        self.lock.readers()
    }
}

impl<V: CacheValue> Default for CacheEntry<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tracked {
        cleanups: Arc<AtomicUsize>,
    }

    impl CacheValue for Tracked {
        fn cleanup(&self) -> Result<(), CxgError> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Err(CxgError::compute("cleanup errors are swallowed"))
        }
    }

    fn tracked(cleanups: &Arc<AtomicUsize>) -> Tracked {
        Tracked {
            cleanups: Arc::clone(cleanups),
        }
    }

    #[tokio::test]
    async fn loads_once_and_returns_with_reader_held() {
        let entry = CacheEntry::new();
        let cleanups = Arc::new(AtomicUsize::new(0));
        let loads = AtomicUsize::new(0);
        let first = entry
            .get("k", || async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(tracked(&cleanups))
            })
            .await
            .expect("first");
        let second = entry
            .get("k", || async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(tracked(&cleanups))
            })
            .await
            .expect("second");
        assert!(Arc::ptr_eq(first.value(), second.value()));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(entry.readers(), 2);
        assert!(!entry.try_delete());
        drop((first, second));
        assert!(entry.try_delete());
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert!(entry.peek().await.expect("peek").is_none());
    }

    #[tokio::test]
    async fn terminal_failure_is_replayed_without_reloading() {
        let entry: CacheEntry<Tracked> = CacheEntry::new();
        let err = entry
            .get("k", || async { Err(CxgError::not_found("gone")) })
            .await
            .err()
            .expect("not found");
        assert_eq!(err.code(), "DatasetNotFoundError");
        let again = entry
            .get("k", || async { Err(CxgError::compute("loader ran again")) })
            .await
            .err()
            .expect("replayed");
        assert_eq!(again, err);
        assert_eq!(entry.readers(), 0);
    }

    #[tokio::test]
    async fn transient_failure_leaves_entry_empty() {
        let entry: CacheEntry<Tracked> = CacheEntry::new();
        let cleanups = Arc::new(AtomicUsize::new(0));
        assert!(entry
            .get("k", || async { Err(CxgError::compute("flap")) })
            .await
            .is_err());
        assert_eq!(entry.readers(), 0);
        let lease = entry
            .get("k", || async { Ok(tracked(&cleanups)) })
            .await
            .expect("retry loads");
        drop(lease);
    }

    #[tokio::test]
    async fn delete_waits_for_readers() {
        let entry = Arc::new(CacheEntry::new());
        let cleanups = Arc::new(AtomicUsize::new(0));
        let lease = entry
            .get("k", || async { Ok(tracked(&cleanups)) })
            .await
            .expect("load");
        let deleter = {
            let entry = Arc::clone(&entry);
            tokio::spawn(async move { entry.delete().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);
        drop(lease);
        deleter.await.expect("delete task");
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }
}

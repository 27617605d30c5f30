// SPDX-License-Identifier: Apache-2.0

//! Reader/writer lock whose write guard can become a read guard without
//! releasing the lock in between.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

pub struct DemotingRwLock<T> {
    inner: Arc<RwLock<T>>,
    readers: Arc<AtomicUsize>,
}

impl<T> DemotingRwLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(RwLock::new(value)),
            readers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn read(&self) -> ReadGuard<T> {
        let guard = Arc::clone(&self.inner).read_owned().await;
        ReadGuard::track(guard, &self.readers)
    }

    pub async fn write(&self) -> WriteGuard<T> {
        WriteGuard {
            guard: Arc::clone(&self.inner).write_owned().await,
            readers: Arc::clone(&self.readers),
        }
    }

    /// Fails immediately when any reader or writer holds the lock.
    pub fn try_write(&self) -> Option<WriteGuard<T>> {
        let guard = Arc::clone(&self.inner).try_write_owned().ok()?;
        Some(WriteGuard {
            guard,
            readers: Arc::clone(&self.readers),
        })
    }

    /// Read guards currently alive.
    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }
}

impl<T: Default> Default for DemotingRwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub struct ReadGuard<T> {
    guard: OwnedRwLockReadGuard<T>,
    readers: Arc<AtomicUsize>,
}

impl<T> ReadGuard<T> {
    fn track(guard: OwnedRwLockReadGuard<T>, readers: &Arc<AtomicUsize>) -> Self {
        readers.fetch_add(1, Ordering::AcqRel);
        Self {
            guard,
            readers: Arc::clone(readers),
        }
    }
}

impl<T> Deref for ReadGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> Drop for ReadGuard<T> {
    fn drop(&mut self) {
        self.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct WriteGuard<T> {
    guard: OwnedRwLockWriteGuard<T>,
    readers: Arc<AtomicUsize>,
}

impl<T> WriteGuard<T> {
    /// Atomically trades exclusive access for one shared reader. No other
    /// writer can acquire the lock in between.
    pub fn demote(self) -> ReadGuard<T> {
        let Self { guard, readers } = self;
        ReadGuard::track(guard.downgrade(), &readers)
    }
}

impl<T> Deref for WriteGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for WriteGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

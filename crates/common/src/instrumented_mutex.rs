// FerroDB
// Copyright (C) 2025 FerroDB Contributors

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Mutex wrappers that account for waiters and holders.
//!
//! Each acquisition path raises a "waiting" gauge while blocked and a "held"
//! gauge for the lifetime of the returned guard. The gauges are maintained by
//! RAII guards, so every exit path releases them: timeouts, early returns and,
//! for the async variant, cancellation of the lock future.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::metrics::{Gauge, GaugeCounterGuard};

/// Gauges shared by one family of instrumented locks.
#[derive(Debug, Default)]
pub struct MutexMetrics {
    pub waiting_exclusive: Arc<Gauge>,
    pub waiting_shared: Arc<Gauge>,
    pub held_exclusive: Arc<Gauge>,
    pub held_shared: Arc<Gauge>,
}

impl MutexMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Exclusive mutex with waiter/holder accounting.
#[derive(Debug)]
pub struct InstrumentedMutex<T> {
    metrics: Arc<MutexMetrics>,
    inner: Mutex<T>,
}

pub struct InstrumentedMutexGuard<'a, T> {
    inner: MutexGuard<'a, T>,
    _held: GaugeCounterGuard,
}

impl<T> Deref for InstrumentedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for InstrumentedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T> InstrumentedMutex<T> {
    pub fn new(metrics: Arc<MutexMetrics>, value: T) -> Self {
        Self {
            metrics,
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> InstrumentedMutexGuard<'_, T> {
        let mut waiting = GaugeCounterGuard::new(Arc::clone(&self.metrics.waiting_exclusive), 1);
        let inner = self.inner.lock();
        waiting.reset();
        InstrumentedMutexGuard {
            inner,
            _held: GaugeCounterGuard::new(Arc::clone(&self.metrics.held_exclusive), 1),
        }
    }

    pub fn try_lock(&self) -> Option<InstrumentedMutexGuard<'_, T>> {
        let inner = self.inner.try_lock()?;
        Some(InstrumentedMutexGuard {
            inner,
            _held: GaugeCounterGuard::new(Arc::clone(&self.metrics.held_exclusive), 1),
        })
    }

    pub fn try_lock_for(&self, timeout: Duration) -> Option<InstrumentedMutexGuard<'_, T>> {
        let mut waiting = GaugeCounterGuard::new(Arc::clone(&self.metrics.waiting_exclusive), 1);
        let inner = self.inner.try_lock_for(timeout)?;
        waiting.reset();
        Some(InstrumentedMutexGuard {
            inner,
            _held: GaugeCounterGuard::new(Arc::clone(&self.metrics.held_exclusive), 1),
        })
    }
}

/// Shared/exclusive lock with waiter/holder accounting for both modes.
#[derive(Debug)]
pub struct InstrumentedRwLock<T> {
    metrics: Arc<MutexMetrics>,
    inner: RwLock<T>,
}

pub struct InstrumentedReadGuard<'a, T> {
    inner: RwLockReadGuard<'a, T>,
    _held: GaugeCounterGuard,
}

impl<T> Deref for InstrumentedReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

pub struct InstrumentedWriteGuard<'a, T> {
    inner: RwLockWriteGuard<'a, T>,
    _held: GaugeCounterGuard,
}

impl<T> Deref for InstrumentedWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for InstrumentedWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T> InstrumentedRwLock<T> {
    pub fn new(metrics: Arc<MutexMetrics>, value: T) -> Self {
        Self {
            metrics,
            inner: RwLock::new(value),
        }
    }

    pub fn read(&self) -> InstrumentedReadGuard<'_, T> {
        let mut waiting = GaugeCounterGuard::new(Arc::clone(&self.metrics.waiting_shared), 1);
        let inner = self.inner.read();
        waiting.reset();
        InstrumentedReadGuard {
            inner,
            _held: GaugeCounterGuard::new(Arc::clone(&self.metrics.held_shared), 1),
        }
    }

    pub fn write(&self) -> InstrumentedWriteGuard<'_, T> {
        let mut waiting = GaugeCounterGuard::new(Arc::clone(&self.metrics.waiting_exclusive), 1);
        let inner = self.inner.write();
        waiting.reset();
        InstrumentedWriteGuard {
            inner,
            _held: GaugeCounterGuard::new(Arc::clone(&self.metrics.held_exclusive), 1),
        }
    }

    pub fn try_read(&self) -> Option<InstrumentedReadGuard<'_, T>> {
        let inner = self.inner.try_read()?;
        Some(InstrumentedReadGuard {
            inner,
            _held: GaugeCounterGuard::new(Arc::clone(&self.metrics.held_shared), 1),
        })
    }

    pub fn try_write(&self) -> Option<InstrumentedWriteGuard<'_, T>> {
        let inner = self.inner.try_write()?;
        Some(InstrumentedWriteGuard {
            inner,
            _held: GaugeCounterGuard::new(Arc::clone(&self.metrics.held_exclusive), 1),
        })
    }

    pub fn try_read_for(&self, timeout: Duration) -> Option<InstrumentedReadGuard<'_, T>> {
        let mut waiting = GaugeCounterGuard::new(Arc::clone(&self.metrics.waiting_shared), 1);
        let inner = self.inner.try_read_for(timeout)?;
        waiting.reset();
        Some(InstrumentedReadGuard {
            inner,
            _held: GaugeCounterGuard::new(Arc::clone(&self.metrics.held_shared), 1),
        })
    }

    pub fn try_write_for(&self, timeout: Duration) -> Option<InstrumentedWriteGuard<'_, T>> {
        let mut waiting = GaugeCounterGuard::new(Arc::clone(&self.metrics.waiting_exclusive), 1);
        let inner = self.inner.try_write_for(timeout)?;
        waiting.reset();
        Some(InstrumentedWriteGuard {
            inner,
            _held: GaugeCounterGuard::new(Arc::clone(&self.metrics.held_exclusive), 1),
        })
    }
}

/// Async mutex with waiter/holder accounting.
///
/// The waiting gauge is carried by a guard across the `.await` point, so a
/// caller that drops the lock future (cancellation) releases its waiting slot.
#[derive(Debug)]
pub struct InstrumentedAsyncMutex<T> {
    metrics: Arc<MutexMetrics>,
    inner: tokio::sync::Mutex<T>,
}

pub struct InstrumentedAsyncMutexGuard<'a, T> {
    inner: tokio::sync::MutexGuard<'a, T>,
    _held: GaugeCounterGuard,
}

impl<T> Deref for InstrumentedAsyncMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for InstrumentedAsyncMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T> InstrumentedAsyncMutex<T> {
    pub fn new(metrics: Arc<MutexMetrics>, value: T) -> Self {
        Self {
            metrics,
            inner: tokio::sync::Mutex::new(value),
        }
    }

    pub async fn lock(&self) -> InstrumentedAsyncMutexGuard<'_, T> {
        let mut waiting = GaugeCounterGuard::new(Arc::clone(&self.metrics.waiting_exclusive), 1);
        let inner = self.inner.lock().await;
        waiting.reset();
        InstrumentedAsyncMutexGuard {
            inner,
            _held: GaugeCounterGuard::new(Arc::clone(&self.metrics.held_exclusive), 1),
        }
    }

    pub fn try_lock(&self) -> Option<InstrumentedAsyncMutexGuard<'_, T>> {
        let inner = self.inner.try_lock().ok()?;
        Some(InstrumentedAsyncMutexGuard {
            inner,
            _held: GaugeCounterGuard::new(Arc::clone(&self.metrics.held_exclusive), 1),
        })
    }

    pub async fn lock_timeout(&self, timeout: Duration) -> Option<InstrumentedAsyncMutexGuard<'_, T>> {
        tokio::time::timeout(timeout, self.lock()).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_lock_accounting() {
        let metrics = MutexMetrics::new();
        let mutex = InstrumentedMutex::new(Arc::clone(&metrics), 0u64);
        {
            let mut guard = mutex.lock();
            *guard += 1;
            assert_eq!(metrics.held_exclusive.get(), 1);
            assert_eq!(metrics.waiting_exclusive.get(), 0);
        }
        assert_eq!(metrics.held_exclusive.get(), 0);
        assert_eq!(*mutex.lock(), 1);
    }

    #[test]
    fn test_try_lock_for_times_out() {
        let metrics = MutexMetrics::new();
        let mutex = Arc::new(InstrumentedMutex::new(Arc::clone(&metrics), ()));

        let guard = mutex.lock();
        let contender = {
            let mutex = Arc::clone(&mutex);
            std::thread::spawn(move || mutex.try_lock_for(Duration::from_millis(50)).is_some())
        };
        let acquired = contender.join().unwrap();
        drop(guard);

        assert!(!acquired);
        assert_eq!(metrics.waiting_exclusive.get(), 0);
        assert_eq!(metrics.held_exclusive.get(), 0);
    }

    #[test]
    fn test_rwlock_shared_accounting() {
        let metrics = MutexMetrics::new();
        let lock = InstrumentedRwLock::new(Arc::clone(&metrics), 7u32);
        let r1 = lock.read();
        let r2 = lock.read();
        assert_eq!(metrics.held_shared.get(), 2);
        assert!(lock.try_write().is_none());
        drop(r1);
        drop(r2);
        assert_eq!(metrics.held_shared.get(), 0);
        assert_eq!(*lock.write(), 7);
    }

    #[tokio::test]
    async fn test_async_lock_accounting() {
        let metrics = MutexMetrics::new();
        let mutex = InstrumentedAsyncMutex::new(Arc::clone(&metrics), 5u64);
        {
            let guard = mutex.lock().await;
            assert_eq!(*guard, 5);
            assert_eq!(metrics.held_exclusive.get(), 1);
        }
        assert_eq!(metrics.held_exclusive.get(), 0);
    }

    #[tokio::test]
    async fn test_async_lock_cancellation_releases_waiting() {
        let metrics = MutexMetrics::new();
        let mutex = Arc::new(InstrumentedAsyncMutex::new(Arc::clone(&metrics), ()));

        let guard = mutex.lock().await;
        // second locker times out while the guard is held; its waiting slot
        // must be released when the future is dropped
        let timed_out = mutex.lock_timeout(Duration::from_millis(20)).await;
        assert!(timed_out.is_none());
        assert_eq!(metrics.waiting_exclusive.get(), 0);
        drop(guard);

        assert!(mutex.try_lock().is_some());
    }
}

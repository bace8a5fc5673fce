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

//! Atomic counter and gauge primitives.
//!
//! Counters are monotone and updated with relaxed ordering; gauges are signed
//! so that transient under-run during concurrent updates does not wrap. Both
//! are readable by the owning subsystem, not just by the exporter.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Monotone event counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Last-value / level gauge.
///
/// Signed on purpose: increment and decrement may race with readers and the
/// value must never wrap into a huge unsigned number.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn sub(&self, delta: i64) {
        self.value.fetch_sub(delta, Ordering::Relaxed);
    }

    pub fn increment(&self) {
        self.add(1);
    }

    pub fn decrement(&self) {
        self.sub(1);
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Atomically increment while the value stays below `limit`.
    ///
    /// This is what makes the gauge usable as a concurrency gate: reserve a
    /// slot and increment in one step, so two racing callers can never both
    /// slip past the limit.
    pub fn try_increment_below(&self, limit: i64) -> bool {
        self.value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| (value < limit).then_some(value + 1))
            .is_ok()
    }
}

/// RAII guard that keeps a gauge elevated for its own lifetime.
///
/// The guard remembers how much it has contributed and subtracts exactly that
/// amount when dropped or reset, so it can be moved across threads and
/// composed with `add` without double accounting.
#[derive(Debug, Default)]
pub struct GaugeCounterGuard {
    gauge: Option<Arc<Gauge>>,
    total: i64,
}

impl GaugeCounterGuard {
    pub fn new(gauge: Arc<Gauge>, initial: i64) -> Self {
        gauge.add(initial);
        Self {
            gauge: Some(gauge),
            total: initial,
        }
    }

    /// Contribute `delta` more to the gauge.
    pub fn add(&mut self, delta: i64) {
        if let Some(gauge) = &self.gauge {
            gauge.add(delta);
            self.total += delta;
        }
    }

    /// Give back the whole contribution early and detach from the gauge.
    pub fn reset(&mut self) {
        if let Some(gauge) = self.gauge.take() {
            gauge.sub(self.total);
            self.total = 0;
        }
    }
}

impl Drop for GaugeCounterGuard {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_monotone() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);
        counter.increment();
        counter.add(41);
        assert_eq!(counter.get(), 42);
    }

    #[test]
    fn test_gauge_add_sub_set() {
        let gauge = Gauge::new();
        gauge.add(10);
        gauge.sub(3);
        assert_eq!(gauge.get(), 7);
        gauge.decrement();
        assert_eq!(gauge.get(), 6);
        gauge.set(-2);
        assert_eq!(gauge.get(), -2);
    }

    #[test]
    fn test_gauge_guard_releases_on_drop() {
        let gauge = Arc::new(Gauge::new());
        {
            let _guard = GaugeCounterGuard::new(Arc::clone(&gauge), 1);
            assert_eq!(gauge.get(), 1);
        }
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn test_gauge_guard_add_and_reset() {
        let gauge = Arc::new(Gauge::new());
        let mut guard = GaugeCounterGuard::new(Arc::clone(&gauge), 2);
        guard.add(3);
        assert_eq!(gauge.get(), 5);
        guard.reset();
        assert_eq!(gauge.get(), 0);
        // a reset guard is inert
        guard.add(7);
        drop(guard);
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn test_try_increment_below() {
        let gauge = Gauge::new();
        assert!(gauge.try_increment_below(2));
        assert!(gauge.try_increment_below(2));
        assert!(!gauge.try_increment_below(2));
        gauge.decrement();
        assert!(gauge.try_increment_below(2));
    }

    #[test]
    fn test_counter_concurrent() {
        let counter = Arc::new(Counter::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.increment();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.get(), 8000);
    }
}

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

//! Thread-pool backends and the work items they execute.
//!
//! Both backends expose the same submit contract: `push` never blocks,
//! shutdown is signalled through sentinel items, and the worker boundary is
//! the sole catch site for panics out of user payloads.

pub mod central;
pub mod work_stealing;

use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ferrodb_common::{Counter, Gauge};
use tracing::warn;

use crate::context::CapturedContext;

/// A single scheduled unit of work.
///
/// Concrete type on purpose: the only polymorphism is the erased payload.
/// The item owns its enqueue timestamp for queue-time tracking, the captured
/// log context of the submitter, and its share of the job-memory gauge.
pub struct WorkItem {
    payload: Option<Box<dyn FnOnce() + Send + 'static>>,
    enqueue_time: Instant,
    context: CapturedContext,
    memory_bytes: i64,
    memory_gauge: Option<Arc<Gauge>>,
}

impl WorkItem {
    pub fn new<F>(payload: F, memory_gauge: Option<Arc<Gauge>>) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let memory_bytes = (size_of::<Self>() + size_of::<F>()) as i64;
        if let Some(gauge) = &memory_gauge {
            gauge.add(memory_bytes);
        }
        Self {
            payload: Some(Box::new(payload)),
            enqueue_time: Instant::now(),
            context: CapturedContext::capture(),
            memory_bytes,
            memory_gauge,
        }
    }

    pub fn enqueue_time(&self) -> Instant {
        self.enqueue_time
    }

    /// Time spent between enqueue and now.
    pub fn queue_time(&self) -> Duration {
        self.enqueue_time.elapsed()
    }

    /// Run the payload exactly once, inside the captured log context.
    pub fn invoke(mut self) {
        if let Some(payload) = self.payload.take() {
            self.context.scope(payload);
        }
    }
}

impl Drop for WorkItem {
    fn drop(&mut self) {
        if let Some(gauge) = self.memory_gauge.take() {
            gauge.sub(self.memory_bytes);
        }
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("enqueue_time", &self.enqueue_time)
            .field("memory_bytes", &self.memory_bytes)
            .finish()
    }
}

/// Queue entry: regular work or the shutdown sentinel.
///
/// Pushing one sentinel per worker unifies the empty-queue and shutdown
/// paths; there is no separate stop broadcast a parked worker could miss.
#[derive(Debug)]
pub(crate) enum Message {
    Work(WorkItem),
    Stop,
}

/// Per-queue metric hooks wired in by the scheduler.
///
/// Pools update these at every state transition; `detached()` gives a pool
/// standalone metrics for direct use and tests.
#[derive(Clone)]
pub struct QueueMetrics {
    pub jobs_dequeued: Arc<Counter>,
    pub jobs_done: Arc<Counter>,
    pub jobs_failed: Arc<Counter>,
    pub queue_length: Arc<Gauge>,
    pub dequeue_time_ms: Arc<Gauge>,
    pub queue_time_violations: Arc<Counter>,
    pub violation_threshold: Duration,
}

impl QueueMetrics {
    pub fn detached() -> Self {
        Self {
            jobs_dequeued: Arc::new(Counter::new()),
            jobs_done: Arc::new(Counter::new()),
            jobs_failed: Arc::new(Counter::new()),
            queue_length: Arc::new(Gauge::new()),
            dequeue_time_ms: Arc::new(Gauge::new()),
            queue_time_violations: Arc::new(Counter::new()),
            violation_threshold: Duration::MAX,
        }
    }

    pub(crate) fn on_enqueue(&self) {
        self.queue_length.increment();
    }

    pub(crate) fn on_dequeue(&self, item: &WorkItem) {
        self.jobs_dequeued.increment();
        self.queue_length.decrement();
        let queue_time = item.queue_time();
        self.dequeue_time_ms.set(queue_time.as_millis() as i64);
        if queue_time > self.violation_threshold {
            self.queue_time_violations.increment();
        }
    }

    pub(crate) fn on_discard(&self) {
        self.queue_length.decrement();
    }
}

/// Concurrency gate on a queue: a slot is reserved on the shared gauge at
/// dequeue time and given back once the item has finished executing, so the
/// bound holds even with many workers racing for the same queue.
#[derive(Clone)]
pub struct ConcurrencyGate {
    gauge: Arc<Gauge>,
    limit: i64,
}

impl ConcurrencyGate {
    pub fn new(gauge: Arc<Gauge>, limit: u64) -> Self {
        Self {
            gauge,
            limit: limit.min(i64::MAX as u64) as i64,
        }
    }

    pub(crate) fn try_acquire(&self) -> bool {
        self.gauge.try_increment_below(self.limit)
    }

    pub(crate) fn release(&self) {
        self.gauge.decrement();
    }
}

/// One scheduler-facing queue of a pool: metric hooks plus an optional
/// concurrency gate.
#[derive(Clone)]
pub struct QueueSlot {
    pub metrics: QueueMetrics,
    pub gate: Option<ConcurrencyGate>,
}

impl QueueSlot {
    pub fn detached() -> Self {
        Self {
            metrics: QueueMetrics::detached(),
            gate: None,
        }
    }
}

/// Shared counters for worker-thread lifecycle events.
#[derive(Clone)]
pub struct ThreadCounters {
    pub started: Arc<Counter>,
    pub stopped: Arc<Counter>,
}

impl ThreadCounters {
    pub fn detached() -> Self {
        Self {
            started: Arc::new(Counter::new()),
            stopped: Arc::new(Counter::new()),
        }
    }
}

/// Snapshot of a pool's own accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatistics {
    pub queued: u64,
    pub dequeued: u64,
    pub done: u64,
    pub failed: u64,
    pub in_queue: i64,
}

thread_local! {
    /// (pool identity, slot index) of the pool worker running on this thread.
    static CURRENT_WORKER: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
    /// Set by `detach_self`; the worker loop exits after the current task.
    static DETACH_REQUESTED: Cell<bool> = const { Cell::new(false) };
}

pub(crate) fn enter_worker(pool: usize, slot: usize) {
    CURRENT_WORKER.set(Some((pool, slot)));
    DETACH_REQUESTED.set(false);
}

pub(crate) fn current_worker_slot(pool: usize) -> Option<usize> {
    match CURRENT_WORKER.get() {
        Some((current_pool, slot)) if current_pool == pool => Some(slot),
        _ => None,
    }
}

pub(crate) fn request_detach() {
    DETACH_REQUESTED.set(true);
}

pub(crate) fn detach_requested() -> bool {
    DETACH_REQUESTED.get()
}

/// Invoke `item` at the worker boundary.
///
/// This is the sole catch site for user panics: they are logged, counted and
/// swallowed so the worker survives.
pub(crate) fn run_work_item(pool_name: &str, item: WorkItem, metrics: &QueueMetrics) -> bool {
    let result = catch_unwind(AssertUnwindSafe(|| item.invoke()));
    let ok = result.is_ok();
    if !ok {
        metrics.jobs_failed.increment();
        warn!(pool = pool_name, "scheduler just swallowed a panic from a task");
    }
    metrics.jobs_done.increment();
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_work_item_invoked_once_and_memory_accounted() {
        let gauge = Arc::new(Gauge::new());
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        let item = WorkItem::new(
            move || {
                ran_clone.store(true, Ordering::SeqCst);
            },
            Some(Arc::clone(&gauge)),
        );
        assert!(gauge.get() > 0);
        item.invoke();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn test_dropped_item_releases_memory_without_running() {
        let gauge = Arc::new(Gauge::new());
        let item = WorkItem::new(|| panic!("must not run"), Some(Arc::clone(&gauge)));
        drop(item);
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn test_queue_metrics_track_violations() {
        let metrics = QueueMetrics {
            violation_threshold: Duration::from_millis(0),
            ..QueueMetrics::detached()
        };
        let item = WorkItem::new(|| {}, None);
        std::thread::sleep(Duration::from_millis(2));
        metrics.on_enqueue();
        metrics.on_dequeue(&item);
        assert_eq!(metrics.queue_time_violations.get(), 1);
        assert_eq!(metrics.jobs_dequeued.get(), 1);
        assert_eq!(metrics.queue_length.get(), 0);
    }

    #[test]
    fn test_run_work_item_swallows_panic() {
        let metrics = QueueMetrics::detached();
        let ok = run_work_item("test-pool", WorkItem::new(|| panic!("boom"), None), &metrics);
        assert!(!ok);
        assert_eq!(metrics.jobs_failed.get(), 1);
        assert_eq!(metrics.jobs_done.get(), 1);
    }
}

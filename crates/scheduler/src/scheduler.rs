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

//! The priority scheduler.
//!
//! Maps request lanes to priority classes and dispatches submitted tasks to
//! the configured pool backend. Admission control, the ongoing low-priority
//! cap, queue-time tracking and the cron wheel for delayed work all live
//! here; the pools only move and run work items.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ferrodb_common::GaugeCounterGuard;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::config::{PoolBackend, SchedulerConfig};
use crate::cron::{CronState, DelayedWorkItem, WorkHandle};
use crate::error::SchedulerError;
use crate::futures::{DelayFuture, SubmitFuture, YieldFuture};
use crate::lane::{NUM_PRIORITIES, RequestLane, RequestPriority, priority_for_lane};
use crate::metrics::SchedulerMetrics;
use crate::pool::central::CentralThreadPool;
use crate::pool::work_stealing::WorkStealingThreadPool;
use crate::pool::{ConcurrencyGate, QueueSlot, WorkItem};

/// Coarse occupancy snapshot for monitoring endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatistics {
    /// Total worker threads across all pools.
    pub running: u64,
    /// Items currently queued across all priorities.
    pub queued: u64,
    /// Items dequeued but not yet finished.
    pub working: u64,
}

/// Pool topology behind the scheduler.
///
/// Central keeps one worker set draining all four priority queues;
/// work-stealing dedicates one pool per priority.
enum PoolSet {
    Central(CentralThreadPool),
    WorkStealing([WorkStealingThreadPool; NUM_PRIORITIES]),
}

impl PoolSet {
    fn start(&self) -> std::io::Result<()> {
        match self {
            Self::Central(pool) => pool.start(),
            Self::WorkStealing(pools) => {
                for pool in pools {
                    pool.start()?;
                }
                Ok(())
            }
        }
    }

    fn push(&self, priority_index: usize, item: WorkItem) {
        match self {
            Self::Central(pool) => pool.push(priority_index, item),
            Self::WorkStealing(pools) => pools[priority_index].push(item),
        }
    }

    fn shutdown(&self) {
        match self {
            Self::Central(pool) => pool.shutdown(),
            Self::WorkStealing(pools) => {
                for pool in pools {
                    pool.shutdown();
                }
            }
        }
    }

    fn worker_count(&self) -> usize {
        match self {
            Self::Central(pool) => pool.worker_count(),
            Self::WorkStealing(pools) => pools.iter().map(|pool| pool.worker_count()).sum(),
        }
    }

    fn detach_current(&self) -> bool {
        match self {
            Self::Central(pool) => pool.detach_self(),
            Self::WorkStealing(pools) => pools.iter().any(|pool| pool.detach_self()),
        }
    }
}

pub(crate) struct SchedulerInner {
    config: SchedulerConfig,
    metrics: Arc<SchedulerMetrics>,
    pools: PoolSet,
    cron: Arc<CronState>,
    cron_thread: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    accepting: AtomicBool,
    stopping: AtomicBool,
}

impl SchedulerInner {
    fn priority_for(&self, lane: RequestLane) -> RequestPriority {
        if lane == RequestLane::Continuation {
            self.config.continuation_priority
        } else {
            priority_for_lane(lane)
        }
    }

    /// Bounded admission against the per-priority cap and, for low priority,
    /// the ongoing limit. The scheduler-side length gauge is the gate, not
    /// the pool internals.
    fn admit(&self, priority: RequestPriority) -> bool {
        let index = priority.as_index();
        if self.metrics.queue_lengths[index].get() >= self.config.fifo_max[index] as i64 {
            self.metrics.queue_full.increment();
            return false;
        }
        if priority == RequestPriority::Low
            && self.metrics.ongoing_low_priority.get() > self.config.ongoing_low_priority_limit as i64
        {
            self.metrics.queue_full.increment();
            return false;
        }
        true
    }

    fn account_submit(&self, lane: RequestLane, priority: RequestPriority) {
        self.metrics.jobs_submitted[priority.as_index()].increment();
        self.metrics.lane_submitted[lane.as_index()].increment();
    }

    /// Wrap the payload with per-lane dequeue accounting and, for low
    /// priority, the ongoing gauge, then erase it into a work item.
    ///
    /// Under the central backend the ongoing gauge is maintained by the low
    /// queue's concurrency gate instead, which reserves at dequeue time.
    fn make_item<F>(&self, lane: RequestLane, priority: RequestPriority, payload: F) -> WorkItem
    where
        F: FnOnce() + Send + 'static,
    {
        let lane_dequeued = Arc::clone(&self.metrics.lane_dequeued[lane.as_index()]);
        let ongoing = (priority == RequestPriority::Low && self.config.backend == PoolBackend::WorkStealing)
            .then(|| Arc::clone(&self.metrics.ongoing_low_priority));
        let wrapped = move || {
            lane_dequeued.increment();
            let _ongoing = ongoing.map(|gauge| GaugeCounterGuard::new(gauge, 1));
            payload();
        };
        WorkItem::new(wrapped, Some(Arc::clone(&self.metrics.job_memory_bytes)))
    }

    fn do_queue<F>(&self, lane: RequestLane, payload: F, bounded: bool) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.accepting.load(Ordering::Acquire) {
            return false;
        }
        let priority = self.priority_for(lane);
        if bounded && !self.admit(priority) {
            return false;
        }
        self.account_submit(lane, priority);
        let item = self.make_item(lane, priority, payload);
        self.pools.push(priority.as_index(), item);
        true
    }

    /// Unbounded submit that hands the payload back instead of dropping it
    /// when the scheduler no longer accepts work. Used by the cron wheel and
    /// the yield future.
    pub(crate) fn queue_boxed(
        &self,
        lane: RequestLane,
        payload: Box<dyn FnOnce() + Send + 'static>,
    ) -> Result<(), Box<dyn FnOnce() + Send + 'static>> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(payload);
        }
        let priority = self.priority_for(lane);
        self.account_submit(lane, priority);
        let item = self.make_item(lane, priority, payload);
        self.pools.push(priority.as_index(), item);
        Ok(())
    }
}

/// The request scheduler: a multi-priority thread-pool dispatcher for
/// short-lived, mostly non-blocking tasks.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let config = config.sanitized();
        let metrics = SchedulerMetrics::new();
        let thread_counters = metrics.thread_counters();
        let violation_threshold = config.queue_time_violation_threshold;

        let pools = match config.backend {
            PoolBackend::Central => {
                let slots = RequestPriority::ALL
                    .iter()
                    .map(|priority| QueueSlot {
                        metrics: metrics.queue_metrics(*priority, violation_threshold),
                        gate: (*priority == RequestPriority::Low).then(|| {
                            ConcurrencyGate::new(Arc::clone(&metrics.ongoing_low_priority), config.ongoing_low_priority_limit)
                        }),
                    })
                    .collect();
                PoolSet::Central(CentralThreadPool::with_queues(
                    "sched",
                    config.max_threads,
                    slots,
                    config.priority_skip_threshold,
                    thread_counters,
                ))
            }
            PoolBackend::WorkStealing => PoolSet::WorkStealing(std::array::from_fn(|index| {
                let priority = RequestPriority::ALL[index];
                WorkStealingThreadPool::with_slot(
                    format!("sched-{}", priority.name()),
                    config.pool_width(priority),
                    QueueSlot {
                        metrics: metrics.queue_metrics(priority, violation_threshold),
                        gate: None,
                    },
                    thread_counters.clone(),
                )
            })),
        };

        Self {
            inner: Arc::new(SchedulerInner {
                config,
                metrics,
                pools,
                cron: CronState::new(),
                cron_thread: Mutex::new(None),
                started: AtomicBool::new(false),
                accepting: AtomicBool::new(true),
                stopping: AtomicBool::new(false),
            }),
        }
    }

    /// Spawn the worker threads and the cron thread. Idempotent.
    pub fn start(&self) -> Result<(), SchedulerError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.pools.start()?;
        let cron = Arc::clone(&self.inner.cron);
        let wake_interval = self.inner.config.cron_wake_interval_max;
        let handle = std::thread::Builder::new()
            .name("sched-cron".into())
            .spawn(move || cron.run(wake_interval))?;
        *self.inner.cron_thread.lock() = Some(handle);
        debug!(workers = self.inner.pools.worker_count(), "scheduler started");
        Ok(())
    }

    /// Reject new work, cancel pending delayed tasks, drain the pools and
    /// join every thread. Idempotent; pending handlers fire with
    /// `cancelled = true`, queued-but-unexecuted items are dropped with their
    /// destructors run.
    pub fn shutdown(&self) {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.accepting.store(false, Ordering::Release);
        self.inner.cron.stop();
        match self.inner.cron_thread.lock().take() {
            Some(handle) => {
                let _ = handle.join();
            }
            None => self.inner.cron.drain(),
        }
        self.inner.pools.shutdown();
        debug!("scheduler stopped");
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::Acquire)
    }

    /// Unbounded submission.
    ///
    /// # Panics
    ///
    /// Panics when the scheduler is shutting down; an unbounded submission
    /// has no failure channel, and silently dropping accepted work would
    /// break the at-most-once contract.
    pub fn submit<F>(&self, lane: RequestLane, payload: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let queued = self.inner.do_queue(lane, payload, false);
        assert!(queued, "unbounded submission to a stopping scheduler");
    }

    /// Bounded submission: false when the priority's queue is at capacity or
    /// (for low-priority lanes) too many low-priority tasks are ongoing.
    #[must_use]
    pub fn try_submit_bounded<F>(&self, lane: RequestLane, payload: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.do_queue(lane, payload, true)
    }

    /// Unbounded submission whose result is delivered through a future.
    pub fn submit_with_future<F, R>(&self, lane: RequestLane, payload: F) -> SubmitFuture<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(lane, move || {
            let _ = tx.send(payload());
        });
        SubmitFuture::new(rx)
    }

    /// Hand `handler` to the cron wheel, to be submitted on `lane` after
    /// `delay`. Dropping every clone of the returned handle cancels the task;
    /// the handler then fires once with `cancelled = true` at its deadline.
    ///
    /// Delays at or below the configured short-delay threshold bypass the
    /// wheel and are submitted right away.
    pub fn submit_delayed<F>(&self, name: &str, lane: RequestLane, delay: Duration, handler: F) -> WorkHandle
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let item = Arc::new(DelayedWorkItem::new(
            name,
            lane,
            Box::new(handler),
            Arc::downgrade(&self.inner),
        ));
        if !self.inner.accepting.load(Ordering::Acquire) {
            item.fire_cancelled();
        } else if delay <= self.inner.config.short_delay_threshold {
            item.fire();
        } else {
            self.inner.cron.insert(Instant::now() + delay, Arc::clone(&item));
        }
        WorkHandle::new(item)
    }

    /// A future that completes after `duration`, or with `Cancelled` when
    /// dropped or raced by shutdown. Zero duration completes immediately.
    pub fn delay(&self, name: &str, duration: Duration) -> DelayFuture {
        if duration.is_zero() {
            return DelayFuture::immediate();
        }
        let (tx, rx) = oneshot::channel();
        let handle = self.submit_delayed(name, RequestLane::DelayedFuture, duration, move |cancelled| {
            let _ = tx.send(cancelled);
        });
        DelayFuture::pending(rx, handle)
    }

    /// Cooperative reschedule: suspend the current task and resume it from a
    /// worker serving `lane`.
    pub fn yield_now(&self, lane: RequestLane) -> YieldFuture {
        YieldFuture::new(Arc::downgrade(&self.inner), lane)
    }

    /// Replace the calling pool worker with a fresh thread; the caller exits
    /// its pool loop after the current task. False when the calling thread is
    /// not a pool worker of this scheduler.
    pub fn detach_current_thread(&self) -> bool {
        self.inner.pools.detach_current()
    }

    pub fn queue_statistics(&self) -> QueueStatistics {
        let mut queued = 0u64;
        let mut working = 0u64;
        for index in 0..NUM_PRIORITIES {
            queued += self.inner.metrics.queue_lengths[index].get().max(0) as u64;
            let dequeued = self.inner.metrics.jobs_dequeued[index].get();
            let done = self.inner.metrics.jobs_done[index].get();
            working += dequeued.saturating_sub(done);
        }
        QueueStatistics {
            running: self.inner.pools.worker_count() as u64,
            queued,
            working,
        }
    }

    /// Ratio of queued items to total queue capacity, in [0, 1].
    pub fn approximate_queue_fill_grade(&self) -> f64 {
        let capacity: u64 = self.inner.config.fifo_max.iter().sum();
        if capacity == 0 {
            return 0.0;
        }
        let queued: u64 = self
            .inner
            .metrics
            .queue_lengths
            .iter()
            .map(|gauge| gauge.get().max(0) as u64)
            .sum();
        (queued as f64 / capacity as f64).clamp(0.0, 1.0)
    }

    /// Fill grade from which onwards the server reports itself unavailable.
    pub fn unavailability_queue_fill_grade(&self) -> f64 {
        self.inner.config.unavailability_queue_fill_grade
    }

    pub fn is_unavailable(&self) -> bool {
        self.approximate_queue_fill_grade() >= self.unavailability_queue_fill_grade()
    }

    pub fn metrics(&self) -> &Arc<SchedulerMetrics> {
        &self.inner.metrics
    }

    pub fn worker_count(&self) -> usize {
        self.inner.pools.worker_count()
    }

    pub fn track_create_handler_task(&self) {
        self.inner.metrics.handler_tasks_created.increment();
    }

    pub fn track_begin_ongoing_low_priority_task(&self) {
        self.inner.metrics.ongoing_low_priority.increment();
    }

    pub fn track_end_ongoing_low_priority_task(&self) {
        self.inner.metrics.ongoing_low_priority.decrement();
    }

    pub fn track_queue_time_violation(&self) {
        self.inner.metrics.queue_time_violations.increment();
    }

    pub fn track_queue_item_size(&self, bytes: i64) {
        self.inner.metrics.job_memory_bytes.add(bytes);
    }

    /// Queue time of the most recently dequeued low-priority item, in ms.
    pub fn last_low_priority_dequeue_time_ms(&self) -> u64 {
        self.inner.metrics.last_low_priority_dequeue_time_ms()
    }

    /// (ongoing low-priority tasks, queued low-priority items).
    pub fn number_low_prio_ongoing_and_queued(&self) -> (u64, u64) {
        let ongoing = self.inner.metrics.ongoing_low_priority.get().max(0) as u64;
        let queued = self.inner.metrics.queue_lengths[RequestPriority::Low.as_index()].get().max(0) as u64;
        (ongoing, queued)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lane::NUM_PRIORITIES;

    fn config_with_caps(caps: [u64; NUM_PRIORITIES]) -> SchedulerConfig {
        SchedulerConfig {
            max_threads: 4,
            fifo_max: caps,
            ..Default::default()
        }
    }

    #[test]
    fn test_submission_accounts_only_target_priority() {
        // not started: items stay queued, counters are still updated
        let scheduler = Scheduler::new(config_with_caps([16; NUM_PRIORITIES]));
        scheduler.submit(RequestLane::ClientFast, || {});
        let metrics = scheduler.metrics();
        assert_eq!(metrics.jobs_submitted[RequestPriority::High.as_index()].get(), 1);
        for priority in [RequestPriority::Maintenance, RequestPriority::Medium, RequestPriority::Low] {
            assert_eq!(metrics.jobs_submitted[priority.as_index()].get(), 0);
        }
        assert_eq!(metrics.lane_submitted[RequestLane::ClientFast.as_index()].get(), 1);
        assert_eq!(metrics.queue_lengths[RequestPriority::High.as_index()].get(), 1);
    }

    #[test]
    fn test_bounded_submission_respects_cap() {
        let scheduler = Scheduler::new(config_with_caps([2; NUM_PRIORITIES]));
        assert!(scheduler.try_submit_bounded(RequestLane::ClientSlow, || {}));
        assert!(scheduler.try_submit_bounded(RequestLane::ClientSlow, || {}));
        assert!(!scheduler.try_submit_bounded(RequestLane::ClientSlow, || {}));
        assert_eq!(scheduler.metrics().queue_full.get(), 1);
        // the unbounded path still accepts
        scheduler.submit(RequestLane::ClientSlow, || {});
    }

    #[test]
    fn test_ongoing_low_priority_blocks_bounded_low_submissions() {
        let scheduler = Scheduler::new(SchedulerConfig {
            max_threads: 4,
            ongoing_low_priority_limit: 2,
            ..Default::default()
        });
        for _ in 0..3 {
            scheduler.track_begin_ongoing_low_priority_task();
        }
        assert!(!scheduler.try_submit_bounded(RequestLane::ClientSlow, || {}));
        // high priority is unaffected
        assert!(scheduler.try_submit_bounded(RequestLane::ClientFast, || {}));
        for _ in 0..3 {
            scheduler.track_end_ongoing_low_priority_task();
        }
        assert!(scheduler.try_submit_bounded(RequestLane::ClientSlow, || {}));
    }

    #[test]
    fn test_fill_grade_matches_queue_contents() {
        let scheduler = Scheduler::new(config_with_caps([100; NUM_PRIORITIES]));
        for _ in 0..95 {
            assert!(scheduler.try_submit_bounded(RequestLane::ClientSlow, || {}));
        }
        let grade = scheduler.approximate_queue_fill_grade();
        assert!((grade - 0.2375).abs() < 1e-9, "grade was {grade}");
        assert!(!scheduler.is_unavailable());
        assert_eq!(scheduler.unavailability_queue_fill_grade(), 0.9);
    }

    #[test]
    fn test_continuation_priority_is_configurable() {
        let scheduler = Scheduler::new(SchedulerConfig {
            continuation_priority: RequestPriority::High,
            ..Default::default()
        });
        scheduler.submit(RequestLane::Continuation, || {});
        assert_eq!(scheduler.metrics().jobs_submitted[RequestPriority::High.as_index()].get(), 1);
    }

    #[test]
    fn test_shutdown_is_idempotent_and_rejects_bounded() {
        let scheduler = Scheduler::new(config_with_caps([16; NUM_PRIORITIES]));
        scheduler.start().unwrap();
        scheduler.shutdown();
        scheduler.shutdown();
        assert!(scheduler.is_stopping());
        assert!(!scheduler.try_submit_bounded(RequestLane::ClientFast, || {}));
    }

    #[test]
    #[should_panic(expected = "stopping scheduler")]
    fn test_unbounded_submit_after_shutdown_panics() {
        let scheduler = Scheduler::new(config_with_caps([16; NUM_PRIORITIES]));
        scheduler.start().unwrap();
        scheduler.shutdown();
        scheduler.submit(RequestLane::ClientFast, || {});
    }

    #[test]
    fn test_queue_statistics_running_counts_all_pools() {
        let config = SchedulerConfig {
            max_threads: 8,
            ..Default::default()
        };
        let expected: usize = RequestPriority::ALL.iter().map(|p| config.pool_width(*p)).sum();
        let scheduler = Scheduler::new(config);
        assert_eq!(scheduler.queue_statistics().running, expected as u64);
    }

    #[test]
    fn test_central_backend_worker_count_is_max_threads() {
        let scheduler = Scheduler::new(SchedulerConfig {
            max_threads: 6,
            backend: PoolBackend::Central,
            ..Default::default()
        });
        assert_eq!(scheduler.worker_count(), 6);
    }

    #[test]
    fn test_queued_items_are_dropped_at_shutdown_with_accounting() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        // never started: the items can only be dropped by shutdown
        scheduler.submit(RequestLane::ClientFast, || panic!("must not run"));
        assert!(scheduler.metrics().job_memory_bytes.get() > 0);
        scheduler.shutdown();
        assert_eq!(scheduler.metrics().job_memory_bytes.get(), 0);
        assert_eq!(scheduler.metrics().queue_lengths[RequestPriority::High.as_index()].get(), 0);
    }
}

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

//! Scheduler metrics registry.
//!
//! The registry is explicitly owned by the scheduler and passed by reference
//! into the pools; there are no ambient globals. The same atomics feed both
//! the scheduler's own decisions (admission, overload detection) and the
//! metrics export. The metric names and the lane/priority labels are a stable
//! contract.

use std::sync::Arc;
use std::time::Duration;

use ::metrics::{absolute_counter, gauge};
use ferrodb_common::{Counter, Gauge};

use crate::lane::{NUM_PRIORITIES, RequestLane, RequestPriority};
use crate::pool::{QueueMetrics, ThreadCounters};

pub const NUM_LANES: usize = RequestLane::ALL.len();

pub struct SchedulerMetrics {
    pub jobs_submitted: [Arc<Counter>; NUM_PRIORITIES],
    pub jobs_dequeued: [Arc<Counter>; NUM_PRIORITIES],
    pub jobs_done: [Arc<Counter>; NUM_PRIORITIES],
    pub jobs_failed: [Arc<Counter>; NUM_PRIORITIES],
    pub queue_lengths: [Arc<Gauge>; NUM_PRIORITIES],
    pub dequeue_times_ms: [Arc<Gauge>; NUM_PRIORITIES],
    pub lane_submitted: [Arc<Counter>; NUM_LANES],
    pub lane_dequeued: [Arc<Counter>; NUM_LANES],
    pub queue_full: Arc<Counter>,
    pub queue_time_violations: Arc<Counter>,
    pub ongoing_low_priority: Arc<Gauge>,
    pub handler_tasks_created: Arc<Counter>,
    pub job_memory_bytes: Arc<Gauge>,
    pub threads_started: Arc<Counter>,
    pub threads_stopped: Arc<Counter>,
}

impl SchedulerMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs_submitted: std::array::from_fn(|_| Arc::new(Counter::new())),
            jobs_dequeued: std::array::from_fn(|_| Arc::new(Counter::new())),
            jobs_done: std::array::from_fn(|_| Arc::new(Counter::new())),
            jobs_failed: std::array::from_fn(|_| Arc::new(Counter::new())),
            queue_lengths: std::array::from_fn(|_| Arc::new(Gauge::new())),
            dequeue_times_ms: std::array::from_fn(|_| Arc::new(Gauge::new())),
            lane_submitted: std::array::from_fn(|_| Arc::new(Counter::new())),
            lane_dequeued: std::array::from_fn(|_| Arc::new(Counter::new())),
            queue_full: Arc::new(Counter::new()),
            queue_time_violations: Arc::new(Counter::new()),
            ongoing_low_priority: Arc::new(Gauge::new()),
            handler_tasks_created: Arc::new(Counter::new()),
            job_memory_bytes: Arc::new(Gauge::new()),
            threads_started: Arc::new(Counter::new()),
            threads_stopped: Arc::new(Counter::new()),
        })
    }

    /// Hooks a pool queue serving `priority` updates on every transition.
    pub(crate) fn queue_metrics(&self, priority: RequestPriority, violation_threshold: Duration) -> QueueMetrics {
        let index = priority.as_index();
        QueueMetrics {
            jobs_dequeued: Arc::clone(&self.jobs_dequeued[index]),
            jobs_done: Arc::clone(&self.jobs_done[index]),
            jobs_failed: Arc::clone(&self.jobs_failed[index]),
            queue_length: Arc::clone(&self.queue_lengths[index]),
            dequeue_time_ms: Arc::clone(&self.dequeue_times_ms[index]),
            queue_time_violations: Arc::clone(&self.queue_time_violations),
            violation_threshold,
        }
    }

    pub(crate) fn thread_counters(&self) -> ThreadCounters {
        ThreadCounters {
            started: Arc::clone(&self.threads_started),
            stopped: Arc::clone(&self.threads_stopped),
        }
    }

    /// Queue time of the most recently dequeued low-priority item, in ms.
    pub fn last_low_priority_dequeue_time_ms(&self) -> u64 {
        self.dequeue_times_ms[RequestPriority::Low.as_index()].get().max(0) as u64
    }

    /// Mirror the registry into the `metrics` facade.
    ///
    /// Intended to be called periodically by the host's exporter; the hot
    /// path only touches the atomics.
    pub fn publish(&self) {
        for priority in RequestPriority::ALL {
            let index = priority.as_index();
            let label = priority.name();
            absolute_counter!("ferrodb_scheduler_jobs_submitted_total", self.jobs_submitted[index].get(), "priority" => label);
            absolute_counter!("ferrodb_scheduler_jobs_dequeued_total", self.jobs_dequeued[index].get(), "priority" => label);
            absolute_counter!("ferrodb_scheduler_jobs_done_total", self.jobs_done[index].get(), "priority" => label);
            absolute_counter!("ferrodb_scheduler_jobs_failed_total", self.jobs_failed[index].get(), "priority" => label);
            gauge!("ferrodb_scheduler_queue_length", self.queue_lengths[index].get() as f64, "priority" => label);
            gauge!("ferrodb_scheduler_dequeue_time_ms", self.dequeue_times_ms[index].get() as f64, "priority" => label);
        }
        for lane in RequestLane::ALL {
            let index = lane.as_index();
            let label = lane.name();
            absolute_counter!("ferrodb_scheduler_lane_submitted_total", self.lane_submitted[index].get(), "lane" => label);
            absolute_counter!("ferrodb_scheduler_lane_dequeued_total", self.lane_dequeued[index].get(), "lane" => label);
        }
        absolute_counter!("ferrodb_scheduler_queue_full_total", self.queue_full.get());
        absolute_counter!("ferrodb_scheduler_queue_time_violations_total", self.queue_time_violations.get());
        gauge!("ferrodb_scheduler_ongoing_low_priority", self.ongoing_low_priority.get() as f64);
        gauge!(
            "ferrodb_scheduler_last_low_priority_dequeue_time_ms",
            self.last_low_priority_dequeue_time_ms() as f64
        );
        absolute_counter!("ferrodb_scheduler_handler_tasks_created_total", self.handler_tasks_created.get());
        gauge!("ferrodb_scheduler_job_memory_bytes", self.job_memory_bytes.get() as f64);
        absolute_counter!("ferrodb_scheduler_threads_started_total", self.threads_started.get());
        absolute_counter!("ferrodb_scheduler_threads_stopped_total", self.threads_stopped.get());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_metrics_share_atomics() {
        let metrics = SchedulerMetrics::new();
        let hooks = metrics.queue_metrics(RequestPriority::Low, Duration::from_secs(1));
        hooks.jobs_done.increment();
        assert_eq!(metrics.jobs_done[RequestPriority::Low.as_index()].get(), 1);
        hooks.queue_length.increment();
        assert_eq!(metrics.queue_lengths[RequestPriority::Low.as_index()].get(), 1);
    }

    #[test]
    fn test_last_low_dequeue_time_reads_low_gauge() {
        let metrics = SchedulerMetrics::new();
        metrics.dequeue_times_ms[RequestPriority::Low.as_index()].set(123);
        assert_eq!(metrics.last_low_priority_dequeue_time_ms(), 123);
    }

    #[test]
    fn test_publish_does_not_panic_without_recorder() {
        let metrics = SchedulerMetrics::new();
        metrics.jobs_submitted[0].add(5);
        metrics.publish();
    }
}

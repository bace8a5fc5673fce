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

//! Scheduler configuration.

use std::time::Duration;

use crate::lane::{NUM_PRIORITIES, RequestPriority};

/// Thread-pool backend selection.
///
/// Central keeps one pool whose workers drain all four priority queues and
/// guarantees FIFO observation per (submitting thread, lane). Work-stealing
/// runs one pool per priority and trades the FIFO guarantee for better
/// locality under load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolBackend {
    Central,
    WorkStealing,
}

/// Per-priority share of `max_threads` and the minimum pool width.
///
/// The shares deliberately sum to more than 1.0: dedicated pools no longer
/// share threads between priorities, so the total is over-provisioned to
/// compensate.
const THREAD_SHARES: [(f64, usize); NUM_PRIORITIES] = [
    (0.1, 2),  // maintenance
    (0.4, 4),  // high
    (0.4, 4),  // medium
    (0.6, 4),  // low
];

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker budget. The central backend runs exactly this many workers;
    /// the work-stealing backend sizes each priority pool as a share of it.
    pub max_threads: usize,
    pub backend: PoolBackend,
    /// Bounded-submission cap per priority queue.
    pub fifo_max: [u64; NUM_PRIORITIES],
    /// Hard cap on concurrently executing low-priority tasks.
    pub ongoing_low_priority_limit: u64,
    /// Queue time above which the violation counter is incremented.
    pub queue_time_violation_threshold: Duration,
    /// Queue fill grade from which onwards the server reports itself as
    /// unavailable because of overload.
    pub unavailability_queue_fill_grade: f64,
    /// Consecutive dequeues a priority may be skipped before a worker is
    /// forced to serve it next.
    pub priority_skip_threshold: u32,
    /// Upper bound on the cron thread's wait when work is pending, so the
    /// wheel stays responsive to newly inserted shorter deadlines.
    pub cron_wake_interval_max: Duration,
    /// Delays at or below this threshold bypass the cron wheel and are
    /// submitted directly.
    pub short_delay_threshold: Duration,
    /// Priority used for the continuation lane.
    pub continuation_priority: RequestPriority,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let max_threads = num_cpus::get().max(4);
        Self {
            max_threads,
            backend: PoolBackend::WorkStealing,
            fifo_max: [4096; NUM_PRIORITIES],
            ongoing_low_priority_limit: (4 * max_threads) as u64,
            queue_time_violation_threshold: Duration::from_secs(1),
            unavailability_queue_fill_grade: 0.9,
            priority_skip_threshold: 64,
            cron_wake_interval_max: Duration::from_millis(10),
            short_delay_threshold: Duration::from_millis(1),
            continuation_priority: RequestPriority::Medium,
        }
    }
}

impl SchedulerConfig {
    /// Worker count of the pool serving `priority` under the work-stealing
    /// backend.
    pub fn pool_width(&self, priority: RequestPriority) -> usize {
        let (share, floor) = THREAD_SHARES[priority.as_index()];
        ((self.max_threads as f64 * share).ceil() as usize).max(floor)
    }

    /// Clamp out-of-range values instead of failing construction.
    pub(crate) fn sanitized(mut self) -> Self {
        self.max_threads = self.max_threads.max(1);
        self.unavailability_queue_fill_grade = self.unavailability_queue_fill_grade.clamp(0.0, 1.0);
        for cap in &mut self.fifo_max {
            *cap = (*cap).max(1);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_sane() {
        let config = SchedulerConfig::default();
        assert!(config.max_threads >= 4);
        assert_eq!(config.backend, PoolBackend::WorkStealing);
        assert!(config.unavailability_queue_fill_grade > 0.0);
        assert!(config.unavailability_queue_fill_grade <= 1.0);
    }

    #[test]
    fn test_pool_widths_respect_floors() {
        let config = SchedulerConfig {
            max_threads: 8,
            ..Default::default()
        };
        assert_eq!(config.pool_width(RequestPriority::Maintenance), 2);
        assert_eq!(config.pool_width(RequestPriority::High), 4);
        assert_eq!(config.pool_width(RequestPriority::Medium), 4);
        assert_eq!(config.pool_width(RequestPriority::Low), 5);
    }

    #[test]
    fn test_sanitized_clamps() {
        let config = SchedulerConfig {
            max_threads: 0,
            unavailability_queue_fill_grade: 3.5,
            fifo_max: [0; NUM_PRIORITIES],
            ..Default::default()
        }
        .sanitized();
        assert_eq!(config.max_threads, 1);
        assert_eq!(config.unavailability_queue_fill_grade, 1.0);
        assert!(config.fifo_max.iter().all(|cap| *cap >= 1));
    }
}

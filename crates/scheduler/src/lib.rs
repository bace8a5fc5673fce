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

//! FerroDB request scheduler.
//!
//! A multi-priority, work-stealing thread-pool dispatcher for the short-lived,
//! mostly non-blocking tasks produced by the other server subsystems: request
//! handlers, replication, administrative jobs, delayed futures and
//! continuations.
//!
//! Producers tag every submission with a [`RequestLane`] naming its origin;
//! the scheduler maps lanes to one of four [`RequestPriority`] classes and
//! dispatches to the configured thread-pool backend. Delayed work goes
//! through a cron wheel whose handles cancel on drop. Every state transition
//! updates the owned [`SchedulerMetrics`] registry, which also feeds
//! admission control and overload detection.
//!
//! ```no_run
//! use ferrodb_scheduler::{RequestLane, Scheduler, SchedulerConfig};
//!
//! let scheduler = Scheduler::new(SchedulerConfig::default());
//! scheduler.start().unwrap();
//! scheduler.submit(RequestLane::ClientFast, || {
//!     // handle the request
//! });
//! scheduler.shutdown();
//! ```

pub mod config;
pub mod context;
pub mod cron;
pub mod error;
pub mod futures;
pub mod lane;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod scheduler;

pub use config::{PoolBackend, SchedulerConfig};
pub use context::CapturedContext;
pub use cron::WorkHandle;
pub use error::SchedulerError;
pub use futures::{DelayFuture, SubmitFuture, YieldFuture};
pub use lane::{NUM_PRIORITIES, RequestLane, RequestPriority, priority_for_lane};
pub use metrics::SchedulerMetrics;
pub use pool::central::CentralThreadPool;
pub use pool::work_stealing::WorkStealingThreadPool;
pub use pool::{ConcurrencyGate, PoolStatistics, QueueMetrics, QueueSlot, ThreadCounters, WorkItem};
pub use queue::BoundedMpmcQueue;
pub use scheduler::{QueueStatistics, Scheduler};

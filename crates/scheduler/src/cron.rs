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

//! Cron wheel for delayed task submission.
//!
//! One dedicated thread owns a min-heap of `(deadline, item)` entries. When a
//! deadline passes, the item's handler is submitted to the scheduler on its
//! registered lane. Cancellation is level-triggered: dropping the last
//! `WorkHandle` marks the item, and the handler then fires exactly once with
//! `cancelled = true` at its deadline. The wheel keeps the scheduler alive
//! through nothing: items refer back to it weakly, so there is no ownership
//! cycle.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::lane::RequestLane;
use crate::scheduler::SchedulerInner;

pub(crate) type DelayedHandler = Box<dyn FnOnce(bool) + Send + 'static>;

/// A task waiting in the cron wheel.
pub(crate) struct DelayedWorkItem {
    name: String,
    lane: RequestLane,
    handler: Mutex<Option<DelayedHandler>>,
    /// Swapped exactly once; whoever wins runs the handler.
    fired: AtomicBool,
    cancel_requested: AtomicBool,
    scheduler: Weak<SchedulerInner>,
}

impl DelayedWorkItem {
    pub(crate) fn new(name: impl Into<String>, lane: RequestLane, handler: DelayedHandler, scheduler: Weak<SchedulerInner>) -> Self {
        Self {
            name: name.into(),
            lane,
            handler: Mutex::new(Some(handler)),
            fired: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            scheduler,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
    }

    /// Run the handler at most once. It is queued on the item's lane; if the
    /// scheduler is gone or no longer accepting, it runs inline instead.
    pub(crate) fn fire(&self) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        let cancelled = self.cancel_requested.load(Ordering::Acquire);
        let Some(handler) = self.handler.lock().take() else {
            return;
        };
        let payload: Box<dyn FnOnce() + Send + 'static> = Box::new(move || handler(cancelled));
        match self.scheduler.upgrade() {
            Some(inner) => {
                if let Err(rejected) = inner.queue_boxed(self.lane, payload) {
                    rejected();
                }
            }
            None => payload(),
        }
    }

    pub(crate) fn fire_cancelled(&self) {
        self.request_cancel();
        self.fire();
    }
}

/// Shared handle to a pending delayed task.
///
/// Handles are cheap to clone; when the last one is dropped the pending task
/// is cancelled and its handler will fire with `cancelled = true`.
#[derive(Clone)]
pub struct WorkHandle {
    core: Arc<HandleCore>,
}

struct HandleCore {
    item: Arc<DelayedWorkItem>,
}

impl Drop for HandleCore {
    fn drop(&mut self) {
        self.item.request_cancel();
    }
}

impl WorkHandle {
    pub(crate) fn new(item: Arc<DelayedWorkItem>) -> Self {
        Self {
            core: Arc::new(HandleCore { item }),
        }
    }

    /// Request cancellation without waiting for the handle to be dropped.
    pub fn cancel(&self) {
        self.core.item.request_cancel();
    }

    pub fn name(&self) -> &str {
        self.core.item.name()
    }
}

impl std::fmt::Debug for WorkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkHandle").field("name", &self.name()).finish()
    }
}

/// Heap entry; ordering is reversed so `BinaryHeap::peek` yields the earliest
/// deadline, ties broken by insertion order.
pub(crate) struct CronEntry {
    deadline: Instant,
    seq: u64,
    pub(crate) item: Arc<DelayedWorkItem>,
}

impl PartialEq for CronEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for CronEntry {}

impl PartialOrd for CronEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CronEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.deadline.cmp(&self.deadline).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// State shared between the cron thread and the scheduler.
pub(crate) struct CronState {
    queue: Mutex<BinaryHeap<CronEntry>>,
    wakeup: Condvar,
    seq: AtomicU64,
    stopping: AtomicBool,
}

impl CronState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(BinaryHeap::new()),
            wakeup: Condvar::new(),
            seq: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
        })
    }

    pub(crate) fn insert(&self, deadline: Instant, item: Arc<DelayedWorkItem>) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut queue = self.queue.lock();
        let becomes_earliest = queue.peek().is_none_or(|top| deadline < top.deadline);
        queue.push(CronEntry { deadline, seq, item });
        drop(queue);
        if becomes_earliest {
            self.wakeup.notify_one();
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub(crate) fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.wakeup.notify_one();
    }

    /// Body of the `sched-cron` thread.
    ///
    /// Waits are clamped to `wake_interval_max` so a newly inserted shorter
    /// deadline is picked up promptly even without a notification.
    pub(crate) fn run(&self, wake_interval_max: Duration) {
        loop {
            let mut queue = self.queue.lock();
            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            let now = Instant::now();
            let next_deadline = queue.peek().map(|top| top.deadline);
            match next_deadline {
                None => {
                    self.wakeup.wait(&mut queue);
                }
                Some(deadline) if deadline > now => {
                    let timeout = (deadline - now).min(wake_interval_max);
                    self.wakeup.wait_for(&mut queue, timeout);
                }
                Some(_) => {
                    let due = queue.pop();
                    drop(queue);
                    if let Some(entry) = due {
                        entry.item.fire();
                    }
                }
            }
        }
        self.drain();
    }

    /// Fire everything still pending with `cancelled = true`. The lock is not
    /// held across the handlers, which may re-enter the scheduler.
    pub(crate) fn drain(&self) {
        let entries: Vec<CronEntry> = {
            let mut queue = self.queue.lock();
            queue.drain().collect()
        };
        for entry in entries {
            entry.item.fire_cancelled();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn inline_item(counter: &Arc<AtomicUsize>, cancelled_seen: &Arc<AtomicBool>) -> Arc<DelayedWorkItem> {
        let counter = Arc::clone(counter);
        let cancelled_seen = Arc::clone(cancelled_seen);
        Arc::new(DelayedWorkItem::new(
            "test",
            RequestLane::DelayedFuture,
            Box::new(move |cancelled| {
                counter.fetch_add(1, Ordering::SeqCst);
                cancelled_seen.store(cancelled, Ordering::SeqCst);
            }),
            // no scheduler: the handler runs inline
            Weak::new(),
        ))
    }

    #[test]
    fn test_entry_ordering_is_min_heap() {
        let base = Instant::now();
        let mut heap = BinaryHeap::new();
        let dummy = || inline_item(&Arc::new(AtomicUsize::new(0)), &Arc::new(AtomicBool::new(false)));
        heap.push(CronEntry {
            deadline: base + Duration::from_millis(30),
            seq: 0,
            item: dummy(),
        });
        heap.push(CronEntry {
            deadline: base + Duration::from_millis(10),
            seq: 1,
            item: dummy(),
        });
        heap.push(CronEntry {
            deadline: base + Duration::from_millis(10),
            seq: 2,
            item: dummy(),
        });
        // earliest deadline first, then insertion order
        let first = heap.pop().unwrap();
        assert_eq!(first.deadline, base + Duration::from_millis(10));
        assert_eq!(first.seq, 1);
        let second = heap.pop().unwrap();
        assert_eq!(second.seq, 2);
        assert_eq!(heap.pop().unwrap().seq, 0);
    }

    #[test]
    fn test_fire_runs_at_most_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cancelled_seen = Arc::new(AtomicBool::new(false));
        let item = inline_item(&counter, &cancelled_seen);
        item.fire();
        item.fire();
        item.fire_cancelled();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!cancelled_seen.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancel_before_fire_passes_flag() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cancelled_seen = Arc::new(AtomicBool::new(false));
        let item = inline_item(&counter, &cancelled_seen);
        let handle = WorkHandle::new(Arc::clone(&item));
        drop(handle);
        item.fire();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(cancelled_seen.load(Ordering::SeqCst));
    }

    #[test]
    fn test_clone_keeps_handle_alive() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cancelled_seen = Arc::new(AtomicBool::new(false));
        let item = inline_item(&counter, &cancelled_seen);
        let handle = WorkHandle::new(Arc::clone(&item));
        let clone = handle.clone();
        drop(handle);
        item.fire();
        // one handle still lives: not cancelled
        assert!(!cancelled_seen.load(Ordering::SeqCst));
        drop(clone);
    }

    #[test]
    fn test_drain_fires_cancelled() {
        let state = CronState::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let cancelled_seen = Arc::new(AtomicBool::new(false));
        let item = inline_item(&counter, &cancelled_seen);
        state.insert(Instant::now() + Duration::from_secs(3600), item);
        assert_eq!(state.pending(), 1);

        state.stop();
        state.run(Duration::from_millis(10));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(cancelled_seen.load(Ordering::SeqCst));
        assert_eq!(state.pending(), 0);
    }
}

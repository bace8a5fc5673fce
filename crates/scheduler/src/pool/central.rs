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

//! Central-queue thread pool.
//!
//! N workers share one set of priority-ordered lock-free queues. A worker
//! that finds them empty spins for a bounded number of tries (the spin budget
//! decays steeply with the worker id, so under light load only the lowest
//! numbered workers stay hot) and then parks on a condition variable gated by
//! the `in_queue` counter.
//!
//! Fairness between the queues is per worker: each worker keeps a
//! "since last serve" counter per queue and serves a queue that has waited
//! longer than the skip threshold next, regardless of more urgent work.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::queue::BoundedMpmcQueue;

use super::{Message, PoolStatistics, QueueSlot, ThreadCounters, WorkItem};

/// Spin budget for worker `id` (1-based): the lowest-numbered worker spins
/// the longest, higher-numbered workers park almost immediately.
fn spin_budget(id: usize) -> usize {
    10 + 16_384 / (id * id * id)
}

/// How long a worker naps when work is present but every queue is gated.
const GATED_NAP: Duration = Duration::from_millis(1);

pub struct CentralThreadPool {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    width: usize,
    queues: Vec<CentralQueue>,
    skip_threshold: u32,
    /// Number of messages across all queues; release/acquire so a woken
    /// worker observes the pushed item state. This is what parks and wakes
    /// workers, separate from the per-queue metric gauges.
    in_queue: AtomicI64,
    park_mutex: Mutex<()>,
    park_condvar: Condvar,
    threads: Mutex<Vec<Option<JoinHandle<()>>>>,
    thread_counters: ThreadCounters,
    stopping: AtomicBool,
    queued: AtomicU64,
    dequeued: AtomicU64,
    done: AtomicU64,
    failed: AtomicU64,
}

struct CentralQueue {
    items: BoundedMpmcQueue<Message>,
    slot: QueueSlot,
}

impl CentralThreadPool {
    /// A plain pool with a single queue and standalone metrics.
    pub fn new(name: impl Into<String>, width: usize) -> Self {
        Self::with_queues(name, width, vec![QueueSlot::detached()], u32::MAX, ThreadCounters::detached())
    }

    /// A pool draining `slots.len()` queues in priority order (index 0 is
    /// the most urgent).
    pub fn with_queues(
        name: impl Into<String>,
        width: usize,
        slots: Vec<QueueSlot>,
        skip_threshold: u32,
        thread_counters: ThreadCounters,
    ) -> Self {
        assert!(width > 0, "thread pool needs at least one worker");
        assert!(!slots.is_empty(), "thread pool needs at least one queue");
        let queues = slots
            .into_iter()
            .map(|slot| CentralQueue {
                items: BoundedMpmcQueue::unbounded(),
                slot,
            })
            .collect();
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                width,
                queues,
                skip_threshold,
                in_queue: AtomicI64::new(0),
                park_mutex: Mutex::new(()),
                park_condvar: Condvar::new(),
                threads: Mutex::new(Vec::new()),
                thread_counters,
                stopping: AtomicBool::new(false),
                queued: AtomicU64::new(0),
                dequeued: AtomicU64::new(0),
                done: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    pub fn start(&self) -> std::io::Result<()> {
        let mut threads = self.inner.threads.lock();
        if !threads.is_empty() {
            return Ok(());
        }
        for id in 1..=self.inner.width {
            threads.push(Some(Inner::spawn_worker(&self.inner, id)?));
        }
        Ok(())
    }

    /// Push work onto queue `queue`. Never blocks.
    pub fn push(&self, queue: usize, item: WorkItem) {
        let target = &self.inner.queues[queue];
        target.slot.metrics.on_enqueue();
        self.inner.queued.fetch_add(1, Ordering::Relaxed);
        if target.items.push(Message::Work(item)).is_err() {
            unreachable!("central pool queues are unbounded");
        }
        self.inner.notify_push();
    }

    /// Convenience for single-queue pools.
    pub fn push_work<F>(&self, payload: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(0, WorkItem::new(payload, None));
    }

    /// Push one stop sentinel per worker, join them all and drop whatever is
    /// still queued. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        for _ in 0..self.inner.width {
            self.inner.push_stop();
        }
        // workers may still be detaching and spawning replacements; keep
        // joining until the thread list is quiescent
        loop {
            let handles: Vec<_> = {
                let mut threads = self.inner.threads.lock();
                threads.iter_mut().filter_map(|slot| slot.take()).collect()
            };
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                let _ = handle.join();
            }
        }
        for queue in &self.inner.queues {
            while let Some(message) = queue.items.pop() {
                self.inner.in_queue.fetch_sub(1, Ordering::AcqRel);
                if let Message::Work(item) = message {
                    queue.slot.metrics.on_discard();
                    drop(item);
                }
            }
        }
    }

    /// Replace the calling worker with a fresh thread and let it leave the
    /// pool once its current task is finished. Returns false when the calling
    /// thread is not a worker of this pool.
    ///
    /// The active slot count stays at the configured width throughout.
    pub fn detach_self(&self) -> bool {
        let Some(slot) = super::current_worker_slot(self.inner.identity()) else {
            return false;
        };
        let replacement = match Inner::spawn_worker(&self.inner, slot) {
            Ok(handle) => handle,
            Err(_) => return false,
        };
        {
            let mut threads = self.inner.threads.lock();
            // dropping the previous handle detaches the calling thread
            threads[slot - 1] = Some(replacement);
        }
        super::request_detach();
        true
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn worker_count(&self) -> usize {
        self.inner.width
    }

    pub fn active_threads(&self) -> usize {
        self.inner.threads.lock().iter().filter(|slot| slot.is_some()).count()
    }

    pub fn queue_len(&self, queue: usize) -> usize {
        self.inner.queues[queue].items.len()
    }

    pub fn statistics(&self) -> PoolStatistics {
        PoolStatistics {
            queued: self.inner.queued.load(Ordering::Relaxed),
            dequeued: self.inner.dequeued.load(Ordering::Relaxed),
            done: self.inner.done.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            in_queue: self.inner.in_queue.load(Ordering::Acquire),
        }
    }
}

impl Drop for CentralThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn identity(&self) -> usize {
        self as *const Inner as usize
    }

    fn spawn_worker(this: &Arc<Inner>, id: usize) -> std::io::Result<JoinHandle<()>> {
        let inner = Arc::clone(this);
        std::thread::Builder::new()
            .name(format!("{}-{}", this.name, id))
            .spawn(move || {
                inner.thread_counters.started.increment();
                inner.worker_loop(id);
                inner.thread_counters.stopped.increment();
            })
    }

    fn worker_loop(&self, id: usize) {
        super::enter_worker(self.identity(), id);
        let mut since_last_serve = vec![0u32; self.queues.len()];
        loop {
            match self.pop(id, &mut since_last_serve) {
                (queue, Message::Stop) => {
                    self.release_gate(queue);
                    return;
                }
                (queue, Message::Work(item)) => {
                    let ok = super::run_work_item(&self.name, item, &self.queues[queue].slot.metrics);
                    self.release_gate(queue);
                    self.done.fetch_add(1, Ordering::Relaxed);
                    if !ok {
                        self.failed.fetch_add(1, Ordering::Relaxed);
                    }
                    if super::detach_requested() {
                        return;
                    }
                }
            }
        }
    }

    /// Blocking pop: spin first, then park until a push arrives.
    fn pop(&self, id: usize, since_last_serve: &mut [u32]) -> (usize, Message) {
        let budget = spin_budget(id);
        loop {
            let mut tries = 0;
            loop {
                if let Some(popped) = self.try_pop(since_last_serve) {
                    return popped;
                }
                tries += 1;
                if tries > budget {
                    break;
                }
                std::hint::spin_loop();
            }

            let mut guard = self.park_mutex.lock();
            if self.in_queue.load(Ordering::Acquire) <= 0 {
                self.park_condvar.wait(&mut guard);
            } else {
                // work exists but every queue with work is gated; nap
                // briefly so a reopened gate is noticed
                self.park_condvar.wait_for(&mut guard, GATED_NAP);
            }
        }
    }

    fn try_pop(&self, since_last_serve: &mut [u32]) -> Option<(usize, Message)> {
        // starved queues first, most patient (least urgent) side up
        for queue in (0..self.queues.len()).rev() {
            if since_last_serve[queue] > self.skip_threshold
                && let Some(message) = self.try_pop_queue(queue)
            {
                return Some(self.note_serve(queue, message, since_last_serve));
            }
        }
        for queue in 0..self.queues.len() {
            if let Some(message) = self.try_pop_queue(queue) {
                return Some(self.note_serve(queue, message, since_last_serve));
            }
        }
        None
    }

    /// Pop from one queue, reserving a gate slot first where one is set. A
    /// message popped from a gated queue carries a reservation that the
    /// worker releases after running it.
    fn try_pop_queue(&self, queue: usize) -> Option<Message> {
        let target = &self.queues[queue];
        match &target.slot.gate {
            None => target.items.pop(),
            Some(gate) => {
                if target.items.is_empty() || !gate.try_acquire() {
                    return None;
                }
                match target.items.pop() {
                    Some(message) => Some(message),
                    None => {
                        // lost the race for the last item
                        gate.release();
                        None
                    }
                }
            }
        }
    }

    fn release_gate(&self, queue: usize) {
        if let Some(gate) = &self.queues[queue].slot.gate {
            gate.release();
        }
    }

    fn note_serve(&self, queue: usize, message: Message, since_last_serve: &mut [u32]) -> (usize, Message) {
        for (index, waited) in since_last_serve.iter_mut().enumerate() {
            if index == queue || self.queues[index].items.is_empty() {
                *waited = 0;
            } else {
                *waited += 1;
            }
        }
        self.in_queue.fetch_sub(1, Ordering::AcqRel);
        if let Message::Work(item) = &message {
            self.dequeued.fetch_add(1, Ordering::Relaxed);
            self.queues[queue].slot.metrics.on_dequeue(item);
        }
        (queue, message)
    }

    fn push_stop(&self) {
        if self.queues[0].items.push(Message::Stop).is_err() {
            unreachable!("central pool queues are unbounded");
        }
        self.notify_push();
    }

    fn notify_push(&self) {
        let previous = self.in_queue.fetch_add(1, Ordering::Release);
        if previous < self.width as i64 {
            // take the park mutex so a worker between its emptiness check and
            // its wait cannot miss this wakeup
            let _guard = self.park_mutex.lock();
            self.park_condvar.notify_one();
        }
    }
}

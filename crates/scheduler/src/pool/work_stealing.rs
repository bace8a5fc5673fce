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

//! Work-stealing thread pool.
//!
//! Every worker owns a deque guarded by its own mutex. Pushes append at the
//! tail; the owner pops from the tail, stealers take from the head. A submit
//! from inside a worker of this pool lands on that worker's own deque,
//! everything else round-robins across the workers. Steal victims are chosen
//! by a per-worker PRNG seeded with the worker id, and a victim's mutex is
//! held only for the dequeue itself, never across the invocation.
//!
//! There is no FIFO guarantee here; callers that need one use the central
//! backend.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::{Message, PoolStatistics, QueueSlot, ThreadCounters, WorkItem};

/// Consecutive failed steals before a worker parks.
const STEAL_FAILURES_BEFORE_PARK: u32 = 8;

/// Park timeout; a parked worker re-checks the other deques this often even
/// without being woken.
const PARK_TIMEOUT: Duration = Duration::from_millis(2);

pub struct WorkStealingThreadPool {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    width: usize,
    workers: Vec<Arc<WorkerState>>,
    slot: QueueSlot,
    push_index: AtomicUsize,
    threads: Mutex<Vec<Option<JoinHandle<()>>>>,
    thread_counters: ThreadCounters,
    stopping: AtomicBool,
    queued: AtomicU64,
    dequeued: AtomicU64,
    done: AtomicU64,
    failed: AtomicU64,
    in_queue: AtomicU64,
}

struct WorkerState {
    deque: Mutex<VecDeque<Message>>,
    wakeup: Condvar,
}

impl WorkStealingThreadPool {
    pub fn new(name: impl Into<String>, width: usize) -> Self {
        Self::with_slot(name, width, QueueSlot::detached(), ThreadCounters::detached())
    }

    pub fn with_slot(name: impl Into<String>, width: usize, slot: QueueSlot, thread_counters: ThreadCounters) -> Self {
        assert!(width > 0, "thread pool needs at least one worker");
        // concurrency gates are a central-backend concept; here the pool
        // width is the execution bound
        debug_assert!(slot.gate.is_none(), "work-stealing pools do not consult queue gates");
        let workers = (0..width)
            .map(|_| {
                Arc::new(WorkerState {
                    deque: Mutex::new(VecDeque::new()),
                    wakeup: Condvar::new(),
                })
            })
            .collect();
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                width,
                workers,
                slot,
                push_index: AtomicUsize::new(0),
                threads: Mutex::new(Vec::new()),
                thread_counters,
                stopping: AtomicBool::new(false),
                queued: AtomicU64::new(0),
                dequeued: AtomicU64::new(0),
                done: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                in_queue: AtomicU64::new(0),
            }),
        }
    }

    pub fn start(&self) -> std::io::Result<()> {
        let mut threads = self.inner.threads.lock();
        if !threads.is_empty() {
            return Ok(());
        }
        for index in 0..self.inner.width {
            threads.push(Some(Inner::spawn_worker(&self.inner, index)?));
        }
        Ok(())
    }

    /// Push work. A pool worker pushes onto its own deque, everyone else
    /// round-robins. Never blocks beyond the deque mutex.
    pub fn push(&self, item: WorkItem) {
        self.inner.slot.metrics.on_enqueue();
        self.inner.queued.fetch_add(1, Ordering::Relaxed);
        self.inner.in_queue.fetch_add(1, Ordering::Release);
        let index = match super::current_worker_slot(self.inner.identity()) {
            Some(own) => own,
            None => self.inner.push_index.fetch_add(1, Ordering::Relaxed) % self.inner.width,
        };
        let worker = &self.inner.workers[index];
        {
            let mut deque = worker.deque.lock();
            deque.push_back(Message::Work(item));
        }
        worker.wakeup.notify_one();
    }

    pub fn push_work<F>(&self, payload: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(WorkItem::new(payload, None));
    }

    /// Put one sentinel at the head of every deque, join the workers, drop
    /// the leftovers. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        for worker in &self.inner.workers {
            {
                let mut deque = worker.deque.lock();
                deque.push_front(Message::Stop);
            }
            worker.wakeup.notify_all();
        }
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
        for worker in &self.inner.workers {
            let mut deque = worker.deque.lock();
            while let Some(message) = deque.pop_front() {
                if let Message::Work(item) = message {
                    self.inner.in_queue.fetch_sub(1, Ordering::AcqRel);
                    self.inner.slot.metrics.on_discard();
                    drop(item);
                }
            }
        }
    }

    /// Replace the calling worker with a fresh thread on the same slot; the
    /// caller leaves the pool loop after its current task. Returns false when
    /// the calling thread is not a worker of this pool.
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
            threads[slot] = Some(replacement);
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

    pub fn statistics(&self) -> PoolStatistics {
        PoolStatistics {
            queued: self.inner.queued.load(Ordering::Relaxed),
            dequeued: self.inner.dequeued.load(Ordering::Relaxed),
            done: self.inner.done.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            in_queue: self.inner.in_queue.load(Ordering::Acquire) as i64,
        }
    }
}

impl Drop for WorkStealingThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn identity(&self) -> usize {
        self as *const Inner as usize
    }

    fn spawn_worker(this: &Arc<Inner>, index: usize) -> std::io::Result<JoinHandle<()>> {
        let inner = Arc::clone(this);
        std::thread::Builder::new()
            .name(format!("{}-{}", this.name, index))
            .spawn(move || {
                inner.thread_counters.started.increment();
                inner.worker_loop(index);
                inner.thread_counters.stopped.increment();
            })
    }

    fn worker_loop(&self, index: usize) {
        super::enter_worker(self.identity(), index);
        let mut rng = SmallRng::seed_from_u64(index as u64);
        let mut steal_failures = 0u32;
        let state = Arc::clone(&self.workers[index]);
        loop {
            let message = {
                let mut deque = state.deque.lock();
                if matches!(deque.front(), Some(Message::Stop)) {
                    deque.pop_front()
                } else {
                    // owner takes the freshest item
                    deque.pop_back()
                }
            };
            match message {
                Some(Message::Stop) => return,
                Some(Message::Work(item)) => {
                    steal_failures = 0;
                    self.run(item);
                }
                None => match self.try_steal(index, &mut rng) {
                    Some(item) => {
                        steal_failures = 0;
                        self.run(item);
                    }
                    None => {
                        steal_failures += 1;
                        if steal_failures >= STEAL_FAILURES_BEFORE_PARK {
                            steal_failures = 0;
                            let mut deque = state.deque.lock();
                            if deque.is_empty() {
                                state.wakeup.wait_for(&mut deque, PARK_TIMEOUT);
                            }
                        }
                    }
                },
            }
            if super::detach_requested() {
                return;
            }
        }
    }

    /// Try to take the oldest item from a random victim. The victim's mutex
    /// is released before the item is invoked.
    fn try_steal(&self, own_index: usize, rng: &mut SmallRng) -> Option<WorkItem> {
        let victim = rng.gen_range(0..self.width);
        if victim == own_index {
            return None;
        }
        let mut deque = self.workers[victim].deque.lock();
        match deque.front() {
            // never steal a shutdown sentinel out from under its owner
            None | Some(Message::Stop) => None,
            Some(Message::Work(_)) => match deque.pop_front() {
                Some(Message::Work(item)) => Some(item),
                _ => None,
            },
        }
    }

    fn run(&self, item: WorkItem) {
        self.dequeued.fetch_add(1, Ordering::Relaxed);
        self.in_queue.fetch_sub(1, Ordering::AcqRel);
        self.slot.metrics.on_dequeue(&item);
        let ok = super::run_work_item(&self.name, item, &self.slot.metrics);
        self.done.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

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

//! Bounded lock-free MPMC FIFO queue.
//!
//! The queue itself is an unbounded `SegQueue`; admission is gated by a
//! separate atomic length counter, which is the authoritative bound. A failed
//! bounded push hands the item back to the caller untouched. Neither push nor
//! pop ever blocks.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;

#[derive(Debug)]
pub struct BoundedMpmcQueue<T> {
    items: SegQueue<T>,
    len: AtomicUsize,
    capacity: usize,
}

impl<T> BoundedMpmcQueue<T> {
    pub fn bounded(capacity: usize) -> Self {
        Self {
            items: SegQueue::new(),
            len: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn unbounded() -> Self {
        Self::bounded(usize::MAX)
    }

    /// Push `item`, or hand it back when the queue is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        // reserve a slot first; the counter is the admission gate, not the
        // queue internals
        let previous = self.len.fetch_add(1, Ordering::AcqRel);
        if previous >= self.capacity {
            self.len.fetch_sub(1, Ordering::AcqRel);
            return Err(item);
        }
        self.items.push(item);
        Ok(())
    }

    /// Pop the least recently pushed item, non-blocking.
    pub fn pop(&self) -> Option<T> {
        let item = self.items.pop()?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(item)
    }

    /// Approximate number of queued items.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_single_thread() {
        let queue = BoundedMpmcQueue::bounded(16);
        for i in 0..10 {
            queue.push(i).unwrap();
        }
        for i in 0..10 {
            assert_eq!(queue.pop(), Some(i));
        }
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_bounded_push_returns_item() {
        let queue = BoundedMpmcQueue::bounded(2);
        assert!(queue.push("a").is_ok());
        assert!(queue.push("b").is_ok());
        assert_eq!(queue.push("c"), Err("c"));
        assert_eq!(queue.len(), 2);
        // popping frees a slot again
        assert_eq!(queue.pop(), Some("a"));
        assert!(queue.push("c").is_ok());
    }

    #[test]
    fn test_concurrent_producers_and_consumers() {
        let queue = Arc::new(BoundedMpmcQueue::unbounded());
        let produced = 4 * 1000;

        let producers: Vec<_> = (0..4u64)
            .map(|p| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..1000u64 {
                        queue.push(p * 1000 + i).unwrap();
                    }
                })
            })
            .collect();

        let consumed = Arc::new(AtomicUsize::new(0));
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let consumed = Arc::clone(&consumed);
                std::thread::spawn(move || {
                    while consumed.load(Ordering::Relaxed) < produced {
                        if queue.pop().is_some() {
                            consumed.fetch_add(1, Ordering::Relaxed);
                        } else {
                            std::thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        for handle in producers {
            handle.join().unwrap();
        }
        for handle in consumers {
            handle.join().unwrap();
        }
        assert_eq!(consumed.load(Ordering::Relaxed), produced);
        assert!(queue.is_empty());
    }

    proptest! {
        #[test]
        fn prop_len_never_exceeds_capacity(capacity in 1usize..64, ops in proptest::collection::vec(any::<bool>(), 0..256)) {
            let queue = BoundedMpmcQueue::bounded(capacity);
            let mut model = std::collections::VecDeque::new();
            for push in ops {
                if push {
                    let value = model.len();
                    match queue.push(value) {
                        Ok(()) => model.push_back(value),
                        Err(returned) => {
                            prop_assert_eq!(returned, value);
                            prop_assert_eq!(model.len(), capacity);
                        }
                    }
                } else {
                    prop_assert_eq!(queue.pop(), model.pop_front());
                }
                prop_assert!(queue.len() <= capacity);
                prop_assert_eq!(queue.len(), model.len());
            }
        }
    }
}

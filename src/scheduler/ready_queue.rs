// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::scheduler::Work;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A bounded thread-safe deque of work items, customized for the needs of
/// the scheduler.
///
/// Each worker owns one of these; idle workers take work off a sibling's
/// queue with [`ReadyQueue::steal_from`]. The queue size is memoized in an
/// atomic so that [`ReadyQueue::size`] and [`ReadyQueue::is_empty`] can be
/// polled by other workers without touching the lock.
pub struct ReadyQueue {
    max_queue_size: usize,
    queue: Mutex<VecDeque<Work>>,
    work_available: Condvar,
    memoized_queue_size: AtomicUsize,
}

impl ReadyQueue {
    /// Create a queue bounded to `max_queue_size` items; `None` means
    /// effectively unbounded.
    pub fn new(max_queue_size: Option<usize>) -> Self {
        Self {
            max_queue_size: max_queue_size.unwrap_or(usize::MAX),
            queue: Mutex::new(VecDeque::new()),
            work_available: Condvar::new(),
            memoized_queue_size: AtomicUsize::new(0),
        }
    }

    /// The current size of the queue. Lock-free.
    pub fn size(&self) -> usize {
        self.memoized_queue_size.load(Ordering::Relaxed)
    }

    /// Check if the queue is empty. Lock-free.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Wait (block) up to `timeout` for work to become available.
    ///
    /// May wake spuriously; callers are expected to loop around their pop.
    pub fn await_work(&self, timeout: Duration) {
        let queue = self.queue.lock().unwrap();
        let _unused = self.work_available.wait_timeout(queue, timeout).unwrap();
    }

    /// Push a task to the front of the queue - pushing a task off the back
    /// of the queue to make room if necessary. A displaced task is returned
    /// to the caller.
    pub fn push_front(&self, task: Work) -> Option<Work> {
        let mut queue = self.queue.lock().unwrap();

        if queue.len() + 1 > self.max_queue_size {
            let overflow = queue.pop_back();
            queue.push_front(task);
            overflow
        } else {
            queue.push_front(task);
            self.memoized_queue_size.fetch_add(1, Ordering::Relaxed);
            self.work_available.notify_one();
            None
        }
    }

    /// Push a task to the back of the queue if there is room.
    ///
    /// # Errors
    ///
    /// Returns the task back when the queue is full.
    pub fn push_back(&self, task: Work) -> Result<(), Work> {
        let mut queue = self.queue.lock().unwrap();

        if queue.len() >= self.max_queue_size {
            return Err(task);
        }

        queue.push_back(task);
        self.memoized_queue_size.fetch_add(1, Ordering::Relaxed);
        self.work_available.notify_one();
        Ok(())
    }

    /// Push a batch of tasks to the back of the queue if there is room for
    /// the entire batch. Atomic: either every task is enqueued or none are.
    ///
    /// # Errors
    ///
    /// Returns the untouched batch back when it does not fit.
    pub fn push_batch_back(&self, batch: Vec<Work>) -> Result<(), Vec<Work>> {
        let mut queue = self.queue.lock().unwrap();

        if queue.len() + batch.len() > self.max_queue_size {
            return Err(batch);
        }

        let enqueued = batch.len();
        queue.extend(batch);
        self.memoized_queue_size
            .fetch_add(enqueued, Ordering::Relaxed);
        self.work_available.notify_one();
        Ok(())
    }

    /// Pop a task from the front of the queue.
    pub fn pop_front(&self) -> Option<Work> {
        let mut queue = self.queue.lock().unwrap();
        let task = queue.pop_front()?;
        self.memoized_queue_size.fetch_sub(1, Ordering::Relaxed);
        Some(task)
    }

    /// Pop a task from the back of the queue.
    pub fn pop_back(&self) -> Option<Work> {
        let mut queue = self.queue.lock().unwrap();
        let task = queue.pop_back()?;
        self.memoized_queue_size.fetch_sub(1, Ordering::Relaxed);
        Some(task)
    }

    /// Steal a task from the back of the victim queue and push it to the
    /// front of this queue. Succeeds only if this queue has room and the
    /// victim has work.
    pub fn steal_from(&self, victim: &ReadyQueue) -> bool {
        if ptr::eq(self, victim) {
            return false;
        }

        // Lock both queues in a fixed global order (lowest address first) so
        // that concurrent thief/victim pairs cannot deadlock.
        let (first, second) = if (self as *const Self) < (victim as *const Self) {
            (self, victim)
        } else {
            (victim, self)
        };
        let first_guard = first.queue.lock().unwrap();
        let second_guard = second.queue.lock().unwrap();
        let (mut mine, mut theirs) = if ptr::eq(first, self) {
            (first_guard, second_guard)
        } else {
            (second_guard, first_guard)
        };

        if mine.len() >= self.max_queue_size {
            return false;
        }
        let Some(task) = theirs.pop_back() else {
            return false;
        };

        mine.push_front(task);
        self.memoized_queue_size.fetch_add(1, Ordering::Relaxed);
        victim.memoized_queue_size.fetch_sub(1, Ordering::Relaxed);
        self.work_available.notify_one();
        true
    }

    /// Wake every thread waiting for work, regardless of whether work is
    /// actually available.
    pub fn wake(&self) {
        let _guard = self.queue.lock().unwrap();
        self.work_available.notify_all();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn marker(slot: &Arc<AtomicUsize>, id: usize) -> Work {
        let slot = Arc::clone(slot);
        Box::new(move || slot.store(id, Ordering::SeqCst))
    }

    fn noop() -> Work {
        Box::new(|| {})
    }

    #[test]
    fn constructs_unbounded() {
        let queue = ReadyQueue::new(None);
        assert_eq!(queue.size(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn constructs_with_queue_size() {
        let queue = ReadyQueue::new(Some(10));
        assert_eq!(queue.size(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn push_front_overflows_from_the_back() {
        let executed = Arc::new(AtomicUsize::new(0));
        let queue = ReadyQueue::new(Some(2));

        assert!(queue.push_front(marker(&executed, 1)).is_none());
        assert_eq!(queue.size(), 1);

        assert!(queue.push_front(marker(&executed, 2)).is_none());
        assert_eq!(queue.size(), 2);

        let overflow = queue.push_front(marker(&executed, 3));
        assert_eq!(queue.size(), 2);

        // the displaced task is the previous back, i.e. the first push
        overflow.expect("queue was full")();
        assert_eq!(executed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn push_back_fails_iff_full() {
        let queue = ReadyQueue::new(Some(2));

        assert!(queue.push_back(noop()).is_ok());
        assert!(queue.push_back(noop()).is_ok());
        assert!(queue.push_back(noop()).is_err());
        assert_eq!(queue.size(), 2);
    }

    #[test]
    fn push_batch_back_fits() {
        let queue = ReadyQueue::new(Some(2));

        assert!(queue.push_batch_back(vec![noop(), noop()]).is_ok());
        assert_eq!(queue.size(), 2);

        assert!(queue.push_batch_back(vec![noop(), noop()]).is_err());
        assert_eq!(queue.size(), 2);
    }

    #[test]
    fn push_batch_back_is_all_or_nothing() {
        let queue = ReadyQueue::new(Some(2));

        let rejected = queue
            .push_batch_back(vec![noop(), noop(), noop()])
            .expect_err("batch cannot fit");
        assert_eq!(rejected.len(), 3);
        assert_eq!(queue.size(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_front_is_fifo() {
        let executed = Arc::new(AtomicUsize::new(0));
        let queue = ReadyQueue::new(Some(2));

        assert!(queue.push_back(marker(&executed, 1)).is_ok());
        assert!(queue.push_back(marker(&executed, 2)).is_ok());

        queue.pop_front().expect("first")();
        assert_eq!(executed.load(Ordering::SeqCst), 1);

        queue.pop_front().expect("second")();
        assert_eq!(executed.load(Ordering::SeqCst), 2);

        assert!(queue.pop_front().is_none());
    }

    #[test]
    fn pop_back_is_lifo() {
        let executed = Arc::new(AtomicUsize::new(0));
        let queue = ReadyQueue::new(Some(2));

        assert!(queue.push_back(marker(&executed, 1)).is_ok());
        assert!(queue.push_back(marker(&executed, 2)).is_ok());

        queue.pop_back().expect("back")();
        assert_eq!(executed.load(Ordering::SeqCst), 2);

        queue.pop_back().expect("front")();
        assert_eq!(executed.load(Ordering::SeqCst), 1);

        assert!(queue.pop_back().is_none());
    }

    #[test]
    fn steal_from_moves_the_victims_back() {
        let executed = Arc::new(AtomicUsize::new(0));
        let thief = ReadyQueue::new(Some(2));
        let victim = ReadyQueue::new(Some(2));

        assert!(victim.push_back(marker(&executed, 1)).is_ok());
        assert!(victim.push_back(marker(&executed, 2)).is_ok());

        assert!(thief.steal_from(&victim));
        assert_eq!(thief.size(), 1);
        assert_eq!(victim.size(), 1);

        victim.pop_front().expect("victim keeps its front")();
        assert_eq!(executed.load(Ordering::SeqCst), 1);

        thief.pop_front().expect("thief got the back")();
        assert_eq!(executed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn steal_from_empty_victim() {
        let thief = ReadyQueue::new(Some(2));
        let victim = ReadyQueue::new(Some(2));
        assert!(!thief.steal_from(&victim));
    }

    #[test]
    fn steal_while_full() {
        let thief = ReadyQueue::new(Some(2));
        let victim = ReadyQueue::new(Some(2));

        assert!(victim.push_back(noop()).is_ok());
        assert!(victim.push_back(noop()).is_ok());
        assert!(thief.push_back(noop()).is_ok());
        assert!(thief.push_back(noop()).is_ok());

        assert!(!thief.steal_from(&victim));
        assert_eq!(thief.size(), 2);
        assert_eq!(victim.size(), 2);
    }

    #[test]
    fn steal_from_self_is_a_no_op() {
        let queue = ReadyQueue::new(Some(2));
        assert!(queue.push_back(noop()).is_ok());
        assert!(!queue.steal_from(&queue));
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn concurrent_steals_in_both_directions() {
        let a = Arc::new(ReadyQueue::new(Some(64)));
        let b = Arc::new(ReadyQueue::new(Some(64)));

        for _ in 0..32 {
            assert!(a.push_back(noop()).is_ok());
            assert!(b.push_back(noop()).is_ok());
        }

        // opposite lock orders from two threads; must not deadlock
        let forward = {
            let (a, b) = (Arc::clone(&a), Arc::clone(&b));
            std::thread::spawn(move || {
                for _ in 0..1_000 {
                    a.steal_from(&b);
                }
            })
        };
        let backward = {
            let (a, b) = (Arc::clone(&a), Arc::clone(&b));
            std::thread::spawn(move || {
                for _ in 0..1_000 {
                    b.steal_from(&a);
                }
            })
        };

        forward.join().unwrap();
        backward.join().unwrap();
        assert_eq!(a.size() + b.size(), 64);
    }

    #[test]
    fn await_work_times_out() {
        let queue = ReadyQueue::new(Some(2));
        // no work, no wake: returns after the timeout
        queue.await_work(Duration::from_millis(10));
    }

    #[test]
    fn wake_releases_waiters() {
        let queue = Arc::new(ReadyQueue::new(Some(2)));

        let waiter = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.await_work(Duration::from_secs(30)))
        };

        // wake unconditionally; the waiter must return well before the
        // 30 second timeout
        std::thread::sleep(Duration::from_millis(50));
        queue.wake();
        waiter.join().unwrap();
    }
}

// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::scheduler::{ReadyQueue, Scheduler, SpinLock, Work};
use core::cell::{Cell, UnsafeCell};
use core::cmp::Ordering as CmpOrdering;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Bound on each worker's ready queue.
const WORKER_QUEUE_SIZE: usize = 1024;
/// Granularity of the timer thread.
const TIMER_TICK: Duration = Duration::from_millis(1);

static NEXT_SCHEDULER_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// `(scheduler id, worker index)` when the current thread is a worker.
    static WORKER_INDEX: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

/// A [`Scheduler`] backed by a fixed pool of worker threads.
///
/// Each worker owns a bounded [`ReadyQueue`]; submission prefers the calling
/// worker's own queue and falls back to the siblings. Idle workers steal one
/// task at a time from a randomly chosen sibling before going to sleep on
/// their queue's condition variable. Delayed work is kept in a binary heap
/// guarded by a [`SpinLock`] and fed back into the ready queues by a
/// dedicated timer thread.
pub struct WorkStealingScheduler {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

struct Shared {
    id: usize,
    queues: Vec<Arc<ReadyQueue>>,
    running: AtomicBool,
    timers: TimerState,
    epoch: Instant,
}

struct TimerState {
    lock: SpinLock,
    entries: UnsafeCell<BinaryHeap<TimerEntry>>,
    next_seq: AtomicU64,
}

// Safety: `entries` is only ever touched while holding `lock`.
unsafe impl Send for TimerState {}
// Safety: see above.
unsafe impl Sync for TimerState {}

struct TimerEntry {
    deadline_ms: i64,
    seq: u64,
    work: Work,
}

// === impl WorkStealingScheduler ===

impl WorkStealingScheduler {
    /// Start a scheduler with `num_workers` worker threads plus one timer
    /// thread.
    pub fn new(num_workers: usize) -> Self {
        assert!(num_workers > 0, "need at least one worker");

        let shared = Arc::new(Shared {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            queues: (0..num_workers)
                .map(|_| Arc::new(ReadyQueue::new(Some(WORKER_QUEUE_SIZE))))
                .collect(),
            running: AtomicBool::new(true),
            timers: TimerState {
                lock: SpinLock::new(),
                entries: UnsafeCell::new(BinaryHeap::new()),
                next_seq: AtomicU64::new(0),
            },
            epoch: Instant::now(),
        });

        let mut threads = Vec::with_capacity(num_workers + 1);
        for index in 0..num_workers {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("strand-worker-{index}"))
                .spawn(move || worker_loop(&shared, index))
                .expect("failed to spawn worker thread");
            threads.push(handle);
        }
        {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name("strand-timer".into())
                .spawn(move || timer_loop(&shared))
                .expect("failed to spawn timer thread");
            threads.push(handle);
        }

        Self {
            shared,
            threads: Mutex::new(threads),
        }
    }
}

impl Scheduler for WorkStealingScheduler {
    fn submit(&self, work: Work) -> Result<(), Work> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(work);
        }
        self.shared.submit_anywhere(work)
    }

    fn submit_after(&self, delay_ms: i64, work: Work) -> Result<(), Work> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(work);
        }
        if delay_ms <= 0 {
            return self.shared.submit_anywhere(work);
        }

        let entry = TimerEntry {
            deadline_ms: self.shared.now_ms() + delay_ms,
            seq: self.shared.timers.next_seq.fetch_add(1, Ordering::Relaxed),
            work,
        };
        self.shared.timers.with(|entries| entries.push(entry));
        Ok(())
    }

    fn now_ms(&self) -> i64 {
        self.shared.now_ms()
    }

    fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(scheduler = self.shared.id, "shutting down");

        for queue in &self.shared.queues {
            queue.wake();
        }

        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        let current = thread::current().id();
        for handle in threads {
            // a worker may itself have requested the shutdown
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for WorkStealingScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn now_ms(&self) -> i64 {
        i64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    /// Enqueue `work` on the calling worker's own queue if possible,
    /// otherwise on the first sibling with room.
    fn submit_anywhere(&self, work: Work) -> Result<(), Work> {
        let num_queues = self.queues.len();
        let start = match WORKER_INDEX.get() {
            Some((scheduler, index)) if scheduler == self.id => index,
            _ => fastrand::usize(0..num_queues),
        };

        let mut work = work;
        for i in 0..num_queues {
            match self.queues[(start + i) % num_queues].push_back(work) {
                Ok(()) => return Ok(()),
                Err(rejected) => work = rejected,
            }
        }
        Err(work)
    }

    fn try_steal(&self, thief: usize, rng: &mut fastrand::Rng) -> bool {
        let num_queues = self.queues.len();
        if num_queues <= 1 {
            return false;
        }

        // start from a random sibling so thieves spread out
        let start = rng.usize(0..num_queues);
        for i in 0..num_queues {
            let victim = (start + i) % num_queues;
            if victim == thief {
                continue;
            }
            if self.queues[thief].steal_from(&self.queues[victim]) {
                tracing::trace!(thief, victim, "stole a task");
                return true;
            }
        }
        false
    }
}

impl TimerState {
    fn with<R>(&self, f: impl FnOnce(&mut BinaryHeap<TimerEntry>) -> R) -> R {
        let _guard = self.lock.lock();
        // Safety: the spin lock serializes all access to the heap.
        f(unsafe { &mut *self.entries.get() })
    }

    /// Remove and return every entry whose deadline has passed.
    fn take_due(&self, now_ms: i64) -> Vec<TimerEntry> {
        self.with(|entries| {
            let mut due = Vec::new();
            while entries
                .peek()
                .is_some_and(|entry| entry.deadline_ms <= now_ms)
            {
                due.push(entries.pop().expect("peeked entry"));
            }
            due
        })
    }
}

fn worker_loop(shared: &Arc<Shared>, index: usize) {
    let _span = tracing::debug_span!("worker main loop", worker = index).entered();
    WORKER_INDEX.set(Some((shared.id, index)));

    let mut rng = fastrand::Rng::with_seed(index as u64 + 1);
    let queue = Arc::clone(&shared.queues[index]);

    loop {
        if let Some(work) = queue.pop_front() {
            work();
            continue;
        }

        if !shared.running.load(Ordering::Acquire) {
            tracing::debug!(worker = index, "stop signal received, shutting down");
            break;
        }

        if shared.try_steal(index, &mut rng) {
            continue;
        }

        queue.await_work(Duration::from_millis(10));
    }

    WORKER_INDEX.set(None);
}

fn timer_loop(shared: &Arc<Shared>) {
    let _span = tracing::debug_span!("timer loop").entered();

    while shared.running.load(Ordering::Acquire) {
        let now = shared.now_ms();
        for entry in shared.timers.take_due(now) {
            tracing::trace!(deadline = entry.deadline_ms, "timer fired");
            if let Err(work) = shared.submit_anywhere(entry.work) {
                // every queue is full: put the entry back and retry next tick
                shared.timers.with(|entries| {
                    entries.push(TimerEntry {
                        deadline_ms: entry.deadline_ms,
                        seq: entry.seq,
                        work,
                    });
                });
            }
        }
        thread::sleep(TIMER_TICK);
    }
}

// Order timer entries so the *earliest* deadline is the heap's maximum; ties
// fire in submission order.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.deadline_ms, other.seq).cmp(&(self.deadline_ms, self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        (self.deadline_ms, self.seq) == (other.deadline_ms, other.seq)
    }
}

impl Eq for TimerEntry {}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerRef;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn scheduler(workers: usize) -> SchedulerRef {
        Arc::new(WorkStealingScheduler::new(workers))
    }

    #[test]
    fn runs_submitted_work() {
        let scheduler = scheduler(2);
        let (tx, rx) = mpsc::channel();

        scheduler
            .submit(Box::new(move || tx.send(42_i32).unwrap()))
            .unwrap_or_else(|_| panic!("submit failed"));

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        scheduler.shutdown();
    }

    #[test]
    fn runs_work_on_a_worker_thread() {
        let scheduler = scheduler(2);
        let (tx, rx) = mpsc::channel();

        scheduler
            .submit(Box::new(move || {
                let name = thread::current().name().unwrap_or("").to_owned();
                tx.send(name).unwrap();
            }))
            .unwrap_or_else(|_| panic!("submit failed"));

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(name.starts_with("strand-worker-"), "ran on {name}");
        scheduler.shutdown();
    }

    #[test]
    fn submit_after_respects_the_delay() {
        let scheduler = scheduler(1);
        let (tx, rx) = mpsc::channel();

        let submitted_at = scheduler.now_ms();
        scheduler
            .submit_after(50, Box::new(move || tx.send(()).unwrap()))
            .unwrap_or_else(|_| panic!("submit_after failed"));

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(scheduler.now_ms() - submitted_at >= 50);
        scheduler.shutdown();
    }

    #[test]
    fn saturates_all_workers() {
        use tracing_subscriber::EnvFilter;
        use tracing_subscriber::util::SubscriberInitExt;

        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_names(true)
            .set_default();

        let scheduler = scheduler(4);
        let completed = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        const TASKS: usize = 500;
        for _ in 0..TASKS {
            let completed = Arc::clone(&completed);
            let tx = tx.clone();
            scheduler
                .submit(Box::new(move || {
                    if completed.fetch_add(1, Ordering::SeqCst) + 1 == TASKS {
                        tx.send(()).unwrap();
                    }
                }))
                .unwrap_or_else(|_| panic!("submit failed"));
        }

        rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), TASKS);
        scheduler.shutdown();
    }

    #[test]
    fn rejects_work_after_shutdown() {
        let scheduler = scheduler(1);
        scheduler.shutdown();

        assert!(scheduler.submit(Box::new(|| {})).is_err());
        assert!(scheduler.submit_after(10, Box::new(|| {})).is_err());
    }

    #[test]
    fn now_ms_is_monotonic() {
        let scheduler = scheduler(1);
        let first = scheduler.now_ms();
        thread::sleep(Duration::from_millis(15));
        let second = scheduler.now_ms();
        assert!(second >= first + 10);
        scheduler.shutdown();
    }
}

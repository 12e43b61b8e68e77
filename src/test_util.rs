// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::scheduler::{Scheduler, Work};
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::collections::VecDeque;
use std::sync::Mutex;

/// A single-threaded, manually pumped [`Scheduler`] with a virtual clock.
///
/// Nothing runs until the test calls [`ManualScheduler::run_until_idle`],
/// and time only moves when the test calls [`ManualScheduler::advance`],
/// which makes suspension-heavy fiber programs fully deterministic to drive.
pub struct ManualScheduler {
    now_ms: AtomicI64,
    next_seq: AtomicU64,
    ready: Mutex<VecDeque<Work>>,
    timers: Mutex<Vec<TimerEntry>>,
    shutdown: AtomicBool,
}

struct TimerEntry {
    deadline_ms: i64,
    seq: u64,
    work: Work,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self {
            now_ms: AtomicI64::new(0),
            next_seq: AtomicU64::new(0),
            ready: Mutex::new(VecDeque::new()),
            timers: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Move the virtual clock forward, promoting timers that come due.
    pub fn advance(&self, ms: i64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
        self.promote_due();
    }

    /// Run ready work (including work enqueued by the work being run) until
    /// there is none left. Returns how many items ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            self.promote_due();
            let Some(work) = self.ready.lock().unwrap().pop_front() else {
                break;
            };
            work();
            ran += 1;
        }
        ran
    }

    fn promote_due(&self) {
        let now = self.now_ms.load(Ordering::SeqCst);
        let mut due = {
            let mut timers = self.timers.lock().unwrap();
            let mut kept = Vec::new();
            let mut due = Vec::new();
            for entry in timers.drain(..) {
                if entry.deadline_ms <= now {
                    due.push(entry);
                } else {
                    kept.push(entry);
                }
            }
            *timers = kept;
            due
        };

        due.sort_by_key(|entry| (entry.deadline_ms, entry.seq));
        let mut ready = self.ready.lock().unwrap();
        for entry in due {
            ready.push_back(entry.work);
        }
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ManualScheduler {
    fn submit(&self, work: Work) -> Result<(), Work> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(work);
        }
        self.ready.lock().unwrap().push_back(work);
        Ok(())
    }

    fn submit_after(&self, delay_ms: i64, work: Work) -> Result<(), Work> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(work);
        }
        self.timers.lock().unwrap().push(TimerEntry {
            deadline_ms: self.now_ms.load(Ordering::SeqCst) + delay_ms.max(0),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            work,
        });
        Ok(())
    }

    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

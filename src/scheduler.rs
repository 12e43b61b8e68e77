// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod promise;
mod ready_queue;
mod spin_lock;
mod work_stealing;

use crate::fiber::FiberValue;
use std::sync::Arc;

pub use promise::Promise;
pub use ready_queue::ReadyQueue;
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use work_stealing::WorkStealingScheduler;

/// A unit of work submitted to a scheduler.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// A shared handle to a scheduler.
pub type SchedulerRef = Arc<dyn Scheduler>;

/// Something that can run callables, now or later.
///
/// Fibers never block a thread themselves; every suspension point turns into
/// a callable handed to one of these methods. Submission hands ownership of
/// the work over; a rejected submission (scheduler shut down, queues full)
/// hands it back so the caller can decide what to do with it.
pub trait Scheduler: Send + Sync {
    /// Submit a work item for execution as soon as a thread is available.
    ///
    /// # Errors
    ///
    /// Returns the work item back when the scheduler cannot accept it.
    fn submit(&self, work: Work) -> Result<(), Work>;

    /// Submit a work item for execution after at least `delay_ms` milliseconds.
    ///
    /// # Errors
    ///
    /// Returns the work item back when the scheduler cannot accept it.
    fn submit_after(&self, delay_ms: i64, work: Work) -> Result<(), Work>;

    /// Milliseconds of monotonic time, measured from an arbitrary epoch fixed
    /// at scheduler construction.
    fn now_ms(&self) -> i64;

    /// Stop accepting work and wind down.
    fn shutdown(&self);
}

/// Callback invoked with a completed fiber result.
pub type CompleteCallback = Box<dyn FnOnce(FiberValue) + Send + 'static>;

/// A shared handle to a deferred result.
pub type DeferredRef = Arc<dyn Deferred>;

/// An asynchronous result, completable from outside the fiber.
///
/// Completion is sticky: the first terminal [`FiberValue`] wins and every
/// registered callback observes it. Callbacks run on the scheduler the
/// deferred is bound to.
pub trait Deferred: Send + Sync {
    /// Register a callback to run once the result is available. If the result
    /// is already available the callback is scheduled immediately.
    fn on_complete(&self, callback: CompleteCallback);

    /// Request cancellation. Completes the deferred with a canceled value
    /// unless it already completed.
    fn cancel(&self);

    /// Block the calling thread until the result is available.
    ///
    /// For off-fiber consumers only; calling this from scheduler threads can
    /// deadlock the pool.
    fn wait(&self) -> FiberValue;
}

// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod current;
mod op;
mod value;

use crate::either::Either;
use crate::erased::Erased;
use crate::scheduler::{CompleteCallback, Deferred, DeferredRef, SchedulerRef};
use core::any::Any;
use core::mem;
use op::{ErasedPredicate, OpKind};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

pub use current::CurrentFiber;
pub use op::{FiberOp, FiberOpType, OpRef};
pub use value::FiberValue;

/// A shared handle to a [`Fiber`].
pub type FiberRef = Arc<Fiber>;

/// A cooperatively scheduled unit of execution that interprets a [`FiberOp`]
/// program tree.
///
/// The fiber is a trampoline: it walks the tree with an explicit loop and an
/// explicit continuation stack rather than language recursion, carrying a
/// [`FiberValue`] between steps. Synchronous transitions (values, errors,
/// thunks, flat maps, self-cancelation) happen inline; the fiber suspends at
/// `async`, `delay`, `race` and `cede` ops and is resumed by the scheduler.
///
/// Evaluation within one fiber is strictly sequential: a flat map's
/// continuation runs only after its input produced a value, and observes all
/// of its memory effects. Cancellation is cooperative: once the carried
/// value turns canceled - via a `cancel` op, an external [`Fiber::cancel`]
/// request, or losing a race - the continuation stack is discarded without
/// invoking anything and the fiber terminates with a canceled result.
///
/// Panics escaping a thunk or continuation are caught at this boundary and
/// turned into an error result; the op layer itself never propagates them.
///
/// A fiber is itself a [`Deferred`], which is how races compose: every race
/// child runs as its own fiber and the parent subscribes to each child's
/// completion.
pub struct Fiber {
    id: u64,
    scheduler: SchedulerRef,
    state: Mutex<FiberState>,
    done: Condvar,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    /// Created or rescheduled, waiting for `resume`.
    Ready,
    /// A thread is inside `drive`.
    Running,
    /// Parked on a deferred, a timer, a race or a cede.
    Suspended,
    /// Terminal.
    Done,
}

enum Awaiting {
    Nothing,
    Deferred(DeferredRef),
    Race(Vec<FiberRef>),
}

struct FiberState {
    op: Option<OpRef>,
    value: FiberValue,
    /// The continuation stack. Thanks to flat-map normalization its depth
    /// tracks the left spine of the program, not the total number of flat
    /// maps composed by the user.
    stack: Vec<ErasedPredicate>,
    phase: Phase,
    awaiting: Awaiting,
    cancel_requested: bool,
    callbacks: Vec<CompleteCallback>,
}

enum Exit {
    Done,
    Suspend(Registration),
}

enum Registration {
    OnComplete(DeferredRef),
    Delay(i64),
    Cede,
    Race(Vec<FiberRef>),
}

// === impl Fiber ===

impl Fiber {
    /// Create a fiber for `op` without starting it.
    pub fn create(op: OpRef, scheduler: &SchedulerRef) -> FiberRef {
        Arc::new(Self {
            id: CurrentFiber::acquire_id(),
            scheduler: Arc::clone(scheduler),
            state: Mutex::new(FiberState {
                op: Some(op),
                value: FiberValue::new(),
                stack: Vec::new(),
                phase: Phase::Ready,
                awaiting: Awaiting::Nothing,
                cancel_requested: false,
                callbacks: Vec::new(),
            }),
            done: Condvar::new(),
        })
    }

    /// Create a fiber for `op` and hand its first resumption to the
    /// scheduler.
    pub fn spawn(op: OpRef, scheduler: &SchedulerRef) -> FiberRef {
        let fiber = Self::create(op, scheduler);
        let handle = Arc::clone(&fiber);
        let work = Box::new(move || {
            handle.resume();
        });
        if let Err(work) = scheduler.submit(work) {
            work();
        }
        fiber
    }

    /// Create a fiber for `op` and drive it on the calling thread until it
    /// completes or suspends.
    pub fn run(op: OpRef, scheduler: &SchedulerRef) -> FiberRef {
        let fiber = Self::create(op, scheduler);
        fiber.resume();
        fiber
    }

    /// The fiber's unique identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// `true` once the fiber has reached a terminal value.
    pub fn is_done(&self) -> bool {
        self.state.lock().unwrap().phase == Phase::Done
    }

    /// Drive the fiber on the calling thread until it completes or
    /// suspends. Returns `false` when the fiber is not in a resumable state
    /// (already running, suspended or done).
    pub fn resume(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.phase != Phase::Ready {
            return false;
        }
        state.phase = Phase::Running;
        self.drive(state);
        true
    }

    /// The trampoline. Executes synchronous transitions in a loop until the
    /// program either finishes or reaches a suspension point.
    ///
    /// User continuations and thunks run while the state lock is held; they
    /// must not touch their own fiber handle.
    fn drive(self: &Arc<Self>, mut state: MutexGuard<'_, FiberState>) {
        debug_assert_eq!(state.phase, Phase::Running);
        CurrentFiber::set_id(self.id);
        let _span = tracing::trace_span!("fiber", id = self.id).entered();

        let exit = loop {
            if state.cancel_requested && !state.value.is_canceled() {
                state.value.set_canceled();
            }
            if state.value.is_canceled() {
                // unwind: drop every pending continuation uninvoked
                state.op = None;
                state.stack.clear();
                break Exit::Done;
            }

            let Some(op) = state.op.take() else {
                // a terminal value is in hand: pop a continuation or halt
                let Some(continuation) = state.stack.pop() else {
                    break Exit::Done;
                };
                let value = mem::take(&mut state.value);
                match panic::catch_unwind(AssertUnwindSafe(|| continuation.call(value))) {
                    Ok(next) => state.op = Some(next),
                    Err(payload) => state.value.set_error(panic_message(payload)),
                }
                continue;
            };

            match op.kind() {
                OpKind::Constant(constant) => match constant {
                    Either::Left(value) => state.value.set_value(value.clone()),
                    Either::Right(error) => state.value.set_error(error.clone()),
                },
                OpKind::Thunk(thunk) => {
                    match panic::catch_unwind(AssertUnwindSafe(|| thunk.call())) {
                        Ok(value) => state.value.set_value(value),
                        Err(payload) => state.value.set_error(panic_message(payload)),
                    }
                }
                OpKind::FlatMap(input, continuation) => {
                    state.stack.push(continuation.clone());
                    state.op = Some(input.clone());
                }
                OpKind::Async(launch) => {
                    match panic::catch_unwind(AssertUnwindSafe(|| launch.call(&self.scheduler))) {
                        Ok(deferred) => {
                            state.awaiting = Awaiting::Deferred(Arc::clone(&deferred));
                            break Exit::Suspend(Registration::OnComplete(deferred));
                        }
                        Err(payload) => state.value.set_error(panic_message(payload)),
                    }
                }
                OpKind::Delay(delay_ms) => break Exit::Suspend(Registration::Delay(*delay_ms)),
                OpKind::Cede => break Exit::Suspend(Registration::Cede),
                OpKind::Race(children) => {
                    if children.is_empty() {
                        state
                            .value
                            .set_error(Erased::new("raced an empty set of operations"));
                    } else {
                        let fibers: Vec<FiberRef> = children
                            .iter()
                            .map(|child| Fiber::create(child.clone(), &self.scheduler))
                            .collect();
                        state.awaiting = Awaiting::Race(fibers.clone());
                        break Exit::Suspend(Registration::Race(fibers));
                    }
                }
                OpKind::Cancel => state.value.set_canceled(),
            }
        };

        match exit {
            Exit::Done => self.finish(state),
            Exit::Suspend(registration) => {
                state.phase = Phase::Suspended;
                tracing::trace!(id = self.id, "fiber suspending");
                drop(state);
                self.register(registration);
            }
        }

        CurrentFiber::clear();
    }

    /// Wire up whatever will eventually resume a freshly suspended fiber.
    /// Runs without the state lock: completions arriving concurrently go
    /// through `resume_with`, which checks the phase.
    fn register(self: &Arc<Self>, registration: Registration) {
        match registration {
            Registration::OnComplete(deferred) => {
                let fiber = Arc::clone(self);
                deferred.on_complete(Box::new(move |value| fiber.resume_with(value)));
            }
            Registration::Delay(delay_ms) => {
                let fiber = Arc::clone(self);
                let work = Box::new(move || fiber.resume_with(unit_value()));
                if self.scheduler.submit_after(delay_ms, work).is_err() {
                    // the scheduler is gone; the fiber can never be resumed
                    self.resume_with(canceled_value());
                }
            }
            Registration::Cede => {
                let fiber = Arc::clone(self);
                let work = Box::new(move || fiber.resume_with(unit_value()));
                if self.scheduler.submit(work).is_err() {
                    self.resume_with(canceled_value());
                }
            }
            Registration::Race(children) => {
                for child in children {
                    let parent = Arc::clone(self);
                    child.on_complete(Box::new(move |value| parent.race_done(value)));

                    let runnable = Arc::clone(&child);
                    let work = Box::new(move || {
                        runnable.resume();
                    });
                    if let Err(work) = self.scheduler.submit(work) {
                        work();
                    }
                }
            }
        }
    }

    /// Resume a suspended fiber with the given carrier value. No-op unless
    /// the fiber is actually suspended, which makes duplicate completions
    /// harmless.
    fn resume_with(self: &Arc<Self>, value: FiberValue) {
        let mut state = self.state.lock().unwrap();
        if state.phase != Phase::Suspended {
            return;
        }
        state.awaiting = Awaiting::Nothing;
        state.phase = Phase::Running;
        state.value = value;
        state.op = None;
        self.drive(state);
    }

    /// First race child to complete wins; the losers are canceled before
    /// the parent continues with the winner's value.
    fn race_done(self: &Arc<Self>, winner: FiberValue) {
        let mut state = self.state.lock().unwrap();
        if state.phase != Phase::Suspended {
            return;
        }
        let awaiting = mem::replace(&mut state.awaiting, Awaiting::Nothing);
        state.phase = Phase::Running;
        state.value = winner;
        state.op = None;
        drop(state);

        if let Awaiting::Race(children) = awaiting {
            for child in children {
                // canceling the winner is a no-op, it is already done
                child.cancel();
            }
        }

        let state = self.state.lock().unwrap();
        self.drive(state);
    }

    fn finish(&self, mut state: MutexGuard<'_, FiberState>) {
        state.phase = Phase::Done;
        tracing::trace!(
            id = self.id,
            is_error = state.value.is_error(),
            is_canceled = state.value.is_canceled(),
            "fiber complete"
        );

        let dispatches: Vec<(CompleteCallback, FiberValue)> = mem::take(&mut state.callbacks)
            .into_iter()
            .map(|callback| (callback, state.value.clone()))
            .collect();
        self.done.notify_all();
        drop(state);

        for (callback, value) in dispatches {
            self.dispatch(callback, value);
        }
    }

    fn dispatch(&self, callback: CompleteCallback, value: FiberValue) {
        if let Err(work) = self.scheduler.submit(Box::new(move || callback(value))) {
            work();
        }
    }
}

impl Deferred for Fiber {
    fn on_complete(&self, callback: CompleteCallback) {
        let mut state = self.state.lock().unwrap();
        if state.phase == Phase::Done {
            let value = state.value.clone();
            drop(state);
            self.dispatch(callback, value);
        } else {
            state.callbacks.push(callback);
        }
    }

    fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        if state.phase == Phase::Done {
            return;
        }
        tracing::trace!(id = self.id, "fiber cancel requested");
        state.cancel_requested = true;
        let awaiting = mem::replace(&mut state.awaiting, Awaiting::Nothing);
        drop(state);

        // propagate the request to whatever the fiber is parked on; its
        // completion path will observe the flag and unwind
        match awaiting {
            Awaiting::Nothing => {}
            Awaiting::Deferred(deferred) => deferred.cancel(),
            Awaiting::Race(children) => {
                for child in children {
                    child.cancel();
                }
            }
        }
    }

    fn wait(&self) -> FiberValue {
        let mut state = self.state.lock().unwrap();
        while state.phase != Phase::Done {
            state = self.done.wait(state).unwrap();
        }
        state.value.clone()
    }
}

fn unit_value() -> FiberValue {
    let mut value = FiberValue::new();
    value.set_value(Erased::new(()));
    value
}

fn canceled_value() -> FiberValue {
    let mut value = FiberValue::new();
    value.set_canceled();
    value
}

/// Translate a caught panic payload into a domain error carrier.
fn panic_message(payload: Box<dyn Any + Send>) -> Erased {
    match payload.downcast::<String>() {
        Ok(message) => Erased::new(*message),
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => Erased::new((*message).to_string()),
            Err(_) => Erased::new(String::from("fiber panicked")),
        },
    }
}

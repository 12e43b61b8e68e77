// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::erased::Erased;
use crate::fiber::FiberValue;
use crate::scheduler::{CompleteCallback, Deferred, SchedulerRef};
use std::sync::{Arc, Condvar, Mutex};

/// The completable side of a [`Deferred`].
///
/// A promise is completed at most once; later completions (including
/// cancellation racing a success) are ignored. Registered callbacks are
/// dispatched through the bound scheduler, never inline on the completing
/// thread - unless the scheduler rejects them, in which case they run inline
/// as a last resort so completions are never lost.
pub struct Promise {
    scheduler: SchedulerRef,
    state: Mutex<State>,
    completed: Condvar,
}

struct State {
    result: Option<FiberValue>,
    callbacks: Vec<CompleteCallback>,
}

impl Promise {
    pub fn create(scheduler: &SchedulerRef) -> Arc<Self> {
        Arc::new(Self {
            scheduler: Arc::clone(scheduler),
            state: Mutex::new(State {
                result: None,
                callbacks: Vec::new(),
            }),
            completed: Condvar::new(),
        })
    }

    /// Complete with an arbitrary terminal value. Returns `false` when the
    /// promise was already complete.
    pub fn complete(&self, value: FiberValue) -> bool {
        let callbacks = {
            let mut state = self.state.lock().unwrap();
            if state.result.is_some() {
                return false;
            }
            state.result = Some(value.clone());
            self.completed.notify_all();
            std::mem::take(&mut state.callbacks)
        };

        for callback in callbacks {
            self.dispatch(callback, value.clone());
        }
        true
    }

    /// Complete successfully with `value`.
    pub fn success(&self, value: Erased) -> bool {
        let mut result = FiberValue::new();
        result.set_value(value);
        self.complete(result)
    }

    /// Complete with the error `value`.
    pub fn error(&self, value: Erased) -> bool {
        let mut result = FiberValue::new();
        result.set_error(value);
        self.complete(result)
    }

    fn dispatch(&self, callback: CompleteCallback, value: FiberValue) {
        let submitted = self
            .scheduler
            .submit(Box::new(move || callback(value)));
        if let Err(work) = submitted {
            work();
        }
    }
}

impl Deferred for Promise {
    fn on_complete(&self, callback: CompleteCallback) {
        let ready = {
            let mut state = self.state.lock().unwrap();
            match &state.result {
                Some(result) => Some(result.clone()),
                None => {
                    state.callbacks.push(callback);
                    return;
                }
            }
        };
        // already complete: hand the callback straight to the scheduler
        if let Some(result) = ready {
            self.dispatch(callback, result);
        }
    }

    fn cancel(&self) {
        let mut canceled = FiberValue::new();
        canceled.set_canceled();
        self.complete(canceled);
    }

    fn wait(&self) -> FiberValue {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(result) = &state.result {
                return result.clone();
            }
            state = self.completed.wait(state).unwrap();
        }
    }
}

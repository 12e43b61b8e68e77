// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A lazy, composable, trampolined description of asynchronous computations
//! and the machinery to execute it: pooled [`FiberOp`] program trees carrying
//! type-erased [`Erased`] values, interpreted by [`Fiber`]s on top of a
//! pluggable [`Scheduler`].

mod either;
mod erased;
mod error;
pub mod fiber;
mod loom;
pub mod pool;
pub mod scheduler;

pub use either::Either;
pub use erased::Erased;
pub use error::EmptyErased;
pub use fiber::{CurrentFiber, Fiber, FiberOp, FiberOpType, FiberRef, FiberValue, OpRef};
pub use pool::{Pool, PoolRef, global_pool};
pub use scheduler::{
    Deferred, DeferredRef, Promise, ReadyQueue, Scheduler, SchedulerRef, SpinLock, SpinLockGuard,
    Work, WorkStealingScheduler,
};

cfg_if::cfg_if! {
    if #[cfg(feature = "__bench")]  {
        pub mod test_util;
    } else
    if #[cfg(test)] {
        mod test_util;
    }
}

// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::either::Either;
use crate::erased::Erased;
use crate::fiber::FiberValue;
use crate::loom::sync::atomic::{AtomicUsize, Ordering, fence};
use crate::pool::{Pool, PoolRef, global_pool};
use crate::scheduler::{DeferredRef, SchedulerRef};
use core::fmt;
use core::ptr::NonNull;
use std::sync::Arc;

/// The kind of operation a [`FiberOp`] represents. Used for optimization of
/// the interpreter run loop and for structural inspection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FiberOpType {
    Async,
    Value,
    Error,
    FlatMap,
    Thunk,
    Delay,
    Race,
    Cancel,
    Cede,
}

/// A node in a trampolined, possibly asynchronous program that can be
/// executed by a [`Fiber`](crate::Fiber).
///
/// Ops are not meant to be used directly but rather as an intermediate
/// description of execution for higher-order, typed façades. The engine
/// supports only a few operations, from which a large number of composite
/// operations can be described:
///
/// 1. `value` represents a pure value which does not need to be computed.
/// 2. `error` represents an error which should halt execution.
/// 3. `thunk` represents a lazily-evaluated method returning a value.
/// 4. `async` represents an asynchronous operation.
/// 5. `flat_map` represents a composite program which takes the result of
///    one program (the input) and provides it to a continuation returning a
///    new and likely transformed program.
/// 6. `delay` represents a timed delay after which a fiber resumes.
/// 7. `race` represents the parallel execution of several operations where
///    the first to complete wins and all others are canceled.
/// 8. `cancel` represents cancelation of the running fiber.
/// 9. `cede` represents a cooperative yield back to the scheduler.
///
/// Nodes are immutable after construction, reference-counted via [`OpRef`],
/// and allocated from the constructing thread's [pool](crate::global_pool).
/// Every node keeps a handle to the pool that allocated it, so its block is
/// returned to the right place no matter which thread drops the last
/// reference.
pub struct FiberOp {
    refs: AtomicUsize,
    pool: PoolRef,
    kind: OpKind,
}

pub(crate) enum OpKind {
    /// Payload for both `Value` (left) and `Error` (right).
    Constant(Either<Erased, Erased>),
    Thunk(ErasedThunk),
    Async(ErasedAsync),
    FlatMap(OpRef, ErasedPredicate),
    Delay(i64),
    Race(Vec<OpRef>),
    Cancel,
    Cede,
}

/// A shared, immutable reference to a [`FiberOp`].
///
/// Cloning bumps a reference count; the node and its payload go back to
/// their pool when the last reference drops. Structural sharing between
/// program trees is expected and cheap.
pub struct OpRef(NonNull<FiberOp>);

// Safety: the pointee is immutable and its payloads are constrained to
// `Send + Sync` closures and values at construction time; the reference
// count is atomic.
unsafe impl Send for OpRef {}
// Safety: see above.
unsafe impl Sync for OpRef {}

// === impl FiberOp ===

impl FiberOp {
    fn alloc(kind: OpKind) -> OpRef {
        let pool = global_pool();
        let node = FiberOp {
            refs: AtomicUsize::new(1),
            pool: Arc::clone(&pool),
            kind,
        };
        OpRef(pool.allocate(node))
    }

    /// A pure value which does not need to be computed.
    pub fn value<T: Clone + Send + Sync + 'static>(value: T) -> OpRef {
        Self::value_erased(Erased::new(value))
    }

    /// A pure value, already erased.
    pub fn value_erased(value: Erased) -> OpRef {
        Self::alloc(OpKind::Constant(Either::left(value)))
    }

    /// A pure error which should halt execution.
    pub fn error<T: Clone + Send + Sync + 'static>(error: T) -> OpRef {
        Self::error_erased(Erased::new(error))
    }

    /// A pure error, already erased.
    pub fn error_erased(error: Erased) -> OpRef {
        Self::alloc(OpKind::Constant(Either::right(error)))
    }

    /// A deferred synchronous computation.
    pub fn thunk<F>(thunk: F) -> OpRef
    where
        F: Fn() -> Erased + Send + Sync + 'static,
    {
        Self::alloc(OpKind::Thunk(ErasedThunk::new(thunk)))
    }

    /// An asynchronous operation: `launch` is given the scheduler and must
    /// hand back the deferred result carrier the fiber will suspend on.
    pub fn async_<F>(launch: F) -> OpRef
    where
        F: Fn(&SchedulerRef) -> DeferredRef + Send + Sync + 'static,
    {
        Self::alloc(OpKind::Async(ErasedAsync::new(launch)))
    }

    /// Sleep for `delay_ms` milliseconds, then yield the unit value.
    pub fn delay(delay_ms: i64) -> OpRef {
        Self::alloc(OpKind::Delay(delay_ms))
    }

    /// Run `children` in parallel; the first result wins and the losers are
    /// canceled.
    pub fn race(children: Vec<OpRef>) -> OpRef {
        Self::alloc(OpKind::Race(children))
    }

    /// Cancel the running fiber.
    pub fn cancel() -> OpRef {
        Self::alloc(OpKind::Cancel)
    }

    /// Yield cooperatively back to the scheduler, resuming with the unit
    /// value.
    pub fn cede() -> OpRef {
        Self::alloc(OpKind::Cede)
    }
}

// === impl OpRef ===

impl OpRef {
    fn node(&self) -> &FiberOp {
        // Safety: the node lives until the last `OpRef` drops.
        unsafe { self.0.as_ref() }
    }

    pub(crate) fn kind(&self) -> &OpKind {
        &self.node().kind
    }

    /// The kind of operation this node represents.
    pub fn op_type(&self) -> FiberOpType {
        match self.kind() {
            OpKind::Constant(Either::Left(_)) => FiberOpType::Value,
            OpKind::Constant(Either::Right(_)) => FiberOpType::Error,
            OpKind::Thunk(_) => FiberOpType::Thunk,
            OpKind::Async(_) => FiberOpType::Async,
            OpKind::FlatMap(..) => FiberOpType::FlatMap,
            OpKind::Delay(_) => FiberOpType::Delay,
            OpKind::Race(_) => FiberOpType::Race,
            OpKind::Cancel => FiberOpType::Cancel,
            OpKind::Cede => FiberOpType::Cede,
        }
    }

    /// The input program of a `FlatMap` node, for structural inspection.
    pub fn flat_map_input(&self) -> Option<&OpRef> {
        match self.kind() {
            OpKind::FlatMap(input, _) => Some(input),
            _ => None,
        }
    }

    /// A new operation which represents the flat map of this operation via
    /// the given continuation.
    ///
    /// The result is kept in left-associated normal form: flat-mapping a
    /// node that is itself a `FlatMap(x, f)` produces `FlatMap(x, |v|
    /// f(v).flat_map(g))` rather than nesting the input. The interpreter
    /// therefore only ever sees a left spine of length one, and its
    /// continuation stack depth stays independent of how deeply user code
    /// nested its composition. Normalization is a single step at
    /// construction; a `FlatMap` returned *by* a continuation is handled by
    /// the interpreter popping continuations at evaluation time, not by
    /// further rewriting here.
    pub fn flat_map<F>(&self, predicate: F) -> OpRef
    where
        F: Fn(FiberValue) -> OpRef + Clone + Send + Sync + 'static,
    {
        self.flat_map_erased(ErasedPredicate::new(predicate))
    }

    fn flat_map_erased(&self, predicate: ErasedPredicate) -> OpRef {
        match self.kind() {
            OpKind::FlatMap(input, inner) => {
                let inner = inner.clone();
                // the composed continuation owns both captured continuations
                let composed =
                    move |value: FiberValue| inner.call(value).flat_map_erased(predicate.clone());
                FiberOp::alloc(OpKind::FlatMap(
                    input.clone(),
                    ErasedPredicate::new(composed),
                ))
            }
            _ => FiberOp::alloc(OpKind::FlatMap(self.clone(), predicate)),
        }
    }
}

impl Clone for OpRef {
    fn clone(&self) -> Self {
        self.node().refs.fetch_add(1, Ordering::Relaxed);
        Self(self.0)
    }
}

impl Drop for OpRef {
    fn drop(&mut self) {
        if self.node().refs.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        fence(Ordering::Acquire);

        // Safety: we hold the last reference. Take the pool handle out first
        // so the node's block can be returned to it after the node (and its
        // own handle) is dropped in place.
        unsafe {
            let pool = Arc::clone(&self.0.as_ref().pool);
            pool.deallocate(self.0);
        }
    }
}

impl fmt::Debug for OpRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OpRef").field(&self.op_type()).finish()
    }
}

// === type-erased callables ===
//
// Continuations, thunks and async launchers ride the same pool hot path as
// the ops that own them: the closure's captures live in a pool slot, and a
// vtable of monomorphized functions knows how to call, clone and drop them.
// Each callable records the pool its captures were allocated from so the
// slot is returned to the right place no matter where it is dropped.

/// A pool-allocated, type-erased `Fn(FiberValue) -> OpRef`.
pub(crate) struct ErasedPredicate {
    data: NonNull<()>,
    call_fn: unsafe fn(NonNull<()>, FiberValue) -> OpRef,
    clone_fn: unsafe fn(NonNull<()>, &Pool) -> NonNull<()>,
    drop_fn: unsafe fn(NonNull<()>, &Pool),
    pool: PoolRef,
}

// Safety: construction requires the closure to be `Send + Sync`, and the
// erased surface only ever calls it through `&self`.
unsafe impl Send for ErasedPredicate {}
// Safety: see above.
unsafe impl Sync for ErasedPredicate {}

impl ErasedPredicate {
    pub(crate) fn new<F>(predicate: F) -> Self
    where
        F: Fn(FiberValue) -> OpRef + Clone + Send + Sync + 'static,
    {
        let pool = global_pool();
        Self {
            data: pool.allocate(predicate).cast(),
            call_fn: call_predicate::<F>,
            clone_fn: clone_closure::<F>,
            drop_fn: drop_closure::<F>,
            pool,
        }
    }

    pub(crate) fn call(&self, value: FiberValue) -> OpRef {
        // Safety: `data` is a live closure of the type `call_fn` was
        // monomorphized for.
        unsafe { (self.call_fn)(self.data, value) }
    }
}

impl Clone for ErasedPredicate {
    fn clone(&self) -> Self {
        // allocate the copy from the cloning thread's pool for locality
        let pool = global_pool();
        Self {
            // Safety: `data` is a live closure matching `clone_fn`.
            data: unsafe { (self.clone_fn)(self.data, &pool) },
            call_fn: self.call_fn,
            clone_fn: self.clone_fn,
            drop_fn: self.drop_fn,
            pool,
        }
    }
}

impl Drop for ErasedPredicate {
    fn drop(&mut self) {
        // Safety: `data` is a live closure matching `drop_fn`, allocated
        // from `self.pool`.
        unsafe { (self.drop_fn)(self.data, &self.pool) };
    }
}

/// A pool-allocated, type-erased `Fn() -> Erased`.
pub(crate) struct ErasedThunk {
    data: NonNull<()>,
    call_fn: unsafe fn(NonNull<()>) -> Erased,
    drop_fn: unsafe fn(NonNull<()>, &Pool),
    pool: PoolRef,
}

// Safety: as for `ErasedPredicate`.
unsafe impl Send for ErasedThunk {}
// Safety: as for `ErasedPredicate`.
unsafe impl Sync for ErasedThunk {}

impl ErasedThunk {
    fn new<F>(thunk: F) -> Self
    where
        F: Fn() -> Erased + Send + Sync + 'static,
    {
        let pool = global_pool();
        Self {
            data: pool.allocate(thunk).cast(),
            call_fn: call_thunk::<F>,
            drop_fn: drop_closure::<F>,
            pool,
        }
    }

    pub(crate) fn call(&self) -> Erased {
        // Safety: `data` is a live closure matching `call_fn`.
        unsafe { (self.call_fn)(self.data) }
    }
}

impl Drop for ErasedThunk {
    fn drop(&mut self) {
        // Safety: `data` is a live closure matching `drop_fn`, allocated
        // from `self.pool`.
        unsafe { (self.drop_fn)(self.data, &self.pool) };
    }
}

/// A pool-allocated, type-erased `Fn(&SchedulerRef) -> DeferredRef`.
pub(crate) struct ErasedAsync {
    data: NonNull<()>,
    call_fn: unsafe fn(NonNull<()>, &SchedulerRef) -> DeferredRef,
    drop_fn: unsafe fn(NonNull<()>, &Pool),
    pool: PoolRef,
}

// Safety: as for `ErasedPredicate`.
unsafe impl Send for ErasedAsync {}
// Safety: as for `ErasedPredicate`.
unsafe impl Sync for ErasedAsync {}

impl ErasedAsync {
    fn new<F>(launch: F) -> Self
    where
        F: Fn(&SchedulerRef) -> DeferredRef + Send + Sync + 'static,
    {
        let pool = global_pool();
        Self {
            data: pool.allocate(launch).cast(),
            call_fn: call_async::<F>,
            drop_fn: drop_closure::<F>,
            pool,
        }
    }

    pub(crate) fn call(&self, scheduler: &SchedulerRef) -> DeferredRef {
        // Safety: `data` is a live closure matching `call_fn`.
        unsafe { (self.call_fn)(self.data, scheduler) }
    }
}

impl Drop for ErasedAsync {
    fn drop(&mut self) {
        // Safety: `data` is a live closure matching `drop_fn`, allocated
        // from `self.pool`.
        unsafe { (self.drop_fn)(self.data, &self.pool) };
    }
}

unsafe fn call_predicate<F>(data: NonNull<()>, value: FiberValue) -> OpRef
where
    F: Fn(FiberValue) -> OpRef + 'static,
{
    // Safety: the caller guarantees `data` holds a live `F`.
    let predicate = unsafe { data.cast::<F>().as_ref() };
    predicate(value)
}

unsafe fn call_thunk<F>(data: NonNull<()>) -> Erased
where
    F: Fn() -> Erased + 'static,
{
    // Safety: the caller guarantees `data` holds a live `F`.
    let thunk = unsafe { data.cast::<F>().as_ref() };
    thunk()
}

unsafe fn call_async<F>(data: NonNull<()>, scheduler: &SchedulerRef) -> DeferredRef
where
    F: Fn(&SchedulerRef) -> DeferredRef + 'static,
{
    // Safety: the caller guarantees `data` holds a live `F`.
    let launch = unsafe { data.cast::<F>().as_ref() };
    launch(scheduler)
}

unsafe fn clone_closure<F: Clone + 'static>(data: NonNull<()>, pool: &Pool) -> NonNull<()> {
    // Safety: the caller guarantees `data` holds a live `F`.
    let copy = unsafe { data.cast::<F>().as_ref() }.clone();
    pool.allocate(copy).cast()
}

unsafe fn drop_closure<F: 'static>(data: NonNull<()>, pool: &Pool) {
    // Safety: the caller guarantees `data` holds a live `F` allocated from
    // `pool` and relinquishes it.
    unsafe { pool.deallocate(data.cast::<F>()) };
}

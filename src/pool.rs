// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod block;

use core::mem;
use core::ptr::NonNull;
use static_assertions::const_assert;
use std::sync::Arc;

pub use block::BlockPool;

cfg_if::cfg_if! {
    if #[cfg(any(target_arch = "mips", target_arch = "mips64"))] {
        /// The platform's destructive-interference unit.
        const CACHE_LINE_SIZE: usize = 32;
    } else {
        /// The platform's destructive-interference unit.
        const CACHE_LINE_SIZE: usize = 64;
    }
}

/// Alignment of every block payload; anything needing more falls through to
/// the system allocator.
pub(crate) const BLOCK_ALIGN: usize = 16;

/// Blocks per chunk in the smallest tier. Each tier halves the count as the
/// block size doubles, so every tier's chunk has roughly the same footprint.
const SMALLEST_BLOCK_NUM_ENTRIES: usize = 2048;

const_assert!(CACHE_LINE_SIZE.is_power_of_two());
const_assert!(CACHE_LINE_SIZE >= BLOCK_ALIGN);
const_assert!(SMALLEST_BLOCK_NUM_ENTRIES.is_power_of_two());

/// A size-tiered façade over seven [`BlockPool`]s.
///
/// `allocate` dispatches to the tier whose block size is the smallest one
/// that fits the value; objects larger than the biggest tier (or with
/// exotic alignment) fall through to the system allocator. All tiers are
/// lock-free and safe for cross-thread allocate/deallocate.
pub struct Pool {
    small_pool: BlockPool<CACHE_LINE_SIZE, SMALLEST_BLOCK_NUM_ENTRIES>,
    medium_pool: BlockPool<{ CACHE_LINE_SIZE * 2 }, { SMALLEST_BLOCK_NUM_ENTRIES / 2 }>,
    large_pool: BlockPool<{ CACHE_LINE_SIZE * 4 }, { SMALLEST_BLOCK_NUM_ENTRIES / 4 }>,
    xlarge_pool: BlockPool<{ CACHE_LINE_SIZE * 8 }, { SMALLEST_BLOCK_NUM_ENTRIES / 8 }>,
    xxlarge_pool: BlockPool<{ CACHE_LINE_SIZE * 16 }, { SMALLEST_BLOCK_NUM_ENTRIES / 16 }>,
    xxxlarge_pool: BlockPool<{ CACHE_LINE_SIZE * 32 }, { SMALLEST_BLOCK_NUM_ENTRIES / 32 }>,
    xxxxlarge_pool: BlockPool<{ CACHE_LINE_SIZE * 64 }, { SMALLEST_BLOCK_NUM_ENTRIES / 64 }>,
}

/// A shared, reference-counted handle to a [`Pool`].
///
/// Objects that may be deallocated on a different thread than the one that
/// allocated them (fiber ops, erased continuations) hold one of these so the
/// owning pool outlives them.
pub type PoolRef = Arc<Pool>;

impl Pool {
    pub fn new() -> Self {
        Self {
            small_pool: BlockPool::new(),
            medium_pool: BlockPool::new(),
            large_pool: BlockPool::new(),
            xlarge_pool: BlockPool::new(),
            xxlarge_pool: BlockPool::new(),
            xxxlarge_pool: BlockPool::new(),
            xxxxlarge_pool: BlockPool::new(),
        }
    }

    /// Move `value` into a block from the smallest tier that fits it.
    pub fn allocate<T>(&self, value: T) -> NonNull<T> {
        let size = mem::size_of::<T>();

        if mem::align_of::<T>() > BLOCK_ALIGN || size > CACHE_LINE_SIZE * 64 {
            // Safety: `Box::into_raw` never returns null.
            return unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(value))) };
        }

        if size <= CACHE_LINE_SIZE {
            self.small_pool.allocate(value)
        } else if size <= CACHE_LINE_SIZE * 2 {
            self.medium_pool.allocate(value)
        } else if size <= CACHE_LINE_SIZE * 4 {
            self.large_pool.allocate(value)
        } else if size <= CACHE_LINE_SIZE * 8 {
            self.xlarge_pool.allocate(value)
        } else if size <= CACHE_LINE_SIZE * 16 {
            self.xxlarge_pool.allocate(value)
        } else if size <= CACHE_LINE_SIZE * 32 {
            self.xxxlarge_pool.allocate(value)
        } else {
            self.xxxxlarge_pool.allocate(value)
        }
    }

    /// Drop the pointee and return its block to the tier it came from.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [`Pool::allocate`] with the same `T` on this
    /// pool and must not be used afterwards.
    pub unsafe fn deallocate<T>(&self, ptr: NonNull<T>) {
        let size = mem::size_of::<T>();

        // Safety for all branches: the caller guarantees `ptr` came from
        // `allocate::<T>` on this pool, so the size dispatch below picks the
        // same tier (or fallback) that `allocate` picked.
        unsafe {
            if mem::align_of::<T>() > BLOCK_ALIGN || size > CACHE_LINE_SIZE * 64 {
                drop(Box::from_raw(ptr.as_ptr()));
            } else if size <= CACHE_LINE_SIZE {
                self.small_pool.deallocate(ptr);
            } else if size <= CACHE_LINE_SIZE * 2 {
                self.medium_pool.deallocate(ptr);
            } else if size <= CACHE_LINE_SIZE * 4 {
                self.large_pool.deallocate(ptr);
            } else if size <= CACHE_LINE_SIZE * 8 {
                self.xlarge_pool.deallocate(ptr);
            } else if size <= CACHE_LINE_SIZE * 16 {
                self.xxlarge_pool.deallocate(ptr);
            } else if size <= CACHE_LINE_SIZE * 32 {
                self.xxxlarge_pool.deallocate(ptr);
            } else {
                self.xxxxlarge_pool.deallocate(ptr);
            }
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static GLOBAL_POOL: PoolRef = Arc::new(Pool::new());
}

/// The calling thread's pool.
///
/// The first call on a thread constructs the pool; subsequent calls return a
/// handle to the same instance. Allocations thereby stay local to the
/// allocating thread in the common case, while the returned handle keeps the
/// pool alive for objects whose blocks are returned from other threads after
/// this thread has exited.
pub fn global_pool() -> PoolRef {
    GLOBAL_POOL.with(Arc::clone)
}

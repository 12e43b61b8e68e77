// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use crate::pool::BLOCK_ALIGN;
use core::mem;
use core::ptr::{self, NonNull};
use std::alloc::{Layout, alloc, dealloc, handle_alloc_error};

/// A lock-free slab allocator handing out fixed-size blocks.
///
/// Memory is requested from the system allocator one *chunk* at a time; a
/// chunk is carved into `BLOCKS_PER_CHUNK` blocks which are pushed onto a
/// Treiber-style free list. Allocation pops a block, deallocation pushes it
/// back. Both paths are a single CAS in the common case and are safe to call
/// from any thread - a block allocated on one thread may be freed on another,
/// which is the typical case because fiber ops migrate between scheduler
/// workers.
///
/// Chunks are never returned to the system until the pool itself is dropped,
/// so the pool must outlive every object allocated from it.
pub struct BlockPool<const BLOCK_SIZE: usize, const BLOCKS_PER_CHUNK: usize> {
    /// Head of the free list, tagged with a generation counter (see
    /// [`pack`](Self::pack)). The counter makes the pop CAS fail when the
    /// list was concurrently popped and re-pushed, which defeats the
    /// classic free-list ABA.
    free_blocks: AtomicU64,
    /// Chain of every chunk ever allocated. Push-only until teardown walks
    /// it, so a plain pointer CAS suffices here - no tag needed.
    allocated_chunks: AtomicPtr<Chunk<BLOCK_SIZE, BLOCKS_PER_CHUNK>>,
    /// Non-blocking exclusion gate for chunk growth. Losers spin back into
    /// the allocate retry loop instead of sleeping.
    allocating_chunk: AtomicBool,
}

/// A payload region followed by the intrusive free-list link.
///
/// The payload sits at offset 0 so that the pointer recovered from a free
/// block coincides with the pointer handed to the user. The struct alignment
/// rounds the block size up so blocks tile evenly inside a chunk.
#[repr(C, align(16))]
struct Block<const BLOCK_SIZE: usize> {
    /// Payload storage; only ever accessed through raw pointer casts.
    #[allow(dead_code)]
    memory: [u8; BLOCK_SIZE],
    /// Link to the next free block. Only meaningful while the block is on
    /// the free list; accessed with relaxed atomics because a stale read is
    /// always caught by the tagged head CAS.
    next: core::sync::atomic::AtomicPtr<Block<BLOCK_SIZE>>,
}

#[repr(C)]
struct Chunk<const BLOCK_SIZE: usize, const BLOCKS_PER_CHUNK: usize> {
    /// Block storage; carved up through raw pointer casts.
    #[allow(dead_code)]
    blocks: [Block<BLOCK_SIZE>; BLOCKS_PER_CHUNK],
    next: *mut Chunk<BLOCK_SIZE, BLOCKS_PER_CHUNK>,
}

/// Number of low bits in the head word reserved for the block address.
const ADDR_BITS: u32 = 48;
const ADDR_MASK: u64 = (1 << ADDR_BITS) - 1;
/// The generation counter lives in the remaining high bits and wraps there.
const TAG_MASK: u64 = u64::MAX >> ADDR_BITS;
/// Blocks are at least 16-byte aligned, so the low four address bits are
/// always zero and can be shifted out. Together with [`ADDR_BITS`] this
/// covers a 52-bit virtual address space.
const ADDR_SHIFT: u32 = 4;

// Safety: the free list and chunk chain are the only shared state and both
// are maintained with atomics; blocks themselves are owned by exactly one
// side (the pool while free, the caller while allocated).
unsafe impl<const B: usize, const N: usize> Send for BlockPool<B, N> {}
unsafe impl<const B: usize, const N: usize> Sync for BlockPool<B, N> {}

impl<const BLOCK_SIZE: usize, const BLOCKS_PER_CHUNK: usize>
    BlockPool<BLOCK_SIZE, BLOCKS_PER_CHUNK>
{
    pub fn new() -> Self {
        Self {
            free_blocks: AtomicU64::new(0),
            allocated_chunks: AtomicPtr::new(ptr::null_mut()),
            allocating_chunk: AtomicBool::new(false),
        }
    }

    /// Move `value` into a freshly popped block.
    ///
    /// Grows the pool by a chunk when the free list is empty. System
    /// allocator failure during growth is fatal.
    pub fn allocate<T>(&self, value: T) -> NonNull<T> {
        assert!(mem::size_of::<T>() <= BLOCK_SIZE);
        assert!(mem::align_of::<T>() <= BLOCK_ALIGN);

        let block = loop {
            if let Some(block) = self.pop_block() {
                break block;
            }
            self.allocate_chunk();
            core::hint::spin_loop();
        };

        let slot = block.cast::<T>();
        // Safety: the block was popped off the free list, so we have
        // exclusive access to its payload region, which is large and aligned
        // enough for `T` per the assertions above.
        unsafe { slot.as_ptr().write(value) };
        slot
    }

    /// Drop the pointee and return its block to the free list.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [`BlockPool::allocate`] on this pool (or a
    /// pool of identical geometry backed by live chunks) and must not be
    /// used afterwards.
    pub unsafe fn deallocate<T>(&self, ptr: NonNull<T>) {
        assert!(mem::size_of::<T>() <= BLOCK_SIZE);

        // Safety: caller guarantees the pointee is a live `T` we own.
        unsafe { ptr::drop_in_place(ptr.as_ptr()) };
        self.push_block(ptr.as_ptr().cast::<Block<BLOCK_SIZE>>());
    }

    fn pack(ptr: *mut Block<BLOCK_SIZE>, tag: u64) -> u64 {
        let addr = ptr as usize as u64;
        debug_assert_eq!(addr % (1 << ADDR_SHIFT), 0);
        debug_assert_eq!((addr >> ADDR_SHIFT) & !ADDR_MASK, 0);
        (addr >> ADDR_SHIFT) | ((tag & TAG_MASK) << ADDR_BITS)
    }

    fn unpack(head: u64) -> *mut Block<BLOCK_SIZE> {
        ((head & ADDR_MASK) << ADDR_SHIFT) as usize as *mut Block<BLOCK_SIZE>
    }

    fn tag(head: u64) -> u64 {
        // wraps at 16 bits when re-packed
        (head >> ADDR_BITS) + 1
    }

    fn pop_block(&self) -> Option<NonNull<u8>> {
        let mut head = self.free_blocks.load(Ordering::Relaxed);
        loop {
            let block = Self::unpack(head);
            if block.is_null() {
                return None;
            }

            // Safety: blocks live as long as the pool; if `block` was
            // concurrently popped and handed out this read is stale, but the
            // CAS below fails in that case because the generation moved on.
            let next = unsafe { (*block).next.load(Ordering::Relaxed) };

            match self.free_blocks.compare_exchange_weak(
                head,
                Self::pack(next, Self::tag(head)),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    // Safety: we won the pop, the block is exclusively ours.
                    unsafe { (*block).next.store(ptr::null_mut(), Ordering::Relaxed) };
                    return Some(NonNull::new(block.cast::<u8>()).expect("free list head was null"));
                }
                Err(actual) => head = actual,
            }
        }
    }

    fn push_block(&self, block: *mut Block<BLOCK_SIZE>) {
        let mut head = self.free_blocks.load(Ordering::Relaxed);
        loop {
            // Safety: the block is exclusively ours until the CAS publishes it.
            unsafe { (*block).next.store(Self::unpack(head), Ordering::Relaxed) };

            match self.free_blocks.compare_exchange_weak(
                head,
                Self::pack(block, Self::tag(head)),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Grow the pool by one chunk.
    ///
    /// Exactly one thread wins the `allocating_chunk` gate; everyone else
    /// returns to the allocate retry loop and picks blocks off the list the
    /// winner is about to publish.
    fn allocate_chunk(&self) {
        if self.allocating_chunk.swap(true, Ordering::Acquire) {
            return;
        }

        tracing::trace!(
            block_size = BLOCK_SIZE,
            blocks = BLOCKS_PER_CHUNK,
            "growing pool by one chunk"
        );

        let layout = Layout::new::<Chunk<BLOCK_SIZE, BLOCKS_PER_CHUNK>>();
        // Safety: `Chunk` is never zero-sized.
        let raw = unsafe { alloc(layout) };
        let chunk: *mut Chunk<BLOCK_SIZE, BLOCKS_PER_CHUNK> = raw.cast();
        if chunk.is_null() {
            handle_alloc_error(layout);
        }

        // String the chunk's blocks into a singly-linked chain. The chunk is
        // private to this thread until the CAS below publishes it.
        let first: *mut Block<BLOCK_SIZE> = chunk.cast();
        // Safety: `first..first + BLOCKS_PER_CHUNK` all lie inside the fresh
        // allocation; `addr_of_mut` writes initialize the link fields without
        // materializing references to uninitialized memory.
        unsafe {
            for i in 0..BLOCKS_PER_CHUNK {
                let block = first.add(i);
                let next = if i + 1 < BLOCKS_PER_CHUNK {
                    first.add(i + 1)
                } else {
                    ptr::null_mut()
                };
                ptr::addr_of_mut!((*block).next).write(core::sync::atomic::AtomicPtr::new(next));
            }
        }

        // Prepend to the chain of chunks used for teardown.
        let mut chunks_head = self.allocated_chunks.load(Ordering::Relaxed);
        loop {
            // Safety: the chunk is still private to this thread.
            unsafe { ptr::addr_of_mut!((*chunk).next).write(chunks_head) };
            match self.allocated_chunks.compare_exchange_weak(
                chunks_head,
                chunk,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => chunks_head = actual,
            }
        }

        // Publish the entire block chain onto the free list with a single CAS.
        let last = first.wrapping_add(BLOCKS_PER_CHUNK - 1);
        let mut head = self.free_blocks.load(Ordering::Relaxed);
        loop {
            // Safety: the chain is unpublished, `last` is ours to relink.
            unsafe { (*last).next.store(Self::unpack(head), Ordering::Relaxed) };
            match self.free_blocks.compare_exchange_weak(
                head,
                Self::pack(first, Self::tag(head)),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }

        self.allocating_chunk.store(false, Ordering::Release);
    }

    /// Number of chunks currently backing the pool.
    #[cfg(test)]
    fn chunks(&self) -> usize {
        let mut count = 0;
        let mut current = self.allocated_chunks.load(Ordering::Acquire);
        while !current.is_null() {
            count += 1;
            // Safety: the chunk chain is immutable once published and we
            // hold `&self`, so no teardown can race this walk.
            current = unsafe { (*current).next };
        }
        count
    }
}

impl<const B: usize, const N: usize> Default for BlockPool<B, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const B: usize, const N: usize> Drop for BlockPool<B, N> {
    fn drop(&mut self) {
        let layout = Layout::new::<Chunk<B, N>>();
        let mut current = self.allocated_chunks.load(Ordering::Acquire);
        while !current.is_null() {
            // Safety: `&mut self` means no blocks are being allocated or
            // freed anymore; the pool outlives all user objects by contract,
            // so every chunk can go back to the system allocator wholesale.
            unsafe {
                let next = (*current).next;
                dealloc(current.cast::<u8>(), layout);
                current = next;
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::loom::thread;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn allocates_and_frees() {
        let pool = BlockPool::<64, 16>::new();
        let thing = pool.allocate(42_u32);
        // Safety: `thing` came from this pool just above.
        unsafe { pool.deallocate(thing) };
    }

    #[test]
    fn allocates_lifo() {
        let pool = BlockPool::<64, 16>::new();

        let first = pool.allocate(1_u32);
        // Safety: allocated from this pool.
        unsafe { pool.deallocate(first) };

        let second = pool.allocate(2_u32);
        // Safety: allocated from this pool.
        unsafe { pool.deallocate(second) };

        assert_eq!(first, second);
    }

    #[test]
    fn grows_chunk_by_chunk() {
        let pool = BlockPool::<64, 4>::new();
        assert_eq!(pool.chunks(), 0);

        let mut outstanding = Vec::new();
        for i in 0..4 {
            outstanding.push(pool.allocate(i));
        }
        assert_eq!(pool.chunks(), 1);

        outstanding.push(pool.allocate(4));
        assert_eq!(pool.chunks(), 2);

        for ptr in outstanding {
            // Safety: every pointer came from this pool.
            unsafe { pool.deallocate(ptr) };
        }
        assert_eq!(pool.chunks(), 2);
    }

    #[test]
    fn outstanding_pointers_are_distinct() {
        let pool = BlockPool::<64, 8>::new();

        let outstanding: Vec<_> = (0..64_u64).map(|i| pool.allocate(i)).collect();
        let unique: HashSet<_> = outstanding.iter().map(|ptr| ptr.as_ptr()).collect();
        assert_eq!(unique.len(), outstanding.len());

        for (i, ptr) in outstanding.iter().enumerate() {
            // Safety: the pointer is outstanding, nobody else touches it.
            assert_eq!(unsafe { *ptr.as_ref() }, i as u64);
        }

        for ptr in outstanding {
            // Safety: every pointer came from this pool.
            unsafe { pool.deallocate(ptr) };
        }
    }

    #[test]
    fn drops_payload_on_deallocate() {
        struct Canary(Arc<std::sync::atomic::AtomicUsize>);
        impl Drop for Canary {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let pool = BlockPool::<64, 8>::new();

        let ptr = pool.allocate(Canary(drops.clone()));
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        // Safety: allocated from this pool.
        unsafe { pool.deallocate(ptr) };
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic]
    fn rejects_oversized_values() {
        let pool = BlockPool::<16, 8>::new();
        pool.allocate([0_u8; 64]);
    }

    #[test]
    fn repeatedly_allocates_parallel() {
        let pool = Arc::new(BlockPool::<64, 32>::new());

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for i in 0..10_000_u64 {
                        let ptr = pool.allocate(i);
                        // Safety: allocated from this pool just above.
                        unsafe {
                            assert_eq!(*ptr.as_ref(), i);
                            pool.deallocate(ptr);
                        }
                    }
                })
            })
            .collect();

        for handle in threads {
            handle.join().unwrap();
        }
    }

    #[test]
    fn cross_thread_free() {
        let pool = Arc::new(BlockPool::<64, 32>::new());
        let (tx, rx) = std::sync::mpsc::channel();

        let producer = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for i in 0..1_000_u64 {
                    tx.send(pool.allocate(i).as_ptr() as usize).unwrap();
                }
            })
        };
        let consumer = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for addr in rx {
                    // Safety: the producer allocated this pointer from the
                    // same pool and relinquished it through the channel.
                    unsafe { pool.deallocate(NonNull::new(addr as *mut u64).unwrap()) };
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();
    }
}

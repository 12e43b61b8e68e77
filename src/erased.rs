// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::EmptyErased;
use crate::pool::Pool;
use core::any::TypeId;
use core::fmt;
use core::ptr;

/// A holder for a single type-erased value.
///
/// This type can hold any (`Clone + Send + Sync + 'static`) value and will
/// properly clone and drop it based on its real type. In many ways it is
/// similar to a checked dynamic-any container except it is _far_ less safe:
/// rather than validating type information at runtime, [`Erased::get`] is a
/// blind cast and assumes the caller _really_ knows what they are doing.
/// Compile-time type safety is meant to be enforced one level up, by
/// whatever typed façade constructs the fiber ops that carry these values.
/// The stored [`TypeId`] is consulted only for the same-type assignment fast
/// path and for debug assertions.
///
/// Payloads live in a process-wide pool shared by every `Erased`; the
/// container always owns its payload, never borrows it.
pub struct Erased {
    /// Null iff the container is empty.
    data: *mut (),
    drop_fn: unsafe fn(*mut ()),
    clone_fn: unsafe fn(*const ()) -> *mut (),
    type_id: TypeId,
}

/// Payload slots for every `Erased` in the process come from this one pool,
/// so a value created on one thread can be dropped on any other.
static ERASED_POOL: spin::Lazy<Pool> = spin::Lazy::new(Pool::new);

/// Marker for the type tag of an empty container.
enum Vacant {}

// Safety: construction requires `T: Send + Sync`, the `&self` surface hands
// out only `&T` and deep copies, and mutation requires `&mut self`.
unsafe impl Send for Erased {}
// Safety: see above.
unsafe impl Sync for Erased {}

impl Erased {
    /// An empty container.
    pub fn empty() -> Self {
        Self {
            data: ptr::null_mut(),
            drop_fn: drop_vacant,
            clone_fn: clone_vacant,
            type_id: TypeId::of::<Vacant>(),
        }
    }

    /// Move `value` into a pool-allocated slot and record the drop/clone
    /// thunks specialized to `T`.
    pub fn new<T: Clone + Send + Sync + 'static>(value: T) -> Self {
        Self {
            data: ERASED_POOL.allocate(value).as_ptr().cast(),
            drop_fn: drop_slot::<T>,
            clone_fn: clone_slot::<T>,
            type_id: TypeId::of::<T>(),
        }
    }

    /// `true` iff this instance currently holds a value.
    pub fn has_value(&self) -> bool {
        !self.data.is_null()
    }

    /// Get the value held by this instance, cast to `T`.
    ///
    /// # Panics
    ///
    /// Panics if the container is empty.
    ///
    /// # Safety
    ///
    /// `T` must be the exact type the container was filled with. The cast is
    /// unchecked in release builds; getting it wrong is undefined behavior.
    #[track_caller]
    pub unsafe fn get<T: 'static>(&self) -> &T {
        // Safety: forwarded to the caller.
        match unsafe { self.try_get::<T>() } {
            Ok(value) => value,
            Err(err) => panic!("{err}"),
        }
    }

    /// Like [`Erased::get`] but reports the empty case as an error instead of
    /// panicking.
    ///
    /// # Safety
    ///
    /// `T` must be the exact type the container was filled with.
    pub unsafe fn try_get<T: 'static>(&self) -> Result<&T, EmptyErased> {
        if self.data.is_null() {
            return Err(EmptyErased(()));
        }
        debug_assert_eq!(
            self.type_id,
            TypeId::of::<T>(),
            "type-confused read of an Erased container"
        );
        // Safety: non-null means the slot holds a live payload, and the
        // caller guarantees it is a `T`.
        Ok(unsafe { &*self.data.cast::<T>() })
    }

    /// Replace the held value.
    ///
    /// When the stored type matches `T` the payload is overwritten in place;
    /// otherwise the current payload is dropped and a new slot is allocated.
    pub fn set<T: Clone + Send + Sync + 'static>(&mut self, value: T) {
        if self.data.is_null() {
            *self = Self::new(value);
        } else if self.type_id == TypeId::of::<T>() {
            // Safety: the type tag says the payload is a `T`, and `&mut self`
            // gives us exclusive access to it.
            unsafe { *self.data.cast::<T>() = value };
        } else {
            self.reset();
            *self = Self::new(value);
        }
    }

    /// If this instance currently holds a value, free it. Afterwards the
    /// instance holds no value. Does nothing on an empty container.
    pub fn reset(&mut self) {
        if !self.data.is_null() {
            // Safety: non-null payload, `drop_fn` matches its type.
            unsafe { (self.drop_fn)(self.data) };
            self.data = ptr::null_mut();
        }
    }
}

impl Clone for Erased {
    /// Deep-copies the payload through the stored clone thunk.
    fn clone(&self) -> Self {
        if self.data.is_null() {
            Self::empty()
        } else {
            Self {
                // Safety: non-null payload, `clone_fn` matches its type.
                data: unsafe { (self.clone_fn)(self.data) },
                drop_fn: self.drop_fn,
                clone_fn: self.clone_fn,
                type_id: self.type_id,
            }
        }
    }
}

impl Default for Erased {
    fn default() -> Self {
        Self::empty()
    }
}

impl Drop for Erased {
    fn drop(&mut self) {
        self.reset();
    }
}

impl fmt::Debug for Erased {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Erased")
            .field("has_value", &self.has_value())
            .finish_non_exhaustive()
    }
}

unsafe fn drop_vacant(_data: *mut ()) {}

unsafe fn clone_vacant(_data: *const ()) -> *mut () {
    ptr::null_mut()
}

unsafe fn drop_slot<T: 'static>(data: *mut ()) {
    // Safety: only ever invoked on a payload of type `T` allocated from the
    // erased pool.
    unsafe { ERASED_POOL.deallocate(ptr::NonNull::new_unchecked(data.cast::<T>())) };
}

unsafe fn clone_slot<T: Clone + Send + Sync + 'static>(data: *const ()) -> *mut () {
    // Safety: only ever invoked on a live payload of type `T`.
    let copy = unsafe { &*data.cast::<T>() }.clone();
    ERASED_POOL.allocate(copy).as_ptr().cast()
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use core::mem;

    #[test]
    fn default_is_empty() {
        let erased = Erased::default();
        assert!(!erased.has_value());
    }

    #[test]
    fn holds_a_value() {
        let erased = Erased::new(42_i32);
        assert!(erased.has_value());
        // Safety: constructed with an `i32` just above.
        assert_eq!(*unsafe { erased.get::<i32>() }, 42);
    }

    #[test]
    fn holds_a_heap_value() {
        let erased = Erased::new(String::from("hello"));
        // Safety: constructed with a `String` just above.
        assert_eq!(unsafe { erased.get::<String>() }, "hello");
    }

    #[test]
    fn clone_is_a_deep_copy() {
        let mut first = Erased::new(vec![1_i32, 2, 3]);
        let second = first.clone();

        first.reset();
        assert!(!first.has_value());
        // Safety: `second` was cloned from a `Vec<i32>` container.
        assert_eq!(*unsafe { second.get::<Vec<i32>>() }, vec![1, 2, 3]);
    }

    #[test]
    fn move_empties_the_source() {
        let mut source = Erased::new(7_i32);
        let destination = mem::take(&mut source);

        assert!(!source.has_value());
        // Safety: the payload moved over with the container.
        assert_eq!(*unsafe { destination.get::<i32>() }, 7);
    }

    #[test]
    #[should_panic(expected = "tried to obtain value for empty Erased container")]
    fn get_on_empty_panics() {
        let erased = Erased::empty();
        // Safety: empty container, the type argument is irrelevant.
        unsafe { erased.get::<i32>() };
    }

    #[test]
    fn try_get_on_empty_errors() {
        let erased = Erased::empty();
        // Safety: empty container, the type argument is irrelevant.
        assert!(unsafe { erased.try_get::<i32>() }.is_err());
    }

    #[test]
    fn set_same_type_overwrites_in_place() {
        let mut erased = Erased::new(1_i32);
        erased.set(2_i32);
        // Safety: still holds an `i32`.
        assert_eq!(*unsafe { erased.get::<i32>() }, 2);
    }

    #[test]
    fn set_new_type_replaces_payload() {
        let mut erased = Erased::new(1_i32);
        erased.set(String::from("now a string"));
        // Safety: the tag and payload were replaced by the assignment.
        assert_eq!(unsafe { erased.get::<String>() }, "now a string");
    }

    #[test]
    fn set_on_empty_fills() {
        let mut erased = Erased::empty();
        erased.set(9_u64);
        // Safety: filled with a `u64` just above.
        assert_eq!(*unsafe { erased.get::<u64>() }, 9);
    }

    #[test]
    fn drops_payload_exactly_once() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        #[derive(Clone)]
        struct Canary(Arc<AtomicUsize>);
        impl Drop for Canary {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let erased = Erased::new(Canary(drops.clone()));
        drop(erased);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}

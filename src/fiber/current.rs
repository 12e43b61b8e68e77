// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::Cell;
use core::sync::atomic::{AtomicU64, Ordering};

/// Access to the identifier of the fiber currently executing on this thread.
///
/// The driver publishes the id while a fiber is being resumed and clears it
/// on suspend or completion, so third parties (log formatters, metrics) can
/// call [`CurrentFiber::id`] at any point to correlate output with a fiber.
pub struct CurrentFiber;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CURRENT_ID: Cell<Option<u64>> = const { Cell::new(None) };
}

impl CurrentFiber {
    /// The id of the fiber currently running on this thread, if any.
    pub fn id() -> Option<u64> {
        CURRENT_ID.get()
    }

    /// Claim a fresh fiber id from the global monotonic counter.
    pub(crate) fn acquire_id() -> u64 {
        NEXT_ID.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn set_id(id: u64) {
        CURRENT_ID.set(Some(id));
    }

    pub(crate) fn clear() {
        CURRENT_ID.set(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let first = CurrentFiber::acquire_id();
        let second = CurrentFiber::acquire_id();
        assert_ne!(first, second);
    }

    #[test]
    fn thread_local_roundtrip() {
        assert_eq!(CurrentFiber::id(), None);

        let id = CurrentFiber::acquire_id();
        CurrentFiber::set_id(id);
        assert_eq!(CurrentFiber::id(), Some(id));

        CurrentFiber::clear();
        assert_eq!(CurrentFiber::id(), None);
    }
}

// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicBool, Ordering};

/// A test-and-set lock that spins instead of sleeping.
///
/// In some (very rare) cases we prefer a spin lock over a mutex: deep in
/// scheduler code where, for latency and timer accuracy reasons, parking the
/// thread costs more than burning a few cycles. It is not fair and it can
/// cause a lot of contention if used inappropriately - don't reach for it
/// unless you're sure you need it.
///
/// The lock exposes no way to manipulate it other than [`SpinLock::lock`],
/// which hands back an RAII [`SpinLockGuard`] that releases on drop, on every
/// exit path.
pub struct SpinLock {
    flag: AtomicBool,
}

/// Scoped ownership of a [`SpinLock`]; releases the lock when dropped.
#[must_use = "if unused the SpinLock will immediately unlock"]
pub struct SpinLockGuard<'a> {
    lock: &'a SpinLock,
}

impl SpinLock {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
        }
    }

    /// Acquire the lock, spinning until it is available.
    pub fn lock(&self) -> SpinLockGuard<'_> {
        while self
            .flag
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // spin on the read-only path to keep the cache line shared
            // between waiters until the holder releases
            while self.flag.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        SpinLockGuard { lock: self }
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SpinLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.flag.store(false, Ordering::Release);
    }
}

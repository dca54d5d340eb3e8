//! Minimal spin lock guarding per-class child-list appends.
//!
//! Append is rare (first sighting of a `(parent, child)` pair per snapshot)
//! and the critical section is a handful of pointer writes, so a spin lock
//! beats a full mutex here. Never held across an external call.

use std::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Word-sized spin lock.
#[derive(Debug)]
pub(crate) struct SpinLock {
    state: AtomicU32,
}

impl SpinLock {
    /// Create an unlocked lock.
    pub(crate) const fn new() -> Self {
        SpinLock {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    /// Acquire the lock, spinning until it is free.
    #[inline]
    pub(crate) fn lock(&self) -> SpinGuard<'_> {
        while self
            .state
            .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.state.load(Ordering::Relaxed) == LOCKED {
                std::hint::spin_loop();
            }
        }
        SpinGuard { lock: self }
    }
}

/// RAII guard; releases the lock on drop.
#[derive(Debug)]
pub(crate) struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.state.store(UNLOCKED, Ordering::Release);
    }
}

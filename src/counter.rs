//! Object counters and the counting fast path.
//!
//! An [`ObjectCounter`] is a 16-byte-aligned pair of signed 64-bit words,
//! `(count, total_size)`, accumulated once per live object during the
//! stop-the-world heap walk. The two operations on it — [`inc`] and
//! [`add`] — are linearizable per counter, never allocate, and never log.
//!
//! # Realizations
//!
//! The arithmetic is selected at build time by target capability:
//!
//! - **Paired 64-bit atomic adds** (default on targets with 64-bit
//!   atomics). A reader may observe one word updated before the other;
//!   that is acceptable because snapshot finalization forbids concurrent
//!   readers.
//! - **Single 128-bit compare-and-swap** (`lock cmpxchg16b`) on x86-64
//!   when the `cmpxchg16b` target feature is enabled. Both words move
//!   together; the 16-byte alignment exists for this path.
//! - **Spin-locked scalar pair** on targets without 64-bit atomics.
//!
//! [`inc`]: ObjectCounter::inc
//! [`add`]: ObjectCounter::add

#[cfg(target_has_atomic = "64")]
use std::sync::atomic::{AtomicI64, Ordering};

#[cfg(not(target_has_atomic = "64"))]
use crate::spin::SpinLock;
#[cfg(not(target_has_atomic = "64"))]
use std::cell::UnsafeCell;

// =============================================================================
// ObjectCounter
// =============================================================================

/// Instance count and cumulative byte size for one class (or one
/// parent→child reference edge).
///
/// The address of every counter is 16-byte aligned so the wide-CAS path
/// can treat the pair as a single 128-bit location.
#[cfg(target_has_atomic = "64")]
#[repr(C, align(16))]
pub struct ObjectCounter {
    /// Live-object count.
    count: AtomicI64,
    /// Cumulative object size in bytes.
    total_size: AtomicI64,
}

/// Instance count and cumulative byte size for one class (or one
/// parent→child reference edge).
///
/// Portable fallback for targets without 64-bit atomics: the pair is
/// guarded by a per-counter spin lock. Alignment is kept at 16 bytes so
/// the layout invariant holds everywhere.
#[cfg(not(target_has_atomic = "64"))]
#[repr(C, align(16))]
pub struct ObjectCounter {
    count: UnsafeCell<i64>,
    total_size: UnsafeCell<i64>,
    lock: SpinLock,
}

// SAFETY: all access to the scalar pair goes through the per-counter
// spin lock.
#[cfg(not(target_has_atomic = "64"))]
unsafe impl Sync for ObjectCounter {}
#[cfg(not(target_has_atomic = "64"))]
unsafe impl Send for ObjectCounter {}

// =============================================================================
// Atomic realization (paired adds, or wide CAS where available)
// =============================================================================

#[cfg(target_has_atomic = "64")]
impl ObjectCounter {
    /// Create a zeroed counter.
    pub const fn new() -> Self {
        ObjectCounter {
            count: AtomicI64::new(0),
            total_size: AtomicI64::new(0),
        }
    }

    /// Zero both words.
    ///
    /// Only called in exclusive phases (snapshot clear, pool recycle), so
    /// relaxed stores suffice.
    #[inline]
    pub fn clear(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.total_size.store(0, Ordering::Relaxed);
    }

    /// Read the `(count, total_size)` pair.
    ///
    /// The two loads are not performed as one atomic unit; callers read
    /// counters only after the walker's join barrier, where the pair is
    /// stable.
    #[inline]
    pub fn load(&self) -> (i64, i64) {
        (
            self.count.load(Ordering::Relaxed),
            self.total_size.load(Ordering::Relaxed),
        )
    }

    #[cfg(not(all(target_arch = "x86_64", target_feature = "cmpxchg16b")))]
    #[inline]
    fn add_pair(&self, count: i64, size: i64) {
        self.count.fetch_add(count, Ordering::Relaxed);
        self.total_size.fetch_add(size, Ordering::Relaxed);
    }

    /// 128-bit read-modify-write: both words advance in one CAS.
    ///
    /// `rbx` is reserved by the compiler, so the desired low word travels
    /// through an exchange around the instruction.
    #[cfg(all(target_arch = "x86_64", target_feature = "cmpxchg16b"))]
    #[inline]
    fn add_pair(&self, count: i64, size: i64) {
        let dst = self as *const ObjectCounter as *mut i64;
        let mut cur_lo = self.count.load(Ordering::Relaxed);
        let mut cur_hi = self.total_size.load(Ordering::Relaxed);
        loop {
            let new_lo = cur_lo.wrapping_add(count);
            let new_hi = cur_hi.wrapping_add(size);
            let ok: u8;
            // SAFETY: `dst` is 16-byte aligned by the counter's layout and
            // the fields are atomics, so concurrent modification through a
            // shared reference is permitted.
            unsafe {
                core::arch::asm!(
                    "xchg rbx, {new_lo}",
                    "lock cmpxchg16b [{dst}]",
                    "sete {ok}",
                    "xchg rbx, {new_lo}",
                    dst = in(reg) dst,
                    new_lo = inout(reg) new_lo => _,
                    in("rcx") new_hi,
                    inout("rax") cur_lo,
                    inout("rdx") cur_hi,
                    ok = out(reg_byte) ok,
                    options(nostack),
                );
            }
            if ok != 0 {
                break;
            }
            // cur_lo / cur_hi now hold the observed pair; retry.
        }
    }
}

// =============================================================================
// Spin-locked realization
// =============================================================================

#[cfg(not(target_has_atomic = "64"))]
impl ObjectCounter {
    /// Create a zeroed counter.
    pub const fn new() -> Self {
        ObjectCounter {
            count: UnsafeCell::new(0),
            total_size: UnsafeCell::new(0),
            lock: SpinLock::new(),
        }
    }

    /// Zero both words.
    #[inline]
    pub fn clear(&self) {
        let _guard = self.lock.lock();
        // SAFETY: the spin lock is held.
        unsafe {
            *self.count.get() = 0;
            *self.total_size.get() = 0;
        }
    }

    /// Read the `(count, total_size)` pair.
    #[inline]
    pub fn load(&self) -> (i64, i64) {
        let _guard = self.lock.lock();
        // SAFETY: the spin lock is held.
        unsafe { (*self.count.get(), *self.total_size.get()) }
    }

    #[inline]
    fn add_pair(&self, count: i64, size: i64) {
        let _guard = self.lock.lock();
        // SAFETY: the spin lock is held.
        unsafe {
            *self.count.get() = (*self.count.get()).wrapping_add(count);
            *self.total_size.get() = (*self.total_size.get()).wrapping_add(size);
        }
    }
}

// =============================================================================
// Shared surface
// =============================================================================

impl ObjectCounter {
    /// Count one object of `size` bytes.
    #[inline]
    pub fn inc(&self, size: i64) {
        self.add_pair(1, size);
    }

    /// Merge another counter into this one (bulk merge of a walker
    /// thread's local tally).
    #[inline]
    pub fn add(&self, operand: &ObjectCounter) {
        let (count, size) = operand.load();
        self.add_pair(count, size);
    }

    /// Current live-object count.
    #[inline]
    pub fn count(&self) -> i64 {
        self.load().0
    }

    /// Current cumulative size in bytes.
    #[inline]
    pub fn total_size(&self) -> i64 {
        self.load().1
    }

    /// Whether both words read zero.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.load() == (0, 0)
    }
}

impl Default for ObjectCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ObjectCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (count, total_size) = self.load();
        f.debug_struct("ObjectCounter")
            .field("count", &count)
            .field("total_size", &total_size)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_zero() {
        let counter = ObjectCounter::new();
        assert!(counter.is_zero());
        assert_eq!(counter.load(), (0, 0));
    }

    #[test]
    fn test_inc_accumulates() {
        let counter = ObjectCounter::new();
        for _ in 0..1000 {
            counter.inc(24);
        }
        assert_eq!(counter.load(), (1000, 24_000));
    }

    #[test]
    fn test_add_merges_operand() {
        let counter = ObjectCounter::new();
        let local = ObjectCounter::new();
        local.inc(100);
        local.inc(20);

        counter.inc(8);
        counter.add(&local);

        assert_eq!(counter.load(), (3, 128));
    }

    #[test]
    fn test_clear_zeroes_both_words() {
        let counter = ObjectCounter::new();
        counter.inc(4096);
        counter.clear();
        assert!(counter.is_zero());
    }

    #[test]
    fn test_alignment_is_sixteen_bytes() {
        assert_eq!(std::mem::align_of::<ObjectCounter>() % 16, 0);

        let counter = ObjectCounter::new();
        assert_eq!(&counter as *const ObjectCounter as usize % 16, 0);
    }

    #[cfg(target_has_atomic = "64")]
    #[test]
    fn test_layout_is_one_pair() {
        assert_eq!(std::mem::size_of::<ObjectCounter>(), 16);
    }

    #[test]
    fn test_concurrent_inc_sums_operands() {
        const THREADS: usize = 4;
        const PER_THREAD: i64 = 50_000;

        let counter = ObjectCounter::new();
        std::thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for _ in 0..PER_THREAD {
                        counter.inc(40);
                    }
                });
            }
        });

        let expected = THREADS as i64 * PER_THREAD;
        assert_eq!(counter.load(), (expected, expected * 40));
    }

    #[test]
    fn test_concurrent_bulk_merge() {
        const THREADS: usize = 4;

        let counter = ObjectCounter::new();
        std::thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    let local = ObjectCounter::new();
                    for _ in 0..10_000 {
                        local.inc(16);
                    }
                    counter.add(&local);
                });
            }
        });

        assert_eq!(counter.load(), (40_000, 640_000));
    }
}

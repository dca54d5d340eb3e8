//! Core counters for monitoring the snapshot subsystem.
//!
//! The counting hot path never logs; anything it would have said is
//! folded into these counters and read out by the profiler's own
//! housekeeping threads.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics about snapshot activity.
///
/// All counters are updated atomically.
#[derive(Debug)]
pub struct CoreStats {
    /// Snapshots handed to a walker.
    snapshots_taken: AtomicU64,
    /// Snapshots returned after serialization.
    snapshots_released: AtomicU64,
    /// Objects the walker skipped without counting.
    ///
    /// This is the aggregate warn rate: a nonzero value means some
    /// contributions were dropped and the snapshot undercounts.
    dropped_contributions: AtomicU64,
}

impl CoreStats {
    /// Create new empty statistics.
    pub const fn new() -> Self {
        Self {
            snapshots_taken: AtomicU64::new(0),
            snapshots_released: AtomicU64::new(0),
            dropped_contributions: AtomicU64::new(0),
        }
    }

    /// Record a snapshot acquisition.
    #[inline]
    pub fn record_snapshot_taken(&self) {
        self.snapshots_taken.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a snapshot release.
    #[inline]
    pub fn record_snapshot_released(&self) {
        self.snapshots_released.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an object the walker could not attribute.
    #[inline]
    pub fn record_dropped_contribution(&self) {
        self.dropped_contributions.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the number of snapshots handed out.
    #[inline]
    pub fn snapshots_taken(&self) -> u64 {
        self.snapshots_taken.load(Ordering::Relaxed)
    }

    /// Get the number of snapshots returned.
    #[inline]
    pub fn snapshots_released(&self) -> u64 {
        self.snapshots_released.load(Ordering::Relaxed)
    }

    /// Get the number of dropped contributions.
    #[inline]
    pub fn dropped_contributions(&self) -> u64 {
        self.dropped_contributions.load(Ordering::Relaxed)
    }

    /// Reset all statistics.
    pub fn reset(&self) {
        self.snapshots_taken.store(0, Ordering::Relaxed);
        self.snapshots_released.store(0, Ordering::Relaxed);
        self.dropped_contributions.store(0, Ordering::Relaxed);
    }
}

impl Default for CoreStats {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CoreStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Snapshot Statistics:")?;
        writeln!(f, "  Taken:    {}", self.snapshots_taken())?;
        writeln!(f, "  Released: {}", self.snapshots_released())?;
        writeln!(f, "  Dropped:  {}", self.dropped_contributions())?;
        Ok(())
    }
}

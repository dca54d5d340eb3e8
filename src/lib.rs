//! Heapscope Snapshot Core
//!
//! The in-process data-collection core of a heap-usage profiler for a
//! garbage-collected host runtime. At each triggering event (GC cycle,
//! interval timer, explicit request) the host's object-graph walker feeds
//! every live object through this crate, producing a *snapshot*: per-class
//! live counts and byte totals, per-reference-edge breakdowns, and a
//! bit-exact file header for the downstream serializer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          ProfilerCore                               │
//! ├──────────────────┬───────────────────────────┬──────────────────────┤
//! │  ClassRegistry   │       ContainerPool       │      CoreStats       │
//! │  host-ptr index  │  idle SnapshotContainers  │   warn counters      │
//! │  durable records │  (bounded, lock-free)     │                      │
//! └──────────────────┴───────────────────────────┴──────────────────────┘
//!            │                     │
//!            ▼                     ▼
//!      ClassRecord         SnapshotContainer
//!      (stable identity)   ├── SnapshotHeader (timing, GC cause, sizes)
//!                          └── ClassCounter per class
//!                              ├── ObjectCounter (count, total_size)
//!                              └── ChildClassCounter per reference edge
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use heapscope::{ProfilerConfig, ProfilerCore, TriggerCause};
//!
//! let core = ProfilerCore::new(ProfilerConfig::default())?;
//!
//! // On each trigger:
//! let snapshot = core.acquire_snapshot();
//! snapshot.begin_fill();
//! snapshot.set_cause(TriggerCause::Gc);
//! // ... walker threads count objects ...
//! // ... serializer drains the container ...
//! core.release_snapshot(snapshot);
//! ```
//!
//! # Concurrency
//!
//! The counting fast path — registry lookup, class-counter lookup,
//! counter increment — is allocation-free and lock-free in the common
//! case, because it runs once per live object inside a stop-the-world
//! pause. Slow paths (first sighting of a class or edge) allocate and may
//! briefly spin. Each snapshot container is single-owner at any moment:
//! walker, serializer, or pool; ownership transitions are the only
//! synchronization boundaries between phases.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod counter;
pub mod pool;
pub mod registry;
pub mod snapshot;
pub mod stats;

mod spin;

// Re-exports for convenient access
pub use config::{ConfigError, ProfilerConfig};
pub use counter::ObjectCounter;
pub use pool::ContainerPool;
pub use registry::{ClassKind, ClassRecord, ClassRegistry, ClassTag, HostPtr, ProvisionalClass};
pub use snapshot::{
    ChildClassCounter, ClassCounter, FieldBlock, HeaderError, JvmInfo, OffsetTable,
    SnapshotContainer, SnapshotFlags, SnapshotHeader, TriggerCause,
};
pub use stats::CoreStats;

use std::sync::Arc;

// =============================================================================
// ProfilerCore
// =============================================================================

/// Context handle owning the process-wide pieces of the snapshot core.
///
/// Constructing the core is the global initialization step; dropping it
/// (or calling [`shutdown`](Self::shutdown)) finalizes everything. Tests
/// and embedders can hold several independent cores — nothing here is an
/// ambient global.
#[derive(Debug)]
pub struct ProfilerCore {
    config: ProfilerConfig,
    registry: ClassRegistry,
    pool: ContainerPool,
    stats: CoreStats,
}

impl ProfilerCore {
    /// Validate `config` and build the core.
    pub fn new(config: ProfilerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = ClassRegistry::with_capacity(config.initial_class_capacity);
        let pool = ContainerPool::new(&config);
        Ok(ProfilerCore {
            config,
            registry,
            pool,
            stats: CoreStats::new(),
        })
    }

    /// The configuration this core was built with.
    #[inline]
    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    /// The class registry.
    #[inline]
    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    /// The container pool.
    #[inline]
    pub fn pool(&self) -> &ContainerPool {
        &self.pool
    }

    /// The core's counters.
    #[inline]
    pub fn stats(&self) -> &CoreStats {
        &self.stats
    }

    /// Hand out a cleared snapshot container and advance the snapshot
    /// serial clock.
    ///
    /// The returned box is the snapshot handle: whoever holds it owns the
    /// container until it is passed on or released.
    pub fn acquire_snapshot(&self) -> Box<SnapshotContainer> {
        self.registry.advance_serial();
        self.stats.record_snapshot_taken();
        self.pool.acquire()
    }

    /// Return a drained (or abandoned) snapshot container to the pool.
    pub fn release_snapshot(&self, snapshot: Box<SnapshotContainer>) {
        self.stats.record_snapshot_released();
        self.pool.release(snapshot);
    }

    /// Convenience wrapper for [`ClassRegistry::intern`].
    pub fn intern_class(
        &self,
        host_ptr: HostPtr,
        provisional: ProvisionalClass,
    ) -> Arc<ClassRecord> {
        self.registry.intern(host_ptr, provisional)
    }

    /// Destroy all idle containers and consume the core.
    pub fn shutdown(self) {
        self.pool.drain();
    }

    /// Print a summary of core activity to stderr.
    pub fn print_summary(&self) {
        eprintln!("=== Snapshot Core Statistics ===");
        eprint!("{}", self.stats);
        eprintln!(
            "Pool: {} idle / {} capacity ({} hits, {} misses, {} destroyed)",
            self.pool.idle(),
            self.pool.capacity(),
            self.pool.hits(),
            self.pool.misses(),
            self.pool.destroyed()
        );
        eprintln!("Classes: {} indexed", self.registry.len());
    }
}

// =============================================================================
// Tests
// =============================================================================

//! Snapshot containers: one snapshot's worth of counters plus its header.
//!
//! A [`SnapshotContainer`] is single-owner at any moment — the walker
//! while it fills, the serializer while it drains, or the pool while it
//! idles — and those ownership transitions are the only synchronization
//! boundaries between phases. Within the fill phase any number of walker
//! threads update it concurrently through the lock-free lookup paths.
//!
//! # Data flow
//!
//! ```text
//! walker ──▶ find_class / push_class ──▶ ClassCounter ──▶ inc / add
//!    │                                        │
//!    │                                        └▶ find_child / push_child
//!    └──▶ set_time / set_cause / set_jvm_info (header)
//!
//! release ──▶ clear(false) ──▶ pool ──▶ acquire ──▶ reuse
//! ```

mod class_counter;
pub mod header;

pub use class_counter::{ChildClassCounter, ChildIter, ClassCounter, FieldBlock, OffsetTable};
pub use header::{
    HeaderError, JvmInfo, SnapshotFlags, SnapshotHeader, TriggerCause, GC_CAUSE_BUFFER,
    HEADER_BYTES,
};

use crate::registry::{ClassRecord, ClassTag, HostPtr};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type FxBuildHasher = BuildHasherDefault<FxHasher>;

/// Default pre-sizing of the class map.
const DEFAULT_CLASS_CAPACITY: usize = 1024;

// =============================================================================
// SnapshotContainer
// =============================================================================

/// One snapshot's counters and header.
pub struct SnapshotContainer {
    /// Header; the lock lets a progress reporter read while the driver
    /// writes.
    header: RwLock<SnapshotHeader>,
    /// Class-tag → counter map. Values are boxed so counter addresses
    /// stay stable for the container's whole lifetime.
    class_map: DashMap<ClassTag, Box<ClassCounter>, FxBuildHasher>,
    cleared: AtomicBool,
}

impl SnapshotContainer {
    /// Create an empty, cleared container.
    pub fn new(collect_reference_tree: bool) -> Self {
        Self::with_capacity(collect_reference_tree, DEFAULT_CLASS_CAPACITY)
    }

    /// Create an empty, cleared container pre-sized for `class_capacity`
    /// classes.
    pub fn with_capacity(collect_reference_tree: bool, class_capacity: usize) -> Self {
        let magic = if collect_reference_tree {
            SnapshotFlags::FORMAT_2_0 | SnapshotFlags::REF_TREE
        } else {
            SnapshotFlags::FORMAT_2_0
        };
        SnapshotContainer {
            header: RwLock::new(SnapshotHeader::new(magic)),
            class_map: DashMap::with_capacity_and_hasher(
                class_capacity,
                FxBuildHasher::default(),
            ),
            cleared: AtomicBool::new(true),
        }
    }

    // =========================================================================
    // Header
    // =========================================================================

    /// Stamp the snapshot time (milliseconds since the host epoch).
    pub fn set_time(&self, millis: i64) {
        self.header.write().snapshot_time = millis;
    }

    /// Stamp what triggered this snapshot.
    pub fn set_cause(&self, cause: TriggerCause) {
        self.header.write().cause = cause;
    }

    /// Stamp the total heap size.
    ///
    /// Separate from [`set_jvm_info`](Self::set_jvm_info): the host's
    /// total-memory query may itself trigger a GC, so the driver issues
    /// it outside any GC-entry context.
    pub fn set_total_heap(&self, bytes: i64) {
        self.header.write().total_heap_size = bytes;
    }

    /// Copy the host runtime's GC and heap metrics into the header.
    pub fn set_jvm_info(&self, info: &JvmInfo) {
        self.header.write().apply_jvm_info(info);
    }

    /// Read a consistent copy of the header.
    pub fn header(&self) -> SnapshotHeader {
        self.header.read().clone()
    }

    /// Encode the header's packed on-disk form.
    pub fn encode_header(&self) -> [u8; HEADER_BYTES] {
        self.header.read().encode()
    }

    // =========================================================================
    // Class counters
    // =========================================================================

    /// Look up the counter for a class.
    ///
    /// Lock-free in the uncontended case; returns `None` if the class has
    /// not been pushed into this container.
    pub fn find_class(&self, record: &ClassRecord) -> Option<&ClassCounter> {
        self.class_map.get(&record.tag()).map(|entry| {
            let counter = entry.value().as_ref() as *const ClassCounter;
            // SAFETY: the box is never dropped or moved while the
            // container lives; `clear` keeps the shells.
            unsafe { &*counter }
        })
    }

    /// Insert a counter for a class seen for the first time this
    /// snapshot, or return the existing one if another thread won the
    /// race.
    pub fn push_class(&self, record: &Arc<ClassRecord>) -> &ClassCounter {
        self.cleared.store(false, Ordering::Release);
        let counter = match self.class_map.entry(record.tag()) {
            Entry::Occupied(entry) => entry.get().as_ref() as *const ClassCounter,
            Entry::Vacant(entry) => {
                self.header.write().entry_count += 1;
                let slot = entry.insert(Box::new(ClassCounter::new(Arc::clone(record))));
                slot.value().as_ref() as *const ClassCounter
            }
        };
        // SAFETY: as in `find_class`.
        unsafe { &*counter }
    }

    /// Look up the edge counter for `child` under `parent`.
    pub fn find_child<'a>(
        &self,
        parent: &'a ClassCounter,
        child: HostPtr,
    ) -> Option<&'a ChildClassCounter> {
        parent.find_child(child)
    }

    /// Append an edge counter for a child class first seen under
    /// `parent` this snapshot.
    pub fn push_child<'a>(
        &self,
        parent: &'a ClassCounter,
        record: &Arc<ClassRecord>,
    ) -> &'a ChildClassCounter {
        parent.push_child(Arc::clone(record))
    }

    /// Number of classes in this container.
    pub fn class_count(&self) -> usize {
        self.class_map.len()
    }

    /// Visit every class counter (serializer drain path; call only after
    /// the walker's join barrier).
    pub fn for_each_class(&self, mut f: impl FnMut(&ClassCounter)) {
        for entry in self.class_map.iter() {
            f(entry.value().as_ref());
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Mark the container in use before the walker starts filling it.
    ///
    /// Counting into recycled counter shells does not pass through
    /// [`push_class`](Self::push_class), so the driver flags the
    /// container dirty up front; otherwise a later non-forced clear
    /// could skip it.
    pub fn begin_fill(&self) {
        self.cleared.store(false, Ordering::Release);
    }

    /// Whether every counter in this container reads zero.
    pub fn is_cleared(&self) -> bool {
        self.cleared.load(Ordering::Acquire)
    }

    /// Zero all counters and release the offset caches.
    ///
    /// A non-forced clear of an already-cleared container is a no-op.
    /// The class map keeps its keys and counter shells so the next
    /// snapshot can reuse the shape.
    pub fn clear(&self, force: bool) {
        if !force && self.is_cleared() {
            return;
        }
        for entry in self.class_map.iter() {
            entry.value().clear();
        }
        self.cleared.store(true, Ordering::Release);
    }

    /// Print a GC statistics summary to stderr.
    pub fn print_gc_info(&self) {
        let header = self.header();
        eprintln!("=== GC Statistics ===");
        if header.cause == TriggerCause::Gc {
            eprintln!(
                "GC cause: {}, worktime: {} ms",
                String::from_utf8_lossy(header.gc_cause()),
                header.gc_work_time
            );
        }
        eprintln!(
            "GC count: {} full / {} young",
            header.full_gc_count, header.young_gc_count
        );
        eprintln!(
            "Area using size: new {} bytes / old {} bytes / total {} bytes",
            header.new_area_size, header.old_area_size, header.total_heap_size
        );
        eprintln!(
            "Metaspace usage: {} bytes, capacity: {} bytes",
            header.metaspace_usage, header.metaspace_capacity
        );
    }
}

impl std::fmt::Debug for SnapshotContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotContainer")
            .field("classes", &self.class_count())
            .field("cleared", &self.is_cleared())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

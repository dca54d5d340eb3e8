//! Durable class identities and the host-pointer index.
//!
//! The host runtime identifies a class by an internal pointer that can be
//! relocated by its collector and invalidated by class unloading. The
//! registry gives every class a durable [`ClassRecord`] whose address and
//! [`ClassTag`] are stable for the record's whole lifetime; only the
//! pointer→record index is rewritten when the host moves a class.
//!
//! # Concurrency
//!
//! - `find` / `intern` run concurrently from any number of walker threads.
//! - `mark_unloaded` runs from the host's class-unload callback.
//! - `relocate` may only be called on a single-threaded safepoint, with no
//!   concurrent readers of the old pointer in flight.
//! - `purge_unloaded_before` runs from the serializer's housekeeping
//!   thread once the snapshot that observed an unload has been written.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use std::borrow::Cow;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

type FxBuildHasher = BuildHasherDefault<FxHasher>;

// =============================================================================
// Identities
// =============================================================================

/// Raw class-pointer value handed to us by the host runtime.
///
/// Only ever compared and hashed; never dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostPtr(pub usize);

/// Durable class identity, assigned once at intern time.
///
/// Tags are monotonic and survive host-pointer relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassTag(pub u64);

/// Broad classification of a host class.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    /// Ordinary instance class with a fixed field layout.
    Instance = 0,
    /// Array whose elements are references.
    ObjectArray = 1,
    /// Array of primitive elements.
    PrimitiveArray = 2,
    /// Anything else the host reports (hidden classes, lambdas, ...).
    Other = 3,
}

// =============================================================================
// ClassRecord
// =============================================================================

/// Fields the walker gathers before interning a class it has not seen.
///
/// If another thread interns the same pointer first, these fields are
/// simply dropped and the winner's record is returned.
#[derive(Debug, Clone)]
pub struct ProvisionalClass {
    /// Class name bytes as reported by the host.
    pub name: Vec<u8>,
    /// Instance id of the defining loader.
    pub loader_id: i64,
    /// Class tag of the defining loader's class.
    pub loader_tag: i64,
    /// Per-instance size for fixed-layout classes, 0 otherwise.
    pub instance_size: i64,
    /// Classification of the class.
    pub kind: ClassKind,
}

/// Durable description of one host class.
///
/// The record's address never changes after intern; mutable state is
/// limited to the unload flag, the last-known host pointer, and the
/// last-recorded total size, all updated at safepoints.
#[derive(Debug)]
pub struct ClassRecord {
    tag: ClassTag,
    name: Box<[u8]>,
    loader_id: i64,
    loader_tag: i64,
    instance_size: i64,
    kind: ClassKind,
    unloaded: AtomicBool,
    host_ptr: AtomicUsize,
    last_total_size: AtomicI64,
}

impl ClassRecord {
    fn new(tag: ClassTag, host_ptr: HostPtr, provisional: ProvisionalClass) -> Self {
        ClassRecord {
            tag,
            name: provisional.name.into_boxed_slice(),
            loader_id: provisional.loader_id,
            loader_tag: provisional.loader_tag,
            instance_size: provisional.instance_size,
            kind: provisional.kind,
            unloaded: AtomicBool::new(false),
            host_ptr: AtomicUsize::new(host_ptr.0),
            last_total_size: AtomicI64::new(0),
        }
    }

    /// Durable tag of this class.
    #[inline]
    pub fn tag(&self) -> ClassTag {
        self.tag
    }

    /// Class name bytes.
    #[inline]
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// Class name for display.
    pub fn name_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }

    /// Instance id of the defining loader.
    #[inline]
    pub fn loader_id(&self) -> i64 {
        self.loader_id
    }

    /// Class tag of the defining loader's class.
    #[inline]
    pub fn loader_tag(&self) -> i64 {
        self.loader_tag
    }

    /// Per-instance size for fixed-layout classes.
    #[inline]
    pub fn instance_size(&self) -> i64 {
        self.instance_size
    }

    /// Classification of the class.
    #[inline]
    pub fn kind(&self) -> ClassKind {
        self.kind
    }

    /// Whether the host has unloaded this class.
    #[inline]
    pub fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::Acquire)
    }

    /// Last-known host pointer for this class.
    #[inline]
    pub fn host_ptr(&self) -> HostPtr {
        HostPtr(self.host_ptr.load(Ordering::Relaxed))
    }

    /// Total size recorded by the most recent serialized snapshot.
    #[inline]
    pub fn last_total_size(&self) -> i64 {
        self.last_total_size.load(Ordering::Relaxed)
    }

    /// Record this snapshot's total size and return the previous one.
    ///
    /// The downstream ranking stage derives its per-class delta from the
    /// returned value.
    #[inline]
    pub fn swap_total_size(&self, total: i64) -> i64 {
        self.last_total_size.swap(total, Ordering::Relaxed)
    }
}

// =============================================================================
// ClassRegistry
// =============================================================================

/// Process-wide host-pointer → [`ClassRecord`] index.
///
/// Keyed by raw pointer value with a mix-then-mask hasher; the record
/// bodies are shared out as `Arc`s so snapshots can outlive an unload.
pub struct ClassRegistry {
    index: DashMap<HostPtr, Arc<ClassRecord>, FxBuildHasher>,
    next_tag: AtomicU64,
    serial: AtomicU64,
    /// Records whose unload has been observed, stamped with the snapshot
    /// serial current at observation time.
    pending_unload: Mutex<Vec<(u64, Arc<ClassRecord>)>>,
}

impl ClassRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create an empty registry pre-sized for `capacity` classes.
    pub fn with_capacity(capacity: usize) -> Self {
        ClassRegistry {
            index: DashMap::with_capacity_and_hasher(capacity, FxBuildHasher::default()),
            next_tag: AtomicU64::new(1),
            serial: AtomicU64::new(0),
            pending_unload: Mutex::new(Vec::new()),
        }
    }

    /// Look up the record for a host pointer.
    ///
    /// Returns `None` for pointers never interned or already relocated
    /// away; the walker re-interns rather than retrying.
    #[inline]
    pub fn find(&self, host_ptr: HostPtr) -> Option<Arc<ClassRecord>> {
        self.index.get(&host_ptr).map(|r| Arc::clone(r.value()))
    }

    /// Install a record for `host_ptr`, or return the existing one.
    ///
    /// Racing installers of the same pointer converge on a single record;
    /// the losers' provisional fields are dropped.
    pub fn intern(&self, host_ptr: HostPtr, provisional: ProvisionalClass) -> Arc<ClassRecord> {
        match self.index.entry(host_ptr) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let tag = ClassTag(self.next_tag.fetch_add(1, Ordering::Relaxed));
                let record = Arc::new(ClassRecord::new(tag, host_ptr, provisional));
                entry.insert(Arc::clone(&record));
                record
            }
        }
    }

    /// Flag a record as unloaded and queue it for purging.
    ///
    /// The record itself is retained: the snapshot currently being filled
    /// still references it, and the serializer must be able to emit its
    /// name.
    pub fn mark_unloaded(&self, record: &Arc<ClassRecord>) {
        record.unloaded.store(true, Ordering::Release);
        let serial = self.serial.load(Ordering::Acquire);
        self.pending_unload.lock().push((serial, Arc::clone(record)));
    }

    /// Rewrite the index after the host relocated a class pointer.
    ///
    /// The record keeps its tag and address; only the index cell moves.
    /// May only be called on a single-threaded safepoint with no
    /// concurrent readers of `old` in flight.
    pub fn relocate(&self, old: HostPtr, new: HostPtr) {
        if let Some((_, record)) = self.index.remove(&old) {
            record.host_ptr.store(new.0, Ordering::Relaxed);
            self.index.insert(new, record);
        }
    }

    /// Drop records whose unload was observed strictly before `serial`.
    ///
    /// Index entries are removed only if they still map to the purged
    /// record (the pointer may have been reused by a newly loaded class).
    /// Returns the number of records purged.
    pub fn purge_unloaded_before(&self, serial: u64) -> usize {
        let mut pending = self.pending_unload.lock();
        let mut purged = 0;
        pending.retain(|(unload_serial, record)| {
            if *unload_serial < serial {
                self.index
                    .remove_if(&record.host_ptr(), |_, current| Arc::ptr_eq(current, record));
                purged += 1;
                false
            } else {
                true
            }
        });
        purged
    }

    /// Advance the snapshot serial clock and return the new serial.
    ///
    /// Called once per snapshot acquisition; `mark_unloaded` stamps its
    /// entries with the serial current at observation time.
    pub fn advance_serial(&self) -> u64 {
        self.serial.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Get the current snapshot serial.
    #[inline]
    pub fn current_serial(&self) -> u64 {
        self.serial.load(Ordering::Acquire)
    }

    /// Number of classes currently indexed.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassRegistry")
            .field("classes", &self.index.len())
            .field("serial", &self.current_serial())
            .field("pending_unload", &self.pending_unload.lock().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn provisional(name: &str) -> ProvisionalClass {
        ProvisionalClass {
            name: name.as_bytes().to_vec(),
            loader_id: 1,
            loader_tag: 2,
            instance_size: 24,
            kind: ClassKind::Instance,
        }
    }

    #[test]
    fn test_intern_then_find() {
        let registry = ClassRegistry::new();
        let record = registry.intern(HostPtr(0x1000), provisional("com/example/K"));

        assert_eq!(record.tag(), ClassTag(1));
        assert_eq!(record.name(), b"com/example/K");
        assert_eq!(record.instance_size(), 24);
        assert!(!record.is_unloaded());

        let found = registry.find(HostPtr(0x1000)).unwrap();
        assert!(Arc::ptr_eq(&record, &found));
    }

    #[test]
    fn test_find_unknown_pointer() {
        let registry = ClassRegistry::new();
        assert!(registry.find(HostPtr(0xdead)).is_none());
    }

    #[test]
    fn test_intern_existing_returns_winner() {
        let registry = ClassRegistry::new();
        let first = registry.intern(HostPtr(0x1000), provisional("K"));
        let second = registry.intern(HostPtr(0x1000), provisional("K"));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_tags_are_monotonic() {
        let registry = ClassRegistry::new();
        let a = registry.intern(HostPtr(0x1000), provisional("A"));
        let b = registry.intern(HostPtr(0x2000), provisional("B"));
        assert!(a.tag() < b.tag());
    }

    #[test]
    fn test_concurrent_intern_converges() {
        let registry = ClassRegistry::new();

        let tags: Vec<ClassTag> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        let record = registry.intern(HostPtr(0x1000), provisional("K"));
                        record.tag()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(registry.len(), 1);
        assert!(tags.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_unload_and_relocate() {
        let registry = ClassRegistry::new();
        let record = registry.intern(HostPtr(0x1000), provisional("K"));

        registry.mark_unloaded(&record);
        registry.relocate(HostPtr(0x1000), HostPtr(0x2000));

        let moved = registry.find(HostPtr(0x2000)).unwrap();
        assert!(Arc::ptr_eq(&record, &moved));
        assert!(registry.find(HostPtr(0x1000)).is_none());
        assert!(moved.is_unloaded());
        assert_eq!(moved.host_ptr(), HostPtr(0x2000));
        assert_eq!(moved.tag(), record.tag());
    }

    #[test]
    fn test_relocate_unknown_is_noop() {
        let registry = ClassRegistry::new();
        registry.relocate(HostPtr(0x1000), HostPtr(0x2000));
        assert!(registry.find(HostPtr(0x2000)).is_none());
    }

    #[test]
    fn test_purge_respects_serial() {
        let registry = ClassRegistry::new();
        let record = registry.intern(HostPtr(0x1000), provisional("K"));

        let serial = registry.advance_serial();
        registry.mark_unloaded(&record);

        // The snapshot that observed the unload has not been serialized.
        assert_eq!(registry.purge_unloaded_before(serial), 0);
        assert!(registry.find(HostPtr(0x1000)).is_some());

        // After that snapshot is done, the record goes away.
        assert_eq!(registry.purge_unloaded_before(serial + 1), 1);
        assert!(registry.find(HostPtr(0x1000)).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_purge_spares_reused_pointer() {
        let registry = ClassRegistry::new();
        let old = registry.intern(HostPtr(0x1000), provisional("Old"));

        registry.advance_serial();
        registry.mark_unloaded(&old);

        // The host moves the dying class and reuses its old pointer for a
        // freshly loaded one before the purge runs.
        registry.relocate(HostPtr(0x1000), HostPtr(0x2000));
        let replacement = registry.intern(HostPtr(0x1000), provisional("New"));

        assert_eq!(registry.purge_unloaded_before(registry.current_serial() + 1), 1);
        assert!(registry.find(HostPtr(0x2000)).is_none());

        let survivor = registry.find(HostPtr(0x1000)).unwrap();
        assert!(Arc::ptr_eq(&survivor, &replacement));
        assert_ne!(replacement.tag(), old.tag());
    }

    #[test]
    fn test_swap_total_size_returns_previous() {
        let registry = ClassRegistry::new();
        let record = registry.intern(HostPtr(0x1000), provisional("K"));

        assert_eq!(record.swap_total_size(4096), 0);
        assert_eq!(record.swap_total_size(8192), 4096);
        assert_eq!(record.last_total_size(), 8192);
    }
}

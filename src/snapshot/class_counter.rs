//! Per-class counters and the intrusive child-edge list.
//!
//! A [`ClassCounter`] owns the root [`ObjectCounter`] for one class within
//! one snapshot, plus a singly-linked intrusive list of
//! [`ChildClassCounter`]s, one per outgoing reference edge seen so far.
//! Edge fan-out is small in practice (usually under eight children per
//! parent), so a linear scan with single-step frequency promotion beats
//! any balanced structure, and the intrusive list keeps it at one
//! allocation per edge.
//!
//! # Concurrency
//!
//! List appends are serialized by the per-counter spin lock. Lookups and
//! the promotion swap run without it: walker threads partition objects so
//! that at most one thread traverses a given parent's child list at a
//! time. All list pointers are atomics, so a violated partition can
//! scramble list order but never memory safety.

use crate::counter::ObjectCounter;
use crate::registry::{ClassRecord, HostPtr};
use crate::spin::SpinLock;
use smallvec::SmallVec;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::Arc;

// =============================================================================
// Reference-field offsets
// =============================================================================

/// One contiguous run of reference fields inside an instance layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldBlock {
    /// Byte offset of the first reference field in the run.
    pub offset: u32,
    /// Number of consecutive reference fields.
    pub count: u32,
}

/// Cached reference-field layout for one class.
///
/// Re-derived once per snapshot so class redefinition between snapshots
/// is tolerated.
pub type OffsetTable = SmallVec<[FieldBlock; 8]>;

// =============================================================================
// ChildClassCounter
// =============================================================================

/// Counter for one `(parent class, child class)` reference edge.
pub struct ChildClassCounter {
    counter: ObjectCounter,
    record: Arc<ClassRecord>,
    next: AtomicPtr<ChildClassCounter>,
    call_count: AtomicU32,
}

impl ChildClassCounter {
    fn new(record: Arc<ClassRecord>) -> Self {
        ChildClassCounter {
            counter: ObjectCounter::new(),
            record,
            next: AtomicPtr::new(ptr::null_mut()),
            call_count: AtomicU32::new(0),
        }
    }

    /// The edge's counter.
    #[inline]
    pub fn counter(&self) -> &ObjectCounter {
        &self.counter
    }

    /// Record of the child class.
    #[inline]
    pub fn record(&self) -> &Arc<ClassRecord> {
        &self.record
    }

    /// How many times `find_child` has hit this edge.
    #[inline]
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ChildClassCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildClassCounter")
            .field("class", &self.record.name_lossy())
            .field("counter", &self.counter)
            .field("call_count", &self.call_count())
            .finish()
    }
}

// =============================================================================
// ClassCounter
// =============================================================================

/// Counters for one class within one snapshot.
pub struct ClassCounter {
    counter: ObjectCounter,
    child_head: AtomicPtr<ChildClassCounter>,
    lock: SpinLock,
    /// Cached reference-field layout; null until derived this snapshot.
    offsets: AtomicPtr<OffsetTable>,
    record: Arc<ClassRecord>,
}

impl ClassCounter {
    /// Create an empty counter for `record`.
    pub fn new(record: Arc<ClassRecord>) -> Self {
        ClassCounter {
            counter: ObjectCounter::new(),
            child_head: AtomicPtr::new(ptr::null_mut()),
            lock: SpinLock::new(),
            offsets: AtomicPtr::new(ptr::null_mut()),
            record,
        }
    }

    /// The class's root counter.
    #[inline]
    pub fn counter(&self) -> &ObjectCounter {
        &self.counter
    }

    /// Record of the counted class.
    #[inline]
    pub fn record(&self) -> &Arc<ClassRecord> {
        &self.record
    }

    // =========================================================================
    // Child list
    // =========================================================================

    /// Find the edge counter for the child class at `host_ptr`.
    ///
    /// On a hit the edge's call count is incremented and, if the
    /// immediately preceding sibling is no more frequent, the hit is
    /// swapped one step toward the head. The walker sees heavy locality
    /// (a parent overwhelmingly points at one or two child classes), so
    /// this single-step promotion bounds the average probe length without
    /// reorganizing the list.
    ///
    /// The promotion runs without the spin lock; callers must honor the
    /// partitioning contract described in the module docs.
    pub fn find_child(&self, host_ptr: HostPtr) -> Option<&ChildClassCounter> {
        let mut more_prev: *mut ChildClassCounter = ptr::null_mut();
        let mut prev: *mut ChildClassCounter = ptr::null_mut();
        let mut cur = self.child_head.load(Ordering::Acquire);

        loop {
            if cur.is_null() {
                return None;
            }
            // SAFETY: nodes are freed only when this counter drops.
            let node = unsafe { &*cur };
            if node.record.host_ptr() == host_ptr {
                break;
            }
            more_prev = prev;
            prev = cur;
            cur = node.next.load(Ordering::Acquire);
        }

        // SAFETY: as above.
        let hit = unsafe { &*cur };
        let calls = hit.call_count.fetch_add(1, Ordering::Relaxed) + 1;

        if !prev.is_null() {
            // SAFETY: `prev` was reached through the list this thread owns
            // under the partitioning contract.
            let prev_node = unsafe { &*prev };
            if prev_node.call_count.load(Ordering::Relaxed) <= calls {
                prev_node
                    .next
                    .store(hit.next.load(Ordering::Relaxed), Ordering::Relaxed);
                if more_prev.is_null() {
                    self.child_head.store(cur, Ordering::Relaxed);
                } else {
                    // SAFETY: as for `prev`.
                    unsafe { &*more_prev }.next.store(cur, Ordering::Relaxed);
                }
                hit.next.store(prev, Ordering::Release);
            }
        }

        Some(hit)
    }

    /// Append an edge counter for a child class seen for the first time
    /// this snapshot.
    pub fn push_child(&self, record: Arc<ClassRecord>) -> &ChildClassCounter {
        let node = Box::into_raw(Box::new(ChildClassCounter::new(record)));

        let _guard = self.lock.lock();
        let head = self.child_head.load(Ordering::Relaxed);
        if head.is_null() {
            self.child_head.store(node, Ordering::Release);
        } else {
            let mut cur = head;
            loop {
                // SAFETY: nodes are freed only when this counter drops.
                let next = unsafe { &*cur }.next.load(Ordering::Relaxed);
                if next.is_null() {
                    break;
                }
                cur = next;
            }
            // SAFETY: as above.
            unsafe { &*cur }.next.store(node, Ordering::Release);
        }
        drop(_guard);

        // SAFETY: the node was just leaked and lives until drop.
        unsafe { &*node }
    }

    /// Iterate the child list in its current order.
    pub fn children(&self) -> ChildIter<'_> {
        ChildIter {
            cur: self.child_head.load(Ordering::Acquire),
            _marker: PhantomData,
        }
    }

    /// Number of child edges.
    pub fn child_count(&self) -> usize {
        self.children().count()
    }

    // =========================================================================
    // Offset cache
    // =========================================================================

    /// Cached reference-field layout, if derived this snapshot.
    #[inline]
    pub fn offsets(&self) -> Option<&OffsetTable> {
        let table = self.offsets.load(Ordering::Acquire);
        if table.is_null() {
            None
        } else {
            // SAFETY: the table is freed only in exclusive phases.
            Some(unsafe { &*table })
        }
    }

    /// Publish a freshly derived offset table.
    ///
    /// The first publisher wins; a racing loser's table is dropped and
    /// the winner's returned.
    pub fn set_offsets(&self, table: OffsetTable) -> &OffsetTable {
        let fresh = Box::into_raw(Box::new(table));
        match self.offsets.compare_exchange(
            ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            // SAFETY: just leaked, freed only in exclusive phases.
            Ok(_) => unsafe { &*fresh },
            Err(winner) => {
                // SAFETY: `fresh` never became visible to anyone else.
                unsafe { drop(Box::from_raw(fresh)) };
                // SAFETY: the winner is freed only in exclusive phases.
                unsafe { &*winner }
            }
        }
    }

    fn clear_offsets(&self) {
        let table = self.offsets.swap(ptr::null_mut(), Ordering::AcqRel);
        if !table.is_null() {
            // SAFETY: exclusive phase; no readers in flight.
            unsafe { drop(Box::from_raw(table)) };
        }
    }

    // =========================================================================
    // Clearing
    // =========================================================================

    /// Zero the root counter and every child counter, release the offset
    /// cache, and keep the list shells for the next snapshot.
    pub(crate) fn clear(&self) {
        self.clear_offsets();

        let mut cur = self.child_head.load(Ordering::Acquire);
        while !cur.is_null() {
            // SAFETY: nodes are freed only when this counter drops.
            let node = unsafe { &*cur };
            node.counter.clear();
            cur = node.next.load(Ordering::Acquire);
        }

        self.counter.clear();
    }
}

impl Drop for ClassCounter {
    fn drop(&mut self) {
        self.clear_offsets();

        let mut cur = self.child_head.swap(ptr::null_mut(), Ordering::Relaxed);
        while !cur.is_null() {
            // SAFETY: nodes were leaked by `push_child` and are reachable
            // exactly once from the list.
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next.load(Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for ClassCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassCounter")
            .field("class", &self.record.name_lossy())
            .field("counter", &self.counter)
            .field("children", &self.child_count())
            .finish()
    }
}

/// Iterator over a [`ClassCounter`]'s child list.
pub struct ChildIter<'a> {
    cur: *mut ChildClassCounter,
    _marker: PhantomData<&'a ClassCounter>,
}

impl<'a> Iterator for ChildIter<'a> {
    type Item = &'a ChildClassCounter;

    fn next(&mut self) -> Option<&'a ChildClassCounter> {
        if self.cur.is_null() {
            return None;
        }
        // SAFETY: nodes live as long as the borrowed counter.
        let node = unsafe { &*self.cur };
        self.cur = node.next.load(Ordering::Acquire);
        Some(node)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ClassKind, ClassRegistry, ProvisionalClass};
    use smallvec::smallvec;

    fn record(registry: &ClassRegistry, ptr: usize, name: &str) -> Arc<ClassRecord> {
        registry.intern(
            HostPtr(ptr),
            ProvisionalClass {
                name: name.as_bytes().to_vec(),
                loader_id: 0,
                loader_tag: 0,
                instance_size: 16,
                kind: ClassKind::Instance,
            },
        )
    }

    fn child_names(counter: &ClassCounter) -> Vec<String> {
        counter
            .children()
            .map(|c| c.record().name_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_push_child_appends_in_order() {
        let registry = ClassRegistry::new();
        let parent = ClassCounter::new(record(&registry, 0x100, "P"));

        parent.push_child(record(&registry, 0x200, "C1"));
        parent.push_child(record(&registry, 0x300, "C2"));
        parent.push_child(record(&registry, 0x400, "C3"));

        assert_eq!(child_names(&parent), ["C1", "C2", "C3"]);
        assert_eq!(parent.child_count(), 3);
    }

    #[test]
    fn test_find_child_miss() {
        let registry = ClassRegistry::new();
        let parent = ClassCounter::new(record(&registry, 0x100, "P"));
        assert!(parent.find_child(HostPtr(0x200)).is_none());

        parent.push_child(record(&registry, 0x200, "C1"));
        assert!(parent.find_child(HostPtr(0x999)).is_none());
    }

    #[test]
    fn test_find_child_hit_counts_calls() {
        let registry = ClassRegistry::new();
        let parent = ClassCounter::new(record(&registry, 0x100, "P"));
        parent.push_child(record(&registry, 0x200, "C1"));

        let hit = parent.find_child(HostPtr(0x200)).unwrap();
        assert_eq!(hit.call_count(), 1);
        let hit = parent.find_child(HostPtr(0x200)).unwrap();
        assert_eq!(hit.call_count(), 2);
    }

    #[test]
    fn test_lfu_promotion_bubbles_hot_child() {
        let registry = ClassRegistry::new();
        let parent = ClassCounter::new(record(&registry, 0x100, "P"));
        parent.push_child(record(&registry, 0x200, "C1"));
        parent.push_child(record(&registry, 0x300, "C2"));
        parent.push_child(record(&registry, 0x400, "C3"));

        for _ in 0..5 {
            parent.find_child(HostPtr(0x400)).unwrap();
        }

        // C3 bubbled past C2, then C1, then stayed at the head.
        assert_eq!(child_names(&parent), ["C3", "C1", "C2"]);
    }

    #[test]
    fn test_promotion_preserves_node_set() {
        let registry = ClassRegistry::new();
        let parent = ClassCounter::new(record(&registry, 0x100, "P"));
        let ptrs = [0x200usize, 0x300, 0x400, 0x500, 0x600];
        for (i, &p) in ptrs.iter().enumerate() {
            parent.push_child(record(&registry, p, &format!("C{}", i)));
        }

        let mut before: Vec<*const ChildClassCounter> = parent
            .children()
            .map(|c| c as *const ChildClassCounter)
            .collect();
        before.sort();

        // Shuffle hard: hit every child with different frequencies.
        for (i, &p) in ptrs.iter().enumerate() {
            for _ in 0..=i {
                parent.find_child(HostPtr(p)).unwrap();
            }
        }
        for &p in ptrs.iter().rev() {
            parent.find_child(HostPtr(p)).unwrap();
        }

        let mut after: Vec<*const ChildClassCounter> = parent
            .children()
            .map(|c| c as *const ChildClassCounter)
            .collect();
        after.sort();

        assert_eq!(before, after);
    }

    #[test]
    fn test_clear_zeroes_counters_and_keeps_shells() {
        let registry = ClassRegistry::new();
        let parent = ClassCounter::new(record(&registry, 0x100, "P"));
        let child = parent.push_child(record(&registry, 0x200, "C1"));

        parent.counter().inc(24);
        child.counter().inc(8);
        parent.set_offsets(smallvec![FieldBlock {
            offset: 16,
            count: 2
        }]);

        parent.clear();

        assert!(parent.counter().is_zero());
        assert!(parent.offsets().is_none());
        assert_eq!(parent.child_count(), 1);
        let child = parent.find_child(HostPtr(0x200)).unwrap();
        assert!(child.counter().is_zero());
    }

    #[test]
    fn test_offsets_first_publisher_wins() {
        let registry = ClassRegistry::new();
        let parent = ClassCounter::new(record(&registry, 0x100, "P"));

        let first = parent.set_offsets(smallvec![FieldBlock {
            offset: 8,
            count: 1
        }]);
        assert_eq!(first.len(), 1);

        let second = parent.set_offsets(smallvec![
            FieldBlock {
                offset: 8,
                count: 1
            },
            FieldBlock {
                offset: 32,
                count: 4
            },
        ]);
        // The loser's table was dropped; the winner is unchanged.
        assert_eq!(second.len(), 1);
        assert_eq!(parent.offsets().unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_push_child_keeps_all_nodes() {
        let registry = ClassRegistry::new();
        let parent = ClassCounter::new(record(&registry, 0x100, "P"));

        std::thread::scope(|s| {
            for t in 0..4usize {
                let registry = &registry;
                let parent = &parent;
                s.spawn(move || {
                    for i in 0..16usize {
                        let ptr = 0x1000 + t * 0x100 + i;
                        parent.push_child(record(registry, ptr, &format!("C{}_{}", t, i)));
                    }
                });
            }
        });

        assert_eq!(parent.child_count(), 64);
    }
}

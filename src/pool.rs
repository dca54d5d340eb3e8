//! Recycling pool for idle snapshot containers.
//!
//! Containers are expensive to rebuild (a class map that has converged on
//! the host's live-class set, plus every counter shell), so completed
//! snapshots are cleared and parked here instead of freed. The pool is
//! bounded to cap idle memory; overflow containers are simply destroyed
//! and a pool miss allocates fresh.

use crate::config::ProfilerConfig;
use crate::snapshot::SnapshotContainer;
use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bounded lock-free pool of cleared [`SnapshotContainer`]s.
pub struct ContainerPool {
    stock: ArrayQueue<Box<SnapshotContainer>>,
    collect_reference_tree: bool,
    class_capacity: usize,
    /// Acquisitions served from stock.
    hits: AtomicU64,
    /// Acquisitions that had to allocate.
    misses: AtomicU64,
    /// Containers destroyed because the stock was full.
    destroyed: AtomicU64,
}

impl ContainerPool {
    /// Default number of idle containers kept.
    pub const DEFAULT_CAPACITY: usize = 2;

    /// Create an empty pool sized and shaped by `config`.
    pub fn new(config: &ProfilerConfig) -> Self {
        ContainerPool {
            stock: ArrayQueue::new(config.pool_capacity.max(1)),
            collect_reference_tree: config.collect_reference_tree,
            class_capacity: config.initial_class_capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
        }
    }

    /// Take a cleared container, reusing an idle one when available.
    pub fn acquire(&self) -> Box<SnapshotContainer> {
        match self.stock.pop() {
            Some(container) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                container
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Box::new(SnapshotContainer::with_capacity(
                    self.collect_reference_tree,
                    self.class_capacity,
                ))
            }
        }
    }

    /// Return a container to the pool.
    ///
    /// The container is cleared (non-forced) first; if the stock is full
    /// it is destroyed instead.
    pub fn release(&self, container: Box<SnapshotContainer>) {
        container.clear(false);
        if self.stock.push(container).is_err() {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Destroy every idle container, returning how many there were.
    ///
    /// Part of shutdown; the caller must be the last user of the pool.
    pub fn drain(&self) -> usize {
        let mut drained = 0;
        while self.stock.pop().is_some() {
            drained += 1;
        }
        drained
    }

    /// Number of idle containers.
    pub fn idle(&self) -> usize {
        self.stock.len()
    }

    /// Maximum number of idle containers.
    pub fn capacity(&self) -> usize {
        self.stock.capacity()
    }

    /// Get acquisitions served from stock.
    #[inline]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get acquisitions that allocated fresh.
    #[inline]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get containers destroyed on release.
    #[inline]
    pub fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ContainerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerPool")
            .field("idle", &self.idle())
            .field("capacity", &self.capacity())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .field("destroyed", &self.destroyed())
            .finish()
    }
}

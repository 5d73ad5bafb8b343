//! Allocator statistics for monitoring.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

/// Snapshot of allocator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Successful pool initializations (reservations made).
    pub initializations: usize,
    /// Teardowns that released reserved memory.
    pub teardowns: usize,
    /// Allocations served from the pool.
    pub pooled_allocations: usize,
    /// Allocations that went straight to the device.
    pub direct_allocations: usize,
    /// Frees returned to the pool.
    pub pooled_frees: usize,
    /// Frees passed straight to the device.
    pub direct_frees: usize,
}

impl PoolStats {
    /// Allocations not yet matched by a free.
    pub fn outstanding(&self) -> usize {
        (self.pooled_allocations + self.direct_allocations)
            .saturating_sub(self.pooled_frees + self.direct_frees)
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    initializations: AtomicUsize,
    teardowns: AtomicUsize,
    pooled_allocations: AtomicUsize,
    direct_allocations: AtomicUsize,
    pooled_frees: AtomicUsize,
    direct_frees: AtomicUsize,
}

impl StatsCounters {
    pub(crate) fn record_initialization(&self) {
        self.initializations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_teardown(&self) {
        self.teardowns.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_allocation(&self, pooled: bool) {
        if pooled {
            self.pooled_allocations.fetch_add(1, Ordering::Relaxed);
        } else {
            self.direct_allocations.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_free(&self, pooled: bool) {
        if pooled {
            self.pooled_frees.fetch_add(1, Ordering::Relaxed);
        } else {
            self.direct_frees.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> PoolStats {
        PoolStats {
            initializations: self.initializations.load(Ordering::Relaxed),
            teardowns: self.teardowns.load(Ordering::Relaxed),
            pooled_allocations: self.pooled_allocations.load(Ordering::Relaxed),
            direct_allocations: self.direct_allocations.load(Ordering::Relaxed),
            pooled_frees: self.pooled_frees.load(Ordering::Relaxed),
            direct_frees: self.direct_frees.load(Ordering::Relaxed),
        }
    }
}

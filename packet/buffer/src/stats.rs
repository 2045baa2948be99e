//! Pool statistics.
//!
//! - [`PoolCounters`] - lock-free counters updated on the hot path
//! - [`PoolInfo`] - point-in-time snapshot returned by [`crate::PacketPool::info`]

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for one pool.
#[derive(Debug, Default)]
pub struct PoolCounters {
    pub allocations: AtomicU64,
    pub releases: AtomicU64,
    /// Requests that found too few free segments.
    pub empty_requests: AtomicU64,
    /// Requests rejected because chaining could not cover them.
    pub oversized: AtomicU64,
    /// Releases of a packet that was already released.
    pub invalid_releases: AtomicU64,
    pub fragments: AtomicU64,
    pub reassembled: AtomicU64,
    pub reassembly_timeouts: AtomicU64,
    pub overlaps: AtomicU64,
}

impl PoolCounters {
    #[inline]
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of a pool's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolInfo {
    pub name: String,
    pub total_segments: usize,
    pub free_segments: usize,
    pub allocations: u64,
    pub releases: u64,
    pub empty_requests: u64,
    pub oversized: u64,
    pub invalid_releases: u64,
    pub fragments: u64,
    pub reassembled: u64,
    pub reassembly_timeouts: u64,
    pub overlaps: u64,
}

impl PoolInfo {
    pub(crate) fn capture(
        name: &str,
        total_segments: usize,
        free_segments: usize,
        counters: &PoolCounters,
    ) -> Self {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Self {
            name: name.to_string(),
            total_segments,
            free_segments,
            allocations: load(&counters.allocations),
            releases: load(&counters.releases),
            empty_requests: load(&counters.empty_requests),
            oversized: load(&counters.oversized),
            invalid_releases: load(&counters.invalid_releases),
            fragments: load(&counters.fragments),
            reassembled: load(&counters.reassembled),
            reassembly_timeouts: load(&counters.reassembly_timeouts),
            overlaps: load(&counters.overlaps),
        }
    }

    /// Segments currently held by packets.
    pub fn used_segments(&self) -> usize {
        self.total_segments - self.free_segments
    }

    /// Utilization as a percentage (0.0 - 100.0).
    pub fn utilization(&self) -> f64 {
        if self.total_segments == 0 {
            0.0
        } else {
            (self.used_segments() as f64 / self.total_segments as f64) * 100.0
        }
    }
}

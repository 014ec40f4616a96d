//! Allocation statistics.
//!
//! Counters are plain relaxed atomics updated on the allocation paths; the
//! snapshot types are what an external statistics surface reads.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-bucket counters, updated without the pool lock.
#[derive(Debug, Default)]
pub(crate) struct BucketCounters {
    hit_alloc: AtomicU64,
    total_alloc: AtomicU64,
    merged: AtomicU64,
}

impl BucketCounters {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_hit(&self) {
        self.hit_alloc.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_alloc(&self) {
        self.total_alloc.fetch_add(1, Ordering::Relaxed);
    }

    /// Records SG entries saved by clustering on one fill.
    #[inline]
    pub(crate) fn record_merged(&self, saved: u64) {
        self.merged.fetch_add(saved, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, order: usize) -> BucketStats {
        BucketStats {
            order,
            hit_alloc: self.hit_alloc.load(Ordering::Relaxed),
            total_alloc: self.total_alloc.load(Ordering::Relaxed),
            merged: self.merged.load(Ordering::Relaxed),
        }
    }
}

/// Counters for the two non-bucket regimes: over-order ("big") and
/// explicitly uncached ("other") allocations.
#[derive(Debug, Default)]
pub(crate) struct RegimeCounters {
    alloc: AtomicU64,
    pages: AtomicU64,
    merged: AtomicU64,
}

impl RegimeCounters {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_alloc(&self) {
        self.alloc.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_fill(&self, pages: u64, saved: u64) {
        self.pages.fetch_add(pages, Ordering::Relaxed);
        self.merged.fetch_add(saved, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> RegimeStats {
        RegimeStats {
            alloc: self.alloc.load(Ordering::Relaxed),
            pages: self.pages.load(Ordering::Relaxed),
            merged: self.merged.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of one cache bucket.
#[derive(Debug, Clone, Default)]
pub struct BucketStats {
    /// Bucket order; objects hold `2^order` pages.
    pub order: usize,
    /// Allocations served from the bucket's free-list.
    pub hit_alloc: u64,
    /// All allocations routed through this bucket.
    pub total_alloc: u64,
    /// SG entries saved by clustering.
    pub merged: u64,
}

impl BucketStats {
    /// Cache hit ratio for this bucket (0.0 to 1.0).
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        if self.total_alloc == 0 {
            0.0
        } else {
            self.hit_alloc as f64 / self.total_alloc as f64
        }
    }
}

/// Snapshot of a non-bucket allocation regime.
#[derive(Debug, Clone, Default)]
pub struct RegimeStats {
    /// Allocations in this regime.
    pub alloc: u64,
    /// Pages requested across those allocations.
    pub pages: u64,
    /// SG entries saved by clustering.
    pub merged: u64,
}

/// Snapshot of one pool.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Pool name.
    pub name: String,
    /// Objects currently created for the cache (free-listed plus lent out).
    pub cached_entries: usize,
    /// Pages those objects account for.
    pub cached_pages: u64,
    /// Pages sitting in free-lists, not lent out.
    pub inactive_cached_pages: u64,
    /// Per-order bucket counters.
    pub buckets: Vec<BucketStats>,
    /// Over-order allocations.
    pub big: RegimeStats,
    /// Explicitly uncached allocations.
    pub other: RegimeStats,
}

impl PoolStats {
    /// Cache hit ratio across all buckets (0.0 to 1.0).
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total: u64 = self.buckets.iter().map(|b| b.total_alloc).sum();
        if total == 0 {
            0.0
        } else {
            let hits: u64 = self.buckets.iter().map(|b| b.hit_alloc).sum();
            hits as f64 / total as f64
        }
    }
}

/// Snapshot of the allocator subsystem.
#[derive(Debug, Clone, Default)]
pub struct GlobalStats {
    /// Pages currently accounted against the watermarks.
    pub pages_total: u64,
    /// Admissions that crossed the high watermark and forced a shrink.
    pub releases_on_hi_wmk: u64,
    /// Of those, how many still failed after shrinking.
    pub releases_on_hi_wmk_failed: u64,
    /// Pool-less raw SG allocations.
    pub raw_allocs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_counters() {
        let counters = BucketCounters::new();
        counters.record_alloc();
        counters.record_alloc();
        counters.record_hit();
        counters.record_merged(3);

        let snap = counters.snapshot(2);
        assert_eq!(snap.order, 2);
        assert_eq!(snap.total_alloc, 2);
        assert_eq!(snap.hit_alloc, 1);
        assert_eq!(snap.merged, 3);
        assert!((snap.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pool_hit_ratio_empty() {
        let stats = PoolStats {
            name: "t".into(),
            cached_entries: 0,
            cached_pages: 0,
            inactive_cached_pages: 0,
            buckets: Vec::new(),
            big: RegimeStats::default(),
            other: RegimeStats::default(),
        };
        assert_eq!(stats.hit_ratio(), 0.0);
    }
}

//! Benchmark support: deterministic page sources and allocator setup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sgv_pool::clock::MonotonicClock;
use sgv_pool::timer::ManualScheduler;
use sgv_pool::{AllocCookie, PageFrame, PageSource, SgEntry, SgvAllocator, SgvConfig};

/// Page size used across the benchmarks.
pub const PAGE: usize = 4096;

/// A page source handing out sequentially adjacent frames, so full
/// clustering always merges, without touching real memory.
#[derive(Debug, Default)]
pub struct AdjacentSource {
    next_frame: AtomicU64,
}

impl PageSource for AdjacentSource {
    fn alloc_page(&self, _cookie: Option<&AllocCookie>) -> Option<SgEntry> {
        let frame = self.next_frame.fetch_add(1, Ordering::Relaxed);
        Some(SgEntry::new(PageFrame::new(frame), PAGE as u32))
    }

    fn free_pages(&self, _entries: &[SgEntry], _cookie: Option<&AllocCookie>) {}
}

/// A page source handing out frames with gaps, so clustering never fires.
#[derive(Debug, Default)]
pub struct SparseSource {
    next_frame: AtomicU64,
}

impl PageSource for SparseSource {
    fn alloc_page(&self, _cookie: Option<&AllocCookie>) -> Option<SgEntry> {
        let frame = self.next_frame.fetch_add(2, Ordering::Relaxed);
        Some(SgEntry::new(PageFrame::new(frame), PAGE as u32))
    }

    fn free_pages(&self, _entries: &[SgEntry], _cookie: Option<&AllocCookie>) {}
}

/// An allocator whose purge work never runs on its own, so benchmarks
/// measure only the paths they drive.
pub fn bench_allocator(hi_wmk: u64, lo_wmk: u64, source: Arc<dyn PageSource>) -> SgvAllocator {
    let cfg = SgvConfig::new(hi_wmk, lo_wmk)
        .with_purge_interval(Duration::from_secs(3600))
        .with_shrink_age(Duration::from_secs(1));
    SgvAllocator::with_runtime(
        cfg,
        Arc::new(MonotonicClock::new()),
        Arc::new(ManualScheduler::new()),
        source,
    )
    .expect("benchmark config is valid")
}

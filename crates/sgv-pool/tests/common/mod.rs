//! Shared fixtures: deterministic page sources and a virtual-time rig.

#![allow(dead_code)]

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sgv_pool::clock::ManualClock;
use sgv_pool::timer::ManualScheduler;
use sgv_pool::{AllocCookie, PageFrame, PageSource, SgEntry, SgvAllocator, SgvConfig};

pub const PAGE: usize = 4096;
pub const SHIFT: u32 = 12;

/// Hands out monotonically increasing, never-adjacent frames and counts
/// page traffic. A grant budget makes page-source failure injectable.
pub struct SeqSource {
    next_frame: AtomicU64,
    grants_left: AtomicI64,
    allocated_pages: AtomicU64,
    freed_pages: AtomicU64,
}

impl SeqSource {
    pub fn new() -> Self {
        Self {
            // Stride two: no two grants are ever physically adjacent.
            next_frame: AtomicU64::new(0x1000),
            grants_left: AtomicI64::new(i64::MAX),
            allocated_pages: AtomicU64::new(0),
            freed_pages: AtomicU64::new(0),
        }
    }

    /// Allow exactly `n` further page grants, then fail.
    pub fn set_grants(&self, n: i64) {
        self.grants_left.store(n, Ordering::SeqCst);
    }

    pub fn allocated_pages(&self) -> u64 {
        self.allocated_pages.load(Ordering::SeqCst)
    }

    pub fn freed_pages(&self) -> u64 {
        self.freed_pages.load(Ordering::SeqCst)
    }

    pub fn outstanding_pages(&self) -> u64 {
        self.allocated_pages() - self.freed_pages()
    }
}

impl PageSource for SeqSource {
    fn alloc_page(&self, _cookie: Option<&AllocCookie>) -> Option<SgEntry> {
        if self.grants_left.fetch_sub(1, Ordering::SeqCst) <= 0 {
            return None;
        }
        let frame = self.next_frame.fetch_add(2, Ordering::SeqCst);
        self.allocated_pages.fetch_add(1, Ordering::SeqCst);
        Some(SgEntry::new(PageFrame::new(frame), PAGE as u32))
    }

    fn free_pages(&self, entries: &[SgEntry], _cookie: Option<&AllocCookie>) {
        let pages: u64 = entries.iter().map(|e| e.page_span(SHIFT)).sum();
        self.freed_pages.fetch_add(pages, Ordering::SeqCst);
    }
}

/// Hands out a scripted frame sequence, for exact clustering shapes.
pub struct ScriptedSource {
    frames: Mutex<Vec<u64>>,
    freed_pages: AtomicU64,
}

impl ScriptedSource {
    pub fn new(frames: &[u64]) -> Self {
        let mut script = frames.to_vec();
        script.reverse();
        Self {
            frames: Mutex::new(script),
            freed_pages: AtomicU64::new(0),
        }
    }

    pub fn freed_pages(&self) -> u64 {
        self.freed_pages.load(Ordering::SeqCst)
    }
}

impl PageSource for ScriptedSource {
    fn alloc_page(&self, _cookie: Option<&AllocCookie>) -> Option<SgEntry> {
        let frame = self.frames.lock().pop()?;
        Some(SgEntry::new(PageFrame::new(frame), PAGE as u32))
    }

    fn free_pages(&self, entries: &[SgEntry], _cookie: Option<&AllocCookie>) {
        let pages: u64 = entries.iter().map(|e| e.page_span(SHIFT)).sum();
        self.freed_pages.fetch_add(pages, Ordering::SeqCst);
    }
}

/// An allocator wired to a manual clock, a manual scheduler and a
/// sequential page source.
pub struct Rig {
    pub allocator: SgvAllocator,
    pub clock: Arc<ManualClock>,
    pub scheduler: Arc<ManualScheduler>,
    pub source: Arc<SeqSource>,
}

pub fn rig(cfg: SgvConfig) -> Rig {
    let clock = Arc::new(ManualClock::new());
    let scheduler = Arc::new(ManualScheduler::new());
    let source = Arc::new(SeqSource::new());
    let allocator = SgvAllocator::with_runtime(
        cfg,
        Arc::clone(&clock) as _,
        Arc::clone(&scheduler) as _,
        Arc::clone(&source) as _,
    )
    .expect("valid test config");
    Rig {
        allocator,
        clock,
        scheduler,
        source,
    }
}

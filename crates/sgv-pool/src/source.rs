//! Page-source adapter.
//!
//! The allocator never allocates pages itself; it asks a [`PageSource`]
//! for one page at a time and hands runs of entries back for release. The
//! adapter carries no allocator state; a per-allocation cookie travels
//! with the object and is passed through both calls.

use std::alloc::{self, Layout};
use std::any::Any;
use std::sync::Arc;

use crate::page::{PageFrame, SgEntry};

/// Opaque per-allocation cookie handed through to the page source.
pub type AllocCookie = Arc<dyn Any + Send + Sync>;

/// Supplies and releases the pages behind SG entries.
pub trait PageSource: Send + Sync {
    /// Produces one page as a fully formed single-page SG entry, or `None`
    /// when no page can be had.
    fn alloc_page(&self, cookie: Option<&AllocCookie>) -> Option<SgEntry>;

    /// Releases `entries`. After clustering an entry may cover several
    /// physically adjacent pages; the per-page allocation order is not
    /// preserved, so each entry is released as a run of single pages.
    fn free_pages(&self, entries: &[SgEntry], cookie: Option<&AllocCookie>);
}

/// The default page source: page-sized, page-aligned heap blocks.
///
/// Frame numbers are derived from block addresses, so physically adjacent
/// heap pages genuinely cluster. Every page handed out is an independent
/// single-page allocation, which is what makes freeing an entry as a run
/// of single pages correct.
#[derive(Debug)]
pub struct SystemPageSource {
    page_size: usize,
    page_shift: u32,
}

impl SystemPageSource {
    /// Creates a source producing pages of `page_size` bytes.
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        assert!(
            page_size.is_power_of_two() && page_size >= 512,
            "page_size must be a power of two >= 512"
        );
        Self {
            page_size,
            page_shift: page_size.trailing_zeros(),
        }
    }

    fn page_layout(&self) -> Layout {
        // Alignment equals size, so frame number <-> address conversion is
        // exact in both directions.
        Layout::from_size_align(self.page_size, self.page_size)
            .expect("page layout is statically valid")
    }
}

impl PageSource for SystemPageSource {
    fn alloc_page(&self, _cookie: Option<&AllocCookie>) -> Option<SgEntry> {
        let layout = self.page_layout();
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc(layout) };
        if ptr.is_null() {
            return None;
        }
        let frame = (ptr as usize >> self.page_shift) as u64;
        Some(SgEntry::new(PageFrame::new(frame), self.page_size as u32))
    }

    fn free_pages(&self, entries: &[SgEntry], _cookie: Option<&AllocCookie>) {
        let layout = self.page_layout();
        for entry in entries {
            let pages = entry.page_span(self.page_shift);
            for i in 0..pages {
                let addr = (entry.page.advance(i).as_u64() as usize) << self.page_shift;
                // SAFETY: each covered page was produced by `alloc_page`
                // with this exact layout; clustering only ever merges
                // whole pages from this source.
                unsafe { alloc::dealloc(addr as *mut u8, layout) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_round_trip() {
        let source = SystemPageSource::new(4096);
        let entry = source.alloc_page(None).expect("page");
        assert_eq!(entry.length, 4096);
        assert_eq!(entry.offset, 0);
        source.free_pages(&[entry], None);
    }

    #[test]
    fn test_frames_are_page_aligned_addresses() {
        let source = SystemPageSource::new(4096);
        let entry = source.alloc_page(None).expect("page");
        let addr = (entry.page.as_u64() as usize) << 12;
        assert_eq!(addr % 4096, 0);
        source.free_pages(&[entry], None);
    }

    #[test]
    fn test_free_merged_run() {
        let source = SystemPageSource::new(4096);
        let a = source.alloc_page(None).expect("page");
        let b = source.alloc_page(None).expect("page");
        if b.page == a.page.advance(1) {
            // Adjacent: free as one two-page entry, the clustered shape.
            let merged = SgEntry::new(a.page, 8192);
            source.free_pages(&[merged], None);
        } else {
            source.free_pages(&[a, b], None);
        }
    }
}

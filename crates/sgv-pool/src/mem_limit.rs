//! Per-caller memory quota cookie.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

/// A per-caller page quota.
///
/// The allocator charges the cookie before committing an allocation and
/// releases the charge when the allocation is freed. The cookie owns its
/// own counter; the allocator does not interpret it beyond pass/fail.
#[derive(Debug)]
pub struct MemLimit {
    allocated_pages: AtomicU64,
    max_allowed_pages: u64,
}

impl MemLimit {
    /// Creates a quota allowing up to `max_allowed_pages` outstanding pages.
    #[must_use]
    pub fn new(max_allowed_pages: u64) -> Self {
        Self {
            allocated_pages: AtomicU64::new(0),
            max_allowed_pages,
        }
    }

    /// Pages currently charged against this quota.
    #[must_use]
    pub fn allocated_pages(&self) -> u64 {
        self.allocated_pages.load(Ordering::Relaxed)
    }

    /// The configured maximum.
    #[must_use]
    pub const fn max_allowed_pages(&self) -> u64 {
        self.max_allowed_pages
    }

    /// Charges `pages`; on overflow the charge is rolled back and the
    /// allocation must be aborted.
    pub(crate) fn add(&self, pages: u64) -> bool {
        let charged = self.allocated_pages.fetch_add(pages, Ordering::Relaxed) + pages;
        if charged > self.max_allowed_pages {
            self.allocated_pages.fetch_sub(pages, Ordering::Relaxed);
            trace!(
                pages,
                max = self.max_allowed_pages,
                "per-caller quota exceeded"
            );
            return false;
        }
        true
    }

    /// Releases a prior charge.
    pub(crate) fn sub(&self, pages: u64) {
        self.allocated_pages.fetch_sub(pages, Ordering::Relaxed);
    }
}

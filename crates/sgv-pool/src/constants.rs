//! System-wide constants for the SGV allocator.

use std::mem;
use std::time::Duration;

use crate::page::{SgEntry, TransTblEnt};

// =============================================================================
// Purge and shrink cadence
// =============================================================================

/// Delay between a pool becoming non-empty and its purge worker running;
/// also the age past which a cached object is considered stale.
pub const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Age filter applied when the external shrinker hook asks for reclaim.
pub const SHRINK_AGE: Duration = Duration::from_secs(1);

/// Maximum pages freed from a single pool per shrink iteration, so one
/// pool cannot absorb the whole sweep.
pub const MAX_PAGES_PER_POOL: u64 = 50;

// =============================================================================
// Page and bucket defaults
// =============================================================================

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default largest cacheable order; bucket `k` holds `2^k`-page objects.
pub const DEFAULT_MAX_ORDER: usize = 10;

/// Default high watermark, in pages (256 MiB at the default page size).
pub const DEFAULT_HI_WMK: u64 = 64 * 1024;

/// Default low watermark, in pages.
pub const DEFAULT_LO_WMK: u64 = 48 * 1024;

// =============================================================================
// Embedded storage thresholds
// =============================================================================

/// Byte budget for the arrays kept inline in an object's own allocation.
///
/// An object whose SG vector (and, for clustered pools, translation table)
/// fits this budget carries them inline; larger orders spill to the heap.
pub const EMBEDDED_BLOCK: usize = 512;

/// Largest order whose SG vector and translation table both fit the
/// embedded budget.
pub const MAX_LOCAL_ORDER: usize =
    (EMBEDDED_BLOCK / (mem::size_of::<SgEntry>() + mem::size_of::<TransTblEnt>())).ilog2() as usize;

/// Largest order whose translation table alone fits the embedded budget.
pub const MAX_TRANS_ORDER: usize =
    (EMBEDDED_BLOCK / mem::size_of::<TransTblEnt>()).ilog2() as usize;

/// Inline capacity of an object's SG vector.
pub(crate) const INLINE_SG_ENTRIES: usize = 1 << MAX_LOCAL_ORDER;

/// Inline capacity of an object's translation table.
pub(crate) const INLINE_TRANS_ENTRIES: usize = 1 << MAX_TRANS_ORDER;

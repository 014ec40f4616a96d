//! Allocator configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_HI_WMK, DEFAULT_LO_WMK, DEFAULT_MAX_ORDER, DEFAULT_PAGE_SIZE, PURGE_INTERVAL,
    SHRINK_AGE,
};

/// Configuration for an allocator subsystem.
///
/// Both watermarks are in pages. `max_order` bounds the cached bucket
/// sizes: bucket `k` holds objects of exactly `2^k` pages, and requests
/// above `2^max_order` pages bypass the caches entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SgvConfig {
    /// High watermark: total accounted pages above which admission shrinks
    /// or fails.
    pub hi_wmk: u64,
    /// Low watermark: shrink sweeps stop once the total drops here.
    pub lo_wmk: u64,
    /// Page size in bytes; must be a power of two.
    pub page_size: usize,
    /// Largest cacheable order.
    pub max_order: usize,
    /// Purge worker period and staleness age.
    pub purge_interval: Duration,
    /// Age filter for shrinker-driven reclaim.
    pub shrink_age: Duration,
}

impl SgvConfig {
    /// Creates a configuration with the given watermarks and defaults for
    /// everything else.
    #[must_use]
    pub fn new(hi_wmk: u64, lo_wmk: u64) -> Self {
        Self {
            hi_wmk,
            lo_wmk,
            page_size: DEFAULT_PAGE_SIZE,
            max_order: DEFAULT_MAX_ORDER,
            purge_interval: PURGE_INTERVAL,
            shrink_age: SHRINK_AGE,
        }
    }

    /// Sets the page size.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the largest cacheable order.
    #[must_use]
    pub fn with_max_order(mut self, max_order: usize) -> Self {
        self.max_order = max_order;
        self
    }

    /// Sets the purge period.
    #[must_use]
    pub fn with_purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = interval;
        self
    }

    /// Sets the shrink age filter.
    #[must_use]
    pub fn with_shrink_age(mut self, age: Duration) -> Self {
        self.shrink_age = age;
        self
    }

    /// Base-2 logarithm of the page size.
    #[inline]
    #[must_use]
    pub fn page_shift(&self) -> u32 {
        self.page_size.trailing_zeros()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.page_size.is_power_of_two() || self.page_size < 512 {
            return Err("page_size must be a power of two >= 512");
        }
        if self.hi_wmk == 0 {
            return Err("hi_wmk must be > 0");
        }
        if self.lo_wmk >= self.hi_wmk {
            return Err("lo_wmk must be below hi_wmk");
        }
        if self.max_order > 20 {
            return Err("max_order must be <= 20");
        }
        if self.purge_interval.is_zero() {
            return Err("purge_interval must be non-zero");
        }
        Ok(())
    }
}

impl Default for SgvConfig {
    fn default() -> Self {
        Self::new(DEFAULT_HI_WMK, DEFAULT_LO_WMK)
    }
}

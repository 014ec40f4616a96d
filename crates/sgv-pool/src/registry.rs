//! The allocator subsystem: pools registry, watermark accountant and
//! cross-pool shrinker.
//!
//! All process-wide state lives in an explicit [`SgvAllocator`] context
//! rather than module statics: the pools list, the ring of *active* pools
//! (those with at least one cached object) with its persistent purge
//! cursor, the atomic total of accounted pages, and the two watermarks
//! that bound it.
//!
//! Lock order: the registry lock is the outer one. A pool lock may be
//! acquired while holding it, never the reverse, and neither is ever
//! held across a page-source call.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::clock::{Clock, MonotonicClock};
use crate::cluster::{alloc_sg_entries, ClusteringMode, SgVec};
use crate::config::SgvConfig;
use crate::constants::MAX_PAGES_PER_POOL;
use crate::error::{SgvError, SgvResult};
use crate::page::SgEntry;
use crate::pool::SgvPool;
use crate::source::{PageSource, SystemPageSource};
use crate::stats::{GlobalStats, PoolStats};
use crate::timer::{PurgeScheduler, ThreadTimer};

/// Identifies the owner scope of a shared pool.
///
/// Callers that want to share a pool by name pass the same tag; a lookup
/// under a different tag is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerTag(pub u64);

/// The ring of active pools plus the persistent shrink cursor.
#[derive(Default)]
pub(crate) struct ActivePools {
    ring: Vec<Arc<SgvPool>>,
    cursor: usize,
}

impl ActivePools {
    /// Adds a pool that just acquired its first cached entry.
    pub(crate) fn enrol(&mut self, pool: Arc<SgvPool>) {
        debug_assert!(
            !self.ring.iter().any(|p| Arc::ptr_eq(p, &pool)),
            "pool already enrolled"
        );
        trace!(pool = %pool.name(), "pool enters the active ring");
        self.ring.push(pool);
    }

    /// Removes a pool whose last cached entry went away, re-pointing the
    /// cursor at the next pool (or leaving it reset when the ring drains).
    pub(crate) fn remove(&mut self, pool: &SgvPool) {
        let Some(idx) = self
            .ring
            .iter()
            .position(|p| std::ptr::eq(Arc::as_ptr(p), pool))
        else {
            return;
        };
        trace!(pool = %pool.name(), "pool leaves the active ring");
        self.ring.remove(idx);
        if self.ring.is_empty() {
            self.cursor = 0;
        } else {
            if idx < self.cursor {
                self.cursor -= 1;
            }
            if self.cursor >= self.ring.len() {
                self.cursor = 0;
            }
        }
    }

    /// Picks the pool under the cursor and advances. The second value is
    /// true when the pick was the last ring slot, i.e. the walk is about
    /// to wrap.
    fn select(&mut self) -> Option<(Arc<SgvPool>, bool)> {
        if self.ring.is_empty() {
            return None;
        }
        if self.cursor >= self.ring.len() {
            self.cursor = 0;
        }
        let pool = Arc::clone(&self.ring[self.cursor]);
        let at_end = self.cursor == self.ring.len() - 1;
        self.cursor = (self.cursor + 1) % self.ring.len();
        Some((pool, at_end))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<SgvPool>> {
        self.ring.iter()
    }
}

/// State shared between the allocator handle and every pool it created.
pub(crate) struct Shared {
    cfg: SgvConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) scheduler: Arc<dyn PurgeScheduler>,
    pub(crate) default_source: Arc<dyn PageSource>,
    pub(crate) pages_total: AtomicU64,
    releases_on_hi_wmk: AtomicU64,
    releases_on_hi_wmk_failed: AtomicU64,
    raw_allocs: AtomicU64,
    /// All live pools; serialises create/destroy and name lookup.
    pub(crate) pools: Mutex<Vec<Arc<SgvPool>>>,
    /// Active ring and purge cursor.
    pub(crate) active: Mutex<ActivePools>,
}

impl Shared {
    pub(crate) fn config(&self) -> &SgvConfig {
        &self.cfg
    }

    /// Admits `pages` against the high watermark, shrinking with a
    /// zero-age filter when the tentative total overshoots. Returns false
    /// (with nothing committed) when not enough could be reclaimed.
    ///
    /// The check is non-atomic with respect to concurrent admissions and
    /// may over-admit by a bounded amount.
    pub(crate) fn admit(&self, pages: u64) -> bool {
        let projected = self.pages_total.load(Ordering::Relaxed) + pages;
        if projected > self.cfg.hi_wmk {
            let overshoot = projected - self.cfg.hi_wmk;
            self.releases_on_hi_wmk.fetch_add(1, Ordering::Relaxed);
            let left = self.shrink_pools(overshoot, 0);
            if left > 0 {
                warn!(
                    pages,
                    hi_wmk = self.cfg.hi_wmk,
                    "allocation exceeds the high watermark and shrinking \
                     could not reclaim enough"
                );
                self.releases_on_hi_wmk_failed.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }
        self.pages_total.fetch_add(pages, Ordering::Relaxed);
        true
    }

    /// Reverts an admission (or accounts a one-shot free).
    pub(crate) fn unadmit(&self, pages: u64) {
        self.pages_total.fetch_sub(pages, Ordering::Relaxed);
    }

    /// Walks active pools round-robin from the purge cursor, evicting
    /// objects aged at least `age_ms`, until `nr` pages are freed, the
    /// total drops to the low watermark, or a full circle brings no
    /// progress. Returns the pages still wanted.
    pub(crate) fn shrink_pools(&self, mut nr: u64, age_ms: u64) -> u64 {
        let now = self.clock.now_ms();
        let mut wrapped = false;
        let mut nr_at_wrap = nr;

        while nr > 0 {
            let pool;
            {
                let mut active = self.active.lock();
                match active.select() {
                    None => break,
                    Some((selected, at_end)) => {
                        if at_end {
                            if wrapped && nr_at_wrap == nr {
                                trace!(nr, "full circle without progress, leaving");
                                break;
                            }
                            wrapped = true;
                            nr_at_wrap = nr;
                        }
                        pool = selected;
                    }
                }
            }
            nr = self.shrink_pool(&pool, nr, age_ms, now);
        }
        nr
    }

    /// Evicts aged LRU-head objects from one pool, stopping at
    /// `MAX_PAGES_PER_POOL` freed, a too-young head, or the low watermark.
    fn shrink_pool(&self, pool: &Arc<SgvPool>, mut nr: u64, age_ms: u64, now: u64) -> u64 {
        let mut freed = 0u64;
        loop {
            let obj = {
                let mut reg = self.active.lock();
                let mut cache = pool.cache.lock();
                if self.pages_total.load(Ordering::Relaxed) <= self.cfg.lo_wmk {
                    break;
                }
                let Some(slot) = cache.lru_head() else { break };
                if now < cache.obj_at(slot).timestamp.saturating_add(age_ms) {
                    break;
                }
                pool.evict_locked(&mut reg, &mut cache, slot)
            };
            let pages = obj.capacity_pages();
            pool.destroy_obj(obj);
            freed += pages;
            nr = nr.saturating_sub(pages);
            trace!(pool = %pool.name(), pages, freed, nr_left = nr, "shrunk pool");
            if nr == 0 || freed >= MAX_PAGES_PER_POOL {
                break;
            }
        }
        nr
    }
}

/// A pool-less SG list, accounted against the watermarks but cached
/// nowhere. Built by [`SgvAllocator::alloc_raw`].
#[derive(Debug)]
pub struct RawSg {
    entries: Vec<SgEntry>,
    pages: u64,
}

impl RawSg {
    /// The SG entries; one page each.
    #[must_use]
    pub fn sg(&self) -> &[SgEntry] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Pages backing the list.
    #[must_use]
    pub fn pages(&self) -> u64 {
        self.pages
    }
}

/// The allocator subsystem handle.
///
/// Owns the configuration, watermark accounting, and the pools registry.
/// Pools created from it stay usable for as long as any reference to them
/// lives, even if this handle is dropped first.
pub struct SgvAllocator {
    shared: Arc<Shared>,
}

impl SgvAllocator {
    /// Creates a subsystem with the production clock, timer thread and
    /// system page source.
    pub fn new(cfg: SgvConfig) -> SgvResult<Self> {
        let page_size = cfg.page_size;
        Self::with_runtime(
            cfg,
            Arc::new(MonotonicClock::new()),
            Arc::new(ThreadTimer::new()),
            Arc::new(SystemPageSource::new(page_size)),
        )
    }

    /// Creates a subsystem over caller-supplied time, scheduling and page
    /// sourcing. This is how embedders and tests drive virtual time.
    pub fn with_runtime(
        cfg: SgvConfig,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn PurgeScheduler>,
        default_source: Arc<dyn PageSource>,
    ) -> SgvResult<Self> {
        cfg.validate()
            .map_err(|reason| SgvError::InvalidArg { reason })?;
        debug!(
            hi_wmk = cfg.hi_wmk,
            lo_wmk = cfg.lo_wmk,
            page_size = cfg.page_size,
            max_order = cfg.max_order,
            "sgv allocator initialised"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                cfg,
                clock,
                scheduler,
                default_source,
                pages_total: AtomicU64::new(0),
                releases_on_hi_wmk: AtomicU64::new(0),
                releases_on_hi_wmk_failed: AtomicU64::new(0),
                raw_allocs: AtomicU64::new(0),
                pools: Mutex::new(Vec::new()),
                active: Mutex::new(ActivePools::default()),
            }),
        })
    }

    /// The subsystem configuration.
    #[must_use]
    pub fn config(&self) -> &SgvConfig {
        self.shared.config()
    }

    /// Creates a pool. The name must be unused.
    pub fn create(&self, name: &str, clustering: ClusteringMode) -> SgvResult<Arc<SgvPool>> {
        self.create_impl(name, clustering, None)
    }

    /// Creates or re-obtains a shared pool. A pool of the same name and
    /// owner tag gains a reference and is returned; a name held by anyone
    /// else fails with [`SgvError::Busy`].
    pub fn create_shared(
        &self,
        name: &str,
        clustering: ClusteringMode,
        owner: OwnerTag,
    ) -> SgvResult<Arc<SgvPool>> {
        self.create_impl(name, clustering, Some(owner))
    }

    fn create_impl(
        &self,
        name: &str,
        clustering: ClusteringMode,
        owner: Option<OwnerTag>,
    ) -> SgvResult<Arc<SgvPool>> {
        let mut pools = self.shared.pools.lock();
        if let Some(existing) = pools.iter().find(|p| p.name() == name) {
            return match owner {
                Some(tag) if existing.owner() == Some(tag) => {
                    existing.grab();
                    Ok(Arc::clone(existing))
                }
                _ => {
                    warn!(pool = name, "pool name already claimed");
                    Err(SgvError::Busy)
                }
            };
        }
        let pool = Arc::new(SgvPool::new(
            name,
            clustering,
            owner,
            Arc::clone(&self.shared),
        ));
        pools.push(Arc::clone(&pool));
        debug!(pool = name, ?clustering, "pool created");
        Ok(pool)
    }

    /// Drops one reference to `pool`. The last reference cancels its purge
    /// worker synchronously, flushes every cached object and unregisters
    /// it.
    pub fn destroy(&self, pool: Arc<SgvPool>) {
        pool.put_ref();
    }

    /// The memory-pressure hook.
    ///
    /// With `requested_pages == 0` this returns an estimate of reclaimable
    /// pages (inactive cached pages over the low watermark); otherwise it
    /// reclaims with the configured shrink age and returns the pages
    /// actually freed.
    pub fn reclaim(&self, requested_pages: u64) -> u64 {
        if requested_pages > 0 {
            let age_ms = self.shared.cfg.shrink_age.as_millis() as u64;
            let left = self.shared.shrink_pools(requested_pages, age_ms);
            requested_pages - left
        } else {
            let active = self.shared.active.lock();
            let inactive: u64 = active
                .iter()
                .map(|pool| pool.cache.lock().inactive_cached_pages)
                .sum();
            inactive.saturating_sub(self.shared.cfg.lo_wmk)
        }
    }

    /// Pages currently accounted against the watermarks.
    #[must_use]
    pub fn pages_total(&self) -> u64 {
        self.shared.pages_total.load(Ordering::Relaxed)
    }

    /// Snapshot of the global counters.
    #[must_use]
    pub fn stats(&self) -> GlobalStats {
        GlobalStats {
            pages_total: self.pages_total(),
            releases_on_hi_wmk: self.shared.releases_on_hi_wmk.load(Ordering::Relaxed),
            releases_on_hi_wmk_failed: self
                .shared
                .releases_on_hi_wmk_failed
                .load(Ordering::Relaxed),
            raw_allocs: self.shared.raw_allocs.load(Ordering::Relaxed),
        }
    }

    /// Snapshots of every live pool, for a statistics surface.
    #[must_use]
    pub fn pool_stats(&self) -> Vec<PoolStats> {
        let pools = self.shared.pools.lock();
        pools.iter().map(|pool| pool.stats()).collect()
    }

    /// Names of pools currently holding cached entries.
    #[must_use]
    pub fn active_pools(&self) -> Vec<String> {
        let active = self.shared.active.lock();
        active.iter().map(|pool| pool.name().to_string()).collect()
    }

    /// Allocates a plain, unclustered SG list straight from the default
    /// page source, watermark-accounted but cached nowhere.
    pub fn alloc_raw(&self, size: usize) -> SgvResult<RawSg> {
        if size == 0 {
            return Err(SgvError::invalid("zero size"));
        }
        let cfg = self.shared.config();
        let pages = (size + cfg.page_size - 1) >> cfg.page_shift();
        self.shared.raw_allocs.fetch_add(1, Ordering::Relaxed);

        if !self.shared.admit(pages as u64) {
            return Err(SgvError::OutOfMemory);
        }

        // Clustering is never used here: the free side must be able to
        // recover the page count from the entry count alone.
        let mut sg = SgVec::new();
        let count = alloc_sg_entries(
            &mut sg,
            None,
            pages,
            ClusteringMode::None,
            self.shared.default_source.as_ref(),
            None,
            cfg.page_shift(),
        );
        if count == 0 {
            self.shared.unadmit(pages as u64);
            return Err(SgvError::OutOfMemory);
        }
        Ok(RawSg {
            entries: sg.into_vec(),
            pages: pages as u64,
        })
    }

    /// Releases a raw SG list and its watermark accounting.
    pub fn free_raw(&self, raw: RawSg) {
        self.shared.unadmit(raw.pages);
        self.shared
            .default_source
            .free_pages(&raw.entries, None);
    }
}

impl fmt::Debug for SgvAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SgvAllocator")
            .field("hi_wmk", &self.shared.cfg.hi_wmk)
            .field("lo_wmk", &self.shared.cfg.lo_wmk)
            .field("pages_total", &self.pages_total())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_named(name: &str, shared: &Arc<Shared>) -> Arc<SgvPool> {
        Arc::new(SgvPool::new(
            name,
            ClusteringMode::None,
            None,
            Arc::clone(shared),
        ))
    }

    fn test_shared() -> Arc<Shared> {
        let allocator = SgvAllocator::new(SgvConfig::new(1024, 512)).expect("allocator");
        Arc::clone(&allocator.shared)
    }

    #[test]
    fn test_ring_cursor_round_robin() {
        let shared = test_shared();
        let mut ring = ActivePools::default();
        let a = pool_named("a", &shared);
        let b = pool_named("b", &shared);
        let c = pool_named("c", &shared);
        ring.enrol(Arc::clone(&a));
        ring.enrol(Arc::clone(&b));
        ring.enrol(Arc::clone(&c));

        let picks: Vec<String> = (0..4)
            .map(|_| ring.select().expect("pool").0.name().to_string())
            .collect();
        assert_eq!(picks, ["a", "b", "c", "a"]);
    }

    #[test]
    fn test_ring_wrap_detection() {
        let shared = test_shared();
        let mut ring = ActivePools::default();
        ring.enrol(pool_named("a", &shared));
        ring.enrol(pool_named("b", &shared));

        assert!(!ring.select().expect("pool").1);
        assert!(ring.select().expect("pool").1);
        assert!(!ring.select().expect("pool").1);
    }

    #[test]
    fn test_ring_remove_repoints_cursor() {
        let shared = test_shared();
        let mut ring = ActivePools::default();
        let a = pool_named("a", &shared);
        let b = pool_named("b", &shared);
        let c = pool_named("c", &shared);
        ring.enrol(Arc::clone(&a));
        ring.enrol(Arc::clone(&b));
        ring.enrol(Arc::clone(&c));

        // Advance the cursor onto "b", then remove it: the next pick must
        // be "c", not a skip back to "a".
        let _ = ring.select();
        ring.remove(&b);
        assert_eq!(ring.select().expect("pool").0.name(), "c");

        ring.remove(&a);
        ring.remove(&c);
        assert!(ring.select().is_none());
    }

    #[test]
    fn test_ring_remove_before_cursor() {
        let shared = test_shared();
        let mut ring = ActivePools::default();
        let a = pool_named("a", &shared);
        let b = pool_named("b", &shared);
        let c = pool_named("c", &shared);
        ring.enrol(Arc::clone(&a));
        ring.enrol(Arc::clone(&b));
        ring.enrol(Arc::clone(&c));

        let _ = ring.select(); // cursor -> b
        let _ = ring.select(); // cursor -> c
        ring.remove(&a);
        assert_eq!(ring.select().expect("pool").0.name(), "c");
    }

    #[test]
    fn test_create_name_clash() {
        let allocator = SgvAllocator::new(SgvConfig::new(1024, 512)).expect("allocator");
        let pool = allocator
            .create("io", ClusteringMode::None)
            .expect("created");
        assert_eq!(
            allocator.create("io", ClusteringMode::None).unwrap_err(),
            SgvError::Busy
        );
        allocator.destroy(pool);
        // Name is free again after the last reference drops.
        let pool = allocator
            .create("io", ClusteringMode::None)
            .expect("recreated");
        allocator.destroy(pool);
    }

    #[test]
    fn test_create_shared_reobtains() {
        let allocator = SgvAllocator::new(SgvConfig::new(1024, 512)).expect("allocator");
        let tag = OwnerTag(7);
        let first = allocator
            .create_shared("shared", ClusteringMode::None, tag)
            .expect("created");
        let second = allocator
            .create_shared("shared", ClusteringMode::None, tag)
            .expect("re-obtained");
        assert!(Arc::ptr_eq(&first, &second));

        // A different owner is refused.
        assert_eq!(
            allocator
                .create_shared("shared", ClusteringMode::None, OwnerTag(8))
                .unwrap_err(),
            SgvError::Busy
        );

        allocator.destroy(second);
        // Still registered: the first reference keeps it alive.
        assert_eq!(allocator.pool_stats().len(), 1);
        allocator.destroy(first);
        assert!(allocator.pool_stats().is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(SgvAllocator::new(SgvConfig::new(10, 20)).is_err());
    }

    #[test]
    fn test_raw_alloc_accounting() {
        let allocator = SgvAllocator::new(SgvConfig::new(1024, 512)).expect("allocator");
        let raw = allocator.alloc_raw(3 * 4096 + 1).expect("raw");
        assert_eq!(raw.count(), 4);
        assert_eq!(allocator.pages_total(), 4);
        assert_eq!(allocator.stats().raw_allocs, 1);
        allocator.free_raw(raw);
        assert_eq!(allocator.pages_total(), 0);
    }
}

//! SGV pools: the per-pool cache plus the public alloc/free paths.
//!
//! A pool hands out scatter-gather lists whose backing pages total a
//! requested byte size. Requests up to `2^max_order` pages are rounded to
//! a power-of-two order and served from per-order buckets of recycled
//! objects; larger (or explicitly uncached) requests get a one-shot object
//! that bypasses the cache. Returned objects are timestamped, filed in
//! their bucket and on the pool LRU, and reclaimed by the pool's purge
//! worker, the cross-pool shrinker, or an explicit flush.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::cache::PoolCache;
use crate::cluster::{alloc_sg_entries, ClusteringMode};
use crate::error::SgvError;
use crate::mem_limit::MemLimit;
use crate::obj::SgvObj;
use crate::page::{SgEntry, TransTblEnt};
use crate::registry::{ActivePools, OwnerTag, Shared};
use crate::source::{AllocCookie, PageSource};
use crate::stats::{BucketCounters, PoolStats, RegimeCounters};
use crate::timer::TaskHandle;

/// Behaviour switches for [`SgvPool::alloc`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocFlags {
    /// Force the one-shot regime; never insert into a cache.
    pub no_cached: bool,
    /// On a cache miss, return without calling the page source.
    pub no_alloc_on_cache_miss: bool,
    /// When the fill fails (or is declined by `no_alloc_on_cache_miss`),
    /// hand the empty object back for a later retry.
    pub return_obj_on_alloc_fail: bool,
}

impl AllocFlags {
    /// No flags set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets [`AllocFlags::no_cached`].
    #[must_use]
    pub fn with_no_cached(mut self) -> Self {
        self.no_cached = true;
        self
    }

    /// Sets [`AllocFlags::no_alloc_on_cache_miss`].
    #[must_use]
    pub fn with_no_alloc_on_cache_miss(mut self) -> Self {
        self.no_alloc_on_cache_miss = true;
        self
    }

    /// Sets [`AllocFlags::return_obj_on_alloc_fail`].
    #[must_use]
    pub fn with_return_obj_on_alloc_fail(mut self) -> Self {
        self.return_obj_on_alloc_fail = true;
        self
    }
}

/// Why an allocation produced no SG list, plus the empty object when the
/// caller asked for it back.
#[derive(Debug)]
pub struct AllocFailure {
    /// The underlying error.
    pub error: SgvError,
    /// The empty object, present only with
    /// [`AllocFlags::return_obj_on_alloc_fail`] in the cacheable regime.
    pub retry_obj: Option<SgvHandle>,
}

impl From<SgvError> for AllocFailure {
    fn from(error: SgvError) -> Self {
        Self {
            error,
            retry_obj: None,
        }
    }
}

impl fmt::Display for AllocFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "allocation failed: {}", self.error)
    }
}

impl std::error::Error for AllocFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// A live allocation (or an empty object awaiting a retry).
///
/// Dropping a handle returns it to the allocator without touching any
/// quota; call [`SgvHandle::free`] to release a quota charge too.
pub struct SgvHandle {
    obj: Option<Box<SgvObj>>,
    pool: Arc<SgvPool>,
    count: usize,
}

impl SgvHandle {
    fn new(obj: Box<SgvObj>, pool: Arc<SgvPool>, count: usize) -> Self {
        Self {
            obj: Some(obj),
            pool,
            count,
        }
    }

    fn obj(&self) -> &SgvObj {
        self.obj.as_deref().expect("handle already released")
    }

    pub(crate) fn into_parts(mut self) -> (Box<SgvObj>, Arc<SgvPool>) {
        let obj = self.obj.take().expect("handle already released");
        let pool = Arc::clone(&self.pool);
        (obj, pool)
    }

    /// The SG entries reported for this allocation. Empty for a handle
    /// returned through `retry_obj`.
    #[must_use]
    pub fn sg(&self) -> &[SgEntry] {
        &self.obj().sg_entries[..self.count]
    }

    /// Number of reported SG entries.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// True when no pages are currently mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Capacity of the backing object, in pages.
    #[must_use]
    pub fn pages(&self) -> u64 {
        self.obj().capacity_pages()
    }

    /// False for one-shot objects that bypass the cache.
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        self.obj().is_cacheable()
    }

    /// The translation table: slot `p` names the 1-based SG entry holding
    /// logical page `p`. Empty unless the pool clusters.
    #[must_use]
    pub fn translation(&self) -> &[TransTblEnt] {
        &self.obj().trans_tbl
    }

    /// The per-allocation cookie, as passed to [`SgvPool::alloc`].
    #[must_use]
    pub fn cookie(&self) -> Option<&AllocCookie> {
        self.obj().cookie.as_ref()
    }

    /// The owning pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<SgvPool> {
        &self.pool
    }

    /// Releases the allocation and refunds `mem_lim` by its page count.
    ///
    /// Cacheable objects go back to their bucket with the tail trim
    /// reverted; one-shot objects release their pages through the adapter
    /// immediately.
    pub fn free(mut self, mem_lim: Option<&MemLimit>) {
        self.release(mem_lim);
    }

    fn release(&mut self, mem_lim: Option<&MemLimit>) {
        let Some(mut obj) = self.obj.take() else {
            return;
        };
        let pages = obj.backing_pages();
        if obj.is_cacheable() {
            if obj.sg_count != 0 {
                let last = obj.orig_sg;
                obj.sg_entries[last].length = obj.orig_length;
            }
            self.pool.put_obj(obj);
        } else {
            if obj.sg_count != 0 {
                self.pool
                    .page_source()
                    .free_pages(obj.live_entries(), obj.cookie.as_ref());
            }
            self.pool.ctx.unadmit(pages);
        }
        if let Some(lim) = mem_lim {
            lim.sub(pages);
        }
    }
}

impl Drop for SgvHandle {
    fn drop(&mut self) {
        self.release(None);
    }
}

impl fmt::Debug for SgvHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SgvHandle")
            .field("pool", &self.pool.name)
            .field("count", &self.count)
            .field("released", &self.obj.is_none())
            .finish()
    }
}

/// A named allocation pool.
///
/// Created through [`crate::SgvAllocator::create`]; destroyed by dropping
/// its references via [`crate::SgvAllocator::destroy`].
pub struct SgvPool {
    name: String,
    clustering: ClusteringMode,
    owner: Option<OwnerTag>,
    pub(crate) ctx: Arc<Shared>,
    source: RwLock<Arc<dyn PageSource>>,
    pub(crate) cache: Mutex<PoolCache>,
    refs: AtomicUsize,
    bucket_counters: Vec<BucketCounters>,
    big: RegimeCounters,
    other: RegimeCounters,
}

impl SgvPool {
    pub(crate) fn new(
        name: &str,
        clustering: ClusteringMode,
        owner: Option<OwnerTag>,
        ctx: Arc<Shared>,
    ) -> Self {
        let max_order = ctx.config().max_order;
        let source = Arc::clone(&ctx.default_source);
        Self {
            name: name.to_string(),
            clustering,
            owner,
            source: RwLock::new(source),
            cache: Mutex::new(PoolCache::new(max_order)),
            refs: AtomicUsize::new(1),
            bucket_counters: (0..=max_order).map(|_| BucketCounters::new()).collect(),
            big: RegimeCounters::new(),
            other: RegimeCounters::new(),
            ctx,
        }
    }

    /// The pool's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pool's clustering mode.
    #[must_use]
    pub fn clustering(&self) -> ClusteringMode {
        self.clustering
    }

    pub(crate) fn owner(&self) -> Option<OwnerTag> {
        self.owner
    }

    /// Replaces the pool's page source. Affects subsequent fills; objects
    /// already filled still free through the source they came from only if
    /// the new source accepts their entries, so swap before allocating.
    pub fn set_page_source(&self, source: Arc<dyn PageSource>) {
        *self.source.write() = source;
    }

    pub(crate) fn page_source(&self) -> Arc<dyn PageSource> {
        Arc::clone(&self.source.read())
    }

    /// Allocates an SG list covering `size` bytes.
    ///
    /// `supplied` re-fills an empty object previously handed back through
    /// [`AllocFailure::retry_obj`]. `mem_lim` is charged by the object's
    /// page capacity before any pool state changes and fully refunded on
    /// failure. `cookie` travels with the object into every page-source
    /// call.
    pub fn alloc(
        self: &Arc<Self>,
        size: usize,
        flags: AllocFlags,
        supplied: Option<SgvHandle>,
        mem_lim: Option<&MemLimit>,
        cookie: Option<AllocCookie>,
    ) -> Result<SgvHandle, AllocFailure> {
        if size == 0 {
            return Err(SgvError::invalid("zero size").into());
        }
        if flags.no_cached && flags.return_obj_on_alloc_fail {
            return Err(
                SgvError::invalid("return_obj_on_alloc_fail requires a cacheable request").into(),
            );
        }

        let cfg = self.ctx.config();
        let page_shift = cfg.page_shift();
        let pages = (size + cfg.page_size - 1) >> page_shift;
        let order = order_for(pages);

        if let Some(handle) = supplied {
            self.alloc_supplied(handle, size, pages, order, flags, mem_lim)
        } else if order <= cfg.max_order && !flags.no_cached {
            self.alloc_cached(size, pages, order, flags, mem_lim, cookie)
        } else {
            self.alloc_oneshot(size, pages, flags, mem_lim, cookie)
        }
    }

    /// Evicts every cached object without destroying the pool.
    pub fn flush(&self) {
        let max_order = self.ctx.config().max_order;
        for order in 0..=max_order {
            loop {
                let obj = {
                    let mut reg = self.ctx.active.lock();
                    let mut cache = self.cache.lock();
                    match cache.bucket_head(order) {
                        Some(slot) => self.evict_locked(&mut reg, &mut cache, slot),
                        None => break,
                    }
                };
                self.destroy_obj(obj);
            }
        }
    }

    /// Snapshot of the pool's counters and gauges.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let (cached_entries, cached_pages, inactive_cached_pages) = {
            let cache = self.cache.lock();
            (
                cache.cached_entries,
                cache.cached_pages,
                cache.inactive_cached_pages,
            )
        };
        PoolStats {
            name: self.name.clone(),
            cached_entries,
            cached_pages,
            inactive_cached_pages,
            buckets: self
                .bucket_counters
                .iter()
                .enumerate()
                .map(|(order, counters)| counters.snapshot(order))
                .collect(),
            big: self.big.snapshot(),
            other: self.other.snapshot(),
        }
    }

    // -------------------------------------------------------------------------
    // Allocation regimes
    // -------------------------------------------------------------------------

    fn alloc_supplied(
        self: &Arc<Self>,
        handle: SgvHandle,
        size: usize,
        pages: usize,
        order: usize,
        flags: AllocFlags,
        mem_lim: Option<&MemLimit>,
    ) -> Result<SgvHandle, AllocFailure> {
        let (obj, from_pool) = handle.into_parts();
        debug_assert!(
            Arc::ptr_eq(&from_pool, self),
            "supplied object belongs to another pool"
        );
        debug_assert_eq!(obj.order_or_pages, order as i32, "supplied object order");
        debug_assert_eq!(obj.sg_count, 0, "supplied object must be empty");

        let pages_to_alloc = 1u64 << order;
        if !charge_quota(mem_lim, pages_to_alloc) {
            self.discard_counted_obj(obj);
            return Err(SgvError::OutOfMemory.into());
        }
        if !self.ctx.admit(pages_to_alloc) {
            release_quota(mem_lim, pages_to_alloc);
            self.discard_counted_obj(obj);
            return Err(SgvError::OutOfMemory.into());
        }
        self.fill_cacheable(obj, size, pages, order, flags, mem_lim)
    }

    fn alloc_cached(
        self: &Arc<Self>,
        size: usize,
        pages: usize,
        order: usize,
        flags: AllocFlags,
        mem_lim: Option<&MemLimit>,
        cookie: Option<AllocCookie>,
    ) -> Result<SgvHandle, AllocFailure> {
        let pages_to_alloc = 1u64 << order;
        if !charge_quota(mem_lim, pages_to_alloc) {
            return Err(SgvError::OutOfMemory.into());
        }

        let mut obj = self.get_obj(order);
        if obj.sg_count != 0 {
            // Full cache hit: the object still holds its pages.
            self.bucket_counters[order].record_hit();
            return Ok(self.finish_cacheable(obj, size, pages, order));
        }

        if flags.no_alloc_on_cache_miss && !flags.return_obj_on_alloc_fail {
            release_quota(mem_lim, pages_to_alloc);
            self.discard_counted_obj(obj);
            return Err(SgvError::OutOfMemory.into());
        }

        obj.reserve_storage(1 << order, self.clustering.is_clustered());
        obj.cookie = cookie;

        if flags.no_alloc_on_cache_miss {
            release_quota(mem_lim, pages_to_alloc);
            return Err(AllocFailure {
                error: SgvError::OutOfMemory,
                retry_obj: Some(SgvHandle::new(obj, Arc::clone(self), 0)),
            });
        }

        if !self.ctx.admit(pages_to_alloc) {
            release_quota(mem_lim, pages_to_alloc);
            self.discard_counted_obj(obj);
            return Err(SgvError::OutOfMemory.into());
        }

        self.fill_cacheable(obj, size, pages, order, flags, mem_lim)
    }

    fn alloc_oneshot(
        self: &Arc<Self>,
        size: usize,
        pages: usize,
        flags: AllocFlags,
        mem_lim: Option<&MemLimit>,
        cookie: Option<AllocCookie>,
    ) -> Result<SgvHandle, AllocFailure> {
        let cfg = self.ctx.config();
        let pages_to_alloc = pages as u64;

        if !charge_quota(mem_lim, pages_to_alloc) {
            return Err(SgvError::OutOfMemory.into());
        }
        if flags.no_alloc_on_cache_miss {
            release_quota(mem_lim, pages_to_alloc);
            return Err(SgvError::OutOfMemory.into());
        }

        let mut obj = SgvObj::new_uncacheable(pages);
        obj.cookie = cookie;
        obj.reserve_storage(pages, false);

        if !self.ctx.admit(pages_to_alloc) {
            release_quota(mem_lim, pages_to_alloc);
            return Err(SgvError::OutOfMemory.into());
        }

        let source = self.page_source();
        let count = {
            let obj_mut = &mut *obj;
            alloc_sg_entries(
                &mut obj_mut.sg_entries,
                None,
                pages,
                self.clustering,
                source.as_ref(),
                obj_mut.cookie.as_ref(),
                cfg.page_shift(),
            )
        };
        obj.sg_count = count;
        if count == 0 {
            self.ctx.unadmit(pages_to_alloc);
            release_quota(mem_lim, pages_to_alloc);
            return Err(SgvError::OutOfMemory.into());
        }

        let saved = (pages - count) as u64;
        let regime = if flags.no_cached {
            &self.other
        } else {
            &self.big
        };
        regime.record_fill(pages_to_alloc, saved);
        regime.record_alloc();

        trace!(
            pool = %self.name,
            pages,
            count,
            "one-shot allocation"
        );

        let residue = size & (cfg.page_size - 1);
        if residue != 0 {
            obj.sg_entries[count - 1].length -= (cfg.page_size - residue) as u32;
        }
        Ok(SgvHandle::new(obj, Arc::clone(self), count))
    }

    /// Runs the page source over an admitted, quota-charged cacheable
    /// object and finishes the allocation; undoes both charges on failure.
    fn fill_cacheable(
        self: &Arc<Self>,
        mut obj: Box<SgvObj>,
        size: usize,
        pages: usize,
        order: usize,
        flags: AllocFlags,
        mem_lim: Option<&MemLimit>,
    ) -> Result<SgvHandle, AllocFailure> {
        let cfg = self.ctx.config();
        let pages_to_alloc = 1usize << order;
        let clustered = self.clustering.is_clustered();
        let source = self.page_source();

        let count = {
            let obj_mut = &mut *obj;
            let tbl = if clustered {
                Some(&mut obj_mut.trans_tbl)
            } else {
                None
            };
            alloc_sg_entries(
                &mut obj_mut.sg_entries,
                tbl,
                pages_to_alloc,
                self.clustering,
                source.as_ref(),
                obj_mut.cookie.as_ref(),
                cfg.page_shift(),
            )
        };
        obj.sg_count = count;

        if count == 0 {
            self.ctx.unadmit(pages_to_alloc as u64);
            release_quota(mem_lim, pages_to_alloc as u64);
            if flags.return_obj_on_alloc_fail {
                return Err(AllocFailure {
                    error: SgvError::OutOfMemory,
                    retry_obj: Some(SgvHandle::new(obj, Arc::clone(self), 0)),
                });
            }
            self.discard_counted_obj(obj);
            return Err(SgvError::OutOfMemory.into());
        }

        self.bucket_counters[order].record_merged((pages_to_alloc - count) as u64);
        Ok(self.finish_cacheable(obj, size, pages, order))
    }

    /// Common success tail for the cacheable regime: reported-count
    /// computation, capacity trim for clustered objects, residue trim, and
    /// the bookkeeping needed to revert both on free.
    fn finish_cacheable(
        self: &Arc<Self>,
        mut obj: Box<SgvObj>,
        size: usize,
        pages: usize,
        order: usize,
    ) -> SgvHandle {
        let cfg = self.ctx.config();
        self.bucket_counters[order].record_alloc();

        let clustered = self.clustering.is_clustered();
        let count = if clustered {
            obj.trans_tbl[pages - 1].sg_num as usize
        } else {
            // One page per entry; report exactly the requested pages.
            pages
        };
        let last = count - 1;
        obj.orig_sg = last;
        obj.orig_length = obj.sg_entries[last].length;
        if clustered {
            // The bucket may hold more pages than requested; cut the last
            // reported entry down to the requested page count.
            let first_page = obj.trans_tbl[last].pg_count as usize;
            obj.sg_entries[last].length = ((pages - first_page) << cfg.page_shift()) as u32;
        }

        let residue = size & (cfg.page_size - 1);
        if residue != 0 {
            obj.sg_entries[last].length -= (cfg.page_size - residue) as u32;
        }

        SgvHandle::new(obj, Arc::clone(self), count)
    }

    // -------------------------------------------------------------------------
    // Cache traffic
    // -------------------------------------------------------------------------

    /// Gets a cached object for `order`, or a counted fresh shell.
    ///
    /// A returned object with `sg_count != 0` is a full cache hit. A fresh
    /// (or cached-empty) shell is already included in `cached_entries` /
    /// `cached_pages`; every failure path afterwards must route it through
    /// [`Self::discard_counted_obj`] or hand it to the caller.
    fn get_obj(self: &Arc<Self>, order: usize) -> Box<SgvObj> {
        let pages = 1u64 << order;
        {
            let mut cache = self.cache.lock();
            if let Some(obj) = cache.pop_bucket(order) {
                cache.inactive_cached_pages -= pages;
                return obj;
            }
        }

        // Miss: enrolment may be needed, so take the registry lock first.
        let mut reg = self.ctx.active.lock();
        let mut cache = self.cache.lock();
        if let Some(obj) = cache.pop_bucket(order) {
            cache.inactive_cached_pages -= pages;
            return obj;
        }
        if cache.cached_entries == 0 {
            reg.enrol(Arc::clone(self));
        }
        cache.cached_entries += 1;
        cache.cached_pages += pages;
        drop(cache);
        drop(reg);

        SgvObj::new_cacheable(order)
    }

    /// Files a returned object back into the cache and arms the purge
    /// worker if idle. Never sleeps.
    pub(crate) fn put_obj(self: &Arc<Self>, mut obj: Box<SgvObj>) {
        let pages = obj.capacity_pages();
        obj.timestamp = self.ctx.clock.now_ms();

        let mut cache = self.cache.lock();
        debug_assert!(
            !cache.tearing_down,
            "object returned to a pool being destroyed"
        );
        cache.insert(obj, self.clustering.is_clustered());
        cache.inactive_cached_pages += pages;
        if !cache.purge_scheduled {
            cache.purge_scheduled = true;
            cache.purge_task = Some(self.arm_purge());
        }
    }

    /// Un-counts a shell that never made it out: the failure dual of the
    /// miss path in [`Self::get_obj`].
    fn discard_counted_obj(&self, obj: Box<SgvObj>) {
        debug_assert_eq!(obj.sg_count, 0, "discarding an object that holds pages");
        let pages = obj.capacity_pages();
        let mut reg = self.ctx.active.lock();
        let mut cache = self.cache.lock();
        cache.cached_entries -= 1;
        cache.cached_pages -= pages;
        if cache.cached_entries == 0 {
            reg.remove(self);
        }
    }

    // -------------------------------------------------------------------------
    // Reclaim
    // -------------------------------------------------------------------------

    /// Unlinks `slot` from the cache under both locks, maintaining every
    /// gauge and the active-ring membership. The caller destroys the
    /// returned object with no locks held.
    pub(crate) fn evict_locked(
        &self,
        reg: &mut ActivePools,
        cache: &mut PoolCache,
        slot: usize,
    ) -> Box<SgvObj> {
        let obj = cache.remove(slot);
        let pages = obj.capacity_pages();
        cache.inactive_cached_pages -= pages;
        cache.cached_entries -= 1;
        cache.cached_pages -= pages;
        if cache.cached_entries == 0 {
            reg.remove(self);
        }
        if obj.sg_count != 0 {
            self.ctx.unadmit(pages);
        }
        obj
    }

    /// Releases an evicted object's pages through the adapter. Must be
    /// called with no locks held.
    pub(crate) fn destroy_obj(&self, obj: Box<SgvObj>) {
        trace!(pool = %self.name, obj = ?obj, "destroying sgv object");
        if obj.sg_count != 0 {
            self.page_source()
                .free_pages(obj.live_entries(), obj.cookie.as_ref());
        }
    }

    /// The purge worker body: destroys LRU-head objects older than the
    /// purge interval, then rearms only if it stopped at a younger one.
    pub(crate) fn purge_expired(self: &Arc<Self>) {
        let now = self.ctx.clock.now_ms();
        let stale_after = self.ctx.config().purge_interval.as_millis() as u64;
        let mut cleared = false;

        loop {
            let obj = {
                let mut reg = self.ctx.active.lock();
                let mut cache = self.cache.lock();
                if !cleared {
                    cache.purge_scheduled = false;
                    cache.purge_task = None;
                    cleared = true;
                }
                let Some(slot) = cache.lru_head() else { break };
                let timestamp = cache.obj_at(slot).timestamp;
                if now < timestamp.saturating_add(stale_after) {
                    // Head too young: come back after a full period rather
                    // than polling as each object expires.
                    if !cache.tearing_down {
                        cache.purge_scheduled = true;
                        cache.purge_task = Some(self.arm_purge());
                    }
                    break;
                }
                self.evict_locked(&mut reg, &mut cache, slot)
            };
            self.destroy_obj(obj);
        }
    }

    fn arm_purge(self: &Arc<Self>) -> TaskHandle {
        let weak = Arc::downgrade(self);
        self.ctx.scheduler.schedule(
            self.ctx.config().purge_interval,
            Box::new(move || {
                if let Some(pool) = weak.upgrade() {
                    pool.purge_expired();
                }
            }),
        )
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    pub(crate) fn grab(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn put_ref(self: &Arc<Self>) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.teardown();
        }
    }

    fn teardown(self: &Arc<Self>) {
        debug!(pool = %self.name, "destroying pool");

        // Stop the purge worker for good; cancel_sync waits out a run in
        // flight, and tearing_down keeps a concurrent run from rearming.
        loop {
            let handle = {
                let mut cache = self.cache.lock();
                cache.tearing_down = true;
                cache.purge_scheduled = false;
                cache.purge_task.take()
            };
            match handle {
                Some(handle) => self.ctx.scheduler.cancel_sync(handle),
                None => break,
            }
        }

        self.flush();
        debug_assert_eq!(
            self.cache.lock().cached_entries,
            0,
            "pool destroyed with outstanding allocations"
        );

        let mut pools = self.ctx.pools.lock();
        pools.retain(|pool| !Arc::ptr_eq(pool, self));
    }
}

impl fmt::Debug for SgvPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cache = self.cache.lock();
        f.debug_struct("SgvPool")
            .field("name", &self.name)
            .field("clustering", &self.clustering)
            .field("cached_entries", &cache.cached_entries)
            .field("cached_pages", &cache.cached_pages)
            .field("inactive_cached_pages", &cache.inactive_cached_pages)
            .finish()
    }
}

/// Smallest order whose `2^order` pages cover `pages`.
fn order_for(pages: usize) -> usize {
    pages.next_power_of_two().trailing_zeros() as usize
}

fn charge_quota(mem_lim: Option<&MemLimit>, pages: u64) -> bool {
    mem_lim.map_or(true, |lim| lim.add(pages))
}

fn release_quota(mem_lim: Option<&MemLimit>, pages: u64) {
    if let Some(lim) = mem_lim {
        lim.sub(pages);
    }
}

//! Per-pool cache lists.
//!
//! Every free object is simultaneously a member of two collections: its
//! order bucket's free-list and the pool-wide LRU. Both must support O(1)
//! unlink of an arbitrary member, so the lists are realized as doubly
//! linked index chains through one slot arena; a slot carries both link
//! pairs, and removing an object detaches it from both lists at once.
//!
//! The whole structure, gauges included, lives behind the pool lock.

use crate::obj::SgvObj;
use crate::timer::TaskHandle;

#[derive(Debug, Clone, Copy, Default)]
struct ListHead {
    head: Option<usize>,
    tail: Option<usize>,
}

#[derive(Debug)]
struct Slot {
    obj: Option<Box<SgvObj>>,
    bucket_prev: Option<usize>,
    bucket_next: Option<usize>,
    lru_prev: Option<usize>,
    lru_next: Option<usize>,
}

impl Slot {
    fn new(obj: Box<SgvObj>) -> Self {
        Self {
            obj: Some(obj),
            bucket_prev: None,
            bucket_next: None,
            lru_prev: None,
            lru_next: None,
        }
    }
}

/// The lock-protected half of a pool: free-lists, LRU, gauges, purge state.
#[derive(Debug)]
pub(crate) struct PoolCache {
    slots: Vec<Slot>,
    free_slots: Vec<usize>,
    buckets: Vec<ListHead>,
    lru: ListHead,
    /// Objects created for the cache: free-listed plus lent out.
    pub(crate) cached_entries: usize,
    /// Pages those objects account for.
    pub(crate) cached_pages: u64,
    /// Pages sitting in free-lists.
    pub(crate) inactive_cached_pages: u64,
    /// Whether a purge task is currently armed.
    pub(crate) purge_scheduled: bool,
    /// Handle of the armed purge task, for synchronous cancellation.
    pub(crate) purge_task: Option<TaskHandle>,
    /// Set once the pool starts tearing down; the purge worker must not
    /// rearm past this point.
    pub(crate) tearing_down: bool,
}

impl PoolCache {
    pub(crate) fn new(max_order: usize) -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            buckets: vec![ListHead::default(); max_order + 1],
            lru: ListHead::default(),
            cached_entries: 0,
            cached_pages: 0,
            inactive_cached_pages: 0,
            purge_scheduled: false,
            purge_task: None,
            tearing_down: false,
        }
    }

    /// Head slot of `order`'s free-list, if any.
    pub(crate) fn bucket_head(&self, order: usize) -> Option<usize> {
        self.buckets[order].head
    }

    /// Oldest free object in the pool, if any.
    pub(crate) fn lru_head(&self) -> Option<usize> {
        self.lru.head
    }

    /// The object parked in `slot`.
    pub(crate) fn obj_at(&self, slot: usize) -> &SgvObj {
        self.slots[slot]
            .obj
            .as_deref()
            .expect("referenced cache slot is vacant")
    }

    /// Pops the head of `order`'s free-list: the cache-hit path.
    pub(crate) fn pop_bucket(&mut self, order: usize) -> Option<Box<SgvObj>> {
        let slot = self.buckets[order].head?;
        Some(self.remove(slot))
    }

    /// Unlinks `slot` from both lists and returns its object.
    pub(crate) fn remove(&mut self, slot: usize) -> Box<SgvObj> {
        self.bucket_unlink(slot);
        self.lru_unlink(slot);
        let obj = self.slots[slot]
            .obj
            .take()
            .expect("removed cache slot is vacant");
        self.free_slots.push(slot);
        obj
    }

    /// Files a returned object in its bucket and at the LRU tail.
    ///
    /// Clustered pools keep each bucket sorted by ascending `sg_count`, so
    /// better-clustered objects are handed out first; the incoming object
    /// goes just before the first one with an equal or larger count, which
    /// keeps ties LIFO. Unclustered buckets are plain LIFO stacks.
    pub(crate) fn insert(&mut self, obj: Box<SgvObj>, clustered: bool) {
        let order = obj.order();
        let sg_count = obj.sg_count;

        let slot = match self.free_slots.pop() {
            Some(idx) => {
                self.slots[idx] = Slot::new(obj);
                idx
            }
            None => {
                self.slots.push(Slot::new(obj));
                self.slots.len() - 1
            }
        };

        if clustered {
            let mut at = self.buckets[order].head;
            while let Some(idx) = at {
                if self.obj_at(idx).sg_count >= sg_count {
                    break;
                }
                at = self.slots[idx].bucket_next;
            }
            match at {
                Some(idx) => self.bucket_insert_before(order, slot, idx),
                None => self.bucket_push_tail(order, slot),
            }
        } else {
            self.bucket_push_head(order, slot);
        }

        self.lru_push_tail(slot);
    }

    /// Number of free-listed objects, across all buckets.
    #[cfg(test)]
    pub(crate) fn free_listed(&self) -> usize {
        let mut count = 0;
        let mut at = self.lru.head;
        while let Some(idx) = at {
            count += 1;
            at = self.slots[idx].lru_next;
        }
        count
    }

    fn bucket_push_head(&mut self, order: usize, slot: usize) {
        let old_head = self.buckets[order].head;
        self.slots[slot].bucket_prev = None;
        self.slots[slot].bucket_next = old_head;
        match old_head {
            Some(idx) => self.slots[idx].bucket_prev = Some(slot),
            None => self.buckets[order].tail = Some(slot),
        }
        self.buckets[order].head = Some(slot);
    }

    fn bucket_push_tail(&mut self, order: usize, slot: usize) {
        let old_tail = self.buckets[order].tail;
        self.slots[slot].bucket_prev = old_tail;
        self.slots[slot].bucket_next = None;
        match old_tail {
            Some(idx) => self.slots[idx].bucket_next = Some(slot),
            None => self.buckets[order].head = Some(slot),
        }
        self.buckets[order].tail = Some(slot);
    }

    fn bucket_insert_before(&mut self, order: usize, slot: usize, before: usize) {
        let prev = self.slots[before].bucket_prev;
        self.slots[slot].bucket_prev = prev;
        self.slots[slot].bucket_next = Some(before);
        self.slots[before].bucket_prev = Some(slot);
        match prev {
            Some(idx) => self.slots[idx].bucket_next = Some(slot),
            None => self.buckets[order].head = Some(slot),
        }
    }

    fn bucket_unlink(&mut self, slot: usize) {
        let order = self.obj_at(slot).order();
        let prev = self.slots[slot].bucket_prev;
        let next = self.slots[slot].bucket_next;
        match prev {
            Some(idx) => self.slots[idx].bucket_next = next,
            None => self.buckets[order].head = next,
        }
        match next {
            Some(idx) => self.slots[idx].bucket_prev = prev,
            None => self.buckets[order].tail = prev,
        }
        self.slots[slot].bucket_prev = None;
        self.slots[slot].bucket_next = None;
    }

    fn lru_push_tail(&mut self, slot: usize) {
        let old_tail = self.lru.tail;
        self.slots[slot].lru_prev = old_tail;
        self.slots[slot].lru_next = None;
        match old_tail {
            Some(idx) => self.slots[idx].lru_next = Some(slot),
            None => self.lru.head = Some(slot),
        }
        self.lru.tail = Some(slot);
    }

    fn lru_unlink(&mut self, slot: usize) {
        let prev = self.slots[slot].lru_prev;
        let next = self.slots[slot].lru_next;
        match prev {
            Some(idx) => self.slots[idx].lru_next = next,
            None => self.lru.head = next,
        }
        match next {
            Some(idx) => self.slots[idx].lru_prev = prev,
            None => self.lru.tail = prev,
        }
        self.slots[slot].lru_prev = None;
        self.slots[slot].lru_next = None;
    }
}

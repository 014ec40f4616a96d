//! Model-checked invariants over randomized operation sequences.
//!
//! A reference model tracks every live handle and the expected cache
//! content (as a sequence, mirroring LRU order); after each operation the
//! allocator's observable gauges must match the model exactly.

mod common;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use common::{rig, Rig, PAGE};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sgv_pool::{AllocFlags, ClusteringMode, SgvConfig, SgvHandle, SgvPool};

const MAX_ORDER: usize = 6;

struct Model {
    /// Free-listed object orders in return order (the pool LRU).
    cached: VecDeque<usize>,
    /// Live cacheable handles, by order.
    live_cacheable: Vec<usize>,
    /// Live one-shot handles, by exact page count.
    live_oneshot: Vec<u64>,
}

impl Model {
    fn new() -> Self {
        Self {
            cached: VecDeque::new(),
            live_cacheable: Vec::new(),
            live_oneshot: Vec::new(),
        }
    }

    fn cached_pages(&self) -> u64 {
        self.cached.iter().map(|&order| 1u64 << order).sum()
    }

    fn expected_pages_total(&self) -> u64 {
        let live: u64 = self.live_cacheable.iter().map(|&o| 1u64 << o).sum();
        let oneshot: u64 = self.live_oneshot.iter().sum();
        live + oneshot + self.cached_pages()
    }

    fn expected_cached_entries(&self) -> usize {
        self.live_cacheable.len() + self.cached.len()
    }

    /// A hit pops the most recently returned object of that order.
    fn take_hit(&mut self, order: usize) -> bool {
        let Some(pos) = self.cached.iter().rposition(|&o| o == order) else {
            return false;
        };
        self.cached.remove(pos);
        true
    }

    fn file_return(&mut self, order: usize) {
        self.cached.push_back(order);
    }

    /// Mirrors a shrink sweep: whole objects from the LRU head until the
    /// request is covered or the total reaches the low watermark.
    fn shrink(&mut self, mut nr: u64, lo_wmk: u64) {
        while nr > 0 && !self.cached.is_empty() && self.expected_pages_total() > lo_wmk {
            let order = self.cached.pop_front().expect("non-empty");
            nr = nr.saturating_sub(1 << order);
        }
    }
}

fn check(rig: &Rig, pool: &Arc<SgvPool>, model: &Model) {
    let stats = pool.stats();
    assert_eq!(
        rig.allocator.pages_total(),
        model.expected_pages_total(),
        "pages_total must equal pages backing all live objects"
    );
    assert_eq!(
        stats.inactive_cached_pages,
        model.cached_pages(),
        "inactive pages must equal the free-listed sum"
    );
    assert_eq!(stats.cached_entries, model.expected_cached_entries());

    // Activity is exactly non-emptiness of the cache accounting.
    let active = rig.allocator.active_pools().contains(&"inv".to_string());
    assert_eq!(
        active,
        stats.cached_entries > 0,
        "active ring membership must track cached_entries"
    );

    // The page source has exactly the accounted pages outstanding.
    assert_eq!(rig.source.outstanding_pages(), model.expected_pages_total());
}

#[test]
fn invariants_hold_over_random_sequences() {
    let lo_wmk = 4;
    let r = rig(
        SgvConfig::new(1 << 20, lo_wmk)
            .with_max_order(MAX_ORDER)
            .with_purge_interval(Duration::from_secs(3600))
            .with_shrink_age(Duration::from_secs(1)),
    );
    let pool = r
        .allocator
        .create("inv", ClusteringMode::None)
        .expect("pool");

    let mut rng = StdRng::seed_from_u64(0x5611);
    let mut model = Model::new();
    let mut handles: Vec<(SgvHandle, bool, usize, u64)> = Vec::new();

    for _ in 0..600 {
        match rng.gen_range(0..10u32) {
            // Cacheable alloc.
            0..=4 => {
                let pages = rng.gen_range(1..=(1usize << MAX_ORDER));
                let size = pages * PAGE - rng.gen_range(0..PAGE);
                let order = pages.next_power_of_two().trailing_zeros() as usize;

                let before_hits: u64 =
                    pool.stats().buckets.iter().map(|b| b.hit_alloc).sum();
                let handle = pool
                    .alloc(size, AllocFlags::new(), None, None, None)
                    .expect("cacheable alloc");
                let after_hits: u64 =
                    pool.stats().buckets.iter().map(|b| b.hit_alloc).sum();

                let expect_hit = model.take_hit(order);
                assert_eq!(
                    after_hits - before_hits,
                    u64::from(expect_hit),
                    "hit iff the bucket had a free object"
                );
                model.live_cacheable.push(order);
                handles.push((handle, true, order, 0));
            }
            // One-shot alloc, past the largest bucket.
            5 => {
                let pages = rng.gen_range((1usize << MAX_ORDER) + 1..=150);
                let handle = pool
                    .alloc(pages * PAGE, AllocFlags::new(), None, None, None)
                    .expect("one-shot alloc");
                model.live_oneshot.push(pages as u64);
                handles.push((handle, false, 0, pages as u64));
            }
            // Free a random handle.
            6..=8 => {
                if handles.is_empty() {
                    continue;
                }
                let idx = rng.gen_range(0..handles.len());
                let (handle, cacheable, order, pages) = handles.swap_remove(idx);
                handle.free(None);
                if cacheable {
                    let pos = model
                        .live_cacheable
                        .iter()
                        .position(|&o| o == order)
                        .expect("model live entry");
                    model.live_cacheable.swap_remove(pos);
                    model.file_return(order);
                } else {
                    let pos = model
                        .live_oneshot
                        .iter()
                        .position(|&p| p == pages)
                        .expect("model one-shot entry");
                    model.live_oneshot.swap_remove(pos);
                }
            }
            // Reclaim under an aged clock, or flush.
            _ => {
                if rng.gen_bool(0.5) {
                    r.clock.advance(Duration::from_secs(2));
                    let nr = rng.gen_range(1..=16);
                    r.allocator.reclaim(nr);
                    model.shrink(nr, lo_wmk);
                } else {
                    pool.flush();
                    model.cached.clear();
                }
            }
        }
        check(&r, &pool, &model);
    }

    // Drain and verify the final state is fully reclaimable.
    for (handle, ..) in handles {
        handle.free(None);
    }
    pool.flush();
    assert_eq!(r.allocator.pages_total(), 0);
    assert_eq!(r.source.outstanding_pages(), 0);
    r.allocator.destroy(pool);
}

#[test]
fn alloc_free_alloc_is_a_hit_with_restored_tail() {
    let r = rig(SgvConfig::new(1024, 512));
    let pool = r
        .allocator
        .create("p6", ClusteringMode::None)
        .expect("pool");

    let size = 3 * PAGE + 777;
    let handle = pool
        .alloc(size, AllocFlags::new(), None, None, None)
        .expect("alloc");
    let first_frame = handle.sg()[0].page;
    let trimmed = handle.sg()[3].length;
    assert_eq!(trimmed, 777);
    handle.free(None);
    assert_eq!(pool.stats().inactive_cached_pages, 4);

    let handle = pool
        .alloc(size, AllocFlags::new(), None, None, None)
        .expect("realloc");
    assert_eq!(handle.sg()[0].page, first_frame, "served from the bucket");
    assert_eq!(handle.sg()[3].length, 777, "trim re-applied after restore");
    let stats = pool.stats();
    assert_eq!(stats.buckets[2].hit_alloc, 1);
    assert_eq!(stats.inactive_cached_pages, 0);

    handle.free(None);
    r.allocator.destroy(pool);
}

#[test]
fn full_clustering_counts_contiguous_runs() {
    // Interleave ascending runs arbitrarily: the entry count must equal
    // the number of runs, whichever way the pages arrive.
    let mut rng = StdRng::seed_from_u64(0xC1_05);
    for _ in 0..25 {
        let run_count = rng.gen_range(1..=5usize);
        let mut runs: Vec<VecDeque<u64>> = (0..run_count)
            .map(|i| {
                let base = 1000 * (i as u64 + 1);
                let len = rng.gen_range(1..=6u64);
                (base..base + len).collect()
            })
            .collect();

        let mut frames = Vec::new();
        while runs.iter().any(|r| !r.is_empty()) {
            let pick = rng.gen_range(0..runs.len());
            if let Some(frame) = runs[pick].pop_front() {
                frames.push(frame);
            }
        }

        let pages = frames.len();
        let r = rig(SgvConfig::new(1 << 20, 512).with_max_order(8));
        let pool = r
            .allocator
            .create("runs", ClusteringMode::Full)
            .expect("pool");

        // Pad the script up to the bucket capacity with isolated frames.
        let capacity = pages.next_power_of_two();
        let mut script = frames.clone();
        for i in 0..(capacity - pages) {
            script.push(1_000_000 + 10 * i as u64);
        }
        pool.set_page_source(Arc::new(common::ScriptedSource::new(&script)));

        let handle = pool
            .alloc(capacity * PAGE, AllocFlags::new(), None, None, None)
            .expect("alloc");
        let expected = run_count + (capacity - pages);
        assert_eq!(
            handle.count(),
            expected,
            "entries must equal maximal contiguous runs for {frames:?}"
        );

        // Translation table sanity: monotonic, in range, and consistent
        // with each entry's first page.
        let tbl = handle.translation();
        let mut prev = 1;
        for slot in tbl {
            assert!(slot.sg_num >= prev && slot.sg_num <= expected as u32);
            prev = slot.sg_num;
        }
        for (i, entry) in handle.sg().iter().enumerate() {
            let first_page = tbl[i].pg_count as usize;
            assert_eq!(tbl[first_page].sg_num as usize, i + 1);
            let span = entry.page_span(12) as usize;
            for p in first_page..first_page + span {
                assert_eq!(tbl[p].sg_num as usize, i + 1);
            }
        }

        handle.free(None);
        r.allocator.destroy(pool);
    }
}

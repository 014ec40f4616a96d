//! Page clustering engine.
//!
//! Clustering merges physically adjacent pages into fewer, longer SG
//! entries while the list is being filled, one page at a time. The merge
//! check runs against the freshly placed tail entry; on success the tail
//! is folded into an earlier entry and removed, so the live entries are
//! always a dense prefix of the list.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::constants::{INLINE_SG_ENTRIES, INLINE_TRANS_ENTRIES};
use crate::page::{SgEntry, TransTblEnt};
use crate::source::{AllocCookie, PageSource};

/// How a pool merges adjacent pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusteringMode {
    /// Every page becomes its own SG entry.
    None,
    /// Merge only with the immediately preceding entry.
    Tail,
    /// Merge with any prior entry, extending it at either end.
    Full,
}

impl ClusteringMode {
    /// True for any mode that merges.
    #[inline]
    #[must_use]
    pub const fn is_clustered(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// SG vector storage; inline below [`crate::constants::MAX_LOCAL_ORDER`].
pub(crate) type SgVec = SmallVec<[SgEntry; INLINE_SG_ENTRIES]>;

/// Translation-table storage; inline below
/// [`crate::constants::MAX_TRANS_ORDER`].
pub(crate) type TransVec = SmallVec<[TransTblEnt; INLINE_TRANS_ENTRIES]>;

/// Tries to merge `sg`'s tail entry into the entry at `i`.
///
/// A head merge fires when `i` starts exactly where the tail ends (the new
/// page precedes `i`): the tail's page becomes `i`'s first page. A tail
/// merge fires when `i` ends exactly where the tail starts. Either way the
/// merge target must consist of whole pages on the growing side.
fn try_merge_at(sg: &mut [SgEntry], i: usize, page_shift: u32) -> bool {
    let cur = sg.len() - 1;
    let cur_entry = sg[cur];
    let target = sg[i];

    if target.page == cur_entry.end_frame(page_shift) && cur_entry.is_full_pages(page_shift) {
        sg[i].page = cur_entry.page;
        sg[i].length += cur_entry.length;
        return true;
    }
    if target.end_frame(page_shift) == cur_entry.page && target.is_full_pages(page_shift) {
        sg[i].length += cur_entry.length;
        return true;
    }
    false
}

/// Full clustering: check the most recent merge target first, then scan
/// backwards over all prior entries.
fn check_full_clustering(sg: &mut [SgEntry], hint: Option<usize>, page_shift: u32) -> Option<usize> {
    let cur = sg.len() - 1;
    if cur == 0 {
        return None;
    }

    if let Some(h) = hint {
        if h < cur && try_merge_at(sg, h, page_shift) {
            return Some(h);
        }
    }

    // TODO: replace the linear scan with an end-frame index if pools with
    // very fragmented sources ever show up hot here.
    for i in (0..cur).rev() {
        if try_merge_at(sg, i, page_shift) {
            return Some(i);
        }
    }
    None
}

/// Tail clustering: only the immediately preceding entry may grow.
fn check_tail_clustering(sg: &mut [SgEntry], page_shift: u32) -> Option<usize> {
    let cur = sg.len() - 1;
    if cur == 0 {
        return None;
    }
    let prev = cur - 1;
    let cur_entry = sg[cur];
    if sg[prev].end_frame(page_shift) == cur_entry.page && sg[prev].is_full_pages(page_shift) {
        sg[prev].length += cur_entry.length;
        return Some(prev);
    }
    None
}

/// Populates the translation table for a freshly clustered list.
///
/// Slot `p` (a logical page position) gets `sg_num`, the 1-based entry
/// containing page `p`; slot `e` (an entry index) gets `pg_count`, the
/// logical position of entry `e`'s first page.
fn populate_trans_tbl(sg: &[SgEntry], tbl: &mut TransVec, pages: usize, page_shift: u32) {
    tbl.clear();
    tbl.resize(pages, TransTblEnt::default());

    let mut pg = 0usize;
    for (i, entry) in sg.iter().enumerate() {
        let span = entry.page_span(page_shift) as usize;
        tbl[i].pg_count = pg as u32;
        for _ in 0..span {
            tbl[pg].sg_num = (i + 1) as u32;
            pg += 1;
        }
    }
    debug_assert_eq!(pg, pages, "translation table must cover every page");
}

/// Fills `sg` with `pages` pages from `source`, clustering as it goes.
///
/// Returns the resulting SG entry count. If any page allocation fails the
/// partial list is released through the source and 0 is returned with `sg`
/// empty. When `trans_tbl` is given (clustered, cacheable objects) it is
/// rebuilt to cover all `pages`.
pub(crate) fn alloc_sg_entries(
    sg: &mut SgVec,
    trans_tbl: Option<&mut TransVec>,
    pages: usize,
    mode: ClusteringMode,
    source: &dyn PageSource,
    cookie: Option<&AllocCookie>,
    page_shift: u32,
) -> usize {
    sg.clear();
    sg.reserve(pages);

    let mut hint = None;
    for _ in 0..pages {
        let Some(entry) = source.alloc_page(cookie) else {
            source.free_pages(sg, cookie);
            sg.clear();
            return 0;
        };
        sg.push(entry);

        let merged = match mode {
            ClusteringMode::Full => check_full_clustering(sg, hint, page_shift),
            ClusteringMode::Tail => check_tail_clustering(sg, page_shift),
            ClusteringMode::None => None,
        };
        if merged.is_some() {
            sg.pop();
        }
        hint = merged;
    }

    if mode.is_clustered() {
        if let Some(tbl) = trans_tbl {
            populate_trans_tbl(sg, tbl, pages, page_shift);
        }
    }

    sg.len()
}

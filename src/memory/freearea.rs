// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The buddy free-area of a zone.
//!
//! Free blocks are kept per `(order, migratetype)` as sequences of head
//! PFNs; the tail of each sequence is the list head (most recently freed
//! first). All mutation happens under the zone's `free_area` lock; the
//! per-order block counters and `free_pages` are atomics so watermark and
//! fragmentation checks can read them speculatively.

use alloc::vec::Vec;

use log::trace;

use crate::error::{MmError, MmResult};
use crate::memory::page::PageFlags;
use crate::memory::zone::Zone;
use crate::memory::{
    MigrateType, Pfn, MAX_ORDER, MIGRATE_TYPES, PAGEBLOCK_NR_PAGES, PAGEBLOCK_ORDER,
};
use core::sync::atomic::Ordering;

/// Per-zone buddy buckets. Lives inside the zone's `free_area` lock.
#[derive(Default)]
pub struct FreeArea {
    pub(crate) lists: [[Vec<Pfn>; MIGRATE_TYPES]; MAX_ORDER],
}

impl FreeArea {
    /// Head of the `(order, migratetype)` list, if any.
    pub(crate) fn head(&self, order: usize, mt: MigrateType) -> Option<Pfn> {
        self.lists[order][mt as usize].last().copied()
    }

    pub(crate) fn is_empty(&self, order: usize, mt: MigrateType) -> bool {
        self.lists[order][mt as usize].is_empty()
    }
}

fn list_remove(list: &mut Vec<Pfn>, pfn: Pfn) {
    let pos = list
        .iter()
        .position(|&p| p == pfn)
        .expect("block is on its free list");
    list.remove(pos);
}

impl Zone {
    /// Free one block of `2^order` pages at `pfn`, merging with free
    /// buddies as far as possible. Caller holds the free-area lock.
    pub(crate) fn free_one_page(&self, fa: &mut FreeArea, pfn: Pfn, order: usize) {
        debug_assert!(self.pfn_valid(pfn));
        debug_assert!(!self.page(pfn).is_buddy() && !self.page(pfn).is_lru());

        self.counters.free_pages.fetch_add(1 << order, Ordering::Relaxed);

        let mut pfn = pfn;
        let mut order = order;
        while order < MAX_ORDER - 1 {
            let buddy = pfn ^ (1 << order);
            if buddy < self.start_pfn() || buddy + (1 << order) > self.end_pfn() {
                break;
            }
            let bpage = self.page(buddy);
            if !bpage.is_valid() || !bpage.is_buddy() || bpage.order() != order {
                break;
            }

            // Detach the buddy and combine; the lower of the two heads the
            // merged block.
            let bmt = self.pageblock_migratetype(buddy);
            list_remove(&mut fa.lists[order][bmt as usize], buddy);
            self.counters.nr_free[order].fetch_sub(1, Ordering::Relaxed);
            bpage.clear(PageFlags::BUDDY);
            bpage.set_order(0);

            pfn = pfn.min(buddy);
            order += 1;
        }

        let head = self.page(pfn);
        head.set_order(order);
        head.set(PageFlags::BUDDY);
        let mt = self.pageblock_migratetype(pfn);
        fa.lists[order][mt as usize].push(pfn);
        self.counters.nr_free[order].fetch_add(1, Ordering::Relaxed);
    }

    /// Take the buddy block headed by `pfn` off its free list and split it
    /// into individually addressable order-0 pages.
    ///
    /// Guarded by the low watermark: carving up a block when the zone is
    /// short on memory would only help an allocation that reclaim should
    /// satisfy instead. Returns the number of pages produced, 0 on refusal.
    pub(crate) fn split_free_page(&self, fa: &mut FreeArea, pfn: Pfn) -> usize {
        let page = self.page(pfn);
        debug_assert!(page.is_buddy());
        let order = page.order();

        let watermark = self.low_wmark_pages() + (1 << order);
        if !self.watermark_ok(0, watermark) {
            return 0;
        }

        let mt = self.pageblock_migratetype(pfn);
        list_remove(&mut fa.lists[order][mt as usize], pfn);
        self.counters.nr_free[order].fetch_sub(1, Ordering::Relaxed);
        self.counters.free_pages.fetch_sub(1 << order, Ordering::Relaxed);
        page.clear(PageFlags::BUDDY);
        page.set_order(0);

        // Whoever ends up with a near-pageblock chunk gets to own the
        // block's mobility tag.
        if order >= PAGEBLOCK_ORDER - 1 {
            let mut p = pfn;
            while p < pfn + (1 << order) {
                self.set_pageblock_migratetype(p, MigrateType::Movable);
                p += PAGEBLOCK_NR_PAGES;
            }
        }

        1 << order
    }

    /// Atomically claim the buddy block headed by `pfn` from the
    /// `(block order, mt)` list for an order-`alloc_order` allocation,
    /// returning the tail of the block to the free lists.
    ///
    /// Caller holds the free-area lock and found `pfn` on that list; the
    /// watermark may still refuse the claim.
    pub(crate) fn capture_free_page(
        &self,
        fa: &mut FreeArea,
        pfn: Pfn,
        alloc_order: usize,
        mt: MigrateType,
    ) -> bool {
        let page = self.page(pfn);
        debug_assert!(page.is_buddy());
        let order = page.order();
        debug_assert!(order >= alloc_order);

        let watermark = self.low_wmark_pages() + (1 << order);
        if !self.watermark_ok(0, watermark) {
            return false;
        }

        list_remove(&mut fa.lists[order][mt as usize], pfn);
        self.counters.nr_free[order].fetch_sub(1, Ordering::Relaxed);
        self.counters.free_pages.fetch_sub(1 << alloc_order, Ordering::Relaxed);
        page.clear(PageFlags::BUDDY);
        page.set_order(0);

        if alloc_order != order {
            self.expand(fa, pfn, alloc_order, order, mt);
        }

        if order >= PAGEBLOCK_ORDER - 1 {
            let mut p = pfn;
            while p < pfn + (1 << alloc_order) {
                self.set_pageblock_migratetype(p, MigrateType::Movable);
                p += PAGEBLOCK_NR_PAGES;
            }
        }

        trace!(
            "captured order-{} block at pfn {:#x} from an order-{} buddy",
            alloc_order,
            pfn,
            order
        );
        true
    }

    /// Return the unused upper halves of a split block to the free lists.
    fn expand(&self, fa: &mut FreeArea, pfn: Pfn, low: usize, high: usize, mt: MigrateType) {
        let mut size = 1usize << high;
        let mut order = high;
        while order > low {
            order -= 1;
            size >>= 1;
            let tail = pfn + size;
            let tpage = self.page(tail);
            tpage.set_order(order);
            tpage.set(PageFlags::BUDDY);
            fa.lists[order][mt as usize].push(tail);
            self.counters.nr_free[order].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Allocate a `2^order` block, preferring `mt` and falling back to the
    /// other per-cpu types and CMA. RESERVE and ISOLATE lists are never
    /// raided.
    pub fn alloc_page(&self, order: usize, mt: MigrateType) -> MmResult<Pfn> {
        let mut fa = self.free_area.lock();

        let fallbacks = [
            MigrateType::Unmovable,
            MigrateType::Reclaimable,
            MigrateType::Movable,
            MigrateType::Cma,
        ];
        for o in order..MAX_ORDER {
            if let Some(pfn) = self.rmqueue(&mut fa, o, order, mt) {
                return Ok(pfn);
            }
        }
        for o in order..MAX_ORDER {
            for &fb in fallbacks.iter().filter(|&&fb| fb != mt) {
                if let Some(pfn) = self.rmqueue(&mut fa, o, order, fb) {
                    return Ok(pfn);
                }
            }
        }
        Err(MmError::OutOfMemory)
    }

    fn rmqueue(
        &self,
        fa: &mut FreeArea,
        order: usize,
        alloc_order: usize,
        mt: MigrateType,
    ) -> Option<Pfn> {
        let pfn = fa.head(order, mt)?;
        fa.lists[order][mt as usize].pop();
        self.counters.nr_free[order].fetch_sub(1, Ordering::Relaxed);
        self.counters
            .free_pages
            .fetch_sub(1 << alloc_order, Ordering::Relaxed);
        let page = self.page(pfn);
        page.clear(PageFlags::BUDDY);
        page.set_order(0);
        if order > alloc_order {
            self.expand(fa, pfn, alloc_order, order, mt);
        }
        Some(pfn)
    }

    /// Give a private list of isolated order-0 pages back to the buddy
    /// allocator. Returns how many pages were released.
    pub(crate) fn release_freepages(&self, list: &mut Vec<Pfn>) -> usize {
        if list.is_empty() {
            return 0;
        }
        let count = list.len();
        let mut fa = self.free_area.lock();
        for pfn in list.drain(..) {
            self.free_one_page(&mut fa, pfn, 0);
        }
        count
    }

    /// Head of the `(order, mt)` free list, for callers probing the
    /// allocator state.
    pub fn find_free_block(&self, order: usize, mt: MigrateType) -> Option<Pfn> {
        self.free_area.lock().head(order, mt)
    }

    /// `(blocks per order, free pages)` at this instant.
    pub fn free_area_snapshot(&self) -> ([usize; MAX_ORDER], usize) {
        let mut blocks = [0usize; MAX_ORDER];
        for (order, slot) in blocks.iter_mut().enumerate() {
            *slot = self.nr_free_blocks(order);
        }
        (blocks, self.free_pages())
    }
}

// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Memory compaction for the reduction of external fragmentation.
//!
//! Two cursors sweep a zone toward each other: the migrate cursor walks up
//! from the zone start isolating movable in-use pages, the free cursor
//! walks down from the zone end isolating free pages. The migration engine
//! moves each isolated page into an isolated free frame, so vacated frames
//! accumulate (and merge) at the low end of the zone while the in-use
//! population packs the high end. The run ends when the cursors meet, when
//! the requested allocation could succeed, or when contention/signals cut
//! it short.
//!
//! Note that this heavily depends upon page migration to do all the real
//! heavy lifting.

use alloc::vec::Vec;
use core::mem;

use log::{debug, trace};

use crate::error::MmError;
use crate::memory::freearea::FreeArea;
use crate::memory::lru::IsolateMode;
use crate::memory::migrate::{migrate_pages, MigrateMode, NewPageSource};
use crate::memory::zone::Zone;
use crate::memory::{
    AllocFlags, MigrateType, Pfn, PfnBatch, COMPACT_CLUSTER_MAX, MAX_ORDER, MAX_ORDER_NR_PAGES,
    MIGRATE_PCPTYPES, PAGEBLOCK_NR_PAGES, PAGEBLOCK_ORDER, SWAP_CLUSTER_MAX,
};
use crate::params;
use crate::sched::TaskState;
use crate::stats;
use crate::sync::{ContendedMutex, MutexGuard};

/// Result of one zone pass (and of the preflight check).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CompactStatus {
    /// Compaction cannot help this zone right now; try reclaim instead.
    Skipped,
    /// Work remains; keep scanning.
    Continue,
    /// The run stopped early: the request can be satisfied, a page was
    /// captured, or contention/signals/memory pressure ended the pass.
    Partial,
    /// The whole zone was scanned.
    Complete,
}

enum IsolateResult {
    /// Abort the whole zone pass.
    Abort,
    /// Nothing isolated from this block; the cursor moved on.
    Skip,
    /// A batch is ready for migration.
    Success,
}

/// Run-local state of one zone compaction pass.
pub struct CompactControl<'a> {
    pub(crate) zone: &'a Zone,
    pub(crate) task: &'a dyn TaskState,
    /// Requested allocation order; `None` compacts the whole zone
    /// regardless of watermarks.
    pub(crate) order: Option<usize>,
    pub(crate) migratetype: MigrateType,
    pub(crate) sync: bool,
    /// Low cursor: next PFN to scan for migration candidates.
    pub(crate) migrate_pfn: Pfn,
    /// High cursor: page-block aligned, scans downward for free pages.
    pub(crate) free_pfn: Pfn,
    /// Isolated in-use pages awaiting migration.
    pub(crate) migratepages: PfnBatch,
    /// Isolated order-0 free pages used as migration targets.
    pub(crate) freepages: Vec<Pfn>,
    /// Cached batch size; stays valid while the migration engine owns the
    /// batch (`update_nr_listpages` resyncs it afterwards).
    pub(crate) nr_migratepages: usize,
    /// Set when an async run backed out because of lock contention.
    pub(crate) contended: bool,
    /// Direct-compactor handoff slot for a captured free block.
    pub(crate) capture: Option<&'a mut Option<Pfn>>,
}

/// Compaction takes coarse locks that are potentially very heavily
/// contended. Back out of async runs when the lock is fought over or the
/// task should yield; sync runs reschedule and only give up on a fatal
/// signal.
///
/// Returns the (re)acquired guard, or `None` if compaction should abort.
fn compact_checklock<'z, T>(
    lock: &'z ContendedMutex<T>,
    held: Option<MutexGuard<'z, T>>,
    cc: &mut CompactControl<'_>,
) -> Option<MutexGuard<'z, T>> {
    let mut held = held;
    if cc.task.need_resched() || lock.is_contended() {
        held = None;

        if !cc.sync {
            cc.contended = true;
            return None;
        }

        cc.task.cond_resched();
        if cc.task.fatal_signal_pending() {
            return None;
        }
    }

    match held {
        Some(guard) => Some(guard),
        None => Some(lock.lock()),
    }
}

/// Arch-level allocation bookkeeping would hook in here for pages leaving
/// the free lists; the model only sanity-checks them.
fn map_pages(zone: &Zone, list: &[Pfn]) {
    for &pfn in list {
        debug_assert!(!zone.page(pfn).is_buddy());
        debug_assert_eq!(zone.page(pfn).order(), 0);
    }
}

/// Is this page-block a place the free scanner may take pages from?
fn suitable_migration_target(zone: &Zone, pfn: Pfn) -> bool {
    let mt = zone.pageblock_migratetype(pfn);

    // Blocks held back for emergency allocations or hot-unplug are
    // off-limits.
    if mt == MigrateType::Isolate || mt == MigrateType::Reserve {
        return false;
    }

    // A block that already is one free buddy chunk can only get better.
    let page = zone.page(pfn);
    if page.is_buddy() && page.order() >= PAGEBLOCK_ORDER {
        return true;
    }

    mt.async_suitable()
}

/// Isolate free pages in `[block_start, end_pfn)` onto `freelist`, splitting
/// every buddy block found down to order 0. Caller holds the zone lock.
///
/// In strict mode any invalid PFN, in-use page or refused split voids the
/// whole call (pages already moved to `freelist` are the caller's to
/// release); non-strict mode takes whatever it can find.
pub(crate) fn isolate_freepages_block(
    zone: &Zone,
    block_start: Pfn,
    end_pfn: Pfn,
    fa: &mut FreeArea,
    freelist: &mut Vec<Pfn>,
    strict: bool,
) -> usize {
    let mut nr_scanned = 0;
    let mut total_isolated = 0;

    let mut pfn = block_start;
    while pfn < end_pfn {
        if !zone.pfn_valid_within(pfn) {
            if strict {
                return 0;
            }
            pfn += 1;
            continue;
        }
        nr_scanned += 1;

        if !zone.page(pfn).is_buddy() {
            if strict {
                return 0;
            }
            pfn += 1;
            continue;
        }

        let isolated = zone.split_free_page(fa, pfn);
        if isolated == 0 && strict {
            return 0;
        }
        total_isolated += isolated;
        for p in pfn..pfn + isolated {
            freelist.push(p);
        }

        pfn += isolated.max(1);
    }

    trace!(
        "free scan [{:#x}, {:#x}): {} scanned, {} isolated",
        block_start,
        end_pfn,
        nr_scanned,
        total_isolated
    );
    total_isolated
}

/// Isolate the whole free range `[start_pfn, end_pfn)` for a caller that
/// needs every page of it (strict mode per block).
///
/// On success returns the PFN one past the range; the isolated pages now
/// belong to the caller. If any part of the range cannot be isolated,
/// everything is released again and 0 is returned.
pub fn isolate_freepages_range(zone: &Zone, start_pfn: Pfn, end_pfn: Pfn) -> usize {
    let mut freelist: Vec<Pfn> = Vec::new();

    let mut pfn = start_pfn;
    while pfn < end_pfn {
        if !zone.pfn_valid(pfn) {
            break;
        }

        let block_end = round_up!(pfn + 1, PAGEBLOCK_NR_PAGES).min(end_pfn);
        let isolated = {
            let mut fa = zone.free_area.lock();
            isolate_freepages_block(zone, pfn, block_end, &mut fa, &mut freelist, true)
        };
        if isolated == 0 {
            break;
        }
        pfn += isolated;
    }

    map_pages(zone, &freelist);

    if pfn < end_pfn {
        zone.release_freepages(&mut freelist);
        return 0;
    }
    pfn
}

/// Isolate migration candidates from `[low_pfn, end_pfn)` onto
/// `cc.migratepages`, up to `COMPACT_CLUSTER_MAX` pages, dropping the LRU
/// lock at bounded intervals so other LRU walkers make progress.
///
/// Returns the PFN where the next scan should resume, or `None` when the
/// zone already has too many isolated pages (async) or a fatal signal
/// arrived while throttling.
pub fn isolate_migratepages_range(
    zone: &Zone,
    cc: &mut CompactControl<'_>,
    low_pfn: Pfn,
    end_pfn: Pfn,
) -> Option<Pfn> {
    // Parallel compactors and reclaimers share the isolated counters;
    // piling on more isolation would destabilize reclaim.
    while zone.too_many_isolated() {
        if !cc.sync {
            return None;
        }

        cc.task.congestion_wait();

        if cc.task.fatal_signal_pending() {
            return None;
        }
    }

    cc.task.cond_resched();

    let mut locked = Some(zone.lru.lock());
    let mut low_pfn = low_pfn;
    let mut nr_scanned = 0;
    let mut nr_isolated = 0;
    let mut last_pageblock: Option<usize> = None;

    while low_pfn < end_pfn {
        // Periodically give the LRU lock away.
        if (low_pfn + 1) % SWAP_CLUSTER_MAX == 0 {
            locked = None;
        }
        locked = match compact_checklock(&zone.lru, locked.take(), cc) {
            Some(guard) => Some(guard),
            None => break,
        };

        // An invalid lead PFN voids its whole maximal buddy block.
        if low_pfn % MAX_ORDER_NR_PAGES == 0 && !zone.pfn_valid(low_pfn) {
            low_pfn += MAX_ORDER_NR_PAGES;
            continue;
        }
        if !zone.pfn_valid_within(low_pfn) {
            low_pfn += 1;
            continue;
        }
        nr_scanned += 1;

        let page = zone.page(low_pfn);

        // Free pages are the other scanner's business.
        if page.is_buddy() {
            low_pfn += 1;
            continue;
        }

        // Async runs only pay for page-blocks they can fully drain.
        let pageblock = low_pfn >> PAGEBLOCK_ORDER;
        if !cc.sync
            && last_pageblock != Some(pageblock)
            && !zone.pageblock_migratetype(low_pfn).async_suitable()
        {
            last_pageblock = Some(pageblock);
            low_pfn = round_up!(low_pfn + PAGEBLOCK_NR_PAGES, PAGEBLOCK_NR_PAGES);
            continue;
        }

        if !page.is_lru() {
            low_pfn += 1;
            continue;
        }

        // Huge pages migrate through their own path; step over the whole
        // compound.
        if page.is_huge_head() {
            low_pfn += 1 << page.order();
            continue;
        }

        let mode = if cc.sync {
            IsolateMode::Sync
        } else {
            IsolateMode::AsyncMigrate
        };
        if zone.isolate_lru_page(low_pfn, mode).is_err() {
            low_pfn += 1;
            continue;
        }
        debug_assert!(!page.is_compound());

        let ll = locked.as_mut().expect("LRU lock is held at isolation");
        zone.del_page_from_lru(ll, low_pfn);
        cc.migratepages.push(low_pfn);
        nr_isolated += 1;
        low_pfn += 1;

        if cc.migratepages.len() == COMPACT_CLUSTER_MAX {
            break;
        }
    }

    zone.acct_isolated(&cc.migratepages);
    drop(locked);

    trace!(
        "migrate scan: {} scanned, {} isolated, resume at {:#x}",
        nr_scanned,
        nr_isolated,
        low_pfn
    );
    Some(low_pfn)
}

impl<'a> CompactControl<'a> {
    pub fn new(
        zone: &'a Zone,
        task: &'a dyn TaskState,
        order: Option<usize>,
        migratetype: MigrateType,
        sync: bool,
        capture: Option<&'a mut Option<Pfn>>,
    ) -> CompactControl<'a> {
        CompactControl {
            zone,
            task,
            order,
            migratetype,
            sync,
            migrate_pfn: 0,
            free_pfn: 0,
            migratepages: PfnBatch::new(),
            freepages: Vec::new(),
            nr_migratepages: 0,
            contended: false,
            capture,
        }
    }

    /// Did an async run back out due to lock contention?
    pub fn contended(&self) -> bool {
        self.contended
    }

    /// Resync the cached batch size with the list the migration engine
    /// handed back.
    fn update_nr_listpages(&mut self) {
        self.nr_migratepages = self.migratepages.len();
    }

    /// High-cursor scan: walk page-blocks downward isolating free pages
    /// until supply covers the pending migration batch or the cursors
    /// would cross.
    fn isolate_freepages(&mut self) {
        let zone = self.zone;
        let zone_end = zone.end_pfn();

        // Keep a full page-block of distance so the scanners never work
        // the same block.
        let low_pfn = self.migrate_pfn + PAGEBLOCK_NR_PAGES;
        let mut pfn = self.free_pfn;
        let mut high_pfn = low_pfn.min(pfn);

        while pfn > low_pfn && self.nr_migratepages > self.freepages.len() {
            if zone.pfn_valid(pfn) && suitable_migration_target(zone, pfn) {
                // The zone lock protects the free lists and is very
                // coarse; async runs refuse to spin on it.
                let mut fa = match compact_checklock(&zone.free_area, None, self) {
                    Some(guard) => guard,
                    None => break,
                };

                // Re-check now that racing allocators are locked out.
                let mut isolated = 0;
                if suitable_migration_target(zone, pfn) {
                    let end = (pfn + PAGEBLOCK_NR_PAGES).min(zone_end);
                    isolated =
                        isolate_freepages_block(zone, pfn, end, &mut fa, &mut self.freepages, false);
                }
                drop(fa);

                if isolated > 0 {
                    high_pfn = high_pfn.max(pfn);
                }
            }

            pfn -= PAGEBLOCK_NR_PAGES;
        }

        map_pages(zone, &self.freepages);

        self.free_pfn = high_pfn;
    }

    /// Low-cursor step: isolate one page-block's worth of migration
    /// candidates.
    fn isolate_migratepages(&mut self) -> IsolateResult {
        let zone = self.zone;

        let low_pfn = self.migrate_pfn.max(zone.start_pfn());
        let end_pfn = round_up!(low_pfn + PAGEBLOCK_NR_PAGES, PAGEBLOCK_NR_PAGES);

        // Never cross the free scanner, and skip blocks with an invalid
        // lead page.
        if end_pfn > self.free_pfn || !zone.pfn_valid(low_pfn) {
            self.migrate_pfn = end_pfn;
            return IsolateResult::Skip;
        }

        match isolate_migratepages_range(zone, self, low_pfn, end_pfn) {
            None => IsolateResult::Abort,
            Some(pfn) => {
                self.migrate_pfn = pfn;
                self.nr_migratepages = self.migratepages.len();
                if self.contended {
                    // No forward progress is possible against a contended
                    // lock; end the pass instead of spinning on it.
                    IsolateResult::Abort
                } else {
                    IsolateResult::Success
                }
            }
        }
    }

    /// Opportunistically claim a newly-formed high-order block for the
    /// requester before any racing allocator sees it.
    fn compact_capture_page(&mut self) {
        match &self.capture {
            None => return,
            Some(slot) if slot.is_some() => return,
            Some(_) => {}
        }
        let order = match self.order {
            Some(order) => order,
            None => return,
        };
        let zone = self.zone;

        // A MOVABLE request may capture from any per-cpu freelist: it
        // claims at least a pageblock, so no foreign block gets polluted
        // with hard-to-move pages. Everything else stays within its own
        // migratetype.
        let (mt_low, mt_high) = if self.migratetype == MigrateType::Movable {
            (0usize, MIGRATE_PCPTYPES)
        } else {
            (self.migratetype as usize, self.migratetype as usize + 1)
        };

        let mut captured = None;
        'search: for mt_raw in mt_low..mt_high {
            let mt = MigrateType::from_u8(mt_raw as u8);
            for o in order..MAX_ORDER {
                // Speculative look without the zone lock.
                if zone.nr_free_blocks(o) == 0 {
                    continue;
                }

                let mut fa = match compact_checklock(&zone.free_area, None, self) {
                    Some(guard) => guard,
                    None => return,
                };
                if let Some(pfn) = fa.head(o, mt) {
                    if zone.capture_free_page(&mut fa, pfn, order, mt) {
                        captured = Some(pfn);
                        break 'search;
                    }
                }
                // Lost the race for this bucket; keep looking.
            }
        }

        if let Some(pfn) = captured {
            debug!("captured order-{} page at pfn {:#x}", order, pfn);
            if let Some(slot) = self.capture.as_deref_mut() {
                *slot = Some(pfn);
            }
        }
    }

    /// Has the run reached one of its termination conditions?
    fn compact_finished(&mut self) -> CompactStatus {
        let zone = self.zone;

        if self.task.fatal_signal_pending() {
            return CompactStatus::Partial;
        }

        // The scanners met: every block has been looked at.
        if self.free_pfn <= self.migrate_pfn {
            return CompactStatus::Complete;
        }

        // Whole-zone runs only end by cursor-meet.
        let order = match self.order {
            Some(order) => order,
            None => return CompactStatus::Continue,
        };

        let watermark = zone.low_wmark_pages() + (1 << order);
        if !zone.watermark_ok(order, watermark) {
            return CompactStatus::Continue;
        }

        match &self.capture {
            // Direct compactor: only a captured page ends the run early.
            Some(slot) => {
                if slot.is_some() {
                    return CompactStatus::Partial;
                }
            }
            None => {
                let fa = zone.free_area.lock();
                for o in order..MAX_ORDER {
                    // Job done if a block of the right migratetype is free.
                    if !fa.is_empty(o, self.migratetype) {
                        return CompactStatus::Partial;
                    }
                    // Job done if the allocation would claim a whole
                    // page-block (its migratetype follows the allocation).
                    if order >= PAGEBLOCK_ORDER && zone.nr_free_blocks(o) > 0 {
                        return CompactStatus::Partial;
                    }
                }
            }
        }

        CompactStatus::Continue
    }
}

/// The migration engine pulls its destination frames from the run's
/// private freelist, refilling via the high-cursor scan on demand.
impl<'a> NewPageSource for CompactControl<'a> {
    fn next_free_page(&mut self) -> Option<Pfn> {
        if self.freepages.is_empty() {
            self.isolate_freepages();

            if self.freepages.is_empty() {
                return None;
            }
        }

        self.freepages.pop()
    }
}

/// Should compaction be attempted at all, and is it even necessary?
pub fn compaction_suitable(zone: &Zone, order: Option<usize>) -> CompactStatus {
    let order = match order {
        // Whole-zone compaction runs regardless of watermarks.
        None => return CompactStatus::Continue,
        Some(order) => order,
    };

    // Compaction consumes free pages while it works; if the zone cannot
    // cover the request twice over, reclaim has to run first.
    let watermark = zone.low_wmark_pages() + (2 << order);
    if !zone.watermark_ok(0, watermark) {
        return CompactStatus::Skipped;
    }

    let fragindex = zone.fragmentation_index(order);
    if fragindex >= 0 && fragindex <= params::extfrag_threshold() {
        return CompactStatus::Skipped;
    }

    if fragindex == -1000 && zone.watermark_ok(order, watermark) {
        return CompactStatus::Partial;
    }

    CompactStatus::Continue
}

/// One full compaction pass over a zone.
pub(crate) fn compact_zone(cc: &mut CompactControl<'_>) -> CompactStatus {
    let zone = cc.zone;

    let mut ret = compaction_suitable(zone, cc.order);
    match ret {
        CompactStatus::Partial | CompactStatus::Skipped => return ret,
        _ => {}
    }

    cc.migrate_pfn = zone.start_pfn();
    cc.free_pfn = round_down!(zone.start_pfn() + zone.spanned_pages(), PAGEBLOCK_NR_PAGES);

    loop {
        ret = cc.compact_finished();
        if ret != CompactStatus::Continue {
            break;
        }

        match cc.isolate_migratepages() {
            IsolateResult::Abort => {
                zone.putback_lru_pages(&mut cc.migratepages);
                cc.update_nr_listpages();
                ret = CompactStatus::Partial;
                break;
            }
            IsolateResult::Skip => continue,
            IsolateResult::Success => {}
        }

        let nr_migrate = cc.nr_migratepages;
        let mode = if cc.sync {
            MigrateMode::SyncLight
        } else {
            MigrateMode::Async
        };

        let mut batch = mem::replace(&mut cc.migratepages, PfnBatch::new());
        let err = migrate_pages(zone, &mut batch, cc, mode);
        cc.migratepages = batch;
        cc.update_nr_listpages();
        let nr_remaining = cc.nr_migratepages;

        stats::count_compact_blocks();
        stats::count_compact_pages((nr_migrate - nr_remaining) as u64);
        if nr_remaining > 0 {
            stats::count_compact_page_failed(nr_remaining as u64);
        }
        trace!(
            "migration batch: {} moved, {} remaining",
            nr_migrate - nr_remaining,
            nr_remaining
        );

        match err {
            Err(MmError::OutOfMemory) => {
                // No destination pages left; give the stragglers back and
                // call it a day.
                zone.putback_lru_pages(&mut cc.migratepages);
                cc.update_nr_listpages();
                ret = CompactStatus::Partial;
                break;
            }
            Err(_) | Ok(_) => {
                if !cc.migratepages.is_empty() {
                    zone.putback_lru_pages(&mut cc.migratepages);
                    cc.update_nr_listpages();
                }
            }
        }

        // Hand a suitable block to the requester before anybody races us
        // to it.
        cc.compact_capture_page();
    }

    // Every exit path drains the private freelist back to the buddy.
    zone.release_freepages(&mut cc.freepages);
    debug_assert!(cc.freepages.is_empty());

    ret
}

/// Compact one zone for an order-`order` allocation.
///
/// Returns the run status and whether an async run aborted on contention.
pub fn compact_zone_order(
    zone: &Zone,
    order: usize,
    flags: AllocFlags,
    sync: bool,
    task: &dyn TaskState,
    capture: Option<&mut Option<Pfn>>,
) -> (CompactStatus, bool) {
    let mut cc = CompactControl::new(
        zone,
        task,
        Some(order),
        flags.migratetype(),
        sync,
        capture,
    );
    let status = compact_zone(&mut cc);
    (status, cc.contended)
}

/// Direct compaction entry point: try each zone of the caller's zonelist
/// until one of them can satisfy the allocation.
///
/// `capture`, when supplied, receives a block captured directly for the
/// caller, bypassing the allocator.
pub fn try_to_compact_pages(
    zonelist: &[&Zone],
    order: usize,
    flags: AllocFlags,
    sync: bool,
    task: &dyn TaskState,
    mut capture: Option<&mut Option<Pfn>>,
) -> (CompactStatus, bool) {
    let mut rc = CompactStatus::Skipped;
    let mut contended = false;

    // Compaction blocks on coarse locks and leans on the allocator's I/O
    // paths; callers that cannot tolerate either get a straight refusal,
    // as do order-0 requests that fragmentation cannot hurt.
    if order == 0 || !flags.contains(AllocFlags::FS) || !flags.contains(AllocFlags::IO) {
        return (rc, contended);
    }

    stats::count_compact_stall();

    for zone in zonelist {
        let (status, zone_contended) =
            compact_zone_order(zone, order, flags, sync, task, capture.as_deref_mut());
        rc = rc.max(status);
        contended |= zone_contended;

        // If the watermark holds now, the allocation will succeed.
        if zone.watermark_ok(order, zone.low_wmark_pages()) {
            break;
        }
    }

    (rc, contended)
}

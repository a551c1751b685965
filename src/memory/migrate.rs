// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Page migration: relocate isolated in-use pages into free frames.
//!
//! The engine is fed a batch of isolated LRU pages and a source of free
//! destination frames. For every page it moves, the destination inherits
//! the page's identity (its LRU placement and cache state) and the vacated
//! source frame goes back to the buddy allocator; that is what actually
//! creates the contiguous free space compaction is after.

use alloc::vec::Vec;

use log::trace;

use crate::error::{MmError, MmResult};
use crate::memory::page::PageFlags;
use crate::memory::zone::Zone;
use crate::memory::{Pfn, PfnBatch};

/// How much the migration engine may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateMode {
    /// Never block; awkward pages fail immediately.
    Async,
    /// May wait on page locks but not on I/O completion.
    SyncLight,
}

/// Supplier of destination frames, consumed once per migrating page.
///
/// Returning `None` makes the current and all remaining pages fail with
/// out-of-memory.
pub trait NewPageSource {
    fn next_free_page(&mut self) -> Option<Pfn>;
}

/// Migrate every page on `batch` into a frame pulled from `src`.
///
/// Pages that fail stay on `batch` (the caller decides whether to put them
/// back on their LRU). Returns the number of transient per-page failures,
/// or `Err(OutOfMemory)` once `src` runs dry.
pub fn migrate_pages(
    zone: &Zone,
    batch: &mut PfnBatch,
    src: &mut dyn NewPageSource,
    mode: MigrateMode,
) -> MmResult<usize> {
    let work: Vec<Pfn> = batch.drain(..).collect();
    let total = work.len();
    let mut moved = 0;
    let mut out_of_memory = false;

    let mut work = work.into_iter();
    for pfn in &mut work {
        // Writeback completion cannot be waited for in either compaction
        // mode; such pages bounce back to the LRU and are retried later.
        if zone.page(pfn).test(PageFlags::WRITEBACK) {
            batch.push(pfn);
            continue;
        }

        match src.next_free_page() {
            Some(dest) => {
                move_one_page(zone, pfn, dest);
                moved += 1;
            }
            None => {
                batch.push(pfn);
                out_of_memory = true;
                break;
            }
        }
    }
    // Pages behind an out-of-memory failure are not attempted.
    for pfn in work {
        batch.push(pfn);
    }

    trace!(
        "migrated {}/{} pages ({:?}), {} remaining",
        moved,
        total,
        mode,
        batch.len()
    );

    if out_of_memory {
        Err(MmError::OutOfMemory)
    } else {
        Ok(batch.len())
    }
}

/// Move one isolated page into `dest`: the destination takes over the LRU
/// identity, the source frame is freed.
fn move_one_page(zone: &Zone, src: Pfn, dest: Pfn) {
    let src_page = zone.page(src);
    let dest_page = zone.page(dest);
    debug_assert!(!src_page.is_lru() && !src_page.is_buddy());
    debug_assert!(!dest_page.is_lru() && !dest_page.is_buddy());

    let was_file = src_page.is_file();
    if was_file {
        dest_page.set(PageFlags::FILE);
    }
    if src_page.is_active() {
        dest_page.set(PageFlags::ACTIVE);
    }
    if src_page.test(PageFlags::DIRTY) {
        dest_page.set(PageFlags::DIRTY);
    }

    {
        let mut ll = zone.lru.lock();
        zone.add_page_to_lru(&mut ll, dest);
    }

    src_page.reset();
    zone.mod_isolated(was_file, -1);
    {
        let mut fa = zone.free_area.lock();
        zone.free_one_page(&mut fa, src, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::lru::IsolateMode;
    use crate::memory::zone::{Watermarks, Zone};
    use crate::memory::MigrateType;

    struct FixedPages(Vec<Pfn>);

    impl NewPageSource for FixedPages {
        fn next_free_page(&mut self) -> Option<Pfn> {
            self.0.pop()
        }
    }

    fn zone_with_isolated(pfns: &[Pfn]) -> (Zone, PfnBatch) {
        let zone = Zone::new(0, 1024, Watermarks::new(0, 0, 0));
        let mut batch = PfnBatch::new();
        for &pfn in pfns {
            zone.seed_lru_page(pfn, pfn % 2 == 0, false).unwrap();
        }
        {
            let mut ll = zone.lru.lock();
            for &pfn in pfns {
                zone.isolate_lru_page(pfn, IsolateMode::Sync).unwrap();
                zone.del_page_from_lru(&mut ll, pfn);
                batch.push(pfn);
            }
        }
        zone.acct_isolated(&batch);
        (zone, batch)
    }

    #[test]
    fn migration_moves_identity_and_frees_source() {
        let (zone, mut batch) = zone_with_isolated(&[4, 5]);
        let mut src = FixedPages(vec![100, 101]);

        let failed = migrate_pages(&zone, &mut batch, &mut src, MigrateMode::SyncLight).unwrap();
        assert_eq!(failed, 0);
        assert!(batch.is_empty());

        // Sources are free again, destinations are LRU pages.
        assert_eq!(zone.free_pages(), 2);
        assert!(zone.page(4).is_buddy());
        assert!(zone.page(101).is_lru());
        assert!(zone.page(100).is_lru());
        // pfn 4 was file-backed, its replacement keeps that.
        assert!(zone.page(101).is_file());
        assert!(!zone.page(100).is_file());

        // Isolated counters net out to zero.
        assert_eq!(zone.nr_isolated(), 0);
        assert_eq!(zone.nr_lru_pages(), 2);
    }

    #[test]
    fn writeback_pages_fail_transiently() {
        let (zone, mut batch) = zone_with_isolated(&[4, 5, 6]);
        zone.set_page_writeback(5, true);
        let mut src = FixedPages(vec![100, 101, 102]);

        let failed = migrate_pages(&zone, &mut batch, &mut src, MigrateMode::SyncLight).unwrap();
        assert_eq!(failed, 1);
        assert_eq!(batch.as_slice(), &[5]);

        // The failure is still isolated; the caller puts it back.
        assert_eq!(zone.nr_isolated(), 1);
        zone.putback_lru_pages(&mut batch);
        assert_eq!(zone.nr_isolated(), 0);
        assert!(zone.page(5).is_lru());
    }

    #[test]
    fn exhausted_source_is_out_of_memory() {
        let (zone, mut batch) = zone_with_isolated(&[4, 5, 6]);
        let mut src = FixedPages(vec![100]);

        let err = migrate_pages(&zone, &mut batch, &mut src, MigrateMode::Async).unwrap_err();
        assert_eq!(err, MmError::OutOfMemory);
        // One moved, two still on the batch.
        assert_eq!(batch.len(), 2);
        assert_eq!(zone.nr_isolated(), 2);
        assert_eq!(zone.free_pages(), 1);
    }

    #[test]
    fn freed_sources_merge_in_buddy() {
        let (zone, mut batch) = zone_with_isolated(&[0, 1, 2, 3]);
        let mut src = FixedPages(vec![100, 101, 102, 103]);

        migrate_pages(&zone, &mut batch, &mut src, MigrateMode::SyncLight).unwrap();
        // Four contiguous vacated frames merge to an order-2 block.
        assert_eq!(zone.nr_free_blocks(2), 1);
        assert_eq!(zone.find_free_block(2, MigrateType::Movable), Some(0));
    }
}

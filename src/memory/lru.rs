// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! LRU lists: the reclaim-side view of in-use user pages.
//!
//! Compaction only ever moves pages that sit on these lists. Isolation
//! detaches a page (clears its LRU tag, removes it from its list, counts it
//! as isolated); putback is the exact inverse. Both run under the zone's
//! `lru` lock.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::memory::page::PageFlags;
use crate::memory::zone::Zone;
use crate::memory::{Pfn, PfnBatch};

pub const NR_LRU_LISTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Lru {
    InactiveAnon = 0,
    ActiveAnon = 1,
    InactiveFile = 2,
    ActiveFile = 3,
}

/// How strict isolation should be about pages that are awkward to migrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolateMode {
    Sync,
    /// Async migration cannot block on writeback or filesystem locks, so
    /// dirty and writeback pages are refused up front.
    AsyncMigrate,
}

/// The four LRU lists of a zone. Lives inside the zone's `lru` lock.
#[derive(Default)]
pub struct LruLists {
    pub(crate) lists: [Vec<Pfn>; NR_LRU_LISTS],
}

impl Zone {
    /// Which LRU list does this page belong to? Derived from the page's
    /// ACTIVE/FILE tags so it stays answerable while the LRU tag itself is
    /// temporarily clear during isolation.
    pub(crate) fn page_lru(&self, pfn: Pfn) -> Lru {
        let page = self.page(pfn);
        match (page.is_file(), page.is_active()) {
            (false, false) => Lru::InactiveAnon,
            (false, true) => Lru::ActiveAnon,
            (true, false) => Lru::InactiveFile,
            (true, true) => Lru::ActiveFile,
        }
    }

    fn lru_counter(&self, lru: Lru) -> &AtomicUsize {
        match lru {
            Lru::InactiveAnon => &self.counters.inactive_anon,
            Lru::ActiveAnon => &self.counters.active_anon,
            Lru::InactiveFile => &self.counters.inactive_file,
            Lru::ActiveFile => &self.counters.active_file,
        }
    }

    /// Add a page to the LRU list its tags select. Caller holds the lru
    /// lock.
    pub(crate) fn add_page_to_lru(&self, ll: &mut LruLists, pfn: Pfn) {
        let page = self.page(pfn);
        page.set(PageFlags::LRU);
        let lru = self.page_lru(pfn);
        ll.lists[lru as usize].push(pfn);
        self.lru_counter(lru).fetch_add(1, Ordering::Relaxed);
    }

    /// Attempt to claim a page for migration: succeeds only for LRU pages,
    /// and async mode additionally refuses pages that would block the
    /// migration engine. On success the page's LRU tag is cleared; the
    /// caller still owns its list linkage (`del_page_from_lru`).
    pub(crate) fn isolate_lru_page(&self, pfn: Pfn, mode: IsolateMode) -> Result<(), ()> {
        let page = self.page(pfn);
        if !page.is_lru() {
            return Err(());
        }
        if mode == IsolateMode::AsyncMigrate
            && (page.test(PageFlags::DIRTY) || page.test(PageFlags::WRITEBACK))
        {
            return Err(());
        }
        page.clear(PageFlags::LRU);
        Ok(())
    }

    /// Remove an isolated page from its LRU list and drop the list counter.
    /// Caller holds the lru lock.
    pub(crate) fn del_page_from_lru(&self, ll: &mut LruLists, pfn: Pfn) {
        let lru = self.page_lru(pfn);
        let list = &mut ll.lists[lru as usize];
        let pos = list
            .iter()
            .position(|&p| p == pfn)
            .expect("isolated page is on its LRU list");
        list.remove(pos);
        self.lru_counter(lru).fetch_sub(1, Ordering::Relaxed);
    }

    /// Credit a freshly isolated batch to the zone's isolated counters.
    pub(crate) fn acct_isolated(&self, batch: &[Pfn]) {
        let mut count = [0isize; 2];
        for &pfn in batch {
            count[self.page(pfn).is_file() as usize] += 1;
        }
        self.mod_isolated(false, count[0]);
        self.mod_isolated(true, count[1]);
    }

    /// Return isolated pages to the LRU lists they came from.
    pub fn putback_lru_pages(&self, batch: &mut PfnBatch) {
        if batch.is_empty() {
            return;
        }
        let mut ll = self.lru.lock();
        for pfn in batch.drain(..) {
            self.mod_isolated(self.page(pfn).is_file(), -1);
            self.add_page_to_lru(&mut ll, pfn);
        }
    }

    /// Are there already so many isolated pages that another isolation
    /// batch would destabilize reclaim? Throttles parallel compactors.
    pub fn too_many_isolated(&self) -> bool {
        self.nr_isolated() > self.nr_lru_pages() / 2
    }
}

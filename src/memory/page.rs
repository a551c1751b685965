// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-frame metadata.
//!
//! One `PageFrame` exists per PFN in a zone. The flag word is atomic so
//! scanners may read it speculatively without the zone locks; mutation of
//! the interesting bits (buddy tag, LRU membership) only happens under the
//! lock that owns the respective structure.

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

bitflags! {
    pub struct PageFlags: u32 {
        /// The PFN is backed by real memory (clear inside zone holes).
        const VALID = 1 << 0;
        /// Head of a free block on a buddy free list.
        const BUDDY = 1 << 1;
        /// On one of the zone's LRU lists.
        const LRU = 1 << 2;
        /// On an active LRU list (meaningful with `LRU`).
        const ACTIVE = 1 << 3;
        /// Page cache page; clear means anonymous.
        const FILE = 1 << 4;
        /// Head of a transparent huge page.
        const HEAD = 1 << 5;
        /// Tail of a compound page.
        const TAIL = 1 << 6;
        const DIRTY = 1 << 7;
        const WRITEBACK = 1 << 8;
    }
}

/// Metadata of one physical page frame.
pub struct PageFrame {
    flags: AtomicU32,
    /// Buddy order while `BUDDY` is set, compound order while `HEAD` is set.
    order: AtomicU8,
}

impl PageFrame {
    pub(crate) fn new_valid() -> PageFrame {
        PageFrame {
            flags: AtomicU32::new(PageFlags::VALID.bits()),
            order: AtomicU8::new(0),
        }
    }

    pub fn test(&self, f: PageFlags) -> bool {
        self.flags.load(Ordering::Relaxed) & f.bits() != 0
    }

    pub(crate) fn set(&self, f: PageFlags) {
        self.flags.fetch_or(f.bits(), Ordering::Relaxed);
    }

    pub(crate) fn clear(&self, f: PageFlags) {
        self.flags.fetch_and(!f.bits(), Ordering::Relaxed);
    }

    /// Reset everything except validity (page leaves all subsystems).
    pub(crate) fn reset(&self) {
        let valid = self.flags.load(Ordering::Relaxed) & PageFlags::VALID.bits();
        self.flags.store(valid, Ordering::Relaxed);
        self.order.store(0, Ordering::Relaxed);
    }

    pub fn order(&self) -> usize {
        self.order.load(Ordering::Relaxed) as usize
    }

    pub(crate) fn set_order(&self, order: usize) {
        debug_assert!(order < 1 << 8);
        self.order.store(order as u8, Ordering::Relaxed);
    }

    pub fn is_valid(&self) -> bool {
        self.test(PageFlags::VALID)
    }

    pub fn is_buddy(&self) -> bool {
        self.test(PageFlags::BUDDY)
    }

    pub fn is_lru(&self) -> bool {
        self.test(PageFlags::LRU)
    }

    pub fn is_active(&self) -> bool {
        self.test(PageFlags::ACTIVE)
    }

    pub fn is_file(&self) -> bool {
        self.test(PageFlags::FILE)
    }

    /// Head of a transparent huge page.
    pub fn is_huge_head(&self) -> bool {
        self.test(PageFlags::HEAD)
    }

    /// Any part of a compound page.
    pub fn is_compound(&self) -> bool {
        self.test(PageFlags::HEAD | PageFlags::TAIL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_ops() {
        let p = PageFrame::new_valid();
        assert!(p.is_valid());
        assert!(!p.is_buddy());

        p.set(PageFlags::BUDDY);
        p.set_order(3);
        assert!(p.is_buddy());
        assert_eq!(p.order(), 3);

        p.clear(PageFlags::BUDDY);
        assert!(!p.is_buddy());
        assert!(p.is_valid());
    }

    #[test]
    fn reset_keeps_validity() {
        let p = PageFrame::new_valid();
        p.set(PageFlags::LRU | PageFlags::ACTIVE | PageFlags::FILE | PageFlags::DIRTY);
        p.set_order(5);

        p.reset();
        assert!(p.is_valid());
        assert!(!p.is_lru());
        assert!(!p.is_active());
        assert!(!p.is_file());
        assert!(!p.test(PageFlags::DIRTY));
        assert_eq!(p.order(), 0);
    }

    #[test]
    fn compound_predicates() {
        let head = PageFrame::new_valid();
        head.set(PageFlags::HEAD | PageFlags::LRU);
        head.set_order(9);
        assert!(head.is_huge_head());
        assert!(head.is_compound());

        let tail = PageFrame::new_valid();
        tail.set(PageFlags::TAIL);
        assert!(!tail.is_huge_head());
        assert!(tail.is_compound());
    }
}

// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Process-wide compaction event counters.

use core::sync::atomic::{AtomicU64, Ordering};

/// Compaction events accumulated over the lifetime of the process.
#[derive(Default)]
pub struct VmEvents {
    /// A direct compactor entered `try_to_compact_pages`.
    pub compact_stall: AtomicU64,
    /// Migration batches handed to the migration engine.
    pub compact_blocks: AtomicU64,
    /// Pages successfully migrated.
    pub compact_pages: AtomicU64,
    /// Pages that failed to migrate and went back to their LRU.
    pub compact_page_failed: AtomicU64,
}

/// Point-in-time copy of the event counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmEventSnapshot {
    pub compact_stall: u64,
    pub compact_blocks: u64,
    pub compact_pages: u64,
    pub compact_page_failed: u64,
}

static VM_EVENTS: VmEvents = VmEvents {
    compact_stall: AtomicU64::new(0),
    compact_blocks: AtomicU64::new(0),
    compact_pages: AtomicU64::new(0),
    compact_page_failed: AtomicU64::new(0),
};

pub fn vm_events() -> &'static VmEvents {
    &VM_EVENTS
}

impl VmEvents {
    pub fn snapshot(&self) -> VmEventSnapshot {
        VmEventSnapshot {
            compact_stall: self.compact_stall.load(Ordering::Relaxed),
            compact_blocks: self.compact_blocks.load(Ordering::Relaxed),
            compact_pages: self.compact_pages.load(Ordering::Relaxed),
            compact_page_failed: self.compact_page_failed.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn count_compact_stall() {
    VM_EVENTS.compact_stall.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn count_compact_blocks() {
    VM_EVENTS.compact_blocks.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn count_compact_pages(n: u64) {
    VM_EVENTS.compact_pages.fetch_add(n, Ordering::Relaxed);
}

pub(crate) fn count_compact_page_failed(n: u64) {
    VM_EVENTS.compact_page_failed.fetch_add(n, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Counters are global and other tests run in parallel, so only check
    /// that they move forward.
    #[test]
    fn events_are_monotonic() {
        let before = vm_events().snapshot();
        count_compact_stall();
        count_compact_blocks();
        count_compact_pages(3);
        count_compact_page_failed(2);
        let after = vm_events().snapshot();

        assert!(after.compact_stall >= before.compact_stall + 1);
        assert!(after.compact_blocks >= before.compact_blocks + 1);
        assert!(after.compact_pages >= before.compact_pages + 3);
        assert!(after.compact_page_failed >= before.compact_page_failed + 2);
    }
}

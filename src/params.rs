// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Process-wide compaction tunables (the sysctl surface).

use core::sync::atomic::{AtomicI32, Ordering};

/// Default external-fragmentation threshold.
///
/// Below this fragmentation index the preflight refuses to compact: the
/// allocation failure is judged to be a lack of memory, not fragmentation,
/// and reclaim is the better tool.
pub const DEFAULT_EXTFRAG_THRESHOLD: i32 = 500;

/// Fragmentation index values live in `[-1000, 1000]`.
pub const MAX_EXTFRAG_THRESHOLD: i32 = 1000;

static EXTFRAG_THRESHOLD: AtomicI32 = AtomicI32::new(DEFAULT_EXTFRAG_THRESHOLD);

pub fn extfrag_threshold() -> i32 {
    EXTFRAG_THRESHOLD.load(Ordering::Relaxed)
}

/// Set the threshold, clamped to the valid fragmentation-index range.
pub fn set_extfrag_threshold(value: i32) {
    let clamped = value.max(0).min(MAX_EXTFRAG_THRESHOLD);
    EXTFRAG_THRESHOLD.store(clamped, Ordering::Relaxed);
}

/// Restore the default (used by embedder teardown and tests).
pub fn reset_extfrag_threshold() {
    EXTFRAG_THRESHOLD.store(DEFAULT_EXTFRAG_THRESHOLD, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_clamped() {
        set_extfrag_threshold(-17);
        assert_eq!(extfrag_threshold(), 0);

        set_extfrag_threshold(5000);
        assert_eq!(extfrag_threshold(), MAX_EXTFRAG_THRESHOLD);

        set_extfrag_threshold(250);
        assert_eq!(extfrag_threshold(), 250);

        reset_extfrag_threshold();
        assert_eq!(extfrag_threshold(), DEFAULT_EXTFRAG_THRESHOLD);
    }
}

// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The scheduling seam of a compaction run.
//!
//! A run executes on a single task but has well-defined suspension points:
//! it yields between page-blocks, backs off when the host wants the CPU and
//! bails out on fatal signals. The host environment supplies those answers
//! through `TaskState`; tests inject preemption and signals the same way.

/// Host scheduling state consulted by the compaction core.
///
/// All methods default to the "nothing ever happens" answers so embedders
/// only override what their environment can actually express.
pub trait TaskState {
    /// Does the current task need to give up the CPU?
    fn need_resched(&self) -> bool {
        false
    }

    /// Voluntarily yield the CPU (sync runs only).
    fn cond_resched(&self) {}

    /// Has the current task been killed?
    fn fatal_signal_pending(&self) -> bool {
        false
    }

    /// Block for one congestion interval while parallel reclaim/compaction
    /// drains isolated pages.
    fn congestion_wait(&self) {
        self.cond_resched();
    }
}

/// A task that is never preempted, never signalled and never waits.
pub struct NeverResched;

impl TaskState for NeverResched {}

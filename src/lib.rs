// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Physical-memory compaction.
//!
//! Reduces external fragmentation of a zone by migrating movable pages
//! toward one end of its PFN space so the buddy allocator can reassemble
//! contiguous high-order free blocks at the other end. The engine moves
//! memory, it never reclaims it: the working set is unchanged, only the
//! placement of the free space improves.
//!
//! The core is a dual-scanner sweep over a zone (`memory::compaction`): a
//! low cursor isolates movable in-use pages, a high cursor isolates free
//! pages, and the migration engine pairs them up batch by batch. Everything
//! around it (the buddy free-area, LRU lists, watermarks and the migration
//! engine itself) lives in the sibling modules as the collaborator
//! contracts compaction consumes.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate bitflags;

#[macro_use]
mod prelude;

pub mod error;
pub mod memory;
pub mod params;
pub mod sched;
pub mod stats;
pub mod sync;

pub use error::{MmError, MmResult};
pub use memory::compaction::{
    compact_zone_order, compaction_suitable, isolate_freepages_range,
    isolate_migratepages_range, try_to_compact_pages, CompactControl, CompactStatus,
};
pub use memory::{AllocFlags, MigrateType, Pfn};
pub use memory::node::{
    compact_node, compact_nodes, compact_pgdat, sysctl_compact_memory, sysfs_compact_node, NodeData,
};
pub use memory::zone::{Watermarks, Zone};
pub use sched::{NeverResched, TaskState};

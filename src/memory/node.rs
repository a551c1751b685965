// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Node-level compaction passes.
//!
//! A node groups the zones of one memory domain. The passes here walk all
//! zones of a node (or of every node), reusing one set of request
//! parameters per zone, and keep the per-zone deferral state honest: zones
//! that keep failing get probed exponentially less often, zones that
//! succeed raise their confidence floor.

use alloc::vec::Vec;

use log::debug;

use crate::memory::compaction::{compact_zone, CompactControl, CompactStatus};
use crate::memory::zone::Zone;
use crate::memory::MigrateType;
use crate::sched::TaskState;

/// The zones of one memory node.
pub struct NodeData {
    pub id: usize,
    pub zones: Vec<Zone>,
}

impl NodeData {
    pub fn new(id: usize, zones: Vec<Zone>) -> NodeData {
        NodeData { id, zones }
    }
}

fn compact_zones(node: &NodeData, order: Option<usize>, sync: bool, task: &dyn TaskState) {
    for zone in &node.zones {
        let mut cc = CompactControl::new(zone, task, order, MigrateType::Movable, sync, None);

        // Whole-node sweeps always run; ordered requests honor the zone's
        // deferral window.
        let deferred = match order {
            Some(o) => zone.compaction_deferred(o),
            None => false,
        };
        if !deferred {
            compact_zone(&mut cc);
        }

        if let Some(o) = order {
            if o > 0 {
                let ok = zone.watermark_ok(o, zone.low_wmark_pages());
                if ok && o >= zone.compact_order_failed() {
                    // This order works now; stop distrusting it and
                    // everything below it.
                    zone.set_compact_order_failed(o + 1);
                } else if !ok && sync {
                    // A full sync effort failed; back off this zone.
                    debug!("node {}: deferring order-{} compaction", node.id, o);
                    zone.defer_compaction(o);
                }
            }
        }

        debug_assert!(cc.migratepages.is_empty());
        debug_assert!(cc.freepages.is_empty());
    }
}

/// Compact all zones of a node for an order-`order` allocation
/// (the background-reclaim entry point; never blocks on contention).
pub fn compact_pgdat(node: &NodeData, order: usize, task: &dyn TaskState) {
    compact_zones(node, Some(order), false, task)
}

/// Compact a whole node, every zone end to end.
pub fn compact_node(node: &NodeData, sync: bool, task: &dyn TaskState) {
    compact_zones(node, None, sync, task)
}

/// Compact every node in the system.
pub fn compact_nodes(nodes: &[NodeData], sync: bool, task: &dyn TaskState) -> CompactStatus {
    for node in nodes {
        compact_node(node, sync, task);
    }
    CompactStatus::Complete
}

/// The "compact memory" sysctl: any write triggers a synchronous
/// full-system compaction. The written value is ignored.
pub fn sysctl_compact_memory(nodes: &[NodeData], task: &dyn TaskState) -> CompactStatus {
    compact_nodes(nodes, true, task)
}

/// Per-node sysfs trigger (write-only attribute): compact one node by id.
/// Unknown ids are ignored.
pub fn sysfs_compact_node(nodes: &[NodeData], nid: usize, task: &dyn TaskState) {
    if let Some(node) = nodes.iter().find(|n| n.id == nid) {
        compact_node(node, true, task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::zone::Watermarks;
    use crate::memory::PAGEBLOCK_ORDER;
    use crate::sched::NeverResched;

    /// Bottom quarter interleaved in-use/free, rest free.
    fn quarter_fragmented_zone() -> Zone {
        let zone = Zone::new(0, 1024, Watermarks::new(4, 8, 16));
        for pfn in 0..256 {
            if pfn % 2 == 0 {
                zone.seed_lru_page(pfn, false, false).unwrap();
            } else {
                zone.free_range(pfn..pfn + 1).unwrap();
            }
        }
        zone.free_range(256..1024).unwrap();
        zone
    }

    #[test]
    fn successful_order_raises_confidence_floor() {
        let zone = Zone::new(0, 1024, Watermarks::new(4, 8, 16));
        zone.free_range(0..256).unwrap();
        let node = NodeData::new(0, vec![zone]);

        compact_pgdat(&node, 2, &NeverResched);

        // Order 2 is trivially satisfiable, so the failure floor moved up.
        assert_eq!(node.zones[0].compact_order_failed(), 3);
    }

    #[test]
    fn sync_failure_defers_the_zone() {
        // Eight free pages against a low watermark of 64: hopeless.
        let zone = Zone::new(0, 1024, Watermarks::new(32, 64, 128));
        zone.free_range(0..8).unwrap();
        let node = NodeData::new(0, vec![zone]);

        compact_zones(&node, Some(3), true, &NeverResched);

        // The zone is now on backoff for order 3.
        assert!(node.zones[0].compaction_deferred(3));
        assert!(!node.zones[0].compaction_deferred(3));
    }

    #[test]
    fn async_failure_does_not_defer() {
        let zone = Zone::new(0, 1024, Watermarks::new(32, 64, 128));
        zone.free_range(0..8).unwrap();
        let node = NodeData::new(0, vec![zone]);

        compact_pgdat(&node, 3, &NeverResched);

        assert!(!node.zones[0].compaction_deferred(3));
    }

    #[test]
    fn compact_nodes_sweeps_every_zone() {
        let nodes = vec![
            NodeData::new(0, vec![quarter_fragmented_zone()]),
            NodeData::new(1, vec![quarter_fragmented_zone(), quarter_fragmented_zone()]),
        ];

        let status = compact_nodes(&nodes, true, &NeverResched);
        assert_eq!(status, CompactStatus::Complete);

        for node in &nodes {
            for zone in &node.zones {
                // The interleaved bottom quarter was vacated and merged.
                assert!(zone.page(0).is_buddy());
                assert!(zone.page(0).order() >= PAGEBLOCK_ORDER);
                assert_eq!(zone.nr_isolated(), 0);
            }
        }
    }

    #[test]
    fn sysctl_compacts_everything() {
        let nodes = vec![NodeData::new(0, vec![quarter_fragmented_zone()])];
        assert_eq!(
            sysctl_compact_memory(&nodes, &NeverResched),
            CompactStatus::Complete
        );
        let zone = &nodes[0].zones[0];
        assert!(zone.page(0).is_buddy());
        assert!(zone.page(0).order() >= PAGEBLOCK_ORDER);
    }

    #[test]
    fn sysfs_trigger_selects_by_node_id() {
        let nodes = vec![
            NodeData::new(7, vec![quarter_fragmented_zone()]),
            NodeData::new(9, vec![quarter_fragmented_zone()]),
        ];

        // Unknown id: nothing happens, nothing panics.
        sysfs_compact_node(&nodes, 3, &NeverResched);
        assert!(!nodes[1].zones[0].page(0).is_buddy());

        sysfs_compact_node(&nodes, 9, &NeverResched);
        assert!(nodes[1].zones[0].page(0).is_buddy());
        // Node 7 was left alone.
        assert!(!nodes[0].zones[0].page(0).is_buddy());
    }
}

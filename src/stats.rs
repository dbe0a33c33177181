//! Rollup statistics
//!
//! Totals are derived bottom-up: every node's `total_*` equals its direct
//! counters plus the totals of its children. A full annotation is a single
//! post-order pass; write paths only re-derive the ancestor chains they touch.

use std::collections::HashMap;

use crate::models::{NodeId, RollupStats, TreeIndex};

/// Recomputes the totals of every node in one post-order pass
pub fn annotate(tree: &mut TreeIndex) {
    for slot in post_order(tree) {
        recompute(tree, slot);
    }
}

/// Projects the already-annotated stats for a batch of nodes
///
/// Unknown slots are left out of the result.
pub fn batch_stats(tree: &TreeIndex, nodes: &[NodeId]) -> HashMap<NodeId, RollupStats> {
    nodes
        .iter()
        .filter_map(|&slot| tree.get(slot).map(|n| (slot, *n.stats())))
        .collect()
}

/// Re-derives totals for `start` and every ancestor above it
///
/// Children outside the chain are assumed to be correct already.
pub fn reroll_ancestors(tree: &mut TreeIndex, start: Option<NodeId>) {
    let mut current = start;
    let mut steps = 0;
    while let Some(slot) = current {
        if steps > tree.len() {
            tracing::error!(node = %slot, "ancestor chain longer than the tree, stopping reroll");
            break;
        }
        recompute(tree, slot);
        current = tree.get(slot).and_then(|n| n.parent());
        steps += 1;
    }
}

/// Sums completed and total tasks over a set of roots, e.g. for a dashboard header
pub fn summarize(tree: &TreeIndex, roots: &[NodeId]) -> RollupStats {
    let mut summary = RollupStats::default();
    for &root in roots {
        if let Some(node) = tree.get(root) {
            summary.absorb_child(node.stats());
        }
    }
    summary
}

/// Recomputes one node from its direct counters and its children's totals
fn recompute(tree: &mut TreeIndex, slot: NodeId) {
    let Some(node) = tree.get(slot) else {
        return;
    };
    let mut stats = RollupStats::from_direct(node.stats().direct());
    for &child in node.children() {
        if let Some(child) = tree.get(child) {
            stats.absorb_child(child.stats());
        }
    }
    if let Some(node) = tree.get_mut(slot) {
        *node.stats_mut() = stats;
    }
}

/// Every node, children before their parents
fn post_order(tree: &TreeIndex) -> Vec<NodeId> {
    // Reversed pre-order where children are pushed left to right
    let mut out = Vec::with_capacity(tree.len());
    let mut stack: Vec<NodeId> = tree.roots().to_vec();
    while let Some(slot) = stack.pop() {
        out.push(slot);
        if let Some(node) = tree.get(slot) {
            stack.extend_from_slice(node.children());
        }
    }
    out.reverse();
    out
}

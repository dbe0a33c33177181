//! Tree construction
//!
//! Turns the flat, unordered record list handed over by the node store into a
//! connected [`TreeIndex`] with depth and path filled in. Malformed input
//! (orphans, parent cycles) degrades into extra roots plus warnings; only
//! duplicate ids abort the build.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};

use serde::Serialize;

use crate::models::{child_path, ChildOrder, NodeId, ProjectId, ProjectRecord, TreeIndex, TreeNode};

/// Problems found while building a tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildError {
    #[error("parent chain of project {node_id} loops back on itself; project promoted to root")]
    CycleDetected { node_id: ProjectId },
    #[error("project {id} references missing parent {missing_parent}; project promoted to root")]
    OrphanedParentReference {
        id: ProjectId,
        missing_parent: ProjectId,
    },
    #[error("project id {id} appears more than once")]
    DuplicateId { id: ProjectId },
}

impl BuildError {
    /// Fatal errors abort the build; everything else is reported next to the tree
    pub fn is_fatal(&self) -> bool {
        matches!(self, BuildError::DuplicateId { .. })
    }
}

/// A successfully built tree together with any non-fatal warnings
#[derive(Debug, Clone)]
pub struct Built {
    pub tree: TreeIndex,
    pub warnings: Vec<BuildError>,
}

/// Builds a tree using the default sibling order
pub fn build(records: &[ProjectRecord]) -> Result<Built, BuildError> {
    build_with(records, ChildOrder::default())
}

/// Builds a tree, ordering siblings with `order`
pub fn build_with(records: &[ProjectRecord], order: ChildOrder) -> Result<Built, BuildError> {
    // Pass 1: one arena slot per record, no relations yet
    let mut nodes = Vec::with_capacity(records.len());
    let mut by_id = HashMap::with_capacity(records.len());
    for (slot, record) in records.iter().enumerate() {
        match by_id.entry(record.id) {
            Entry::Occupied(_) => return Err(BuildError::DuplicateId { id: record.id }),
            Entry::Vacant(entry) => {
                entry.insert(NodeId::new(slot));
            }
        }
        nodes.push(TreeNode::from_record(record));
    }

    // Pass 2: resolve parent slots
    let mut warnings = Vec::new();
    let mut parents: Vec<Option<NodeId>> = Vec::with_capacity(records.len());
    for record in records {
        let parent = match record.parent_id {
            None => None,
            Some(parent_id) => match by_id.get(&parent_id) {
                Some(&slot) => Some(slot),
                None => {
                    tracing::warn!(
                        id = record.id,
                        missing_parent = parent_id,
                        "orphaned project promoted to root"
                    );
                    warnings.push(BuildError::OrphanedParentReference {
                        id: record.id,
                        missing_parent: parent_id,
                    });
                    None
                }
            },
        };
        parents.push(parent);
    }

    for slot in break_cycles(&mut parents, records) {
        let node_id = records[slot.index()].id;
        tracing::warn!(id = node_id, "parent cycle broken, project promoted to root");
        warnings.push(BuildError::CycleDetected { node_id });
    }

    // Link children to parents
    let mut roots = Vec::new();
    for (slot, parent) in parents.iter().enumerate() {
        let node = NodeId::new(slot);
        match parent {
            Some(parent) => {
                let parent_id = records[parent.index()].id;
                nodes[slot].set_parent(Some((*parent, parent_id)));
                nodes[parent.index()].children_mut().push(node);
            }
            None => {
                nodes[slot].set_parent(None);
                roots.push(node);
            }
        }
    }

    let mut tree = TreeIndex::from_parts(nodes, roots, by_id, order);
    sort_siblings(&mut tree);
    place_subtrees(&mut tree);

    tracing::debug!(
        nodes = tree.len(),
        roots = tree.roots().len(),
        warnings = warnings.len(),
        "built project tree"
    );

    Ok(Built { tree, warnings })
}

/// Cuts every parent cycle, returning the slots that were promoted to root
///
/// Each node is walked at most once thanks to the three-colour marking, so
/// the whole pass is linear in the number of records. The node with the
/// smallest project id on each cycle is the one that gets cut, which keeps
/// the outcome independent of record order.
fn break_cycles(parents: &mut [Option<NodeId>], records: &[ProjectRecord]) -> Vec<NodeId> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Unvisited,
        OnPath,
        Done,
    }

    let mut marks = vec![Mark::Unvisited; parents.len()];
    let mut promoted = Vec::new();
    let mut path: Vec<usize> = Vec::new();

    for start in 0..parents.len() {
        if marks[start] != Mark::Unvisited {
            continue;
        }
        path.clear();
        let mut current = Some(start);
        while let Some(slot) = current {
            match marks[slot] {
                Mark::Done => break,
                Mark::OnPath => {
                    let cycle_start = path.iter().position(|&s| s == slot).unwrap_or(0);
                    let cut = path[cycle_start..]
                        .iter()
                        .copied()
                        .min_by_key(|&s| records[s].id)
                        .unwrap_or(slot);
                    parents[cut] = None;
                    promoted.push(NodeId::new(cut));
                    break;
                }
                Mark::Unvisited => {
                    marks[slot] = Mark::OnPath;
                    path.push(slot);
                    current = parents[slot].map(NodeId::index);
                }
            }
        }
        for &slot in &path {
            marks[slot] = Mark::Done;
        }
    }

    promoted
}

fn sort_siblings(tree: &mut TreeIndex) {
    let order = tree.order();
    let mut roots = std::mem::take(tree.roots_mut());
    roots.sort_by(|&a, &b| compare_slots(tree, &order, a, b));
    *tree.roots_mut() = roots;

    let slots: Vec<NodeId> = tree.node_ids().collect();
    for slot in slots {
        let Some(node) = tree.get_mut(slot) else {
            continue;
        };
        if node.children().len() < 2 {
            continue;
        }
        let mut children = std::mem::take(node.children_mut());
        children.sort_by(|&a, &b| compare_slots(tree, &order, a, b));
        if let Some(node) = tree.get_mut(slot) {
            *node.children_mut() = children;
        }
    }
}

fn compare_slots(tree: &TreeIndex, order: &ChildOrder, a: NodeId, b: NodeId) -> std::cmp::Ordering {
    match (tree.get(a), tree.get(b)) {
        (Some(a), Some(b)) => order.compare(a, b),
        _ => a.cmp(&b),
    }
}

/// Fills in depth and path for every node, breadth-first from the roots
fn place_subtrees(tree: &mut TreeIndex) {
    let mut queue: VecDeque<NodeId> = tree.roots().iter().copied().collect();
    while let Some(slot) = queue.pop_front() {
        let (depth, path, children) = {
            let Some(node) = tree.get(slot) else {
                continue;
            };
            let parent = node.parent().and_then(|p| tree.get(p));
            let depth = parent.map(|p| p.depth() + 1).unwrap_or(0);
            (depth, child_path(parent, node.name()), node.children().to_vec())
        };
        if let Some(node) = tree.get_mut(slot) {
            node.set_placement(depth, path);
        }
        queue.extend(children);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn record(id: ProjectId, parent: Option<ProjectId>, name: &str) -> ProjectRecord {
        ProjectRecord::new(id, parent, name)
    }

    fn path_of(tree: &TreeIndex, id: ProjectId) -> String {
        tree.get(tree.lookup(id).unwrap()).unwrap().path().to_string()
    }

    #[test]
    fn test_three_level_chain() {
        let records = vec![
            record(1, None, "A"),
            record(2, Some(1), "B"),
            record(3, Some(2), "C"),
        ];
        let built = build(&records).unwrap();
        assert!(built.warnings.is_empty());

        let tree = built.tree;
        let c = tree.get(tree.lookup(3).unwrap()).unwrap();
        assert_eq!(c.path(), "A/B/C");
        assert_eq!(c.depth(), 2);
        assert_eq!(tree.roots().len(), 1);
    }

    #[test]
    fn test_unordered_input_links_correctly() {
        let records = vec![
            record(3, Some(2), "C"),
            record(2, Some(1), "B"),
            record(1, None, "A"),
        ];
        let tree = build(&records).unwrap().tree;
        assert_eq!(path_of(&tree, 3), "A/B/C");
        assert!(tree.check_invariants().is_empty());
    }

    #[test]
    fn test_orphan_promoted_to_root() {
        let records = vec![record(1, None, "A"), record(5, Some(999), "Lost")];
        let built = build(&records).unwrap();

        assert_eq!(
            built.warnings,
            vec![BuildError::OrphanedParentReference {
                id: 5,
                missing_parent: 999
            }]
        );
        let slot = built.tree.lookup(5).unwrap();
        let node = built.tree.get(slot).unwrap();
        assert!(node.is_root());
        assert_eq!(node.parent_id(), None);
        assert_eq!(node.depth(), 0);
        assert_eq!(node.path(), "Lost");
        assert!(built.tree.roots().contains(&slot));
    }

    #[test]
    fn test_cycle_detected_and_broken() {
        let records = vec![
            record(1, Some(3), "A"),
            record(2, Some(1), "B"),
            record(3, Some(2), "C"),
            record(4, None, "D"),
        ];
        let built = build(&records).unwrap();

        assert_eq!(built.warnings, vec![BuildError::CycleDetected { node_id: 1 }]);
        assert_eq!(path_of(&built.tree, 3), "A/B/C");
        assert_eq!(built.tree.roots().len(), 2);
        assert!(built.tree.check_invariants().is_empty());
    }

    #[test]
    fn test_self_parent_is_a_cycle() {
        let records = vec![record(7, Some(7), "Loop")];
        let built = build(&records).unwrap();
        assert_eq!(built.warnings, vec![BuildError::CycleDetected { node_id: 7 }]);
        assert_eq!(path_of(&built.tree, 7), "Loop");
    }

    #[test]
    fn test_tail_into_cycle_keeps_tail_attached() {
        // 10 hangs off a two-node cycle; only the cycle is cut
        let records = vec![
            record(10, Some(21), "Tail"),
            record(20, Some(21), "X"),
            record(21, Some(20), "Y"),
        ];
        let built = build(&records).unwrap();
        assert_eq!(built.warnings, vec![BuildError::CycleDetected { node_id: 20 }]);
        assert_eq!(path_of(&built.tree, 10), "X/Y/Tail");
    }

    #[test]
    fn test_duplicate_id_is_fatal() {
        let records = vec![record(1, None, "A"), record(1, None, "Again")];
        let err = build(&records).unwrap_err();
        assert_eq!(err, BuildError::DuplicateId { id: 1 });
        assert!(err.is_fatal());
    }

    #[test]
    fn test_deep_chain_does_not_recurse() {
        let mut records = vec![record(0, None, "n0")];
        for i in 1..5_000 {
            records.push(record(i, Some(i - 1), "n"));
        }
        let tree = build(&records).unwrap().tree;
        let last = tree.get(tree.lookup(4_999).unwrap()).unwrap();
        assert_eq!(last.depth(), 4_999);
    }

    #[test]
    fn test_recently_updated_order() {
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let records = vec![
            record(1, None, "Root"),
            record(2, Some(1), "Beta").with_updated_at(early),
            record(3, Some(1), "Alpha"),
            record(4, Some(1), "Gamma").with_updated_at(late),
            record(5, Some(1), "Aardvark").with_updated_at(early),
        ];
        let tree = build(&records).unwrap().tree;
        let root = tree.get(tree.lookup(1).unwrap()).unwrap();
        let names: Vec<&str> = root
            .children()
            .iter()
            .map(|&c| tree.get(c).unwrap().name())
            .collect();
        assert_eq!(names, vec!["Gamma", "Aardvark", "Beta", "Alpha"]);
    }

    #[test]
    fn test_name_order() {
        let records = vec![
            record(1, None, "zeta"),
            record(2, None, "alpha"),
            record(3, None, "mid"),
        ];
        let tree = build_with(&records, ChildOrder::Name).unwrap().tree;
        let names: Vec<&str> = tree
            .roots()
            .iter()
            .map(|&r| tree.get(r).unwrap().name())
            .collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_custom_order() {
        let records = vec![record(1, None, "a"), record(2, None, "b"), record(3, None, "c")];
        let order = ChildOrder::custom(|a: &TreeNode, b: &TreeNode| b.id().cmp(&a.id()));
        let tree = build_with(&records, order).unwrap().tree;
        let ids: Vec<ProjectId> = tree.roots().iter().map(|&r| tree.get(r).unwrap().id()).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn test_custom_order_with_captured_state() {
        // Pinned projects first, the rest by name
        let pinned = vec![3];
        let order = ChildOrder::custom(move |a: &TreeNode, b: &TreeNode| {
            pinned
                .contains(&b.id())
                .cmp(&pinned.contains(&a.id()))
                .then_with(|| a.name().cmp(b.name()))
        });
        let records = vec![record(1, None, "a"), record(2, None, "b"), record(3, None, "c")];
        let tree = build_with(&records, order).unwrap().tree;
        let ids: Vec<ProjectId> = tree.roots().iter().map(|&r| tree.get(r).unwrap().id()).collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert_eq!(format!("{:?}", tree.order()), "Custom(..)");
    }

    #[test]
    fn test_empty_input() {
        let built = build(&[]).unwrap();
        assert!(built.tree.is_empty());
        assert!(built.warnings.is_empty());
    }
}

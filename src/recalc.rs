//! In-place structural updates
//!
//! Each function here resolves everything it needs before touching the arena,
//! so a failed call leaves the tree exactly as it was. Only the affected
//! subtree and ancestor chains are re-derived.

use crate::engine::EngineError;
use crate::models::{child_path, DirectStats, NodeId, TreeIndex, PATH_SEPARATOR};
use crate::stats::reroll_ancestors;

/// Re-parents `node` under `new_parent` (or makes it a root)
///
/// The move must already have passed [`crate::validate::validate_move`];
/// depth limits are not checked again here.
pub fn apply_move(
    tree: &mut TreeIndex,
    node: NodeId,
    new_parent: Option<NodeId>,
) -> Result<(), EngineError> {
    let old_parent = tree.node(node)?.parent();
    let new_parent_id = match new_parent {
        Some(parent) => Some((parent, tree.node(parent)?.id())),
        None => None,
    };

    let subtree = tree.subtree(node);
    if let Some(parent) = new_parent {
        if subtree.contains(&parent) {
            tracing::error!(node = %node, new_parent = %parent, "refusing to move a node into its own subtree");
            return Err(EngineError::MoveIntoSubtree {
                node,
                new_parent: parent,
            });
        }
    }

    detach(tree, node, old_parent);
    attach(tree, node, new_parent_id);
    replace_subtree_paths(tree, &subtree);

    reroll_ancestors(tree, old_parent);
    reroll_ancestors(tree, new_parent);

    tracing::debug!(
        node = %node,
        from = ?old_parent,
        to = ?new_parent,
        moved = subtree.len(),
        "moved subtree"
    );
    Ok(())
}

/// Renames `node`, rewriting the paths of its whole subtree
///
/// The node is re-positioned among its siblings since the sibling order may
/// depend on the name.
pub fn apply_rename(tree: &mut TreeIndex, node: NodeId, name: String) -> Result<(), EngineError> {
    let parent = tree.node(node)?.parent();
    let parent_id = match parent {
        Some(parent) => Some((parent, tree.node(parent)?.id())),
        None => None,
    };
    if name.trim().is_empty() {
        return Err(EngineError::EmptyName(node));
    }
    if name.contains(PATH_SEPARATOR) {
        return Err(EngineError::NameContainsSeparator { node, name });
    }

    detach(tree, node, parent);
    if let Some(n) = tree.get_mut(node) {
        n.set_name(name);
    }
    attach(tree, node, parent_id);

    let subtree = tree.subtree(node);
    replace_subtree_paths(tree, &subtree);
    Ok(())
}

/// Replaces the direct counters of `node` and rolls the change up to its root
pub fn apply_direct_stats(
    tree: &mut TreeIndex,
    node: NodeId,
    direct: DirectStats,
) -> Result<(), EngineError> {
    tree.node(node)?;
    if let Some(n) = tree.get_mut(node) {
        n.stats_mut().set_direct(direct);
    }
    reroll_ancestors(tree, Some(node));
    Ok(())
}

fn detach(tree: &mut TreeIndex, node: NodeId, parent: Option<NodeId>) {
    let siblings = match parent {
        Some(parent) => match tree.get_mut(parent) {
            Some(p) => p.children_mut(),
            None => return,
        },
        None => tree.roots_mut(),
    };
    siblings.retain(|&s| s != node);
}

fn attach(tree: &mut TreeIndex, node: NodeId, parent: Option<(NodeId, u64)>) {
    let siblings: Vec<NodeId> = match parent {
        Some((slot, _)) => tree.get(slot).map(|p| p.children().to_vec()).unwrap_or_default(),
        None => tree.roots().to_vec(),
    };
    let at = tree.insertion_point(&siblings, node);

    match parent {
        Some((slot, _)) => {
            if let Some(p) = tree.get_mut(slot) {
                p.children_mut().insert(at, node);
            }
        }
        None => tree.roots_mut().insert(at, node),
    }
    if let Some(n) = tree.get_mut(node) {
        n.set_parent(parent);
    }
}

/// Re-derives depth and path for a subtree listed parents-first
fn replace_subtree_paths(tree: &mut TreeIndex, subtree: &[NodeId]) {
    for &slot in subtree {
        let Some(node) = tree.get(slot) else {
            continue;
        };
        let parent = node.parent().and_then(|p| tree.get(p));
        let depth = parent.map(|p| p.depth() + 1).unwrap_or(0);
        let path = child_path(parent, node.name());
        if let Some(node) = tree.get_mut(slot) {
            node.set_placement(depth, path);
        }
    }
}

//! Move validation
//!
//! A pure predicate over the tree: callers can preview a relocation before
//! committing it with [`crate::recalc::apply_move`].

use serde::Serialize;

use crate::models::{NodeId, TreeIndex};

/// Reasons a move is refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MoveError {
    #[error("a project cannot become its own parent")]
    SelfReference,
    #[error("the new parent is inside the subtree being moved")]
    CyclicReference,
    #[error("the move would nest projects {attempted} levels deep (maximum {max})")]
    DepthExceeded { attempted: u32, max: u32 },
    #[error("node {node} does not exist")]
    UnknownNode { node: NodeId },
}

/// Checks whether `node` may be re-parented under `new_parent`
///
/// `None` as the new parent means "make it a root". The resulting deepest
/// descendant must stay within `max_depth` (roots are depth 0).
pub fn validate_move(
    tree: &TreeIndex,
    node: NodeId,
    new_parent: Option<NodeId>,
    max_depth: u32,
) -> Result<(), MoveError> {
    let moved = tree.get(node).ok_or(MoveError::UnknownNode { node })?;

    if new_parent == Some(node) {
        return Err(MoveError::SelfReference);
    }

    let new_depth = match new_parent {
        Some(parent) => {
            let parent_node = tree.get(parent).ok_or(MoveError::UnknownNode { node: parent })?;
            parent_node.depth() + 1
        }
        None => 0,
    };

    // Walk the moved subtree once: it bounds the cycle check and yields the
    // subtree height for the depth check.
    let mut relative_height = 0;
    for slot in tree.descendants(node) {
        if Some(slot) == new_parent {
            return Err(MoveError::CyclicReference);
        }
        if let Some(descendant) = tree.get(slot) {
            relative_height = relative_height.max(descendant.depth() - moved.depth());
        }
    }

    let attempted = new_depth.saturating_add(relative_height);
    if attempted > max_depth {
        return Err(MoveError::DepthExceeded {
            attempted,
            max: max_depth,
        });
    }

    Ok(())
}

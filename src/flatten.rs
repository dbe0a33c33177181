//! Tree flattening for list-style display

use crate::models::{NodeId, TreeIndex, TreeNode};

/// Produces the pre-order display sequence starting from `roots`
///
/// A node is emitted when `filter` accepts it (or no filter is given). Its
/// children are visited when expansion is ignored, when the node is
/// expanded, or when the node itself was filtered out, so hiding a parent
/// never hides children the viewer is allowed to see.
pub fn flatten(
    roots: &[NodeId],
    tree: &TreeIndex,
    respect_expansion: bool,
    filter: Option<&dyn Fn(&TreeNode) -> bool>,
) -> Vec<NodeId> {
    flatten_rows(roots, tree, respect_expansion, filter)
        .into_iter()
        .map(|row| row.node)
        .collect()
}

/// One line of a flattened view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Row {
    pub node: NodeId,
    /// Number of emitted ancestors above this row, for indentation
    pub indent: u32,
}

/// Like [`flatten`], also reporting how deep each row sits among emitted rows
pub fn flatten_rows(
    roots: &[NodeId],
    tree: &TreeIndex,
    respect_expansion: bool,
    filter: Option<&dyn Fn(&TreeNode) -> bool>,
) -> Vec<Row> {
    let mut rows = Vec::new();
    let mut stack: Vec<(NodeId, u32)> = roots.iter().rev().map(|&r| (r, 0)).collect();

    while let Some((slot, indent)) = stack.pop() {
        let Some(node) = tree.get(slot) else {
            continue;
        };
        let shown = filter.map_or(true, |f| f(node));
        if shown {
            rows.push(Row { node: slot, indent });
        }
        if !respect_expansion || node.is_expanded() || !shown {
            let child_indent = if shown { indent + 1 } else { indent };
            stack.extend(node.children().iter().rev().map(|&c| (c, child_indent)));
        }
    }

    rows
}

/// Filter accepting only public projects
pub fn public_only(node: &TreeNode) -> bool {
    node.is_public()
}

//! Expand/collapse state
//!
//! The in-memory tree is updated before the store confirms the write. Every
//! optimistic flip remembers the state it replaced until the caller either
//! confirms it or rolls it back.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::engine::EngineError;
use crate::flatten::flatten;
use crate::models::{NodeId, ProjectId, TreeIndex, TreeNode};
use crate::store::{Change, PersistError};

/// The two states a node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpansionState {
    Expanded,
    Collapsed,
}

impl ExpansionState {
    pub fn of(node: &TreeNode) -> Self {
        Self::from_flag(node.is_expanded())
    }

    pub fn from_flag(expanded: bool) -> Self {
        if expanded {
            ExpansionState::Expanded
        } else {
            ExpansionState::Collapsed
        }
    }

    pub fn is_expanded(self) -> bool {
        self == ExpansionState::Expanded
    }

    pub fn toggled(self) -> Self {
        match self {
            ExpansionState::Expanded => ExpansionState::Collapsed,
            ExpansionState::Collapsed => ExpansionState::Expanded,
        }
    }
}

/// Description of a single expansion transition, produced without side effects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpansionCommand {
    pub node: NodeId,
    pub project: ProjectId,
    pub from: ExpansionState,
    pub to: ExpansionState,
}

impl ExpansionCommand {
    /// The store-level change that makes this transition durable
    pub fn change(&self) -> Change {
        Change::Expansion {
            id: self.project,
            expanded: self.to.is_expanded(),
        }
    }
}

/// Outcome of an expand-all or collapse-all sweep
#[derive(Debug, Default)]
pub struct BatchReport {
    pub applied: Vec<NodeId>,
    pub failed: Vec<(NodeId, PersistError)>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Tracks optimistic expand/collapse flips awaiting confirmation
#[derive(Debug, Default)]
pub struct ExpansionStateManager {
    pending: HashMap<NodeId, ExpansionState>,
}

impl ExpansionStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Describes the transition a toggle of `node` would perform
    pub fn toggle(&self, tree: &TreeIndex, node: NodeId) -> Result<ExpansionCommand, EngineError> {
        let target = tree.node(node)?;
        let from = ExpansionState::of(target);
        Ok(ExpansionCommand {
            node,
            project: target.id(),
            from,
            to: from.toggled(),
        })
    }

    /// Flips `node` in the tree, remembering the previous state
    pub fn apply_optimistic(&mut self, tree: &mut TreeIndex, node: NodeId) -> Result<ExpansionCommand, EngineError> {
        let command = self.toggle(tree, node)?;
        self.set(tree, command);
        Ok(command)
    }

    /// Restores the state `node` had before its pending optimistic update
    ///
    /// Does nothing when no update is pending, so a late or repeated
    /// rollback cannot flip the node a second time.
    pub fn rollback(&mut self, tree: &mut TreeIndex, node: NodeId) {
        let Some(previous) = self.pending.remove(&node) else {
            tracing::debug!(node = %node, "rollback without pending expansion change");
            return;
        };
        if let Some(target) = tree.get_mut(node) {
            target.set_expanded(previous.is_expanded());
        }
        tracing::debug!(node = %node, restored = ?previous, "rolled back expansion change");
    }

    /// Marks the pending update of `node` as durable
    pub fn confirm(&mut self, node: NodeId) {
        self.pending.remove(&node);
    }

    /// Returns true when `node` has an unconfirmed optimistic update
    pub fn is_pending(&self, node: NodeId) -> bool {
        self.pending.contains_key(&node)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Expands every viewable node, persisting each change independently
    ///
    /// Viewable means accepted by `filter`. Nodes under collapsed ancestors
    /// are included, so one call opens the whole tree.
    pub fn expand_all<P>(
        &mut self,
        tree: &mut TreeIndex,
        filter: Option<&dyn Fn(&TreeNode) -> bool>,
        persist: P,
    ) -> BatchReport
    where
        P: FnMut(&Change) -> Result<(), PersistError>,
    {
        self.set_all(tree, filter, ExpansionState::Expanded, persist)
    }

    /// Collapses every viewable node, persisting each change independently
    ///
    /// Like [`Self::expand_all`], nodes under collapsed ancestors are included.
    pub fn collapse_all<P>(
        &mut self,
        tree: &mut TreeIndex,
        filter: Option<&dyn Fn(&TreeNode) -> bool>,
        persist: P,
    ) -> BatchReport
    where
        P: FnMut(&Change) -> Result<(), PersistError>,
    {
        self.set_all(tree, filter, ExpansionState::Collapsed, persist)
    }

    fn set(&mut self, tree: &mut TreeIndex, command: ExpansionCommand) {
        // Keep the oldest pending state: a second flip before confirmation
        // must still roll back to what the store last saw.
        self.pending.entry(command.node).or_insert(command.from);
        if let Some(target) = tree.get_mut(command.node) {
            target.set_expanded(command.to.is_expanded());
        }
        tracing::debug!(node = %command.node, to = ?command.to, "optimistic expansion change");
    }

    fn set_all<P>(
        &mut self,
        tree: &mut TreeIndex,
        filter: Option<&dyn Fn(&TreeNode) -> bool>,
        target: ExpansionState,
        mut persist: P,
    ) -> BatchReport
    where
        P: FnMut(&Change) -> Result<(), PersistError>,
    {
        let roots = tree.roots().to_vec();
        let viewable = flatten(&roots, tree, false, filter);

        let mut report = BatchReport::default();
        for node in viewable {
            let Some(current) = tree.get(node).map(ExpansionState::of) else {
                continue;
            };
            if current == target {
                continue;
            }
            let Some(project) = tree.get(node).map(|n| n.id()) else {
                continue;
            };
            let command = ExpansionCommand {
                node,
                project,
                from: current,
                to: target,
            };
            self.set(tree, command);
            match persist(&command.change()) {
                Ok(()) => {
                    self.confirm(node);
                    report.applied.push(node);
                }
                Err(err) => {
                    tracing::warn!(node = %node, error = %err, "expansion change not persisted");
                    self.rollback(tree, node);
                    report.failed.push((node, err));
                }
            }
        }

        tracing::debug!(
            target = ?target,
            applied = report.applied.len(),
            failed = report.failed.len(),
            "batch expansion change"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build_with;
    use crate::models::{ChildOrder, ProjectRecord};
    use pretty_assertions::assert_eq;

    fn sample() -> TreeIndex {
        let records = vec![
            ProjectRecord::new(1, None, "A").public(),
            ProjectRecord::new(2, Some(1), "B").public(),
            ProjectRecord::new(3, Some(2), "C"),
            ProjectRecord::new(4, None, "D").collapsed(),
        ];
        build_with(&records, ChildOrder::Name).unwrap().tree
    }

    fn expanded(tree: &TreeIndex, id: u64) -> bool {
        tree.get(tree.lookup(id).unwrap()).unwrap().is_expanded()
    }

    #[test]
    fn test_toggle_describes_without_mutating() {
        let tree = sample();
        let manager = ExpansionStateManager::new();
        let b = tree.lookup(2).unwrap();
        let command = manager.toggle(&tree, b).unwrap();
        assert_eq!(command.from, ExpansionState::Expanded);
        assert_eq!(command.to, ExpansionState::Collapsed);
        assert_eq!(command.change(), Change::Expansion { id: 2, expanded: false });
        assert!(expanded(&tree, 2));
    }

    #[test]
    fn test_optimistic_then_rollback() {
        let mut tree = sample();
        let mut manager = ExpansionStateManager::new();
        let b = tree.lookup(2).unwrap();

        manager.apply_optimistic(&mut tree, b).unwrap();
        assert!(!expanded(&tree, 2));
        assert!(manager.is_pending(b));

        manager.rollback(&mut tree, b);
        assert!(expanded(&tree, 2));
        assert!(!manager.is_pending(b));

        // Nothing pending: second rollback is a no-op
        manager.rollback(&mut tree, b);
        assert!(expanded(&tree, 2));
    }

    #[test]
    fn test_confirm_keeps_new_state() {
        let mut tree = sample();
        let mut manager = ExpansionStateManager::new();
        let d = tree.lookup(4).unwrap();
        manager.apply_optimistic(&mut tree, d).unwrap();
        manager.confirm(d);
        manager.rollback(&mut tree, d);
        assert!(expanded(&tree, 4));
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn test_double_flip_rolls_back_to_original() {
        let mut tree = sample();
        let mut manager = ExpansionStateManager::new();
        let b = tree.lookup(2).unwrap();
        manager.apply_optimistic(&mut tree, b).unwrap();
        manager.apply_optimistic(&mut tree, b).unwrap();
        assert!(expanded(&tree, 2));
        manager.rollback(&mut tree, b);
        assert!(expanded(&tree, 2));
    }

    #[test]
    fn test_unknown_node() {
        let mut tree = sample();
        let mut manager = ExpansionStateManager::new();
        let ghost = NodeId::new(9);
        assert!(matches!(
            manager.apply_optimistic(&mut tree, ghost),
            Err(EngineError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_collapse_all_best_effort() {
        let mut tree = sample();
        let mut manager = ExpansionStateManager::new();
        let mut persisted = Vec::new();
        let report = manager.collapse_all(&mut tree, None, |change: &Change| {
            if let Change::Expansion { id: 2, .. } = change {
                return Err(PersistError::Unavailable("store offline".to_string()));
            }
            persisted.push(change.clone());
            Ok(())
        });

        // D was already collapsed and is skipped
        assert_eq!(report.applied.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, tree.lookup(2).unwrap());
        assert!(!expanded(&tree, 1));
        assert!(expanded(&tree, 2));
        assert!(!expanded(&tree, 3));
        assert_eq!(manager.pending_count(), 0);
        assert_eq!(
            persisted,
            vec![
                Change::Expansion { id: 1, expanded: false },
                Change::Expansion { id: 3, expanded: false },
            ]
        );
    }

    #[test]
    fn test_expand_all_respects_filter() {
        let mut tree = sample();
        let mut manager = ExpansionStateManager::new();
        let only_public = |n: &TreeNode| n.is_public();
        let report = manager.expand_all(&mut tree, Some(&only_public), |_: &Change| Ok(()));
        // Everything visible is already expanded; D is private
        assert!(report.applied.is_empty());
        assert!(report.is_clean());
        assert!(!expanded(&tree, 4));

        let report = manager.expand_all(&mut tree, None, |_: &Change| Ok(()));
        assert_eq!(report.applied, vec![tree.lookup(4).unwrap()]);
        assert!(expanded(&tree, 4));
    }

    #[test]
    fn test_expand_all_reaches_nodes_under_collapsed_parents() {
        let records = vec![
            ProjectRecord::new(1, None, "A").collapsed(),
            ProjectRecord::new(2, Some(1), "B").collapsed(),
            ProjectRecord::new(3, Some(2), "C").collapsed(),
        ];
        let mut tree = build_with(&records, ChildOrder::Name).unwrap().tree;
        let mut manager = ExpansionStateManager::new();

        let report = manager.expand_all(&mut tree, None, |_: &Change| Ok(()));
        assert_eq!(report.applied.len(), 3);
        assert!(expanded(&tree, 1) && expanded(&tree, 2) && expanded(&tree, 3));

        let report = manager.collapse_all(&mut tree, None, |_: &Change| Ok(()));
        assert_eq!(report.applied.len(), 3);
        assert!(!expanded(&tree, 3));
    }
}

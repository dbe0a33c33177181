//! Session and command handling
//!
//! A [`Session`] owns one built tree and is the only place application
//! commands enter the engine. Every write follows the same shape: validate,
//! update the in-memory tree, persist through the node store, and undo the
//! in-memory update if the store refuses the write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::builder::{build_with, BuildError};
use crate::config::EngineConfig;
use crate::expansion::{BatchReport, ExpansionCommand, ExpansionStateManager};
use crate::flatten::flatten;
use crate::models::{DirectStats, NodeId, ProjectId, ProjectRecord, RollupStats, TreeIndex, TreeNode};
use crate::recalc::{apply_direct_stats, apply_move, apply_rename};
use crate::stats::annotate;
use crate::store::{Change, NodeStore, PersistError};
use crate::validate::{validate_move, MoveError};

/// Errors surfaced by engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("node {0} does not exist in this tree")]
    NodeNotFound(NodeId),
    #[error("project {0} is not part of this tree")]
    UnknownProject(ProjectId),
    #[error("cannot move node {node} under {new_parent}, which lies inside its own subtree")]
    MoveIntoSubtree { node: NodeId, new_parent: NodeId },
    #[error("project name for node {0} cannot be empty")]
    EmptyName(NodeId),
    #[error("project name '{name}' for node {node} cannot contain '/'")]
    NameContainsSeparator { node: NodeId, name: String },
    #[error("invalid move: {0}")]
    Move(#[from] MoveError),
    #[error("failed to build tree: {0}")]
    Build(#[from] BuildError),
    #[error("failed to persist change: {0}")]
    Persist(#[from] PersistError),
}

impl EngineError {
    /// True for errors caused by a stale or invalid id handed in by the caller
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            EngineError::NodeNotFound(_)
                | EngineError::UnknownProject(_)
                | EngineError::MoveIntoSubtree { .. }
        )
    }
}

/// Re-parent a project; `max_depth` overrides the session default
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveCommand {
    pub node: ProjectId,
    pub new_parent: Option<ProjectId>,
    #[serde(default)]
    pub max_depth: Option<u32>,
}

/// Flip the expanded flag of a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleCommand {
    pub node: ProjectId,
}

/// Give a project a new name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameCommand {
    pub node: ProjectId,
    pub name: String,
}

/// Discard the in-memory tree and rebuild it from the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildCommand {}

/// Every mutating entry point accepted from the application layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Move(MoveCommand),
    Toggle(ToggleCommand),
    Rename(RenameCommand),
    Rebuild(RebuildCommand),
}

/// What a successfully executed command did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Moved,
    Toggled(ExpansionCommand),
    Renamed,
    Rebuilt { warnings: usize },
}

/// Represents a single state transition event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub details: Option<String>,
}

impl TransitionLogEntry {
    pub fn new(action: String, details: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            details,
        }
    }
}

/// One logical session of operations over a built tree
pub struct Session {
    tree: TreeIndex,
    config: EngineConfig,
    expansion: ExpansionStateManager,
    warnings: Vec<BuildError>,
    history: VecDeque<TransitionLogEntry>,
}

impl Session {
    /// Builds and annotates a session from raw records
    pub fn from_records(records: &[ProjectRecord], config: EngineConfig) -> Result<Self, EngineError> {
        let built = build_with(records, config.child_order.clone())?;
        let mut tree = built.tree;
        annotate(&mut tree);

        let mut session = Self {
            tree,
            history: VecDeque::with_capacity(config.history_size),
            config,
            expansion: ExpansionStateManager::new(),
            warnings: built.warnings,
        };
        session.log_transition(
            "build".to_string(),
            Some(format!(
                "Built {} projects with {} warnings",
                session.tree.len(),
                session.warnings.len()
            )),
        );
        Ok(session)
    }

    /// Loads every record from the store and builds a session
    pub fn load<S: NodeStore + ?Sized>(store: &S, config: EngineConfig) -> Result<Self, EngineError> {
        let records = store.load_all()?;
        Self::from_records(&records, config)
    }

    pub fn tree(&self) -> &TreeIndex {
        &self.tree
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Non-fatal problems found by the last build
    pub fn warnings(&self) -> &[BuildError] {
        &self.warnings
    }

    /// Recent transitions, oldest first
    pub fn history(&self) -> impl Iterator<Item = &TransitionLogEntry> {
        self.history.iter()
    }

    pub fn has_pending_expansion(&self) -> bool {
        self.expansion.pending_count() > 0
    }

    /// Resolves a store id to its node
    pub fn node(&self, id: ProjectId) -> Result<&TreeNode, EngineError> {
        let slot = self.resolve(id)?;
        self.tree.node(slot)
    }

    /// Logs a state transition, maintaining the history buffer size.
    fn log_transition(&mut self, action: String, details: Option<String>) {
        tracing::debug!(action = %action, details = ?details, "transition");
        while self.history.len() >= self.config.history_size.max(1) {
            self.history.pop_front();
        }
        self.history
            .push_back(TransitionLogEntry::new(action, details));
    }

    fn resolve(&self, id: ProjectId) -> Result<NodeId, EngineError> {
        self.tree.node_id(id).inspect_err(|err| {
            tracing::error!(project = id, error = %err, "command referenced an unknown project");
        })
    }

    fn resolve_parent(&self, id: Option<ProjectId>) -> Result<Option<NodeId>, EngineError> {
        id.map(|id| self.resolve(id)).transpose()
    }

    /// Runs the move checks without touching the tree
    pub fn preview_move(&self, command: &MoveCommand) -> Result<(), EngineError> {
        let node = self.resolve(command.node)?;
        let new_parent = self.resolve_parent(command.new_parent)?;
        let max_depth = command.max_depth.unwrap_or(self.config.max_depth);
        validate_move(&self.tree, node, new_parent, max_depth)?;
        Ok(())
    }

    /// Validates, applies and persists a move
    pub fn move_node<S: NodeStore + ?Sized>(
        &mut self,
        command: &MoveCommand,
        store: &mut S,
    ) -> Result<(), EngineError> {
        let node = self.resolve(command.node)?;
        let new_parent = self.resolve_parent(command.new_parent)?;
        let max_depth = command.max_depth.unwrap_or(self.config.max_depth);

        if let Err(err) = validate_move(&self.tree, node, new_parent, max_depth) {
            self.log_transition(
                "move_rejected".to_string(),
                Some(format!("Project {}: {}", command.node, err)),
            );
            return Err(err.into());
        }

        let old_parent = self.tree.node(node)?.parent();
        apply_move(&mut self.tree, node, new_parent)?;

        let change = Change::Move {
            id: command.node,
            new_parent: command.new_parent,
        };
        if let Err(err) = store.persist(&change) {
            tracing::warn!(project = command.node, error = %err, "move not persisted, rolling back");
            if let Err(undo) = apply_move(&mut self.tree, node, old_parent) {
                tracing::error!(project = command.node, error = %undo, "failed to roll back move");
            }
            self.log_transition(
                "move_rolled_back".to_string(),
                Some(format!("Project {}: {}", command.node, err)),
            );
            return Err(err.into());
        }

        self.log_transition(
            "move".to_string(),
            Some(format!(
                "Moved project {} under {:?}",
                command.node, command.new_parent
            )),
        );
        Ok(())
    }

    /// Renames a project and persists the new name
    pub fn rename<S: NodeStore + ?Sized>(
        &mut self,
        command: &RenameCommand,
        store: &mut S,
    ) -> Result<(), EngineError> {
        let node = self.resolve(command.node)?;
        let old_name = self.tree.node(node)?.name().to_string();
        apply_rename(&mut self.tree, node, command.name.clone())?;

        let change = Change::Rename {
            id: command.node,
            name: command.name.clone(),
        };
        if let Err(err) = store.persist(&change) {
            tracing::warn!(project = command.node, error = %err, "rename not persisted, rolling back");
            if let Err(undo) = apply_rename(&mut self.tree, node, old_name) {
                tracing::error!(project = command.node, error = %undo, "failed to roll back rename");
            }
            self.log_transition(
                "rename_rolled_back".to_string(),
                Some(format!("Project {}: {}", command.node, err)),
            );
            return Err(err.into());
        }

        self.log_transition(
            "rename".to_string(),
            Some(format!("Renamed project {} from '{}' to '{}'", command.node, old_name, command.name)),
        );
        Ok(())
    }

    /// Optimistically toggles expansion, rolling back if the store refuses
    pub fn toggle<S: NodeStore + ?Sized>(
        &mut self,
        command: &ToggleCommand,
        store: &mut S,
    ) -> Result<ExpansionCommand, EngineError> {
        let node = self.resolve(command.node)?;
        let change = self.expansion.apply_optimistic(&mut self.tree, node)?;

        match store.persist(&change.change()) {
            Ok(()) => {
                self.expansion.confirm(node);
                self.log_transition(
                    "toggle".to_string(),
                    Some(format!("Project {} is now {:?}", command.node, change.to)),
                );
                Ok(change)
            }
            Err(err) => {
                tracing::warn!(project = command.node, error = %err, "toggle not persisted, rolling back");
                self.expansion.rollback(&mut self.tree, node);
                self.log_transition(
                    "toggle_rolled_back".to_string(),
                    Some(format!("Project {}: {}", command.node, err)),
                );
                Err(err.into())
            }
        }
    }

    /// Replaces a project's own task counters and re-rolls its ancestors
    pub fn update_direct_stats<S: NodeStore + ?Sized>(
        &mut self,
        id: ProjectId,
        direct: DirectStats,
        store: &mut S,
    ) -> Result<(), EngineError> {
        let node = self.resolve(id)?;
        let previous = self.tree.node(node)?.stats().direct();
        apply_direct_stats(&mut self.tree, node, direct)?;

        if let Err(err) = store.persist(&Change::DirectStats { id, stats: direct }) {
            tracing::warn!(project = id, error = %err, "stats update not persisted, rolling back");
            apply_direct_stats(&mut self.tree, node, previous)?;
            return Err(err.into());
        }

        self.log_transition(
            "update_stats".to_string(),
            Some(format!("Project {} now has {} direct tasks", id, direct.tasks)),
        );
        Ok(())
    }

    /// Expands every project passing `filter`, best effort
    ///
    /// Projects under collapsed ancestors are expanded too.
    pub fn expand_all<S: NodeStore + ?Sized>(
        &mut self,
        filter: Option<&dyn Fn(&TreeNode) -> bool>,
        store: &mut S,
    ) -> BatchReport {
        let report = self
            .expansion
            .expand_all(&mut self.tree, filter, |change| store.persist(change));
        self.log_batch("expand_all", &report);
        report
    }

    /// Collapses every project passing `filter`, best effort
    ///
    /// Projects under collapsed ancestors are collapsed too.
    pub fn collapse_all<S: NodeStore + ?Sized>(
        &mut self,
        filter: Option<&dyn Fn(&TreeNode) -> bool>,
        store: &mut S,
    ) -> BatchReport {
        let report = self
            .expansion
            .collapse_all(&mut self.tree, filter, |change| store.persist(change));
        self.log_batch("collapse_all", &report);
        report
    }

    fn log_batch(&mut self, action: &str, report: &BatchReport) {
        self.log_transition(
            action.to_string(),
            Some(format!(
                "{} changed, {} failed",
                report.applied.len(),
                report.failed.len()
            )),
        );
    }

    /// Rebuilds the whole tree from the store
    ///
    /// Every [`NodeId`] handed out before the rebuild becomes invalid.
    pub fn rebuild<S: NodeStore + ?Sized>(&mut self, store: &S) -> Result<usize, EngineError> {
        let records = store.load_all()?;
        let built = build_with(&records, self.config.child_order.clone())?;
        let mut tree = built.tree;
        annotate(&mut tree);

        self.tree = tree;
        self.warnings = built.warnings;
        self.expansion = ExpansionStateManager::new();
        self.log_transition(
            "rebuild".to_string(),
            Some(format!(
                "Rebuilt {} projects with {} warnings",
                self.tree.len(),
                self.warnings.len()
            )),
        );
        Ok(self.warnings.len())
    }

    /// Dispatches an application command
    pub fn execute<S: NodeStore + ?Sized>(
        &mut self,
        command: &Command,
        store: &mut S,
    ) -> Result<Outcome, EngineError> {
        match command {
            Command::Move(cmd) => self.move_node(cmd, store).map(|()| Outcome::Moved),
            Command::Toggle(cmd) => self.toggle(cmd, store).map(Outcome::Toggled),
            Command::Rename(cmd) => self.rename(cmd, store).map(|()| Outcome::Renamed),
            Command::Rebuild(_) => self
                .rebuild(store)
                .map(|warnings| Outcome::Rebuilt { warnings }),
        }
    }

    /// Display order honouring expand/collapse state
    pub fn visible_nodes(&self, filter: Option<&dyn Fn(&TreeNode) -> bool>) -> Vec<NodeId> {
        flatten(self.tree.roots(), &self.tree, true, filter)
    }

    /// Display order of the full tree regardless of expansion
    pub fn all_nodes(&self, filter: Option<&dyn Fn(&TreeNode) -> bool>) -> Vec<NodeId> {
        flatten(self.tree.roots(), &self.tree, false, filter)
    }

    /// Rollup stats for a batch of store ids; unknown ids are skipped
    pub fn stats_for(&self, ids: &[ProjectId]) -> HashMap<ProjectId, RollupStats> {
        let slots: Vec<NodeId> = ids.iter().filter_map(|&id| self.tree.lookup(id)).collect();
        crate::stats::batch_stats(&self.tree, &slots)
            .into_iter()
            .filter_map(|(slot, stats)| self.tree.get(slot).map(|n| (n.id(), stats)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn records() -> Vec<ProjectRecord> {
        vec![
            ProjectRecord::new(1, None, "A"),
            ProjectRecord::new(2, Some(1), "B").with_tasks(5, 2, 1),
            ProjectRecord::new(3, Some(2), "C").with_tasks(3, 3, 0),
            ProjectRecord::new(4, None, "D"),
        ]
    }

    fn session(store: &MemoryStore) -> Session {
        Session::load(store, EngineConfig::default()).unwrap()
    }

    fn ids(session: &Session, slots: &[NodeId]) -> Vec<ProjectId> {
        slots
            .iter()
            .map(|&s| session.tree().get(s).unwrap().id())
            .collect()
    }

    #[test]
    fn test_move_persists() {
        let mut store = MemoryStore::new(records());
        let mut session = session(&store);
        let command = MoveCommand {
            node: 2,
            new_parent: Some(4),
            max_depth: None,
        };
        session.move_node(&command, &mut store).unwrap();

        assert_eq!(session.node(3).unwrap().path(), "D/B/C");
        assert_eq!(store.get(2).unwrap().parent_id, Some(4));
        assert_eq!(session.history().last().unwrap().action, "move");
    }

    #[test]
    fn test_rejected_move_leaves_everything() {
        let mut store = MemoryStore::new(records());
        let mut session = session(&store);
        let command = MoveCommand {
            node: 1,
            new_parent: Some(3),
            max_depth: None,
        };
        let err = session.move_node(&command, &mut store).unwrap_err();
        assert!(matches!(err, EngineError::Move(MoveError::CyclicReference)));
        assert!(!err.is_programmer_error());
        assert_eq!(store.writes(), 0);
        assert_eq!(session.node(3).unwrap().path(), "A/B/C");
    }

    #[test]
    fn test_move_depth_override() {
        let store = MemoryStore::new(records());
        let session = session(&store);
        let command = MoveCommand {
            node: 4,
            new_parent: Some(3),
            max_depth: Some(2),
        };
        assert!(matches!(
            session.preview_move(&command),
            Err(EngineError::Move(MoveError::DepthExceeded { attempted: 3, max: 2 }))
        ));
    }

    #[test]
    fn test_failed_move_rolls_back() {
        let mut store = MemoryStore::new(records());
        let mut session = session(&store);
        store.fail_next_writes(1);

        let command = MoveCommand {
            node: 2,
            new_parent: None,
            max_depth: None,
        };
        let err = session.move_node(&command, &mut store).unwrap_err();
        assert!(matches!(err, EngineError::Persist(_)));
        assert_eq!(session.node(3).unwrap().path(), "A/B/C");
        assert_eq!(session.node(1).unwrap().stats().total_tasks, 8);
        assert!(session.tree().check_invariants().is_empty());
        assert_eq!(store.get(2).unwrap().parent_id, Some(1));
    }

    #[test]
    fn test_failed_rename_rolls_back() {
        let mut store = MemoryStore::new(records());
        let mut session = session(&store);
        store.fail_next_writes(1);
        let command = RenameCommand {
            node: 1,
            name: "Renamed".to_string(),
        };
        assert!(session.rename(&command, &mut store).is_err());
        assert_eq!(session.node(3).unwrap().path(), "A/B/C");

        session.rename(&command, &mut store).unwrap();
        assert_eq!(session.node(3).unwrap().path(), "Renamed/B/C");
        assert_eq!(store.get(1).unwrap().name, "Renamed");
    }

    #[test]
    fn test_rename_with_separator_is_not_persisted() {
        let mut store = MemoryStore::new(records());
        let mut session = session(&store);
        let command = RenameCommand {
            node: 2,
            name: "B/C".to_string(),
        };
        let err = session.rename(&command, &mut store).unwrap_err();
        assert!(matches!(err, EngineError::NameContainsSeparator { .. }));
        assert_eq!(store.writes(), 0);
        assert_eq!(store.get(2).unwrap().name, "B");
    }

    #[test]
    fn test_toggle_and_flatten() {
        let mut store = MemoryStore::new(records());
        let mut session = session(&store);

        let change = session.toggle(&ToggleCommand { node: 2 }, &mut store).unwrap();
        assert!(!change.to.is_expanded());
        assert_eq!(ids(&session, &session.visible_nodes(None)), vec![1, 2, 4]);
        assert!(!store.get(2).unwrap().is_expanded);

        session.toggle(&ToggleCommand { node: 2 }, &mut store).unwrap();
        assert_eq!(ids(&session, &session.visible_nodes(None)), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_failed_toggle_rolls_back() {
        let mut store = MemoryStore::new(records());
        let mut session = session(&store);
        store.fail_next_writes(1);
        assert!(session.toggle(&ToggleCommand { node: 2 }, &mut store).is_err());
        assert!(session.node(2).unwrap().is_expanded());
        assert!(!session.has_pending_expansion());
        assert_eq!(session.history().last().unwrap().action, "toggle_rolled_back");
    }

    #[test]
    fn test_unknown_project_is_programmer_error() {
        let mut store = MemoryStore::new(records());
        let mut session = session(&store);
        let err = session
            .toggle(&ToggleCommand { node: 99 }, &mut store)
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownProject(99)));
        assert!(err.is_programmer_error());
    }

    #[test]
    fn test_update_direct_stats() {
        let mut store = MemoryStore::new(records());
        let mut session = session(&store);
        let direct = DirectStats {
            tasks: 4,
            completed: 1,
            in_progress: 0,
            minutes: 45,
        };
        session.update_direct_stats(3, direct, &mut store).unwrap();
        assert_eq!(session.node(1).unwrap().stats().total_tasks, 9);
        assert_eq!(session.node(1).unwrap().stats().total_minutes, 45);
        assert_eq!(store.get(3).unwrap().direct_minutes, 45);
    }

    #[test]
    fn test_rebuild_picks_up_external_writes() {
        let mut store = MemoryStore::new(records());
        let mut session = session(&store);
        store.save(&ProjectRecord::new(5, Some(4), "E")).unwrap();

        let outcome = session
            .execute(&Command::Rebuild(RebuildCommand {}), &mut store)
            .unwrap();
        assert_eq!(outcome, Outcome::Rebuilt { warnings: 0 });
        assert_eq!(session.node(5).unwrap().path(), "D/E");
    }

    #[test]
    fn test_execute_dispatch_from_json() {
        let mut store = MemoryStore::new(records());
        let mut session = session(&store);
        let command: Command =
            serde_json::from_str(r#"{"type": "move", "node": 3, "new_parent": null}"#).unwrap();
        assert_eq!(session.execute(&command, &mut store).unwrap(), Outcome::Moved);
        assert!(session.node(3).unwrap().is_root());
    }

    #[test]
    fn test_stats_for_batch() {
        let store = MemoryStore::new(records());
        let session = session(&store);
        let stats = session.stats_for(&[1, 2, 404]);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[&1].total_tasks, 8);
        assert_eq!(stats[&2].total_completed, 5);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut store = MemoryStore::new(records());
        let config = EngineConfig {
            history_size: 3,
            ..EngineConfig::default()
        };
        let mut session = Session::load(&store, config).unwrap();
        for _ in 0..5 {
            session.toggle(&ToggleCommand { node: 1 }, &mut store).unwrap();
        }
        assert_eq!(session.history().count(), 3);
        assert!(session.history().all(|entry| entry.action == "toggle"));
    }

    #[test]
    fn test_orphan_warning_surfaces() {
        let mut list = records();
        list.push(ProjectRecord::new(5, Some(999), "Lost"));
        let store = MemoryStore::new(list);
        let session = session(&store);
        assert_eq!(
            session.warnings(),
            &[BuildError::OrphanedParentReference {
                id: 5,
                missing_parent: 999
            }]
        );
        assert!(session.node(5).unwrap().is_root());
    }
}

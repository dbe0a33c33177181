//! Core models for the hierarchy engine
//!
//! This module contains the record type handed over by the node store, the
//! arena-backed tree the engine owns, and the rollup statistics attached to
//! every node.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::engine::EngineError;

/// Identifier of a project as known to the node store
pub type ProjectId = u64;

/// Dense arena slot of a node inside one [`TreeIndex`]
///
/// A `NodeId` is only meaningful for the tree that handed it out; rebuilding
/// the tree invalidates every id issued before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(usize);

impl NodeId {
    pub(crate) fn new(slot: usize) -> Self {
        Self(slot)
    }

    /// Returns the arena slot
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

fn default_expanded() -> bool {
    true
}

/// A flat project record as loaded from the node store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: ProjectId,
    #[serde(default)]
    pub parent_id: Option<ProjectId>,
    pub name: String,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default = "default_expanded")]
    pub is_expanded: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub direct_tasks: u64,
    #[serde(default)]
    pub direct_completed: u64,
    #[serde(default)]
    pub direct_in_progress: u64,
    #[serde(default)]
    pub direct_minutes: u64,
}

impl ProjectRecord {
    /// Creates an expanded, private record with no tasks
    pub fn new(id: ProjectId, parent_id: Option<ProjectId>, name: impl Into<String>) -> Self {
        Self {
            id,
            parent_id,
            name: name.into(),
            is_public: false,
            is_expanded: true,
            updated_at: None,
            direct_tasks: 0,
            direct_completed: 0,
            direct_in_progress: 0,
            direct_minutes: 0,
        }
    }

    /// Sets the direct task counters
    pub fn with_tasks(mut self, tasks: u64, completed: u64, in_progress: u64) -> Self {
        self.direct_tasks = tasks;
        self.direct_completed = completed;
        self.direct_in_progress = in_progress;
        self
    }

    pub fn with_minutes(mut self, minutes: u64) -> Self {
        self.direct_minutes = minutes;
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = Some(updated_at);
        self
    }

    pub fn public(mut self) -> Self {
        self.is_public = true;
        self
    }

    pub fn collapsed(mut self) -> Self {
        self.is_expanded = false;
        self
    }

    /// Returns the direct counters carried by this record
    pub fn direct_stats(&self) -> DirectStats {
        DirectStats {
            tasks: self.direct_tasks,
            completed: self.direct_completed,
            in_progress: self.direct_in_progress,
            minutes: self.direct_minutes,
        }
    }
}

/// Task counters that belong to a single project, excluding its descendants
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectStats {
    pub tasks: u64,
    pub completed: u64,
    pub in_progress: u64,
    pub minutes: u64,
}

/// Direct and subtree-aggregated task statistics of a node
///
/// The `total_*` fields and `descendant_count` are owned by the stats
/// aggregator and only ever derived from children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupStats {
    pub direct_tasks: u64,
    pub direct_completed: u64,
    pub direct_in_progress: u64,
    pub direct_minutes: u64,
    pub total_tasks: u64,
    pub total_completed: u64,
    pub total_in_progress: u64,
    pub total_minutes: u64,
    pub descendant_count: u64,
}

impl RollupStats {
    /// Creates stats whose totals equal the direct counters (a leaf)
    pub fn from_direct(direct: DirectStats) -> Self {
        let mut stats = Self::default();
        stats.set_direct(direct);
        stats.reset_totals();
        stats
    }

    pub fn direct(&self) -> DirectStats {
        DirectStats {
            tasks: self.direct_tasks,
            completed: self.direct_completed,
            in_progress: self.direct_in_progress,
            minutes: self.direct_minutes,
        }
    }

    pub(crate) fn set_direct(&mut self, direct: DirectStats) {
        self.direct_tasks = direct.tasks;
        self.direct_completed = direct.completed;
        self.direct_in_progress = direct.in_progress;
        self.direct_minutes = direct.minutes;
    }

    /// Resets the totals to the direct counters, forgetting all descendants
    pub(crate) fn reset_totals(&mut self) {
        self.total_tasks = self.direct_tasks;
        self.total_completed = self.direct_completed;
        self.total_in_progress = self.direct_in_progress;
        self.total_minutes = self.direct_minutes;
        self.descendant_count = 0;
    }

    /// Folds an already-rolled-up child into these totals
    ///
    /// Totals saturate at `u64::MAX` instead of wrapping.
    pub(crate) fn absorb_child(&mut self, child: &RollupStats) {
        self.total_tasks = self.total_tasks.saturating_add(child.total_tasks);
        self.total_completed = self.total_completed.saturating_add(child.total_completed);
        self.total_in_progress = self.total_in_progress.saturating_add(child.total_in_progress);
        self.total_minutes = self.total_minutes.saturating_add(child.total_minutes);
        self.descendant_count = self
            .descendant_count
            .saturating_add(child.descendant_count.saturating_add(1));
    }

    /// Fraction of subtree tasks that are completed, `None` for an empty subtree
    pub fn completion_ratio(&self) -> Option<f64> {
        if self.total_tasks == 0 {
            None
        } else {
            Some(self.total_completed as f64 / self.total_tasks as f64)
        }
    }
}

/// A project node inside the arena
#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    id: ProjectId,
    parent_id: Option<ProjectId>,
    #[serde(skip)]
    parent: Option<NodeId>,
    name: String,
    depth: u32,
    path: String,
    is_expanded: bool,
    is_public: bool,
    updated_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    children: Vec<NodeId>,
    stats: RollupStats,
}

impl TreeNode {
    pub(crate) fn from_record(record: &ProjectRecord) -> Self {
        Self {
            id: record.id,
            parent_id: record.parent_id,
            parent: None,
            name: record.name.clone(),
            depth: 0,
            path: record.name.clone(),
            is_expanded: record.is_expanded,
            is_public: record.is_public,
            updated_at: record.updated_at,
            children: Vec::new(),
            stats: RollupStats::from_direct(record.direct_stats()),
        }
    }

    /// Gets the store id of this node
    pub fn id(&self) -> ProjectId {
        self.id
    }

    /// Gets the store id of the parent, `None` for roots
    pub fn parent_id(&self) -> Option<ProjectId> {
        self.parent_id
    }

    /// Gets the arena slot of the parent, `None` for roots
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Gets the slash separated path from the root to this node
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_expanded(&self) -> bool {
        self.is_expanded
    }

    pub fn is_public(&self) -> bool {
        self.is_public
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Gets the children in display order
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn stats(&self) -> &RollupStats {
        &self.stats
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Converts the node back into the record shape the store persists
    pub fn to_record(&self) -> ProjectRecord {
        let direct = self.stats.direct();
        ProjectRecord {
            id: self.id,
            parent_id: self.parent_id,
            name: self.name.clone(),
            is_public: self.is_public,
            is_expanded: self.is_expanded,
            updated_at: self.updated_at,
            direct_tasks: direct.tasks,
            direct_completed: direct.completed,
            direct_in_progress: direct.in_progress,
            direct_minutes: direct.minutes,
        }
    }

    pub(crate) fn set_parent(&mut self, parent: Option<(NodeId, ProjectId)>) {
        self.parent = parent.map(|(slot, _)| slot);
        self.parent_id = parent.map(|(_, id)| id);
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub(crate) fn set_expanded(&mut self, expanded: bool) {
        self.is_expanded = expanded;
    }

    pub(crate) fn set_placement(&mut self, depth: u32, path: String) {
        self.depth = depth;
        self.path = path;
    }

    pub(crate) fn children_mut(&mut self) -> &mut Vec<NodeId> {
        &mut self.children
    }

    pub(crate) fn stats_mut(&mut self) -> &mut RollupStats {
        &mut self.stats
    }
}

/// Separator between the names of a breadcrumb path
pub const PATH_SEPARATOR: char = '/';

/// Joins a parent path and a child name
pub(crate) fn child_path(parent: Option<&TreeNode>, name: &str) -> String {
    match parent {
        Some(parent) => format!("{}{}{}", parent.path(), PATH_SEPARATOR, name),
        None => name.to_string(),
    }
}

/// Ordering applied to siblings when the tree is built or a node is attached
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildOrder {
    /// Most recently updated first, never-updated last, ties broken by name then id
    #[default]
    RecentlyUpdated,
    /// Alphabetical by name, ties broken by id
    Name,
    /// Ascending store id
    Id,
    /// Caller-supplied comparator
    #[serde(skip)]
    Custom(Arc<dyn Fn(&TreeNode, &TreeNode) -> Ordering + Send + Sync>),
}

impl fmt::Debug for ChildOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildOrder::RecentlyUpdated => f.write_str("RecentlyUpdated"),
            ChildOrder::Name => f.write_str("Name"),
            ChildOrder::Id => f.write_str("Id"),
            ChildOrder::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl ChildOrder {
    /// Wraps a caller comparator, which may capture its own state
    pub fn custom<F>(cmp: F) -> Self
    where
        F: Fn(&TreeNode, &TreeNode) -> Ordering + Send + Sync + 'static,
    {
        ChildOrder::Custom(Arc::new(cmp))
    }

    pub fn compare(&self, a: &TreeNode, b: &TreeNode) -> Ordering {
        match self {
            ChildOrder::RecentlyUpdated => match (a.updated_at(), b.updated_at()) {
                (Some(x), Some(y)) => y.cmp(&x),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
            .then_with(|| a.name().cmp(b.name()))
            .then_with(|| a.id().cmp(&b.id())),
            ChildOrder::Name => a.name().cmp(b.name()).then_with(|| a.id().cmp(&b.id())),
            ChildOrder::Id => a.id().cmp(&b.id()),
            ChildOrder::Custom(cmp) => cmp(a, b),
        }
    }
}

/// The arena-backed project forest
///
/// Parent and child relations are arena indices; nothing outside the crate
/// can mutate a node directly.
#[derive(Debug, Clone)]
pub struct TreeIndex {
    nodes: Vec<TreeNode>,
    roots: Vec<NodeId>,
    by_id: HashMap<ProjectId, NodeId>,
    order: ChildOrder,
}

impl TreeIndex {
    pub(crate) fn from_parts(
        nodes: Vec<TreeNode>,
        roots: Vec<NodeId>,
        by_id: HashMap<ProjectId, NodeId>,
        order: ChildOrder,
    ) -> Self {
        Self {
            nodes,
            roots,
            by_id,
            order,
        }
    }

    /// Returns the root nodes in display order
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn order(&self) -> ChildOrder {
        self.order.clone()
    }

    /// Gets the node in the given slot
    pub fn get(&self, node: NodeId) -> Option<&TreeNode> {
        self.nodes.get(node.0)
    }

    pub(crate) fn get_mut(&mut self, node: NodeId) -> Option<&mut TreeNode> {
        self.nodes.get_mut(node.0)
    }

    /// Resolves a slot, failing with [`EngineError::NodeNotFound`]
    pub fn node(&self, node: NodeId) -> Result<&TreeNode, EngineError> {
        self.get(node).ok_or(EngineError::NodeNotFound(node))
    }

    /// Looks up the slot of a store id
    pub fn lookup(&self, id: ProjectId) -> Option<NodeId> {
        self.by_id.get(&id).copied()
    }

    /// Looks up the slot of a store id, failing with [`EngineError::UnknownProject`]
    pub fn node_id(&self, id: ProjectId) -> Result<NodeId, EngineError> {
        self.lookup(id).ok_or(EngineError::UnknownProject(id))
    }

    /// Iterates over every slot in arena order
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(NodeId)
    }

    /// Iterates over every node in arena order
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &TreeNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub(crate) fn roots_mut(&mut self) -> &mut Vec<NodeId> {
        &mut self.roots
    }

    /// Returns the ancestors of a node, nearest parent first
    pub fn ancestors(&self, node: NodeId) -> Vec<NodeId> {
        let mut ancestors = Vec::new();
        let mut current = self.get(node).and_then(|n| n.parent());
        while let Some(slot) = current {
            // A forest never has a chain longer than the arena
            if ancestors.len() >= self.nodes.len() {
                break;
            }
            ancestors.push(slot);
            current = self.get(slot).and_then(|n| n.parent());
        }
        ancestors
    }

    /// Returns the node and all of its descendants in breadth-first order
    ///
    /// The walk is bounded by the size of the subtree and never recurses.
    pub fn subtree(&self, node: NodeId) -> Vec<NodeId> {
        if self.get(node).is_none() {
            return Vec::new();
        }
        let mut out = vec![node];
        let mut cursor = 0;
        while cursor < out.len() {
            let current = out[cursor];
            cursor += 1;
            if let Some(n) = self.get(current) {
                out.extend_from_slice(n.children());
            }
        }
        out
    }

    /// Returns all descendants of a node, excluding the node itself
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut subtree = self.subtree(node);
        if !subtree.is_empty() {
            subtree.remove(0);
        }
        subtree
    }

    /// Returns the names from the root down to the parent of `node`
    pub fn breadcrumb(&self, node: NodeId) -> Vec<String> {
        let mut names: Vec<String> = self
            .ancestors(node)
            .into_iter()
            .filter_map(|slot| self.get(slot).map(|n| n.name().to_string()))
            .collect();
        names.reverse();
        names
    }

    /// Position at which `node` would be inserted among `siblings`
    pub(crate) fn insertion_point(&self, siblings: &[NodeId], node: NodeId) -> usize {
        let Some(target) = self.get(node) else {
            return siblings.len();
        };
        siblings.partition_point(|&other| {
            self.get(other)
                .map(|o| self.order.compare(o, target) != Ordering::Greater)
                .unwrap_or(true)
        })
    }

    /// Checks the structural invariants and returns a description of each violation
    pub fn check_invariants(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut seen = vec![false; self.nodes.len()];
        let mut queue: VecDeque<NodeId> = VecDeque::new();

        for &root in &self.roots {
            match self.get(root) {
                Some(node) if node.parent().is_some() => {
                    problems.push(format!("root {} has a parent", node.id()))
                }
                Some(node) => {
                    if node.depth() != 0 {
                        problems.push(format!("root {} has depth {}", node.id(), node.depth()));
                    }
                    if node.path() != node.name() {
                        problems.push(format!("root {} has path '{}'", node.id(), node.path()));
                    }
                }
                None => problems.push(format!("root slot {} does not exist", root)),
            }
            queue.push_back(root);
        }

        while let Some(slot) = queue.pop_front() {
            let Some(node) = self.get(slot) else {
                continue;
            };
            if seen[slot.0] {
                problems.push(format!("node {} reachable twice", node.id()));
                continue;
            }
            seen[slot.0] = true;

            let mut expected = RollupStats::from_direct(node.stats().direct());
            for &child_slot in node.children() {
                let Some(child) = self.get(child_slot) else {
                    problems.push(format!("node {} has dangling child {}", node.id(), child_slot));
                    continue;
                };
                if child.parent() != Some(slot) || child.parent_id() != Some(node.id()) {
                    problems.push(format!("node {} has wrong parent link", child.id()));
                }
                if child.depth() != node.depth() + 1 {
                    problems.push(format!("node {} has depth {}", child.id(), child.depth()));
                }
                if child.path() != child_path(Some(node), child.name()) {
                    problems.push(format!("node {} has path '{}'", child.id(), child.path()));
                }
                expected.absorb_child(child.stats());
                queue.push_back(child_slot);
            }
            if expected != *node.stats() {
                problems.push(format!("node {} has stale rollup stats", node.id()));
            }
        }

        for (slot, reached) in seen.iter().enumerate() {
            if !reached {
                problems.push(format!("node {} is not reachable from a root", self.nodes[slot].id()));
            }
        }
        for (&id, &slot) in &self.by_id {
            if self.get(slot).map(|n| n.id()) != Some(id) {
                problems.push(format!("index entry for {} points at the wrong slot", id));
            }
        }

        problems
    }
}

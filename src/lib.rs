//! Project hierarchy library crate
//!
//! Builds a forest of projects from flat parent-pointer records, keeps
//! rolled-up task statistics consistent under moves and renames, and tracks
//! per-project expand/collapse state for list-style display.

pub mod builder;
pub mod cli;
pub mod config;
pub mod engine;
pub mod expansion;
pub mod flatten;
pub mod models;
pub mod recalc;
pub mod stats;
pub mod store;
pub mod validate;

// Re-export commonly used types
pub use builder::{build, build_with, BuildError, Built};
pub use config::{ConfigError, EngineConfig};
pub use engine::{
    Command, EngineError, MoveCommand, Outcome, RebuildCommand, RenameCommand, Session,
    ToggleCommand,
};
pub use expansion::{BatchReport, ExpansionCommand, ExpansionState, ExpansionStateManager};
pub use flatten::{flatten, flatten_rows, public_only, Row};
pub use models::{
    ChildOrder, DirectStats, NodeId, ProjectId, ProjectRecord, RollupStats, TreeIndex, TreeNode,
    PATH_SEPARATOR,
};
pub use store::{Change, JsonFileStore, MemoryStore, NodeStore, PersistError};
pub use validate::{validate_move, MoveError};

//! Node store boundary
//!
//! The engine never owns durable state. It reads records through a
//! [`NodeStore`] and reports each committed in-memory change back as a
//! [`Change`], which the store turns into a write.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::models::{DirectStats, ProjectId, ProjectRecord};

/// Errors raised by a node store
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("project {0} not found in store")]
    NotFound(ProjectId),
    #[error("store I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed store data: {0}")]
    Format(#[from] serde_json::Error),
}

/// A single durable change produced by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    Expansion {
        id: ProjectId,
        expanded: bool,
    },
    Move {
        id: ProjectId,
        new_parent: Option<ProjectId>,
    },
    Rename {
        id: ProjectId,
        name: String,
    },
    DirectStats {
        id: ProjectId,
        stats: DirectStats,
    },
}

impl Change {
    /// The project this change applies to
    pub fn project(&self) -> ProjectId {
        match self {
            Change::Expansion { id, .. }
            | Change::Move { id, .. }
            | Change::Rename { id, .. }
            | Change::DirectStats { id, .. } => *id,
        }
    }

    /// Applies the change to a stored record
    pub fn apply_to(&self, record: &mut ProjectRecord) {
        match self {
            Change::Expansion { expanded, .. } => record.is_expanded = *expanded,
            Change::Move { new_parent, .. } => record.parent_id = *new_parent,
            Change::Rename { name, .. } => record.name = name.clone(),
            Change::DirectStats { stats, .. } => {
                record.direct_tasks = stats.tasks;
                record.direct_completed = stats.completed;
                record.direct_in_progress = stats.in_progress;
                record.direct_minutes = stats.minutes;
            }
        }
    }
}

/// Flat record source the engine is built from
pub trait NodeStore {
    /// Loads every record, in no particular order
    fn load_all(&self) -> Result<Vec<ProjectRecord>, PersistError>;

    /// Loads the direct children of `parent` (`None` loads the roots)
    fn load_children(&self, parent: Option<ProjectId>) -> Result<Vec<ProjectRecord>, PersistError> {
        Ok(self
            .load_all()?
            .into_iter()
            .filter(|r| r.parent_id == parent)
            .collect())
    }

    /// Inserts or replaces a record
    fn save(&mut self, record: &ProjectRecord) -> Result<(), PersistError>;

    /// Removes a record; removing a missing record is not an error
    fn remove(&mut self, id: ProjectId) -> Result<(), PersistError>;

    /// Makes a single engine change durable
    fn persist(&mut self, change: &Change) -> Result<(), PersistError> {
        let id = change.project();
        let mut record = self
            .load_all()?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or(PersistError::NotFound(id))?;
        change.apply_to(&mut record);
        self.save(&record)
    }
}

/// In-memory store, mostly for tests and embedding
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    records: Vec<ProjectRecord>,
    fail_writes: usize,
    writes: usize,
}

impl MemoryStore {
    pub fn new(records: Vec<ProjectRecord>) -> Self {
        Self {
            records,
            fail_writes: 0,
            writes: 0,
        }
    }

    /// Makes the next `count` writes fail with [`PersistError::Unavailable`]
    pub fn fail_next_writes(&mut self, count: usize) {
        self.fail_writes = count;
    }

    /// Number of successful writes so far
    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn get(&self, id: ProjectId) -> Option<&ProjectRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    fn check_write(&mut self) -> Result<(), PersistError> {
        if self.fail_writes > 0 {
            self.fail_writes -= 1;
            return Err(PersistError::Unavailable("injected write failure".to_string()));
        }
        self.writes += 1;
        Ok(())
    }
}

impl NodeStore for MemoryStore {
    fn load_all(&self) -> Result<Vec<ProjectRecord>, PersistError> {
        Ok(self.records.clone())
    }

    fn save(&mut self, record: &ProjectRecord) -> Result<(), PersistError> {
        self.check_write()?;
        match self.records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => self.records.push(record.clone()),
        }
        Ok(())
    }

    fn remove(&mut self, id: ProjectId) -> Result<(), PersistError> {
        self.check_write()?;
        self.records.retain(|r| r.id != id);
        Ok(())
    }

    fn persist(&mut self, change: &Change) -> Result<(), PersistError> {
        let id = change.project();
        if !self.records.iter().any(|r| r.id == id) {
            return Err(PersistError::NotFound(id));
        }
        self.check_write()?;
        if let Some(record) = self.records.iter_mut().find(|r| r.id == id) {
            change.apply_to(record);
        }
        Ok(())
    }
}

/// Store backed by a JSON array of records on disk
///
/// Every write rewrites the whole file through a temporary sibling and a
/// rename, so readers never observe a half-written file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_all(&self, records: &[ProjectRecord]) -> Result<(), PersistError> {
        let json = serde_json::to_string_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl NodeStore for JsonFileStore {
    fn load_all(&self) -> Result<Vec<ProjectRecord>, PersistError> {
        match fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(Vec::new()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&mut self, record: &ProjectRecord) -> Result<(), PersistError> {
        let mut records = self.load_all()?;
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        self.write_all(&records)
    }

    fn remove(&mut self, id: ProjectId) -> Result<(), PersistError> {
        let mut records = self.load_all()?;
        records.retain(|r| r.id != id);
        self.write_all(&records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn setup_store_path() -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("projects.json");
        (tmp, path)
    }

    #[test]
    fn test_change_apply_to() {
        let mut record = ProjectRecord::new(1, None, "A");
        Change::Move {
            id: 1,
            new_parent: Some(9),
        }
        .apply_to(&mut record);
        Change::Rename {
            id: 1,
            name: "Renamed".to_string(),
        }
        .apply_to(&mut record);
        Change::Expansion {
            id: 1,
            expanded: false,
        }
        .apply_to(&mut record);
        assert_eq!(record.parent_id, Some(9));
        assert_eq!(record.name, "Renamed");
        assert!(!record.is_expanded);
    }

    #[test]
    fn test_memory_store_children_and_failures() {
        let mut store = MemoryStore::new(vec![
            ProjectRecord::new(1, None, "A"),
            ProjectRecord::new(2, Some(1), "B"),
            ProjectRecord::new(3, Some(1), "C"),
        ]);
        let children: Vec<ProjectId> = store
            .load_children(Some(1))
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(children, vec![2, 3]);

        store.fail_next_writes(1);
        let change = Change::Rename {
            id: 2,
            name: "B2".to_string(),
        };
        assert!(matches!(store.persist(&change), Err(PersistError::Unavailable(_))));
        assert_eq!(store.get(2).unwrap().name, "B");

        store.persist(&change).unwrap();
        assert_eq!(store.get(2).unwrap().name, "B2");
        assert_eq!(store.writes(), 1);

        assert!(matches!(
            store.persist(&Change::Expansion { id: 42, expanded: true }),
            Err(PersistError::NotFound(42))
        ));
    }

    #[test]
    fn test_json_store_round_trip() {
        let (_tmp, path) = setup_store_path();
        let mut store = JsonFileStore::new(&path);
        assert!(store.load_all().unwrap().is_empty());

        store.save(&ProjectRecord::new(1, None, "A")).unwrap();
        store.save(&ProjectRecord::new(2, Some(1), "B")).unwrap();
        store
            .persist(&Change::Move {
                id: 2,
                new_parent: None,
            })
            .unwrap();
        store.remove(1).unwrap();

        let records = store.load_all().unwrap();
        assert_eq!(records, vec![ProjectRecord::new(2, None, "B")]);
    }

    #[test]
    fn test_json_store_defaults_optional_fields() {
        let (_tmp, path) = setup_store_path();
        fs::write(&path, r#"[{"id": 1, "name": "Solo"}]"#).unwrap();
        let store = JsonFileStore::new(&path);
        let records = store.load_all().unwrap();
        assert_eq!(records, vec![ProjectRecord::new(1, None, "Solo")]);
    }

    #[test]
    fn test_json_store_rejects_garbage() {
        let (_tmp, path) = setup_store_path();
        fs::write(&path, "not json").unwrap();
        let store = JsonFileStore::new(&path);
        assert!(matches!(store.load_all(), Err(PersistError::Format(_))));
    }
}

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{pickup_order, Task, TaskFilter, TaskState, TaskUpdate};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(Uuid),
    #[error("duplicate task: {0}")]
    Duplicate(Uuid),
    /// The backing store cannot be reached. Fatal to a run.
    #[error("task store unreachable: {0}")]
    Unreachable(String),
    #[error("task record could not be decoded: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// SetOutcome
// ---------------------------------------------------------------------------

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub enum SetOutcome {
    /// The expected prior state matched and the update was written.
    Applied(Task),
    /// Another writer changed the state first; nothing was written.
    Conflict { actual: TaskState },
}

impl SetOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, SetOutcome::Applied(_))
    }
}

// ---------------------------------------------------------------------------
// TaskStore port
// ---------------------------------------------------------------------------

/// Persisted task records shared by every engine instance.
///
/// `set` is the only cross-instance coordination primitive: it writes
/// only when the stored state still equals `expected`. Adapters must make
/// the compare and the write a single atomic step.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Task>>;

    async fn set(&self, id: Uuid, update: &TaskUpdate, expected: TaskState)
        -> Result<SetOutcome>;

    async fn delete(&self, id: Uuid) -> Result<()>;

    /// Matching tasks in pickup order (priority desc, then oldest first).
    async fn fetch(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    async fn insert(&self, task: &Task) -> Result<()>;
}

// ---------------------------------------------------------------------------
// InMemoryTaskStore
// ---------------------------------------------------------------------------

/// Thread-safe in-memory store. Clones share the same records, so several
/// engines built on clones race exactly like instances on a real store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskStore {
    tasks: Arc<RwLock<HashMap<Uuid, Task>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in any state.
    pub fn len(&self) -> usize {
        self.tasks.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned(err: impl std::fmt::Display) -> StoreError {
    StoreError::Unreachable(err.to_string())
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get(&self, id: Uuid) -> Result<Option<Task>> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        Ok(tasks.get(&id).cloned())
    }

    async fn set(
        &self,
        id: Uuid,
        update: &TaskUpdate,
        expected: TaskState,
    ) -> Result<SetOutcome> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        let task = tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if task.state != expected {
            return Ok(SetOutcome::Conflict { actual: task.state });
        }
        update.apply_to(task);
        Ok(SetOutcome::Applied(task.clone()))
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        tasks.remove(&id).map(|_| ()).ok_or(StoreError::NotFound(id))
    }

    async fn fetch(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        let mut out: Vec<Task> = tasks.values().filter(|t| filter.matches(t)).cloned().collect();
        out.sort_by(pickup_order);
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn insert(&self, task: &Task) -> Result<()> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        if tasks.contains_key(&task.id) {
            return Err(StoreError::Duplicate(task.id));
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

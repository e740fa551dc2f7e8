use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::TransactionBehavior;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::store::{Result, SetOutcome, StoreError, TaskStore};
use crate::types::{Task, TaskFilter, TaskState, TaskUpdate, WorkCategory};

/// SQLite-backed task store. Several engine processes may open the same
/// file; the conditional `UPDATE ... WHERE state = ?` is what keeps claims
/// exclusive across them.
pub struct SqliteTaskStore {
    conn: Connection,
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::Rusqlite(rusqlite::Error::FromSqlConversionFailure(
                _,
                _,
                inner,
            )) => StoreError::Serialization(inner.to_string()),
            other => StoreError::Unreachable(other.to_string()),
        }
    }
}

fn conversion(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind}: {raw}")]
struct UnknownValue {
    kind: &'static str,
    raw: String,
}

fn parse_dt(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion(idx, e))
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let id_str: String = row.get(0)?;
    let name: String = row.get(1)?;
    let category_str: String = row.get(2)?;
    let state_str: String = row.get(3)?;
    let properties_str: String = row.get(5)?;
    let metadata_str: String = row.get(6)?;
    let created_at_str: String = row.get(7)?;
    let updated_at_str: String = row.get(8)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| conversion(0, e))?;
    let category = WorkCategory::parse(&category_str).ok_or_else(|| {
        conversion(
            2,
            UnknownValue {
                kind: "category",
                raw: category_str.clone(),
            },
        )
    })?;
    let state = TaskState::parse(&state_str).ok_or_else(|| {
        conversion(
            3,
            UnknownValue {
                kind: "state",
                raw: state_str.clone(),
            },
        )
    })?;

    Ok(Task {
        id,
        name,
        category,
        properties: serde_json::from_str(&properties_str).map_err(|e| conversion(5, e))?,
        state,
        metadata: serde_json::from_str(&metadata_str).map_err(|e| conversion(6, e))?,
        created_at: parse_dt(7, &created_at_str)?,
        updated_at: parse_dt(8, &updated_at_str)?,
    })
}

const SELECT_COLUMNS: &str =
    "SELECT id, name, category, state, priority, properties, metadata, created_at, updated_at
     FROM tasks";

fn select_one(conn: &rusqlite::Connection, id: &str) -> rusqlite::Result<Option<Task>> {
    let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1"))?;
    let mut rows = stmt.query(rusqlite::params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_task(row)?)),
        None => Ok(None),
    }
}

enum SetResult {
    Missing,
    Done(SetOutcome),
}

impl SqliteTaskStore {
    /// Open (or create) a store at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Purely in-memory store (useful for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS tasks (
                        id          TEXT PRIMARY KEY,
                        name        TEXT NOT NULL,
                        category    TEXT NOT NULL,
                        state       TEXT NOT NULL,
                        priority    INTEGER NOT NULL DEFAULT 0,
                        properties  TEXT NOT NULL,
                        metadata    TEXT NOT NULL,
                        created_at  TEXT NOT NULL,
                        updated_at  TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state);
                    CREATE INDEX IF NOT EXISTS idx_tasks_pickup
                        ON tasks(state, priority DESC, created_at ASC);
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn get(&self, id: Uuid) -> Result<Option<Task>> {
        let id = id.to_string();
        let task = self.conn.call(move |conn| Ok(select_one(conn, &id)?)).await?;
        Ok(task)
    }

    async fn set(
        &self,
        id: Uuid,
        update: &TaskUpdate,
        expected: TaskState,
    ) -> Result<SetOutcome> {
        let update = update.clone();
        let id_str = id.to_string();
        let result = self
            .conn
            .call(move |conn| {
                // Take the write lock up front so two processes never both
                // read the same prior state.
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let Some(mut task) = select_one(&tx, &id_str)? else {
                    return Ok(SetResult::Missing);
                };
                if task.state != expected {
                    return Ok(SetResult::Done(SetOutcome::Conflict { actual: task.state }));
                }
                update.apply_to(&mut task);
                let metadata = serde_json::to_string(&task.metadata)
                    .map_err(|e| tokio_rusqlite::Error::Other(Box::new(e)))?;

                // The state guard makes the write conditional even when
                // another process holds the same file open.
                let changed = tx.execute(
                    "UPDATE tasks SET state = ?1, metadata = ?2, updated_at = ?3
                     WHERE id = ?4 AND state = ?5",
                    rusqlite::params![
                        task.state.as_str(),
                        metadata,
                        task.updated_at.to_rfc3339(),
                        id_str,
                        expected.as_str(),
                    ],
                )?;
                if changed == 0 {
                    let actual = select_one(&tx, &id_str)?
                        .map(|t| t.state)
                        .unwrap_or(expected);
                    return Ok(SetResult::Done(SetOutcome::Conflict { actual }));
                }
                tx.commit()?;
                Ok(SetResult::Done(SetOutcome::Applied(task)))
            })
            .await?;

        match result {
            SetResult::Missing => Err(StoreError::NotFound(id)),
            SetResult::Done(outcome) => Ok(outcome),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let id_str = id.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute("DELETE FROM tasks WHERE id = ?1", rusqlite::params![id_str])?)
            })
            .await?;
        if removed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn fetch(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let state = filter.state.map(|s| s.as_str().to_string());
        let category = filter.category.map(|c| c.as_str().to_string());
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);

        let tasks = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_COLUMNS}
                     WHERE (?1 IS NULL OR state = ?1)
                       AND (?2 IS NULL OR category = ?2)
                     ORDER BY priority DESC, created_at ASC, id ASC
                     LIMIT ?3"
                ))?;
                let rows = stmt.query_map(rusqlite::params![state, category, limit], row_to_task)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;
        Ok(tasks)
    }

    async fn insert(&self, task: &Task) -> Result<()> {
        let properties = serde_json::to_string(&task.properties)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let metadata = serde_json::to_string(&task.metadata)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let id = task.id;
        let id_str = id.to_string();
        let name = task.name.clone();
        let category = task.category.as_str();
        let state = task.state.as_str();
        let priority = task.priority() as i64;
        let created_at = task.created_at.to_rfc3339();
        let updated_at = task.updated_at.to_rfc3339();

        let inserted = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "INSERT OR IGNORE INTO tasks (id, name, category, state, priority,
                        properties, metadata, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    rusqlite::params![
                        id_str, name, category, state, priority, properties, metadata,
                        created_at, updated_at,
                    ],
                )?)
            })
            .await?;
        if inserted == 0 {
            return Err(StoreError::Duplicate(id));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::meta;

    #[tokio::test]
    async fn insert_and_get_preserve_the_record() {
        let store = SqliteTaskStore::open_in_memory().await.unwrap();
        let mut task = Task::new("write docs", WorkCategory::Documentation)
            .with_priority(3)
            .with_output_path("docs/guide.md");
        task.metadata.insert("origin".into(), serde_json::json!("import"));
        store.insert(&task).await.unwrap();

        let loaded = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "write docs");
        assert_eq!(loaded.category, WorkCategory::Documentation);
        assert_eq!(loaded.properties.output_path.as_deref(), Some("docs/guide.md"));
        assert_eq!(loaded.meta_str("origin"), Some("import"));
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_is_conditional_on_prior_state() {
        let store = SqliteTaskStore::open_in_memory().await.unwrap();
        let task = Task::new("t", WorkCategory::Coding);
        store.insert(&task).await.unwrap();

        let claim = TaskUpdate::to_state(TaskState::InProgress).with_meta(meta::CLAIMED_BY, "a");
        let first = store.set(task.id, &claim, TaskState::Available).await.unwrap();
        assert!(first.is_applied());

        let second = store.set(task.id, &claim, TaskState::Available).await.unwrap();
        assert_eq!(
            second,
            SetOutcome::Conflict {
                actual: TaskState::InProgress
            }
        );

        let loaded = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.meta_str(meta::CLAIMED_BY), Some("a"));
    }

    #[tokio::test]
    async fn fetch_uses_pickup_order() {
        let store = SqliteTaskStore::open_in_memory().await.unwrap();
        let a = Task::new("a", WorkCategory::Coding).with_priority(1);
        let b = Task::new("b", WorkCategory::Planning).with_priority(7);
        let c = Task::new("c", WorkCategory::Coding)
            .with_priority(100)
            .with_state(TaskState::Failed);
        for t in [&a, &b, &c] {
            store.insert(t).await.unwrap();
        }

        let available = store.fetch(&TaskFilter::available()).await.unwrap();
        let names: Vec<_> = available.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["b", "a"]);

        let coding = store
            .fetch(&TaskFilter::available().in_category(WorkCategory::Coding))
            .await
            .unwrap();
        assert_eq!(coding.len(), 1);

        let everything = store.fetch(&TaskFilter::default()).await.unwrap();
        assert_eq!(everything.len(), 3);
    }

    #[tokio::test]
    async fn missing_and_duplicate_records_are_reported() {
        let store = SqliteTaskStore::open_in_memory().await.unwrap();
        let task = Task::new("t", WorkCategory::Operations);
        store.insert(&task).await.unwrap();
        assert!(matches!(store.insert(&task).await, Err(StoreError::Duplicate(_))));

        let err = store
            .set(Uuid::new_v4(), &TaskUpdate::default(), TaskState::Available)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        store.delete(task.id).await.unwrap();
        assert!(matches!(store.delete(task.id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn file_backed_store_is_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let one = SqliteTaskStore::open(&path).await.unwrap();
        let two = SqliteTaskStore::open(&path).await.unwrap();

        let task = Task::new("shared", WorkCategory::Coding);
        one.insert(&task).await.unwrap();

        let claim = TaskUpdate::to_state(TaskState::InProgress);
        assert!(two.set(task.id, &claim, TaskState::Available).await.unwrap().is_applied());
        assert!(!one.set(task.id, &claim, TaskState::Available).await.unwrap().is_applied());
    }
}

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dl_core::types::{Task, WorkCategory};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::operations::OperationDefinition;

#[derive(Debug, Error)]
pub enum WorkSourceError {
    #[error("work file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("work file {path} is malformed: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("cannot rewrite work file: {0}")]
    Encode(String),
    #[error("work source failed: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, WorkSourceError>;

// ---------------------------------------------------------------------------
// WorkProposal
// ---------------------------------------------------------------------------

/// A candidate task offered by a [`WorkSource`]. Becomes an available task
/// once the controller inserts it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkProposal {
    pub name: String,
    #[serde(default = "default_category")]
    pub category: WorkCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acceptance_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
}

fn default_category() -> WorkCategory {
    WorkCategory::Coding
}

impl WorkProposal {
    pub fn new(name: impl Into<String>, category: WorkCategory) -> Self {
        Self {
            name: name.into(),
            category,
            description: None,
            priority: 0,
            acceptance_criteria: Vec::new(),
            output_path: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn into_task(self) -> Task {
        let mut task = Task::new(self.name, self.category).with_priority(self.priority);
        task.properties.description = self.description;
        task.properties.acceptance_criteria = self.acceptance_criteria;
        task.properties.output_path = self.output_path;
        task
    }
}

// ---------------------------------------------------------------------------
// WorkSource port
// ---------------------------------------------------------------------------

/// Produces new work when the queue runs dry. Roadmap parsing and proposal
/// generation live behind this trait.
#[async_trait]
pub trait WorkSource: Send + Sync {
    /// At most `limit` proposals, shaped by the acquire operation's
    /// definition. An empty result means there is nothing left to do.
    async fn propose(
        &self,
        operation: &OperationDefinition,
        limit: usize,
    ) -> Result<Vec<WorkProposal>>;
}

/// Never proposes anything; the loop only drains what is already queued.
pub struct NoWorkSource;

#[async_trait]
impl WorkSource for NoWorkSource {
    async fn propose(&self, _: &OperationDefinition, _: usize) -> Result<Vec<WorkProposal>> {
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// FileWorkSource
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProposalFile {
    #[serde(default, rename = "task")]
    tasks: Vec<WorkProposal>,
}

/// Hands out `[[task]]` entries from a TOML file front to back. Taken
/// entries are removed from the file so each is proposed exactly once.
///
/// ```toml
/// [[task]]
/// name = "Add retry to the fetcher"
/// category = "coding"
/// priority = 5
/// description = "Wrap the HTTP call in a bounded retry."
/// ```
pub struct FileWorkSource {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileWorkSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> WorkSourceError {
        WorkSourceError::Io {
            path: self.path.clone(),
            source,
        }
    }

    async fn read(&self) -> Result<Option<ProposalFile>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(e)),
        };
        toml::from_str(&text)
            .map(Some)
            .map_err(|e| WorkSourceError::Parse {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }

    async fn write(&self, file: &ProposalFile) -> Result<()> {
        let text = toml::to_string_pretty(file).map_err(|e| WorkSourceError::Encode(e.to_string()))?;
        tokio::fs::write(&self.path, text)
            .await
            .map_err(|e| self.io_err(e))
    }
}

#[async_trait]
impl WorkSource for FileWorkSource {
    async fn propose(
        &self,
        operation: &OperationDefinition,
        limit: usize,
    ) -> Result<Vec<WorkProposal>> {
        let _guard = self.lock.lock().await;
        let Some(mut file) = self.read().await? else {
            debug!(path = %self.path.display(), "no work file");
            return Ok(Vec::new());
        };
        let limit = operation.max_tasks.map_or(limit, |max| max.min(limit));
        let take = limit.min(file.tasks.len());
        let mut taken: Vec<WorkProposal> = file.tasks.drain(..take).collect();
        if take > 0 {
            self.write(&file).await?;
        }
        for proposal in &mut taken {
            proposal.priority += operation.priority;
        }
        info!(
            path = %self.path.display(),
            taken = taken.len(),
            remaining = file.tasks.len(),
            "proposals taken from work file"
        );
        Ok(taken)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

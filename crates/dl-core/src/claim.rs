use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{SetOutcome, StoreError, TaskStore};
use crate::types::{meta, Task, TaskFilter, TaskState, TaskUpdate};

/// Default number of pick+claim rounds before `claim_next` gives up.
pub const DEFAULT_CLAIM_ATTEMPTS: usize = 8;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: TaskState, to: TaskState },
    #[error("task not found: {0}")]
    NotFound(Uuid),
    /// The task left the state this instance expected it to hold.
    #[error("task {id} is no longer {expected} (now {actual})")]
    Lost {
        id: Uuid,
        expected: TaskState,
        actual: TaskState,
    },
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ClaimError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ClaimError::NotFound(id),
            other => ClaimError::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClaimError>;

// ---------------------------------------------------------------------------
// TaskTransitions
// ---------------------------------------------------------------------------

/// The only path by which the engine changes a task's state. Every edge is
/// checked against [`TaskState::can_transition_to`] before the store is
/// touched.
#[derive(Clone)]
pub struct TaskTransitions {
    store: Arc<dyn TaskStore>,
}

impl TaskTransitions {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub async fn apply(
        &self,
        id: Uuid,
        from: TaskState,
        to: TaskState,
        patch: TaskUpdate,
    ) -> Result<SetOutcome> {
        if !from.can_transition_to(&to) {
            return Err(ClaimError::IllegalTransition { from, to });
        }
        let update = TaskUpdate {
            state: Some(to),
            metadata: patch.metadata,
        };
        Ok(self.store.set(id, &update, from).await?)
    }

    /// Apply a transition the caller already owns; a conflict means the
    /// claim was lost and is reported as an error.
    async fn apply_owned(
        &self,
        id: Uuid,
        from: TaskState,
        to: TaskState,
        patch: TaskUpdate,
    ) -> Result<Task> {
        match self.apply(id, from, to, patch).await? {
            SetOutcome::Applied(task) => Ok(task),
            SetOutcome::Conflict { actual } => Err(ClaimError::Lost {
                id,
                expected: from,
                actual,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Claim types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(Task),
    /// Another instance moved the task first. Not an error: re-pick.
    Conflict { actual: TaskState },
}

/// How a claim ends when the work did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseKind {
    /// Return the task to `available` so any instance can pick it again.
    Retryable,
    /// Mark the task `failed`.
    Unrecoverable,
}

/// Figures recorded on a task when it completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionStats {
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub invocations: u64,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub doc_words: u64,
}

/// Instance identity written to `claimed_by`.
pub fn default_claimant_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    let short = Uuid::new_v4().simple().to_string();
    format!("{host}-{}-{}", std::process::id(), &short[..8])
}

// ---------------------------------------------------------------------------
// ClaimManager
// ---------------------------------------------------------------------------

/// Picks and atomically claims available work over a shared store.
#[derive(Clone)]
pub struct ClaimManager {
    store: Arc<dyn TaskStore>,
    transitions: TaskTransitions,
    claimant: String,
    max_attempts: usize,
}

impl ClaimManager {
    pub fn new(store: Arc<dyn TaskStore>, claimant: impl Into<String>) -> Self {
        Self {
            transitions: TaskTransitions::new(Arc::clone(&store)),
            store,
            claimant: claimant.into(),
            max_attempts: DEFAULT_CLAIM_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn claimant(&self) -> &str {
        &self.claimant
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn transitions(&self) -> &TaskTransitions {
        &self.transitions
    }

    /// Highest-priority, oldest available task matching `filter`.
    pub async fn pick(&self, filter: &TaskFilter) -> Result<Option<Task>> {
        let filter = TaskFilter {
            state: Some(TaskState::Available),
            category: filter.category,
            limit: Some(1),
        };
        let mut tasks = self.store.fetch(&filter).await?;
        Ok(if tasks.is_empty() {
            None
        } else {
            Some(tasks.remove(0))
        })
    }

    /// Conditionally move `task` from available to in-progress.
    pub async fn claim(&self, task: &Task) -> Result<ClaimOutcome> {
        let patch = TaskUpdate::default()
            .with_meta(meta::CLAIMED_AT, Utc::now().to_rfc3339())
            .with_meta(meta::CLAIMED_BY, self.claimant.as_str());
        let outcome = self
            .transitions
            .apply(task.id, TaskState::Available, TaskState::InProgress, patch)
            .await?;
        match outcome {
            SetOutcome::Applied(task) => {
                info!(task_id = %task.id, claimant = %self.claimant, "task claimed");
                Ok(ClaimOutcome::Claimed(task))
            }
            SetOutcome::Conflict { actual } => {
                debug!(task_id = %task.id, actual = %actual, "claim lost to another instance");
                Ok(ClaimOutcome::Conflict { actual })
            }
        }
    }

    /// Pick and claim, re-picking when another instance wins the race.
    pub async fn claim_next(&self, filter: &TaskFilter) -> Result<Option<Task>> {
        for attempt in 1..=self.max_attempts {
            let Some(candidate) = self.pick(filter).await? else {
                return Ok(None);
            };
            match self.claim(&candidate).await {
                Ok(ClaimOutcome::Claimed(task)) => return Ok(Some(task)),
                Ok(ClaimOutcome::Conflict { .. }) => {
                    debug!(attempt, task_id = %candidate.id, "re-picking after conflict");
                }
                Err(ClaimError::NotFound(id)) => {
                    warn!(task_id = %id, attempt, "task vanished while claiming; re-picking");
                }
                Err(e) => return Err(e),
            }
        }
        warn!(
            attempts = self.max_attempts,
            "claim contention exhausted; treating queue as empty"
        );
        Ok(None)
    }

    /// End a claim without completing the work.
    pub async fn release(&self, id: Uuid, reason: &str, kind: ReleaseKind) -> Result<Task> {
        self.release_with(id, reason, kind, TaskUpdate::default()).await
    }

    /// Fail a task because a quality gate rejected it.
    pub async fn fail_at_gate(&self, id: Uuid, reason: &str, gate: &str) -> Result<Task> {
        let extra = TaskUpdate::default().with_meta(meta::FAILED_GATE, gate);
        self.release_with(id, reason, ReleaseKind::Unrecoverable, extra)
            .await
    }

    async fn release_with(
        &self,
        id: Uuid,
        reason: &str,
        kind: ReleaseKind,
        extra: TaskUpdate,
    ) -> Result<Task> {
        let now = Utc::now().to_rfc3339();
        let (to, patch) = match kind {
            ReleaseKind::Retryable => (
                TaskState::Available,
                extra
                    .with_meta(meta::RELEASED_AT, now)
                    .with_meta(meta::RELEASE_REASON, reason),
            ),
            ReleaseKind::Unrecoverable => (
                TaskState::Failed,
                extra
                    .with_meta(meta::FAILED_AT, now)
                    .with_meta(meta::FAILURE_REASON, reason),
            ),
        };
        let task = self
            .transitions
            .apply_owned(id, TaskState::InProgress, to, patch)
            .await?;
        info!(task_id = %id, state = %task.state, reason, "claim released");
        Ok(task)
    }

    /// Mark a claimed task completed and record its figures.
    pub async fn complete(&self, id: Uuid, stats: CompletionStats) -> Result<Task> {
        let patch = TaskUpdate::default()
            .with_meta(meta::COMPLETED_AT, Utc::now().to_rfc3339())
            .with_meta(meta::TOKENS_INPUT, stats.tokens_input)
            .with_meta(meta::TOKENS_OUTPUT, stats.tokens_output)
            .with_meta(meta::INVOCATIONS, stats.invocations)
            .with_meta(meta::LINES_ADDED, stats.lines_added)
            .with_meta(meta::LINES_REMOVED, stats.lines_removed)
            .with_meta(meta::DOC_WORDS, stats.doc_words);
        let task = self
            .transitions
            .apply_owned(id, TaskState::InProgress, TaskState::Completed, patch)
            .await?;
        info!(task_id = %id, "task completed");
        Ok(task)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dl_core::cancel::CancelSignal;
use dl_core::claim::{ClaimError, ClaimManager, CompletionStats, ReleaseKind};
use dl_core::quality_gate::{documentation_words, GateKind, GateReport, QualityGateRunner};
use dl_core::store::StoreError;
use dl_core::types::{Task, TaskFilter, TaskState, WorkCategory};
use dl_core::worktree_manager::{
    CleanupReport, DiffStat, MergeResult, Workspace, WorkspaceError, WorkspaceManager,
};
use dl_harness::dispatch::{DispatchError, DispatchLoop};
use dl_harness::provider::Usage;
use dl_harness::tools::ToolContext;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::prompts::{PromptSource, TemplatePrompts};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures that prevent a task from being finalised at all. Anything that
/// only sinks the attempt is a [`TaskFailure`] inside a [`TaskOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum TaskRunError {
    #[error("task {id} is not claimed (state {state})")]
    NotClaimed { id: Uuid, state: TaskState },
    #[error(transparent)]
    Claim(#[from] ClaimError),
    #[error("task {id} ({name}): {source}")]
    Workspace {
        id: Uuid,
        name: String,
        #[source]
        source: WorkspaceError,
    },
}

impl TaskRunError {
    /// Store unreachable or git missing: stop the run, not just the task.
    pub fn is_infrastructure(&self) -> bool {
        match self {
            TaskRunError::Claim(ClaimError::Store(StoreError::Unreachable(_))) => true,
            TaskRunError::Workspace { source, .. } => source.is_infrastructure(),
            _ => false,
        }
    }

    /// The task the error belongs to, when it is known.
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            TaskRunError::NotClaimed { id, .. }
            | TaskRunError::Workspace { id, .. }
            | TaskRunError::Claim(ClaimError::Lost { id, .. })
            | TaskRunError::Claim(ClaimError::NotFound(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn task_name(&self) -> Option<&str> {
        match self {
            TaskRunError::Workspace { name, .. } => Some(name),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskRunError>;

// ---------------------------------------------------------------------------
// TaskFailure / TaskOutcome
// ---------------------------------------------------------------------------

/// Why one attempt did not complete.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskFailure {
    Agent(DispatchError),
    Workspace(String),
    GateSpawn(String),
    Gate { kind: GateKind, reason: String },
    MergeConflict(Vec<String>),
    /// The per-task deadline passed.
    TimedOut,
    /// The run was cancelled. The task goes back to the queue.
    Cancelled,
}

impl TaskFailure {
    pub fn release_kind(&self) -> ReleaseKind {
        match self {
            TaskFailure::Cancelled => ReleaseKind::Retryable,
            _ => ReleaseKind::Unrecoverable,
        }
    }

    pub fn failed_gate(&self) -> Option<GateKind> {
        match self {
            TaskFailure::Gate { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFailure::Agent(DispatchError::Provider(e)) => {
                write!(f, "agent {}: {e}", e.class())
            }
            TaskFailure::Agent(e) => write!(f, "agent: {e}"),
            TaskFailure::Workspace(msg) => write!(f, "workspace: {msg}"),
            TaskFailure::GateSpawn(msg) => write!(f, "gate: {msg}"),
            TaskFailure::Gate { reason, .. } => f.write_str(reason),
            TaskFailure::MergeConflict(files) => {
                write!(f, "merge conflict in {}", files.join(", "))
            }
            TaskFailure::TimedOut => f.write_str("timed out"),
            TaskFailure::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Everything the controller needs to account for one finished attempt.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    /// The task as persisted after finalisation.
    pub task: Task,
    pub usage: Usage,
    pub diff: DiffStat,
    pub doc_words: u64,
    pub gates: Option<GateReport>,
    pub failure: Option<TaskFailure>,
    /// Present for code-bearing tasks that got a workspace.
    pub cleanup: Option<CleanupReport>,
    pub duration_ms: u64,
}

impl TaskOutcome {
    pub fn completed(&self) -> bool {
        self.task.state == TaskState::Completed
    }
}

#[derive(Debug, Default)]
struct Attempt {
    usage: Usage,
    diff: DiffStat,
    doc_words: u64,
    gates: Option<GateReport>,
    /// Set when git disappeared mid-attempt; the run aborts after cleanup.
    infrastructure: Option<WorkspaceError>,
}

impl Attempt {
    fn workspace_failure(&mut self, err: WorkspaceError) -> TaskFailure {
        let failure = TaskFailure::Workspace(err.to_string());
        if err.is_infrastructure() {
            self.infrastructure = Some(err);
        }
        failure
    }
}

// ---------------------------------------------------------------------------
// TaskRunner
// ---------------------------------------------------------------------------

/// Drives one claimed task through its lifecycle:
///
/// workspace (code only) -> dispatch -> diff -> gates -> merge or discard
/// -> workspace removal -> complete / fail / release.
///
/// The workspace is removed on every path once it exists, including
/// cancellation, and always before the task's final state is written.
#[derive(Clone)]
pub struct TaskRunner {
    claims: ClaimManager,
    workspaces: WorkspaceManager,
    gates: QualityGateRunner,
    dispatch: DispatchLoop,
    prompts: Arc<dyn PromptSource>,
    task_timeout: Option<Duration>,
    command_timeout: Duration,
}

impl TaskRunner {
    pub fn new(
        claims: ClaimManager,
        workspaces: WorkspaceManager,
        gates: QualityGateRunner,
        dispatch: DispatchLoop,
    ) -> Self {
        Self {
            claims,
            workspaces,
            gates,
            dispatch,
            prompts: Arc::new(TemplatePrompts::new()),
            task_timeout: None,
            command_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_prompts(mut self, prompts: Arc<dyn PromptSource>) -> Self {
        self.prompts = prompts;
        self
    }

    /// Deadline for one whole attempt, measured from the start of `run`.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    /// Timeout for agent `run_command` tool calls.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn claims(&self) -> &ClaimManager {
        &self.claims
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn gates(&self) -> &QualityGateRunner {
        &self.gates
    }

    /// Claim the next matching task and run it. `None` when the queue is
    /// empty.
    pub async fn run_next(
        &self,
        filter: &TaskFilter,
        cancel: &CancelSignal,
    ) -> Result<Option<TaskOutcome>> {
        match self.claims.claim_next(filter).await? {
            Some(task) => self.run(task, cancel).await.map(Some),
            None => Ok(None),
        }
    }

    /// Run a task this instance has already claimed.
    pub async fn run(&self, task: Task, cancel: &CancelSignal) -> Result<TaskOutcome> {
        if task.state != TaskState::InProgress {
            return Err(TaskRunError::NotClaimed {
                id: task.id,
                state: task.state,
            });
        }
        let started = Instant::now();
        let signal = match self.task_timeout {
            Some(timeout) => cancel.limited_to(tokio::time::Instant::now() + timeout),
            None => cancel.clone(),
        };
        info!(
            task_id = %task.id,
            name = %task.name,
            category = %task.category,
            "running task"
        );

        let workspace = if task.category.is_code_bearing() {
            match self.workspaces.create(task.id).await {
                Ok(ws) => Some(ws),
                Err(e) if e.is_infrastructure() => {
                    error!(task_id = %task.id, error = %e, "cannot create workspace");
                    return Err(self.abandon(&task, e).await);
                }
                Err(e) => {
                    let failure = TaskFailure::Workspace(e.to_string());
                    return self
                        .finish(task, Attempt::default(), Err(failure), None, started)
                        .await;
                }
            }
        } else {
            None
        };

        let work_dir = workspace
            .as_ref()
            .map(|ws| ws.path.clone())
            .unwrap_or_else(|| self.workspaces.repo_root().to_path_buf());

        let mut attempt = Attempt::default();
        let result = self
            .execute(&task, workspace.as_ref(), &work_dir, &signal, &mut attempt)
            .await;

        let cleanup = match &workspace {
            Some(ws) => Some(self.workspaces.remove(ws).await),
            None => None,
        };
        if let Some(e) = attempt.infrastructure.take() {
            error!(task_id = %task.id, error = %e, "git unavailable mid-task");
            return Err(self.abandon(&task, e).await);
        }
        self.finish(task, attempt, result, cleanup, started).await
    }

    /// Put the task back in the queue and wrap the error that stopped it.
    async fn abandon(&self, task: &Task, source: WorkspaceError) -> TaskRunError {
        if let Err(release) = self
            .claims
            .release(task.id, &source.to_string(), ReleaseKind::Retryable)
            .await
        {
            warn!(task_id = %task.id, error = %release, "failed to release task");
        }
        TaskRunError::Workspace {
            id: task.id,
            name: task.name.clone(),
            source,
        }
    }

    async fn execute(
        &self,
        task: &Task,
        workspace: Option<&Workspace>,
        work_dir: &Path,
        signal: &CancelSignal,
        attempt: &mut Attempt,
    ) -> std::result::Result<(), TaskFailure> {
        let messages = self.prompts.prompt_for(task, work_dir).into_messages();
        let ctx = ToolContext {
            root: work_dir.to_path_buf(),
            cancel: signal.clone(),
            command_timeout: self.command_timeout,
        };

        match self.dispatch.run(messages, &ctx).await {
            Ok(report) => {
                attempt.usage = report.usage;
                if report.truncated {
                    warn!(task_id = %task.id, "agent output truncated; gating what was produced");
                }
            }
            Err(failure) => {
                attempt.usage = failure.usage;
                return Err(match failure.error {
                    DispatchError::TimedOut => interrupted(signal),
                    other => TaskFailure::Agent(other),
                });
            }
        }
        if signal.is_cancelled() {
            return Err(interrupted(signal));
        }

        if let Some(ws) = workspace {
            attempt.diff = match self.workspaces.diff_stat(ws).await {
                Ok(diff) => diff,
                Err(e) => return Err(attempt.workspace_failure(e)),
            };
        }

        let report = self
            .gates
            .evaluate(task, work_dir, signal)
            .await
            .map_err(|e| TaskFailure::GateSpawn(e.to_string()))?;
        let first_failure = report.first_failure().map(|r| (r.kind, r.summary()));
        attempt.gates = Some(report);
        if signal.is_cancelled() {
            return Err(interrupted(signal));
        }
        if let Some((kind, reason)) = first_failure {
            return Err(TaskFailure::Gate { kind, reason });
        }

        match workspace {
            Some(ws) => match self.workspaces.merge(ws).await {
                Ok(MergeResult::Success | MergeResult::NothingToMerge) => {}
                Ok(MergeResult::Conflict(files)) => return Err(TaskFailure::MergeConflict(files)),
                Err(e) => return Err(attempt.workspace_failure(e)),
            },
            None if task.category == WorkCategory::Documentation => {
                if let Some(rel) = &task.properties.output_path {
                    attempt.doc_words = documentation_words(&work_dir.join(rel)).await;
                }
            }
            None => {}
        }
        Ok(())
    }

    async fn finish(
        &self,
        task: Task,
        attempt: Attempt,
        result: std::result::Result<(), TaskFailure>,
        cleanup: Option<CleanupReport>,
        started: Instant,
    ) -> Result<TaskOutcome> {
        let (task, failure) = match result {
            Ok(()) => {
                let stats = CompletionStats {
                    tokens_input: attempt.usage.input_tokens,
                    tokens_output: attempt.usage.output_tokens,
                    invocations: attempt.usage.invocations,
                    lines_added: attempt.diff.lines_added,
                    lines_removed: attempt.diff.lines_removed,
                    doc_words: attempt.doc_words,
                };
                (self.claims.complete(task.id, stats).await?, None)
            }
            Err(failure) => {
                let reason = failure.to_string();
                warn!(task_id = %task.id, reason = %reason, "task attempt failed");
                let updated = match failure.failed_gate() {
                    Some(gate) => {
                        self.claims
                            .fail_at_gate(task.id, &reason, gate.as_str())
                            .await?
                    }
                    None => {
                        self.claims
                            .release(task.id, &reason, failure.release_kind())
                            .await?
                    }
                };
                (updated, Some(failure))
            }
        };

        Ok(TaskOutcome {
            task,
            usage: attempt.usage,
            diff: attempt.diff,
            doc_words: attempt.doc_words,
            gates: attempt.gates,
            failure,
            cleanup,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

fn interrupted(signal: &CancelSignal) -> TaskFailure {
    if signal.is_cancel_requested() {
        TaskFailure::Cancelled
    } else {
        TaskFailure::TimedOut
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

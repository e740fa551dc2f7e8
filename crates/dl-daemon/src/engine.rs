use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dl_agents::prompts::TemplatePrompts;
use dl_agents::task_runner::TaskRunner;
use dl_core::cancel::CancelSignal;
use dl_core::claim::{default_claimant_id, ClaimManager};
use dl_core::config::{Config, STATE_DIR};
use dl_core::quality_gate::QualityGateRunner;
use dl_core::sqlite_store::SqliteTaskStore;
use dl_core::store::TaskStore;
use dl_core::types::{Task, TaskFilter, TaskState};
use dl_core::worktree_manager::WorkspaceManager;
use dl_harness::anthropic::AnthropicProvider;
use dl_harness::builtin_tools::builtin_registry;
use dl_harness::dispatch::DispatchLoop;
use dl_harness::provider::LlmProvider;
use tracing::{info, warn};

use crate::controller::{Controller, RunOutcome};
use crate::metrics::{CycleMetrics, MetricsJournal};
use crate::operations::OperationRegistry;
use crate::report::{LogTouchpoint, StdinTouchpoint, Touchpoint};
use crate::work_source::{FileWorkSource, WorkSource};

/// Wires the store, workspaces, gates and agent into a [`Controller`] for
/// one repository.
pub struct Engine {
    config: Config,
    repo_root: PathBuf,
    store: Arc<dyn TaskStore>,
}

impl Engine {
    /// Open the SQLite task store named by the config, creating it (and the
    /// state directory) on first use.
    pub async fn open(repo_root: impl Into<PathBuf>, config: Config) -> Result<Self> {
        let repo_root = repo_root.into();
        let db_path = Config::resolve(&repo_root, &config.store.path);
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let store = SqliteTaskStore::open(&db_path)
            .await
            .with_context(|| format!("failed to open task store at {}", db_path.display()))?;
        info!(path = %db_path.display(), "task store opened");
        Ok(Self::with_store(repo_root, config, Arc::new(store)))
    }

    pub fn with_store(
        repo_root: impl Into<PathBuf>,
        config: Config,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        Self {
            config,
            repo_root: repo_root.into(),
            store,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    fn path(&self, configured: &str) -> PathBuf {
        Config::resolve(&self.repo_root, configured)
    }

    pub fn journal(&self) -> MetricsJournal {
        MetricsJournal::new(self.path(&self.config.controller.journal_path))
    }

    pub fn operations_dir(&self) -> PathBuf {
        self.path(&self.config.controller.operations_dir)
    }

    pub fn load_operations(&self) -> Result<OperationRegistry> {
        let dir = self.operations_dir();
        OperationRegistry::load_from_dir(&dir)
            .with_context(|| format!("failed to load operations from {}", dir.display()))
    }

    pub fn claims(&self) -> ClaimManager {
        let claimant = self
            .config
            .general
            .instance_id
            .clone()
            .unwrap_or_else(default_claimant_id);
        ClaimManager::new(self.store.clone(), claimant)
    }

    pub fn workspaces(&self) -> WorkspaceManager {
        WorkspaceManager::new(
            &self.repo_root,
            self.path(&self.config.workspace.worktree_dir),
        )
    }

    pub fn task_runner(&self, provider: Arc<dyn LlmProvider>) -> TaskRunner {
        let agent = &self.config.agent;
        let dispatch = DispatchLoop::new(provider, builtin_registry()).with_max_turns(agent.max_turns);
        let mut prompts = TemplatePrompts::new();
        prompts.load_from_dir(&self.repo_root.join(STATE_DIR).join("prompts"));

        TaskRunner::new(
            self.claims(),
            self.workspaces(),
            QualityGateRunner::new(self.config.gates.commands()),
            dispatch,
        )
        .with_prompts(Arc::new(prompts))
        .with_task_timeout(agent.task_timeout())
        .with_command_timeout(Duration::from_secs(self.config.gates.timeout_secs))
    }

    pub fn controller(
        &self,
        provider: Arc<dyn LlmProvider>,
        work: Arc<dyn WorkSource>,
        touchpoint: Arc<dyn Touchpoint>,
    ) -> Result<Controller> {
        Ok(
            Controller::new(self.task_runner(provider), work, self.journal())
                .with_operations(self.load_operations()?)
                .with_config(self.config.controller.clone())
                .with_thresholds(self.config.health.clone())
                .with_touchpoint(touchpoint),
        )
    }

    /// Run the development loop with the configured provider, the work file
    /// as work source, and a touchpoint matching the guided flag.
    pub async fn run(&self, cancel: &CancelSignal) -> Result<RunOutcome> {
        let provider = AnthropicProvider::from_config(&self.config.agent)
            .context("failed to configure the agent provider")?;
        let work = FileWorkSource::new(self.path(&self.config.controller.work_file));
        let touchpoint: Arc<dyn Touchpoint> = if self.config.controller.guided {
            Arc::new(StdinTouchpoint)
        } else {
            Arc::new(LogTouchpoint)
        };
        self.run_with(Arc::new(provider), Arc::new(work), touchpoint, cancel)
            .await
    }

    pub async fn run_with(
        &self,
        provider: Arc<dyn LlmProvider>,
        work: Arc<dyn WorkSource>,
        touchpoint: Arc<dyn Touchpoint>,
        cancel: &CancelSignal,
    ) -> Result<RunOutcome> {
        if self.config.workspace.sweep_on_start {
            self.sweep_stale_workspaces().await?;
        }
        let mut controller = self.controller(provider, work, touchpoint)?;
        controller.run(cancel).await.context("development loop aborted")
    }

    /// Remove old workspaces left by crashed runs. Tasks still in progress
    /// may belong to a live peer instance, so their workspaces are kept.
    pub async fn sweep_stale_workspaces(&self) -> Result<Vec<PathBuf>> {
        let claimed = TaskFilter {
            state: Some(TaskState::InProgress),
            ..TaskFilter::default()
        };
        let live: HashSet<_> = self
            .store
            .fetch(&claimed)
            .await
            .context("failed to query claimed tasks")?
            .into_iter()
            .map(|t| t.id)
            .collect();
        let max_age = Duration::from_secs(self.config.workspace.stale_after_secs);
        match self.workspaces().sweep_stale(max_age, &live).await {
            Ok(swept) => {
                if !swept.is_empty() {
                    info!(count = swept.len(), kept = live.len(), "stale workspaces swept");
                }
                Ok(swept)
            }
            Err(e) => {
                warn!(error = %e, "stale workspace sweep failed");
                Ok(Vec::new())
            }
        }
    }

    pub async fn enqueue(&self, task: &Task) -> Result<()> {
        self.store
            .insert(task)
            .await
            .with_context(|| format!("failed to enqueue task {}", task.name))?;
        info!(task_id = %task.id, name = %task.name, category = %task.category, "task enqueued");
        Ok(())
    }

    pub async fn status(&self) -> Result<Status> {
        let mut queue = Vec::with_capacity(TaskState::ALL.len());
        for state in TaskState::ALL {
            let filter = TaskFilter {
                state: Some(state),
                ..TaskFilter::default()
            };
            let count = self
                .store
                .fetch(&filter)
                .await
                .context("failed to query task store")?
                .len();
            queue.push((state, count));
        }
        let last_cycle = self
            .journal()
            .last()
            .await
            .context("failed to read metrics journal")?;
        Ok(Status { queue, last_cycle })
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Status {
    pub queue: Vec<(TaskState, usize)>,
    pub last_cycle: Option<CycleMetrics>,
}

impl Status {
    pub fn count(&self, state: TaskState) -> usize {
        self.queue
            .iter()
            .find(|(s, _)| *s == state)
            .map_or(0, |(_, n)| *n)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Task queue")?;
        for (state, count) in &self.queue {
            writeln!(f, "  {:<12} {count}", state.as_str())?;
        }
        match &self.last_cycle {
            None => writeln!(f, "No cycles recorded yet"),
            Some(m) => writeln!(
                f,
                "Last cycle #{}: {} completed, {} failed, {} tokens, +{}/-{} lines",
                m.cycle,
                m.tasks_completed,
                m.tasks_failed,
                m.tokens_used(),
                m.lines_added,
                m.lines_removed
            ),
        }
    }
}

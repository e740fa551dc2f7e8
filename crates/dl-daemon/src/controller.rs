//! The development-loop controller.
//!
//! One cycle walks the loop states:
//!
//! ```text
//! Idle ─┬─> Executing ──────────────> Evaluating ─┬─> Reporting ─> Idle (next cycle)
//!       └─> Acquiring ─> Executing        ^  │     ├─> Fixing ─────┘ (back to Evaluating)
//!                    └─> Reporting        └──┘     └─> Redesigning ─> Reporting
//! ```
//!
//! The controller is an owned value. Everything it carries across cycles
//! (cycle number, lint baseline, state log) lives in its fields and is
//! mutated only by [`Controller::run`].

use std::fmt;
use std::sync::Arc;

use dl_agents::task_runner::{TaskOutcome, TaskRunError, TaskRunner};
use dl_core::cancel::CancelSignal;
use dl_core::claim::{ClaimError, ClaimOutcome};
use dl_core::config::{ControllerConfig, HealthConfig};
use dl_core::quality_gate::GateError;
use dl_core::store::StoreError;
use dl_core::types::{Task, TaskFilter, TaskState, WorkCategory};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::health::{self, Evaluation, HealthViolation, PathHealth, Route};
use crate::metrics::{CycleMetrics, JournalError, MetricsJournal};
use crate::operations::{OperationKind, OperationRegistry};
use crate::report::{CycleReport, FailedTask, LogTouchpoint, Resume, StopReason, Touchpoint};
use crate::work_source::{WorkSource, WorkSourceError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures that abort the whole run. Per-task failures never surface
/// here; they are recorded in the cycle and the batch continues.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Claim(#[from] ClaimError),
    #[error(transparent)]
    Task(#[from] TaskRunError),
    #[error("evaluation gates could not run: {0}")]
    Gate(#[from] GateError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    WorkSource(#[from] WorkSourceError),
}

pub type Result<T> = std::result::Result<T, ControllerError>;

// ---------------------------------------------------------------------------
// LoopState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopState {
    Idle,
    Acquiring,
    Executing,
    Evaluating,
    Fixing,
    Redesigning,
    Reporting,
    Stopped,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::Idle => "idle",
            LoopState::Acquiring => "acquiring",
            LoopState::Executing => "executing",
            LoopState::Evaluating => "evaluating",
            LoopState::Fixing => "fixing",
            LoopState::Redesigning => "redesigning",
            LoopState::Reporting => "reporting",
            LoopState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in the controller's transition log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub cycle: u64,
    pub from: LoopState,
    pub to: LoopState,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Cycles that reached reporting during this run.
    pub cycles: u32,
    pub stop: StopReason,
    pub last_report: Option<CycleReport>,
}

// ---------------------------------------------------------------------------
// Per-cycle scratch state
// ---------------------------------------------------------------------------

struct Cycle {
    metrics: CycleMetrics,
    evaluation: Option<Evaluation>,
    decisions: Vec<String>,
    failures: Vec<FailedTask>,
    fix_attempts: u32,
    acquisitions: u32,
    redesigned: bool,
    stop: Option<StopReason>,
}

impl Cycle {
    fn new(number: u64) -> Self {
        Self {
            metrics: CycleMetrics::new(number),
            evaluation: None,
            decisions: Vec::new(),
            failures: Vec::new(),
            fix_attempts: 0,
            acquisitions: 0,
            redesigned: false,
            stop: None,
        }
    }

    fn record(&mut self, outcome: &TaskOutcome) {
        self.metrics.record_task(outcome);
        if outcome.task.state == TaskState::Failed {
            let reason = outcome
                .failure
                .as_ref()
                .map_or_else(|| "unknown failure".to_string(), ToString::to_string);
            self.failures.push(FailedTask {
                id: outcome.task.id,
                name: outcome.task.name.clone(),
                reason,
            });
        }
        if let Some(cleanup) = outcome.cleanup.as_ref().filter(|c| !c.is_clean()) {
            self.decisions.push(format!(
                "Workspace for task {} was not fully removed: {}",
                outcome.task.id,
                cleanup.errors.join("; ")
            ));
        }
    }

    /// Failed, as opposed to completed or released back to the queue.
    fn is_failure(outcome: &TaskOutcome) -> bool {
        !outcome.completed() && outcome.task.state != TaskState::Available
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct Controller {
    runner: TaskRunner,
    work: Arc<dyn WorkSource>,
    touchpoint: Arc<dyn Touchpoint>,
    operations: OperationRegistry,
    journal: MetricsJournal,
    config: ControllerConfig,
    thresholds: HealthConfig,
    state: LoopState,
    history: Vec<StateChange>,
    cycle: u64,
    lint_baseline: Option<u64>,
    stop: Option<StopReason>,
}

impl Controller {
    pub fn new(runner: TaskRunner, work: Arc<dyn WorkSource>, journal: MetricsJournal) -> Self {
        Self {
            runner,
            work,
            touchpoint: Arc::new(LogTouchpoint),
            operations: OperationRegistry::new(),
            journal,
            config: ControllerConfig::default(),
            thresholds: HealthConfig::default(),
            state: LoopState::Idle,
            history: Vec::new(),
            cycle: 1,
            lint_baseline: None,
            stop: None,
        }
    }

    pub fn with_touchpoint(mut self, touchpoint: Arc<dyn Touchpoint>) -> Self {
        self.touchpoint = touchpoint;
        self
    }

    pub fn with_operations(mut self, operations: OperationRegistry) -> Self {
        self.operations = operations;
        self
    }

    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_thresholds(mut self, thresholds: HealthConfig) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Every transition taken so far, oldest first.
    pub fn history(&self) -> &[StateChange] {
        &self.history
    }

    /// Number of the cycle in progress (or the last one, once stopped).
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn journal(&self) -> &MetricsJournal {
        &self.journal
    }

    fn transition(&mut self, to: LoopState) {
        if to == self.state {
            return;
        }
        info!(cycle = self.cycle, from = %self.state, to = %to, "loop state");
        self.history.push(StateChange {
            cycle: self.cycle,
            from: self.state,
            to,
        });
        self.state = to;
    }

    fn halt(&mut self, reason: StopReason) -> LoopState {
        self.stop = Some(reason);
        LoopState::Stopped
    }

    /// Drive cycles until the cycle cap, a stop at a touchpoint,
    /// cancellation, or an infrastructure failure.
    ///
    /// Cycle numbering continues from the last journaled cycle.
    pub async fn run(&mut self, cancel: &CancelSignal) -> Result<RunOutcome> {
        let journaled = self.journal.read_all().await?;
        self.cycle = journaled.last().map_or(1, |m| m.cycle + 1);
        // The baseline only ever ratchets down, so it is the lowest count on
        // record.
        self.lint_baseline = journaled.iter().filter_map(|m| m.lint_violations).min();
        self.stop = None;
        self.state = LoopState::Idle;
        info!(
            cycle = self.cycle,
            max_cycles = self.config.max_cycles,
            batch_size = self.config.batch_size,
            guided = self.config.guided,
            "development loop starting"
        );

        let mut cycle = Cycle::new(self.cycle);
        let mut completed = 0u32;
        let mut last_report = None;

        while self.state != LoopState::Stopped {
            if cancel.is_cancelled() {
                if cycle.metrics.had_activity() {
                    cycle.metrics.finish();
                    self.journal.append(&cycle.metrics).await?;
                }
                let next = self.halt(StopReason::Cancelled);
                self.transition(next);
                break;
            }

            let step = match self.state {
                LoopState::Idle => self.idle().await,
                LoopState::Acquiring => self.acquire(&mut cycle).await,
                LoopState::Executing => self.execute(&mut cycle, cancel).await,
                LoopState::Evaluating => self.evaluate(&mut cycle, cancel).await,
                LoopState::Fixing => self.fix(&mut cycle, cancel).await,
                LoopState::Redesigning => self.redesign(&mut cycle, cancel).await,
                LoopState::Reporting => {
                    match self.report(&mut cycle, &mut completed, cancel).await {
                        Ok((next, report)) => {
                            last_report = Some(report);
                            Ok(next)
                        }
                        Err(e) => Err(e),
                    }
                }
                LoopState::Stopped => Ok(LoopState::Stopped),
            };

            match step {
                Ok(next) => self.transition(next),
                Err(err) => {
                    error!(cycle = self.cycle, state = %self.state, error = %err, "run aborted");
                    let report = self
                        .surface(&mut cycle, StopReason::Infrastructure(err.to_string()), cancel)
                        .await;
                    last_report = Some(report);
                    self.transition(LoopState::Stopped);
                    return Err(err);
                }
            }
        }

        let stop = self.stop.clone().unwrap_or(StopReason::Cancelled);
        info!(cycles = completed, reason = %stop, "development loop stopped");
        Ok(RunOutcome {
            cycles: completed,
            stop,
            last_report,
        })
    }

    // -- states --------------------------------------------------------------

    async fn idle(&mut self) -> Result<LoopState> {
        let waiting = self
            .runner
            .claims()
            .store()
            .fetch(&TaskFilter::available().limit(1))
            .await?;
        Ok(if waiting.is_empty() {
            LoopState::Acquiring
        } else {
            LoopState::Executing
        })
    }

    async fn acquire(&mut self, cycle: &mut Cycle) -> Result<LoopState> {
        let op = self.operations.resolve(OperationKind::Acquire);
        cycle.metrics.record_operation(op.kind());
        cycle.acquisitions += 1;

        let proposals = self
            .work
            .propose(op.definition(), self.config.batch_size as usize)
            .await?;
        let store = self.runner.claims().store();
        let mut inserted = 0usize;
        for proposal in proposals {
            let task = proposal.into_task();
            store.insert(&task).await?;
            debug!(task_id = %task.id, name = %task.name, "proposal queued");
            inserted += 1;
        }
        info!(cycle = self.cycle, inserted, "work acquired");

        if inserted > 0 {
            Ok(LoopState::Executing)
        } else if cycle.metrics.tasks_attempted() > 0 {
            Ok(LoopState::Evaluating)
        } else {
            cycle.decisions.push("No work available and the work source proposed none".into());
            Ok(LoopState::Reporting)
        }
    }

    async fn execute(&mut self, cycle: &mut Cycle, cancel: &CancelSignal) -> Result<LoopState> {
        let op = self.operations.resolve(OperationKind::Execute);
        cycle.metrics.record_operation(op.kind());
        let cap = op
            .definition()
            .max_tasks
            .unwrap_or(self.config.batch_size as usize);

        // The batch size is fixed here; tasks queued later wait for the
        // next batch.
        let batch = self
            .runner
            .claims()
            .store()
            .fetch(&TaskFilter::available().limit(cap))
            .await?
            .len();
        if batch == 0 {
            return Ok(match (cycle.metrics.tasks_attempted(), cycle.acquisitions) {
                (0, 0) => LoopState::Acquiring,
                (0, _) => LoopState::Reporting,
                _ => LoopState::Evaluating,
            });
        }
        info!(cycle = self.cycle, batch, "executing batch");

        let mut attempted = 0usize;
        let mut failures = 0usize;
        while attempted < batch {
            if cancel.is_cancelled() {
                break;
            }
            let failed = match self.runner.run_next(&TaskFilter::available(), cancel).await {
                Ok(Some(outcome)) => {
                    cycle.record(&outcome);
                    Cycle::is_failure(&outcome)
                }
                Ok(None) => break,
                Err(err) => {
                    self.absorb(cycle, err).await?;
                    true
                }
            };
            attempted += 1;
            if !failed {
                continue;
            }
            failures += 1;

            if self.config.stop_on_failure {
                let task_id = cycle.failures.last().map_or(Uuid::nil(), |f| f.id);
                warn!(task_id = %task_id, "task failed with stop-on-failure set");
                cycle.stop = Some(StopReason::TaskFailure);
                return Ok(LoopState::Reporting);
            }
            let ratio = failures as f64 / batch as f64;
            if ratio > self.config.failure_threshold {
                warn!(
                    cycle = self.cycle,
                    failures,
                    batch,
                    remaining = batch - attempted,
                    "batch failure ratio over threshold, evaluating early"
                );
                cycle.decisions.push(format!(
                    "Batch stopped after {failures} of {batch} tasks failed; {} left queued",
                    batch - attempted
                ));
                return Ok(LoopState::Evaluating);
            }
        }
        Ok(LoopState::Evaluating)
    }

    async fn evaluate(&mut self, cycle: &mut Cycle, cancel: &CancelSignal) -> Result<LoopState> {
        let op = self.operations.resolve(OperationKind::Evaluate);
        cycle.metrics.record_operation(op.kind());

        let root = self.runner.workspaces().repo_root().to_path_buf();
        let report = self.runner.gates().run_code_gates(&root, cancel).await?;
        if cancel.is_cancelled() {
            return Ok(LoopState::Reporting);
        }
        let evaluation = Evaluation::from_report(report, self.lint_baseline);
        cycle.metrics.test_pass_rate = Some(evaluation.test_pass_rate);
        cycle.metrics.lint_violations = Some(evaluation.lint_violations);

        let health = self.path_health(cycle, Some(&evaluation)).await?;
        cycle.evaluation = Some(evaluation);
        let route = health::route(&health, &self.thresholds, self.redesign_due());
        info!(
            cycle = self.cycle,
            pass_rate = health.test_pass_rate,
            new_lint = health.new_lint_violations,
            growth = health.code_growth,
            completion = health.completion_rate,
            route = ?route,
            "path health evaluated"
        );

        Ok(match route {
            Route::Fix if cycle.fix_attempts >= self.config.max_fix_attempts => {
                let problems = violation_list(&health.violations(&self.thresholds));
                cycle.decisions.push(format!(
                    "Fix attempts exhausted ({}) with {problems} still open",
                    cycle.fix_attempts
                ));
                LoopState::Reporting
            }
            Route::Fix => LoopState::Fixing,
            Route::Redesign if !cycle.redesigned => LoopState::Redesigning,
            Route::Redesign | Route::Report => LoopState::Reporting,
        })
    }

    async fn fix(&mut self, cycle: &mut Cycle, cancel: &CancelSignal) -> Result<LoopState> {
        cycle.fix_attempts += 1;
        let health = self.path_health(cycle, cycle.evaluation.as_ref()).await?;
        let mut description = violation_list(&health.violations(&self.thresholds));
        if let Some(eval) = &cycle.evaluation {
            description.push_str("\n\n");
            description.push_str(&eval.diagnostics());
        }
        let name = format!("Restore quality gates (cycle {}, attempt {})", self.cycle, cycle.fix_attempts);
        self.corrective(OperationKind::Fix, cycle, name, description, cancel)
            .await?;
        Ok(LoopState::Evaluating)
    }

    async fn redesign(&mut self, cycle: &mut Cycle, cancel: &CancelSignal) -> Result<LoopState> {
        cycle.redesigned = true;
        let health = self.path_health(cycle, cycle.evaluation.as_ref()).await?;
        let description = format!(
            "Code growth is {:.0} lines per completed task over the last {} cycles \
             (limit {:.0}). Test pass rate {:.0}%, completion rate {:.0}%.",
            health.code_growth,
            health.window,
            self.thresholds.max_code_growth,
            health.test_pass_rate * 100.0,
            health.completion_rate * 100.0,
        );
        let name = format!("Simplify structure (cycle {})", self.cycle);
        self.corrective(OperationKind::Redesign, cycle, name, description, cancel)
            .await?;
        Ok(LoopState::Reporting)
    }

    async fn report(
        &mut self,
        cycle: &mut Cycle,
        completed: &mut u32,
        cancel: &CancelSignal,
    ) -> Result<(LoopState, CycleReport)> {
        let health = self.path_health(cycle, cycle.evaluation.as_ref()).await?;
        let violations = health.violations(&self.thresholds);
        for v in &violations {
            if let HealthViolation::LowCompletionRate { .. } = v {
                cycle
                    .decisions
                    .push(format!("Review failed tasks: {v}"));
            }
        }
        cycle.metrics.finish();
        self.journal.append(&cycle.metrics).await?;
        *completed += 1;

        let stop = cycle.stop.clone().or_else(|| {
            (self.config.max_cycles > 0 && *completed >= self.config.max_cycles)
                .then_some(StopReason::CycleLimit)
        });
        let report = CycleReport {
            cycle: self.cycle,
            metrics: cycle.metrics.clone(),
            health,
            violations: violations.iter().map(ToString::to_string).collect(),
            decisions: std::mem::take(&mut cycle.decisions),
            failures: std::mem::take(&mut cycle.failures),
            stop: stop.clone(),
        };
        let resume = self.present(&report, cancel).await;

        if let Some(eval) = &cycle.evaluation {
            self.lint_baseline = Some(
                self.lint_baseline
                    .map_or(eval.lint_violations, |b| b.min(eval.lint_violations)),
            );
        }

        let next = if let Some(stop) = stop {
            self.halt(stop)
        } else if cancel.is_cancelled() {
            self.halt(StopReason::Cancelled)
        } else if resume == Resume::Stop {
            self.halt(StopReason::Operator)
        } else {
            self.cycle += 1;
            *cycle = Cycle::new(self.cycle);
            LoopState::Idle
        };
        Ok((next, report))
    }

    // -- helpers -------------------------------------------------------------

    /// Guided touchpoints may wait forever; cancellation still ends the wait.
    async fn present(&self, report: &CycleReport, cancel: &CancelSignal) -> Resume {
        tokio::select! {
            resume = self.touchpoint.present(report) => resume,
            _ = cancel.cancelled() => Resume::Stop,
        }
    }

    /// Best-effort report for a run that is about to abort.
    async fn surface(&mut self, cycle: &mut Cycle, reason: StopReason, cancel: &CancelSignal) -> CycleReport {
        cycle.metrics.finish();
        if let Err(e) = self.journal.append(&cycle.metrics).await {
            warn!(error = %e, "cannot journal metrics of aborted cycle");
        }
        let health = PathHealth::compute(std::slice::from_ref(&cycle.metrics), cycle.evaluation.as_ref());
        cycle
            .decisions
            .push(format!("Resolve before restarting: {reason}"));
        let report = CycleReport {
            cycle: self.cycle,
            metrics: cycle.metrics.clone(),
            violations: health
                .violations(&self.thresholds)
                .iter()
                .map(ToString::to_string)
                .collect(),
            health,
            decisions: std::mem::take(&mut cycle.decisions),
            failures: std::mem::take(&mut cycle.failures),
            stop: Some(reason.clone()),
        };
        self.stop = Some(reason);
        let _ = self.present(&report, cancel).await;
        report
    }

    /// Record a task that could not be finalised as a failure of this
    /// cycle. Infrastructure errors are handed back to abort the run.
    async fn absorb(&self, cycle: &mut Cycle, err: TaskRunError) -> Result<()> {
        if err.is_infrastructure() || matches!(err, TaskRunError::Claim(ClaimError::Store(_))) {
            return Err(err.into());
        }
        let id = err.task_id().unwrap_or(Uuid::nil());
        let name = match err.task_name() {
            Some(name) => name.to_string(),
            None => self.task_name(id).await,
        };
        warn!(cycle = self.cycle, task_id = %id, error = %err, "task attempt could not be finalised");
        cycle.metrics.tasks_failed += 1;
        cycle.failures.push(FailedTask {
            id,
            name,
            reason: err.to_string(),
        });
        Ok(())
    }

    async fn task_name(&self, id: Uuid) -> String {
        if id.is_nil() {
            return String::new();
        }
        match self.runner.claims().store().get(id).await {
            Ok(Some(task)) => task.name,
            Ok(None) => String::new(),
            Err(e) => {
                debug!(task_id = %id, error = %e, "cannot look up failed task");
                String::new()
            }
        }
    }

    /// Queue a corrective task built from the operation's definition, claim
    /// that exact task and run it through the normal lifecycle.
    async fn corrective(
        &mut self,
        kind: OperationKind,
        cycle: &mut Cycle,
        name: String,
        description: String,
        cancel: &CancelSignal,
    ) -> Result<()> {
        let op = self.operations.resolve(kind);
        cycle.metrics.record_operation(op.kind());
        let def = op.definition();

        let mut task = Task::new(name, def.category.unwrap_or(WorkCategory::Coding))
            .with_priority(def.priority)
            .with_description(description);
        task.properties.template = def.template.clone();
        self.runner.claims().store().insert(&task).await?;
        info!(cycle = self.cycle, task_id = %task.id, operation = %kind, "corrective task queued");

        let claimed = match self.runner.claims().claim(&task).await? {
            ClaimOutcome::Claimed(claimed) => claimed,
            ClaimOutcome::Conflict { actual } => {
                warn!(task_id = %task.id, actual = %actual, "corrective task taken by another instance");
                return Ok(());
            }
        };
        match self.runner.run(claimed, cancel).await {
            Ok(outcome) => cycle.record(&outcome),
            Err(err) => self.absorb(cycle, err).await?,
        }
        Ok(())
    }

    /// Health over the journaled window plus the cycle in progress.
    async fn path_health(&self, cycle: &Cycle, evaluation: Option<&Evaluation>) -> Result<PathHealth> {
        let mut window = self
            .journal
            .tail(self.config.health_window.saturating_sub(1))
            .await?;
        window.push(cycle.metrics.clone());
        Ok(PathHealth::compute(&window, evaluation))
    }

    fn redesign_due(&self) -> bool {
        let every = u64::from(self.config.redesign_interval);
        every > 0 && self.cycle % every == 0
    }
}

fn violation_list(violations: &[HealthViolation]) -> String {
    if violations.is_empty() {
        return "no threshold violations".to_string();
    }
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

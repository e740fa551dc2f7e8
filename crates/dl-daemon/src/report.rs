use std::fmt;
use std::fmt::Write as _;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use uuid::Uuid;

use crate::health::PathHealth;
use crate::metrics::CycleMetrics;

// ---------------------------------------------------------------------------
// CycleReport
// ---------------------------------------------------------------------------

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    CycleLimit,
    Cancelled,
    /// A task failed while `stop_on_failure` was set.
    TaskFailure,
    /// The operator chose to stop at a touchpoint.
    Operator,
    /// Store unreachable, git missing or the journal unwritable.
    Infrastructure(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::CycleLimit => f.write_str("cycle limit reached"),
            StopReason::Cancelled => f.write_str("cancelled"),
            StopReason::TaskFailure => f.write_str("task failed with stop-on-failure set"),
            StopReason::Operator => f.write_str("stopped by operator"),
            StopReason::Infrastructure(why) => write!(f, "infrastructure failure: {why}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTask {
    pub id: Uuid,
    pub name: String,
    pub reason: String,
}

/// Human-facing summary of one cycle, handed to the [`Touchpoint`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub metrics: CycleMetrics,
    pub health: PathHealth,
    /// Threshold violations, rendered.
    pub violations: Vec<String>,
    /// Items that need a human decision before the next cycle.
    pub decisions: Vec<String>,
    pub failures: Vec<FailedTask>,
    /// Set when this report is the last one of the run.
    pub stop: Option<StopReason>,
}

impl CycleReport {
    pub fn to_markdown(&self) -> String {
        let m = &self.metrics;
        let h = &self.health;
        let mut out = String::new();
        let _ = writeln!(out, "# devloop cycle {}", self.cycle);
        let _ = writeln!(out);
        if let Some(stop) = &self.stop {
            let _ = writeln!(out, "**Run stopped:** {stop}");
            let _ = writeln!(out);
        }

        let _ = writeln!(out, "## Metrics");
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "- tasks: {} completed, {} failed, {} released",
            m.tasks_completed, m.tasks_failed, m.tasks_released
        );
        let _ = writeln!(
            out,
            "- tokens: {} in / {} out over {} invocations",
            m.tokens_input, m.tokens_output, m.invocations
        );
        let _ = writeln!(out, "- lines: +{} / -{}", m.lines_added, m.lines_removed);
        if m.doc_words > 0 {
            let _ = writeln!(out, "- documentation words: {}", m.doc_words);
        }
        let _ = writeln!(out, "- wall time: {:.1}s", m.wall_time_ms as f64 / 1000.0);
        if !m.operations.is_empty() {
            let ops: Vec<&str> = m.operations.iter().map(|k| k.as_str()).collect();
            let _ = writeln!(out, "- operations: {}", ops.join(" → "));
        }
        let _ = writeln!(out);

        let _ = writeln!(out, "## Path health (last {} cycles)", h.window);
        let _ = writeln!(out);
        let _ = writeln!(out, "- test pass rate: {:.0}%", h.test_pass_rate * 100.0);
        let _ = writeln!(out, "- new lint violations: {}", h.new_lint_violations);
        let _ = writeln!(out, "- code growth: {:.0} lines/task", h.code_growth);
        let _ = writeln!(out, "- completion rate: {:.0}%", h.completion_rate * 100.0);
        for v in &self.violations {
            let _ = writeln!(out, "- ⚠ {v}");
        }

        if !self.failures.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "## Failed tasks");
            let _ = writeln!(out);
            for f in &self.failures {
                let _ = writeln!(out, "- `{}` {}: {}", f.id, f.name, f.reason);
            }
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "## Pending decisions");
        let _ = writeln!(out);
        if self.decisions.is_empty() {
            let _ = writeln!(out, "- none");
        }
        for d in &self.decisions {
            let _ = writeln!(out, "- [ ] {d}");
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Touchpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    Continue,
    Stop,
}

/// Where the controller hands each cycle report and waits to be resumed.
#[async_trait]
pub trait Touchpoint: Send + Sync {
    async fn present(&self, report: &CycleReport) -> Resume;
}

/// Autonomous mode: log the summary and carry on.
pub struct LogTouchpoint;

#[async_trait]
impl Touchpoint for LogTouchpoint {
    async fn present(&self, report: &CycleReport) -> Resume {
        let m = &report.metrics;
        info!(
            cycle = report.cycle,
            completed = m.tasks_completed,
            failed = m.tasks_failed,
            tokens = m.tokens_used(),
            net_lines = m.net_lines(),
            pass_rate = report.health.test_pass_rate,
            decisions = report.decisions.len(),
            "cycle report"
        );
        for decision in &report.decisions {
            info!(cycle = report.cycle, decision = %decision, "pending decision");
        }
        Resume::Continue
    }
}

/// Guided mode: print the report and block on stdin until the operator
/// answers. There is no timeout.
pub struct StdinTouchpoint;

const PROMPT: &str = "[c]ontinue / [s]top > ";

#[async_trait]
impl Touchpoint for StdinTouchpoint {
    async fn present(&self, report: &CycleReport) -> Resume {
        let mut stdout = tokio::io::stdout();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let text = format!("{}\n", report.to_markdown());
        if let Err(e) = stdout.write_all(text.as_bytes()).await {
            warn!(error = %e, "cannot write report to stdout");
        }
        loop {
            let _ = stdout.write_all(PROMPT.as_bytes()).await;
            let _ = stdout.flush().await;
            match lines.next_line().await {
                Ok(Some(line)) => match parse_resume(&line) {
                    Some(resume) => return resume,
                    None => continue,
                },
                Ok(None) => return Resume::Stop,
                Err(e) => {
                    warn!(error = %e, "stdin closed, stopping");
                    return Resume::Stop;
                }
            }
        }
    }
}

/// Operator answer at a guided touchpoint. `None` means ask again.
pub fn parse_resume(line: &str) -> Option<Resume> {
    match line.trim().to_ascii_lowercase().as_str() {
        "" | "c" | "continue" | "y" | "yes" => Some(Resume::Continue),
        "s" | "stop" | "q" | "quit" | "n" | "no" => Some(Resume::Stop),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::OperationKind;

    fn report() -> CycleReport {
        let mut metrics = CycleMetrics::new(3);
        metrics.tasks_completed = 4;
        metrics.tasks_failed = 1;
        metrics.lines_added = 90;
        metrics.record_operation(OperationKind::Execute);
        metrics.record_operation(OperationKind::Evaluate);
        CycleReport {
            cycle: 3,
            metrics,
            health: PathHealth {
                test_pass_rate: 0.5,
                new_lint_violations: 0,
                code_growth: 22.5,
                completion_rate: 0.8,
                window: 3,
            },
            violations: vec!["test pass rate 50% is below 90%".into()],
            decisions: vec!["Fix attempts exhausted".into()],
            failures: vec![FailedTask {
                id: Uuid::nil(),
                name: "broken".into(),
                reason: "lint gate failed".into(),
            }],
            stop: Some(StopReason::CycleLimit),
        }
    }

    #[test]
    fn markdown_carries_every_section() {
        let md = report().to_markdown();
        assert!(md.starts_with("# devloop cycle 3"));
        assert!(md.contains("cycle limit reached"));
        assert!(md.contains("4 completed, 1 failed"));
        assert!(md.contains("execute → evaluate"));
        assert!(md.contains("test pass rate: 50%"));
        assert!(md.contains("- [ ] Fix attempts exhausted"));
        assert!(md.contains("broken: lint gate failed"));
    }

    #[test]
    fn resume_answers() {
        assert_eq!(parse_resume(""), Some(Resume::Continue));
        assert_eq!(parse_resume(" C \n"), Some(Resume::Continue));
        assert_eq!(parse_resume("stop"), Some(Resume::Stop));
        assert_eq!(parse_resume("q"), Some(Resume::Stop));
        assert_eq!(parse_resume("maybe"), None);
    }

    #[tokio::test]
    async fn log_touchpoint_always_continues() {
        assert_eq!(LogTouchpoint.present(&report()).await, Resume::Continue);
    }
}

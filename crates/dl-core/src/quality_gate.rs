use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::cancel::CancelSignal;
use crate::types::{Task, WorkCategory};

/// Captured output kept per gate result.
const MAX_CAPTURED_OUTPUT: usize = 16 * 1024;

pub const DEFAULT_GATE_TIMEOUT: Duration = Duration::from_secs(600);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum GateError {
    #[error("failed to spawn gate command `{command}`: {reason}")]
    Spawn { command: String, reason: String },
}

pub type Result<T> = std::result::Result<T, GateError>;

// ---------------------------------------------------------------------------
// GateKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Test,
    Lint,
    Build,
    Documentation,
}

impl GateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateKind::Test => "test",
            GateKind::Lint => "lint",
            GateKind::Build => "build",
            GateKind::Documentation => "documentation",
        }
    }
}

impl fmt::Display for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// GateResult / GateReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub kind: GateKind,
    pub passed: bool,
    pub skipped: bool,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    /// Combined stdout/stderr, tail-truncated.
    pub output: String,
    /// Why a gate failed without a normal exit (timeout, cancelled, ...).
    pub reason: Option<String>,
}

impl GateResult {
    fn skipped(kind: GateKind) -> Self {
        Self {
            kind,
            passed: true,
            skipped: true,
            duration_ms: 0,
            exit_code: None,
            output: String::new(),
            reason: Some("skipped".into()),
        }
    }

    /// One-line summary suitable for a failure reason.
    pub fn summary(&self) -> String {
        match (&self.reason, self.exit_code) {
            (Some(reason), _) => format!("{} gate failed: {reason}", self.kind),
            (None, Some(code)) => format!("{} gate failed with exit code {code}", self.kind),
            (None, None) => format!("{} gate failed", self.kind),
        }
    }
}

/// Results of one gate attempt. Immutable once produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateReport {
    pub results: Vec<GateResult>,
}

impl GateReport {
    /// A report with no gates, as for operations and planning work.
    pub fn trivial() -> Self {
        Self::default()
    }

    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed || r.skipped)
    }

    pub fn first_failure(&self) -> Option<&GateResult> {
        self.results.iter().find(|r| !r.passed && !r.skipped)
    }

    pub fn result_for(&self, kind: GateKind) -> Option<&GateResult> {
        self.results.iter().find(|r| r.kind == kind)
    }
}

// ---------------------------------------------------------------------------
// CommandRunner trait (for testability)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }

    fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        command: &str,
        dir: &Path,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> Result<CommandOutput>;
}

/// Runs gate commands through `sh -c`. The child is killed when the
/// timeout elapses or the cancel signal fires.
pub struct ShellCommandRunner;

#[async_trait]
impl CommandRunner for ShellCommandRunner {
    async fn run(
        &self,
        command: &str,
        dir: &Path,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> Result<CommandOutput> {
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GateError::Spawn {
                command: command.to_string(),
                reason: e.to_string(),
            })?;

        // Dropping the wait future drops the child, which kills it.
        tokio::select! {
            out = child.wait_with_output() => {
                let out = out.map_err(|e| GateError::Spawn {
                    command: command.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(CommandOutput {
                    exit_code: out.status.code(),
                    stdout: String::from_utf8_lossy(&out.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&out.stderr).to_string(),
                    timed_out: false,
                    cancelled: false,
                })
            }
            _ = tokio::time::sleep(timeout) => Ok(CommandOutput {
                timed_out: true,
                ..CommandOutput::default()
            }),
            _ = cancel.cancelled() => Ok(CommandOutput {
                cancelled: true,
                ..CommandOutput::default()
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Gate definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateCommand {
    pub kind: GateKind,
    pub command: String,
    pub skip: bool,
    pub timeout: Duration,
}

impl GateCommand {
    pub fn new(kind: GateKind, command: impl Into<String>) -> Self {
        Self {
            kind,
            command: command.into(),
            skip: false,
            timeout: DEFAULT_GATE_TIMEOUT,
        }
    }
}

/// The code gates in their fixed order: test, lint, build.
pub fn default_code_gates() -> Vec<GateCommand> {
    vec![
        GateCommand::new(GateKind::Test, "cargo test"),
        GateCommand::new(GateKind::Lint, "cargo clippy -- -D warnings"),
        GateCommand::new(GateKind::Build, "cargo build"),
    ]
}

fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[... truncated ...]\n{}", &text[start..])
}

// ---------------------------------------------------------------------------
// QualityGateRunner
// ---------------------------------------------------------------------------

/// Decides, per work category, whether a task's output may be committed.
#[derive(Clone)]
pub struct QualityGateRunner {
    runner: Arc<dyn CommandRunner>,
    gates: Vec<GateCommand>,
}

impl QualityGateRunner {
    pub fn new(gates: Vec<GateCommand>) -> Self {
        Self::with_runner(gates, Arc::new(ShellCommandRunner))
    }

    pub fn with_runner(gates: Vec<GateCommand>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner, gates }
    }

    pub fn gates(&self) -> &[GateCommand] {
        &self.gates
    }

    /// Gate a task's output. `work_dir` is the workspace for coding tasks
    /// and the shared tree for everything else.
    pub async fn evaluate(
        &self,
        task: &Task,
        work_dir: &Path,
        cancel: &CancelSignal,
    ) -> Result<GateReport> {
        match task.category {
            WorkCategory::Coding => self.run_code_gates(work_dir, cancel).await,
            WorkCategory::Documentation => {
                let declared = task.properties.output_path.as_deref();
                Ok(check_documentation(work_dir, declared).await)
            }
            WorkCategory::Operations | WorkCategory::Planning => Ok(GateReport::trivial()),
        }
    }

    /// Run every configured gate in order. A failure does not stop the
    /// remaining gates.
    pub async fn run_code_gates(&self, dir: &Path, cancel: &CancelSignal) -> Result<GateReport> {
        let mut report = GateReport::default();
        for gate in &self.gates {
            if gate.skip {
                report.results.push(GateResult::skipped(gate.kind));
                continue;
            }
            let started = Instant::now();
            let out = self
                .runner
                .run(&gate.command, dir, gate.timeout, cancel)
                .await?;
            let reason = if out.cancelled {
                Some("cancelled".to_string())
            } else if out.timed_out {
                Some(format!("timed out after {}s", gate.timeout.as_secs()))
            } else {
                None
            };
            let result = GateResult {
                kind: gate.kind,
                passed: out.success(),
                skipped: false,
                duration_ms: started.elapsed().as_millis() as u64,
                exit_code: out.exit_code,
                output: tail(&out.combined(), MAX_CAPTURED_OUTPUT),
                reason,
            };
            if result.passed {
                info!(gate = %gate.kind, duration_ms = result.duration_ms, "gate passed");
            } else {
                warn!(gate = %gate.kind, exit_code = ?result.exit_code, reason = ?result.reason, "gate failed");
            }
            report.results.push(result);
        }
        Ok(report)
    }
}

/// Documentation passes when the declared output exists and is non-empty:
/// a file with content, or a directory with at least one entry.
pub async fn check_documentation(work_dir: &Path, declared: Option<&str>) -> GateReport {
    let started = Instant::now();
    let verdict: std::result::Result<(), String> = match declared {
        None => Err("no declared output path".to_string()),
        Some(rel) => {
            let path = work_dir.join(rel);
            match tokio::fs::metadata(&path).await {
                Err(_) => Err(format!("{} does not exist", path.display())),
                Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
                Ok(meta) if meta.is_file() => Err(format!("{} is empty", path.display())),
                Ok(_) => match tokio::fs::read_dir(&path).await {
                    Ok(mut entries) => match entries.next_entry().await {
                        Ok(Some(_)) => Ok(()),
                        _ => Err(format!("{} is an empty directory", path.display())),
                    },
                    Err(e) => Err(format!("{}: {e}", path.display())),
                },
            }
        }
    };
    let (passed, reason) = match verdict {
        Ok(()) => (true, None),
        Err(reason) => (false, Some(reason)),
    };
    GateReport {
        results: vec![GateResult {
            kind: GateKind::Documentation,
            passed,
            skipped: false,
            duration_ms: started.elapsed().as_millis() as u64,
            exit_code: None,
            output: String::new(),
            reason,
        }],
    }
}

/// Whitespace-separated words in a documentation output (file or
/// directory tree).
pub async fn documentation_words(path: &Path) -> u64 {
    let mut total = 0u64;
    let mut pending: Vec<PathBuf> = vec![path.to_path_buf()];
    while let Some(next) = pending.pop() {
        let Ok(meta) = tokio::fs::metadata(&next).await else {
            continue;
        };
        if meta.is_file() {
            if let Ok(bytes) = tokio::fs::read(&next).await {
                total += String::from_utf8_lossy(&bytes).split_whitespace().count() as u64;
            }
        } else if meta.is_dir() {
            if let Ok(mut entries) = tokio::fs::read_dir(&next).await {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    pending.push(entry.path());
                }
            }
        }
    }
    total
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

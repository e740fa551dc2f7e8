use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dl_agents::task_runner::TaskOutcome;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::operations::OperationKind;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("metrics journal {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("metrics encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, JournalError>;

// ---------------------------------------------------------------------------
// CycleMetrics
// ---------------------------------------------------------------------------

/// Figures for one controller cycle, appended to the journal when the
/// cycle reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleMetrics {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tokens_input: u64,
    #[serde(default)]
    pub tokens_output: u64,
    #[serde(default)]
    pub invocations: u64,
    #[serde(default)]
    pub tasks_completed: u64,
    #[serde(default)]
    pub tasks_failed: u64,
    /// Tasks handed back to the queue (cancellation).
    #[serde(default)]
    pub tasks_released: u64,
    #[serde(default)]
    pub lines_added: u64,
    #[serde(default)]
    pub lines_removed: u64,
    #[serde(default)]
    pub doc_words: u64,
    #[serde(default)]
    pub wall_time_ms: u64,
    #[serde(default)]
    pub operations: Vec<OperationKind>,
    /// From the last evaluation of the cycle, if one ran.
    #[serde(default)]
    pub test_pass_rate: Option<f64>,
    #[serde(default)]
    pub lint_violations: Option<u64>,
}

impl CycleMetrics {
    pub fn new(cycle: u64) -> Self {
        Self {
            cycle,
            started_at: Utc::now(),
            ended_at: None,
            tokens_input: 0,
            tokens_output: 0,
            invocations: 0,
            tasks_completed: 0,
            tasks_failed: 0,
            tasks_released: 0,
            lines_added: 0,
            lines_removed: 0,
            doc_words: 0,
            wall_time_ms: 0,
            operations: Vec::new(),
            test_pass_rate: None,
            lint_violations: None,
        }
    }

    pub fn record_operation(&mut self, kind: OperationKind) {
        self.operations.push(kind);
    }

    /// Fold one finished task into the cycle. Tokens count whether or not
    /// the task succeeded; line and word deltas only count when it landed.
    pub fn record_task(&mut self, outcome: &TaskOutcome) {
        self.tokens_input += outcome.usage.input_tokens;
        self.tokens_output += outcome.usage.output_tokens;
        self.invocations += outcome.usage.invocations;
        if outcome.completed() {
            self.tasks_completed += 1;
            self.lines_added += outcome.diff.lines_added;
            self.lines_removed += outcome.diff.lines_removed;
            self.doc_words += outcome.doc_words;
        } else if outcome.task.state == dl_core::types::TaskState::Available {
            self.tasks_released += 1;
        } else {
            self.tasks_failed += 1;
        }
    }

    pub fn finish(&mut self) {
        let now = Utc::now();
        self.wall_time_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.ended_at = Some(now);
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_input + self.tokens_output
    }

    pub fn net_lines(&self) -> i64 {
        self.lines_added as i64 - self.lines_removed as i64
    }

    pub fn tasks_attempted(&self) -> u64 {
        self.tasks_completed + self.tasks_failed + self.tasks_released
    }

    pub fn had_activity(&self) -> bool {
        self.tasks_attempted() > 0 || !self.operations.is_empty()
    }
}

// ---------------------------------------------------------------------------
// MetricsJournal
// ---------------------------------------------------------------------------

/// Append-only JSONL file of [`CycleMetrics`], one line per cycle.
#[derive(Debug, Clone)]
pub struct MetricsJournal {
    path: PathBuf,
}

impl MetricsJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> JournalError {
        JournalError::Io {
            path: self.path.clone(),
            source,
        }
    }

    pub async fn append(&self, metrics: &CycleMetrics) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_err(e))?;
        }
        let mut line = serde_json::to_string(metrics)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_err(e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| self.io_err(e))?;
        file.flush().await.map_err(|e| self.io_err(e))?;
        debug!(cycle = metrics.cycle, path = %self.path.display(), "cycle metrics journaled");
        Ok(())
    }

    /// Every readable entry, oldest first. Malformed lines are skipped.
    pub async fn read_all(&self) -> Result<Vec<CycleMetrics>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_err(e)),
        };
        let mut entries = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CycleMetrics>(line) {
                Ok(m) => entries.push(m),
                Err(e) => {
                    warn!(line = lineno + 1, error = %e, "skipping malformed journal entry")
                }
            }
        }
        Ok(entries)
    }

    /// The last `n` entries, oldest first.
    pub async fn tail(&self, n: usize) -> Result<Vec<CycleMetrics>> {
        let mut all = self.read_all().await?;
        let skip = all.len().saturating_sub(n);
        Ok(all.split_off(skip))
    }

    pub async fn last(&self) -> Result<Option<CycleMetrics>> {
        Ok(self.tail(1).await?.pop())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_derived_figures() {
        let mut m = CycleMetrics::new(4);
        assert!(!m.had_activity());
        m.lines_added = 120;
        m.lines_removed = 20;
        m.tokens_input = 1_000;
        m.tokens_output = 250;
        m.record_operation(OperationKind::Execute);
        m.finish();
        assert_eq!(m.net_lines(), 100);
        assert_eq!(m.tokens_used(), 1_250);
        assert!(m.had_activity());
        assert!(m.ended_at.is_some());
    }

    #[tokio::test]
    async fn append_then_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let journal = MetricsJournal::new(tmp.path().join("state/metrics.jsonl"));
        assert!(journal.last().await.unwrap().is_none());

        for cycle in 1..=4 {
            let mut m = CycleMetrics::new(cycle);
            m.tasks_completed = cycle;
            journal.append(&m).await.unwrap();
        }

        let tail = journal.tail(2).await.unwrap();
        assert_eq!(tail.iter().map(|m| m.cycle).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(journal.last().await.unwrap().unwrap().tasks_completed, 4);
        assert_eq!(journal.tail(10).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("metrics.jsonl");
        let good = serde_json::to_string(&CycleMetrics::new(1)).unwrap();
        std::fs::write(&path, format!("{good}\nnot json\n\n{good}\n")).unwrap();

        let entries = MetricsJournal::new(&path).read_all().await.unwrap();
        assert_eq!(entries.len(), 2);
    }
}

use std::fmt;

use dl_core::config::HealthConfig;
use dl_core::quality_gate::{GateKind, GateReport, GateResult};
use serde::{Deserialize, Serialize};

use crate::metrics::CycleMetrics;

// ---------------------------------------------------------------------------
// Evaluation of the shared tree
// ---------------------------------------------------------------------------

/// What one evaluating step measured on the shared tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub report: GateReport,
    pub test_pass_rate: f64,
    /// All lint findings in the current tree.
    pub lint_violations: u64,
    /// Findings above the baseline carried from earlier cycles. Zero when
    /// there is no baseline yet.
    pub new_lint_violations: u64,
}

impl Evaluation {
    pub fn from_report(report: GateReport, lint_baseline: Option<u64>) -> Self {
        let test_pass_rate = test_pass_rate(report.result_for(GateKind::Test));
        let lint_violations = count_lint_violations(report.result_for(GateKind::Lint));
        let new_lint_violations = lint_baseline.map_or(0, |b| lint_violations.saturating_sub(b));
        Self {
            report,
            test_pass_rate,
            lint_violations,
            new_lint_violations,
        }
    }

    /// Output of every failing gate, for a corrective task's description.
    pub fn diagnostics(&self) -> String {
        self.report
            .results
            .iter()
            .filter(|r| !r.passed && !r.skipped)
            .map(|r| format!("### {}\n\n```\n{}\n```", r.summary(), r.output.trim_end()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Fraction of passing tests from cargo-style `test result:` lines. Falls
/// back to 1.0 / 0.0 on the exit status when no counts are printed; a
/// skipped or absent gate counts as passing.
pub fn test_pass_rate(result: Option<&GateResult>) -> f64 {
    let Some(result) = result.filter(|r| !r.skipped) else {
        return 1.0;
    };
    let (mut passed, mut failed) = (0u64, 0u64);
    for line in result.output.lines() {
        let Some(rest) = line.trim().strip_prefix("test result:") else {
            continue;
        };
        for part in rest.split(';') {
            let mut words = part.split_whitespace().rev();
            let (Some(label), Some(count)) = (words.next(), words.next()) else {
                continue;
            };
            let Ok(count) = count.parse::<u64>() else {
                continue;
            };
            match label {
                "passed" => passed += count,
                "failed" => failed += count,
                _ => {}
            }
        }
    }
    if passed + failed > 0 {
        passed as f64 / (passed + failed) as f64
    } else if result.passed {
        1.0
    } else {
        0.0
    }
}

/// Number of `warning:` / `error:` diagnostics in lint output, ignoring
/// compiler summary lines. A failing gate counts at least one.
pub fn count_lint_violations(result: Option<&GateResult>) -> u64 {
    let Some(result) = result.filter(|r| !r.skipped) else {
        return 0;
    };
    let counted = result
        .output
        .lines()
        .map(str::trim_start)
        .filter(|l| l.starts_with("warning:") || l.starts_with("error:") || l.starts_with("error["))
        .filter(|l| {
            !l.contains("generated")
                && !l.contains("aborting due to")
                && !l.contains("could not compile")
        })
        .count() as u64;
    if counted == 0 && !result.passed {
        1
    } else {
        counted
    }
}

// ---------------------------------------------------------------------------
// PathHealth
// ---------------------------------------------------------------------------

/// Trajectory indicators over the last few cycles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PathHealth {
    pub test_pass_rate: f64,
    pub new_lint_violations: u64,
    /// Net lines per completed task.
    pub code_growth: f64,
    pub completion_rate: f64,
    /// Number of cycles the figures cover.
    pub window: usize,
}

impl PathHealth {
    /// `window` is the recent cycle metrics including the current cycle,
    /// oldest first. Without a fresh evaluation the last recorded pass
    /// rate is reused.
    pub fn compute(window: &[CycleMetrics], evaluation: Option<&Evaluation>) -> Self {
        let completed: u64 = window.iter().map(|m| m.tasks_completed).sum();
        let failed: u64 = window.iter().map(|m| m.tasks_failed).sum();
        let net: i64 = window.iter().map(CycleMetrics::net_lines).sum();

        let test_pass_rate = evaluation
            .map(|e| e.test_pass_rate)
            .or_else(|| window.iter().rev().find_map(|m| m.test_pass_rate))
            .unwrap_or(1.0);

        Self {
            test_pass_rate,
            new_lint_violations: evaluation.map_or(0, |e| e.new_lint_violations),
            code_growth: if completed == 0 {
                0.0
            } else {
                net as f64 / completed as f64
            },
            completion_rate: if completed + failed == 0 {
                1.0
            } else {
                completed as f64 / (completed + failed) as f64
            },
            window: window.len(),
        }
    }

    pub fn violations(&self, thresholds: &HealthConfig) -> Vec<HealthViolation> {
        let mut found = Vec::new();
        if self.test_pass_rate < thresholds.min_test_pass_rate {
            found.push(HealthViolation::LowTestPassRate {
                actual: self.test_pass_rate,
                min: thresholds.min_test_pass_rate,
            });
        }
        if self.new_lint_violations > thresholds.max_new_lint_violations {
            found.push(HealthViolation::NewLintViolations {
                actual: self.new_lint_violations,
                max: thresholds.max_new_lint_violations,
            });
        }
        if self.code_growth > thresholds.max_code_growth {
            found.push(HealthViolation::ExcessiveGrowth {
                actual: self.code_growth,
                max: thresholds.max_code_growth,
            });
        }
        if self.completion_rate < thresholds.min_completion_rate {
            found.push(HealthViolation::LowCompletionRate {
                actual: self.completion_rate,
                min: thresholds.min_completion_rate,
            });
        }
        found
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HealthViolation {
    LowTestPassRate { actual: f64, min: f64 },
    NewLintViolations { actual: u64, max: u64 },
    ExcessiveGrowth { actual: f64, max: f64 },
    LowCompletionRate { actual: f64, min: f64 },
}

impl HealthViolation {
    /// Broken tests or new lint findings: repairable in place.
    pub fn is_local_defect(&self) -> bool {
        matches!(
            self,
            HealthViolation::LowTestPassRate { .. } | HealthViolation::NewLintViolations { .. }
        )
    }

    pub fn is_structural(&self) -> bool {
        matches!(self, HealthViolation::ExcessiveGrowth { .. })
    }
}

impl fmt::Display for HealthViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthViolation::LowTestPassRate { actual, min } => write!(
                f,
                "test pass rate {:.0}% is below {:.0}%",
                actual * 100.0,
                min * 100.0
            ),
            HealthViolation::NewLintViolations { actual, max } => {
                write!(f, "{actual} new lint violations (allowed {max})")
            }
            HealthViolation::ExcessiveGrowth { actual, max } => {
                write!(f, "code growth {actual:.0} lines/task exceeds {max:.0}")
            }
            HealthViolation::LowCompletionRate { actual, min } => write!(
                f,
                "task completion rate {:.0}% is below {:.0}%",
                actual * 100.0,
                min * 100.0
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Where the controller goes after evaluating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Fix,
    Redesign,
    Report,
}

/// First match wins: local defects, then structural growth, then the
/// periodic redesign.
pub fn route(health: &PathHealth, thresholds: &HealthConfig, redesign_due: bool) -> Route {
    let violations = health.violations(thresholds);
    if violations.iter().any(HealthViolation::is_local_defect) {
        Route::Fix
    } else if violations.iter().any(HealthViolation::is_structural) || redesign_due {
        Route::Redesign
    } else {
        Route::Report
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(kind: GateKind, passed: bool, output: &str) -> GateResult {
        GateResult {
            kind,
            passed,
            skipped: false,
            duration_ms: 1,
            exit_code: Some(if passed { 0 } else { 1 }),
            output: output.into(),
            reason: None,
        }
    }

    fn healthy() -> PathHealth {
        PathHealth {
            test_pass_rate: 1.0,
            new_lint_violations: 0,
            code_growth: 40.0,
            completion_rate: 1.0,
            window: 1,
        }
    }

    #[test]
    fn half_passing_tests_route_to_fix() {
        let health = PathHealth {
            test_pass_rate: 0.5,
            code_growth: 500.0,
            ..healthy()
        };
        assert_eq!(route(&health, &HealthConfig::default(), true), Route::Fix);
    }

    #[test]
    fn new_lint_routes_to_fix() {
        let health = PathHealth {
            new_lint_violations: 2,
            ..healthy()
        };
        assert_eq!(route(&health, &HealthConfig::default(), false), Route::Fix);
    }

    #[test]
    fn growth_or_interval_routes_to_redesign() {
        let growing = PathHealth {
            code_growth: 250.0,
            ..healthy()
        };
        assert_eq!(route(&growing, &HealthConfig::default(), false), Route::Redesign);
        assert_eq!(route(&healthy(), &HealthConfig::default(), true), Route::Redesign);
        assert_eq!(route(&healthy(), &HealthConfig::default(), false), Route::Report);
    }

    #[test]
    fn low_completion_is_reported_not_routed() {
        let health = PathHealth {
            completion_rate: 0.4,
            ..healthy()
        };
        let violations = health.violations(&HealthConfig::default());
        assert_eq!(violations.len(), 1);
        assert!(violations[0].to_string().contains("40%"));
        assert_eq!(route(&health, &HealthConfig::default(), false), Route::Report);
    }

    #[test]
    fn pass_rate_from_cargo_output() {
        let out = "running 4 tests\n\
                   test result: FAILED. 3 passed; 1 failed; 0 ignored; 0 measured\n\
                   test result: ok. 4 passed; 0 failed; 0 ignored\n";
        let rate = test_pass_rate(Some(&gate(GateKind::Test, false, out)));
        assert!((rate - 7.0 / 8.0).abs() < 1e-9);

        assert_eq!(test_pass_rate(Some(&gate(GateKind::Test, false, "boom"))), 0.0);
        assert_eq!(test_pass_rate(Some(&gate(GateKind::Test, true, ""))), 1.0);
        assert_eq!(test_pass_rate(None), 1.0);
    }

    #[test]
    fn lint_counts_diagnostics_not_summaries() {
        let out = "warning: unused variable: `x`\n  --> src/lib.rs:3:9\n\
                   error[E0425]: cannot find value `y`\n\
                   warning: `demo` (lib) generated 1 warning\n\
                   error: could not compile `demo`\n";
        assert_eq!(count_lint_violations(Some(&gate(GateKind::Lint, false, out))), 2);
        assert_eq!(count_lint_violations(Some(&gate(GateKind::Lint, false, "odd"))), 1);
        assert_eq!(count_lint_violations(Some(&gate(GateKind::Lint, true, ""))), 0);
    }

    #[test]
    fn evaluation_subtracts_baseline() {
        let report = GateReport {
            results: vec![
                gate(GateKind::Test, true, ""),
                gate(GateKind::Lint, false, "warning: a\nwarning: b\nwarning: c\n"),
            ],
        };
        let first = Evaluation::from_report(report.clone(), None);
        assert_eq!(first.new_lint_violations, 0);

        let eval = Evaluation::from_report(report, Some(2));
        assert_eq!(eval.lint_violations, 3);
        assert_eq!(eval.new_lint_violations, 1);
        assert!(eval.diagnostics().contains("lint gate failed"));
    }

    #[test]
    fn compute_over_window() {
        let mut a = CycleMetrics::new(1);
        a.tasks_completed = 3;
        a.tasks_failed = 1;
        a.lines_added = 400;
        a.lines_removed = 100;
        a.test_pass_rate = Some(0.95);
        let mut b = CycleMetrics::new(2);
        b.tasks_completed = 1;
        b.lines_added = 100;

        let health = PathHealth::compute(&[a, b], None);
        assert_eq!(health.window, 2);
        assert_eq!(health.code_growth, 100.0);
        assert_eq!(health.completion_rate, 0.8);
        assert_eq!(health.test_pass_rate, 0.95);

        let empty = PathHealth::compute(&[], None);
        assert_eq!(empty.completion_rate, 1.0);
        assert_eq!(empty.code_growth, 0.0);
    }
}

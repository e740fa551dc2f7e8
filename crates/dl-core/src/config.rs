use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::quality_gate::{GateCommand, GateKind};

/// Directory under the repository root that holds engine state.
pub const STATE_DIR: &str = ".devloop";

/// Top-level configuration loaded from `<repo>/.devloop/config.toml`.
///
/// Credentials are never stored here. The provider API key is read from
/// the environment variable named by [`AgentConfig::api_key_env`].
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub gates: GatesConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

impl Config {
    /// Load config for a repository: `<repo>/.devloop/config.toml`, then
    /// `~/.devloop/config.toml`, falling back to defaults when neither
    /// exists.
    pub fn load(repo_root: &Path) -> Result<Self, ConfigError> {
        let candidates = [Some(Self::repo_path(repo_root)), Self::user_path()];
        for path in candidates.into_iter().flatten() {
            if path.exists() {
                return Self::load_from(path);
            }
        }
        let cfg = Config::default();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.agent.validate()?;
        self.controller.validate()?;
        self.health.validate()?;
        if self.gates.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "gates.timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn repo_path(repo_root: &Path) -> PathBuf {
        repo_root.join(STATE_DIR).join("config.toml")
    }

    fn user_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(STATE_DIR).join("config.toml"))
    }

    /// Resolve a configured path against the repository root.
    pub fn resolve(repo_root: &Path, configured: &str) -> PathBuf {
        let path = Path::new(configured);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            repo_root.join(path)
        }
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

fn check_ratio(name: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!(
            "{name} must be within [0, 1], got {value}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
    /// Claimant identity; generated from host and pid when unset.
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            json_logs: false,
            instance_id: None,
        }
    }
}

fn default_project_name() -> String {
    "devloop".into()
}
fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    format!("{STATE_DIR}/tasks.db")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Wall-clock budget for one task's agent conversation.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
            max_turns: default_max_turns(),
            request_timeout_secs: default_request_timeout(),
            task_timeout_secs: default_task_timeout(),
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            temperature: None,
        }
    }
}

impl AgentConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_turns == 0 {
            return Err(ConfigError::Validation(
                "agent.max_turns must be greater than 0".into(),
            ));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::Validation(
                "agent.max_tokens must be greater than 0".into(),
            ));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=1.0).contains(&t) {
                return Err(ConfigError::Validation(format!(
                    "agent.temperature must be within [0, 1], got {t}"
                )));
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".into()
}
fn default_max_tokens() -> u32 {
    8192
}
fn default_max_turns() -> u32 {
    50
}
fn default_request_timeout() -> u64 {
    300
}
fn default_task_timeout() -> u64 {
    3600
}
fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".into()
}
fn default_base_url() -> String {
    "https://api.anthropic.com".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatesConfig {
    #[serde(default = "default_test_command")]
    pub test_command: String,
    #[serde(default = "default_lint_command")]
    pub lint_command: String,
    #[serde(default = "default_build_command")]
    pub build_command: String,
    #[serde(default)]
    pub skip_test: bool,
    #[serde(default)]
    pub skip_lint: bool,
    #[serde(default)]
    pub skip_build: bool,
    #[serde(default = "default_gate_timeout")]
    pub timeout_secs: u64,
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            test_command: default_test_command(),
            lint_command: default_lint_command(),
            build_command: default_build_command(),
            skip_test: false,
            skip_lint: false,
            skip_build: false,
            timeout_secs: default_gate_timeout(),
        }
    }
}

impl GatesConfig {
    /// Code gates in their fixed order: test, lint, build.
    pub fn commands(&self) -> Vec<GateCommand> {
        let timeout = Duration::from_secs(self.timeout_secs);
        [
            (GateKind::Test, &self.test_command, self.skip_test),
            (GateKind::Lint, &self.lint_command, self.skip_lint),
            (GateKind::Build, &self.build_command, self.skip_build),
        ]
        .into_iter()
        .map(|(kind, command, skip)| GateCommand {
            kind,
            command: command.clone(),
            skip,
            timeout,
        })
        .collect()
    }
}

fn default_test_command() -> String {
    "cargo test".into()
}
fn default_lint_command() -> String {
    "cargo clippy -- -D warnings".into()
}
fn default_build_command() -> String {
    "cargo build".into()
}
fn default_gate_timeout() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceConfig {
    #[serde(default = "default_worktree_dir")]
    pub worktree_dir: String,
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    #[serde(default = "default_true")]
    pub sweep_on_start: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            worktree_dir: default_worktree_dir(),
            stale_after_secs: default_stale_after(),
            sweep_on_start: true,
        }
    }
}

fn default_worktree_dir() -> String {
    format!("{STATE_DIR}/worktrees")
}
fn default_stale_after() -> u64 {
    24 * 60 * 60
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerConfig {
    /// Completed cycles before the loop stops; 0 means unbounded.
    #[serde(default)]
    pub max_cycles: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Batch failure ratio above which the loop evaluates early.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,
    #[serde(default)]
    pub stop_on_failure: bool,
    /// Suspend at every report until a human resumes the loop.
    #[serde(default)]
    pub guided: bool,
    /// Force a redesign every N cycles; 0 disables.
    #[serde(default)]
    pub redesign_interval: u32,
    #[serde(default = "default_max_fix_attempts")]
    pub max_fix_attempts: u32,
    #[serde(default = "default_health_window")]
    pub health_window: usize,
    #[serde(default = "default_journal_path")]
    pub journal_path: String,
    #[serde(default = "default_operations_dir")]
    pub operations_dir: String,
    #[serde(default = "default_work_file")]
    pub work_file: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_cycles: 0,
            batch_size: default_batch_size(),
            failure_threshold: default_failure_threshold(),
            stop_on_failure: false,
            guided: false,
            redesign_interval: 0,
            max_fix_attempts: default_max_fix_attempts(),
            health_window: default_health_window(),
            journal_path: default_journal_path(),
            operations_dir: default_operations_dir(),
            work_file: default_work_file(),
        }
    }
}

impl ControllerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Validation(
                "controller.batch_size must be greater than 0".into(),
            ));
        }
        if !(self.failure_threshold > 0.0 && self.failure_threshold <= 1.0) {
            return Err(ConfigError::Validation(format!(
                "controller.failure_threshold must be within (0, 1], got {}",
                self.failure_threshold
            )));
        }
        if self.health_window == 0 {
            return Err(ConfigError::Validation(
                "controller.health_window must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_batch_size() -> u32 {
    10
}
fn default_failure_threshold() -> f64 {
    0.5
}
fn default_max_fix_attempts() -> u32 {
    3
}
fn default_health_window() -> usize {
    5
}
fn default_journal_path() -> String {
    format!("{STATE_DIR}/metrics.jsonl")
}
fn default_operations_dir() -> String {
    format!("{STATE_DIR}/operations")
}
fn default_work_file() -> String {
    format!("{STATE_DIR}/proposals.toml")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthConfig {
    #[serde(default = "default_min_test_pass_rate")]
    pub min_test_pass_rate: f64,
    #[serde(default)]
    pub max_new_lint_violations: u64,
    /// Net lines per completed task.
    #[serde(default = "default_max_code_growth")]
    pub max_code_growth: f64,
    #[serde(default = "default_min_completion_rate")]
    pub min_completion_rate: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            min_test_pass_rate: default_min_test_pass_rate(),
            max_new_lint_violations: 0,
            max_code_growth: default_max_code_growth(),
            min_completion_rate: default_min_completion_rate(),
        }
    }
}

impl HealthConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        check_ratio("health.min_test_pass_rate", self.min_test_pass_rate)?;
        check_ratio("health.min_completion_rate", self.min_completion_rate)?;
        if self.max_code_growth <= 0.0 {
            return Err(ConfigError::Validation(
                "health.max_code_growth must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_min_test_pass_rate() -> f64 {
    0.9
}
fn default_max_code_growth() -> f64 {
    200.0
}
fn default_min_completion_rate() -> f64 {
    0.8
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.controller.batch_size, 10);
        assert_eq!(cfg.controller.failure_threshold, 0.5);
        assert_eq!(cfg.controller.max_cycles, 0);
        assert_eq!(cfg.agent.max_turns, 50);
        assert_eq!(cfg.gates.timeout_secs, 600);
    }

    #[test]
    fn gate_commands_keep_order_and_skip_flags() {
        let gates = GatesConfig {
            skip_lint: true,
            ..GatesConfig::default()
        };
        let cmds = gates.commands();
        let kinds: Vec<_> = cmds.iter().map(|g| g.kind).collect();
        assert_eq!(kinds, [GateKind::Test, GateKind::Lint, GateKind::Build]);
        assert!(cmds[1].skip);
        assert_eq!(cmds[0].timeout, Duration::from_secs(600));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [controller]
            max_cycles = 2
            guided = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.controller.max_cycles, 2);
        assert!(cfg.controller.guided);
        assert_eq!(cfg.controller.batch_size, 10);
        assert_eq!(cfg.health.min_test_pass_rate, 0.9);
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        let mut cfg = Config::default();
        cfg.controller.failure_threshold = 0.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        let mut cfg = Config::default();
        cfg.health.min_completion_rate = 1.5;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        let mut cfg = Config::default();
        cfg.controller.batch_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn resolve_keeps_absolute_paths() {
        let root = Path::new("/repo");
        assert_eq!(Config::resolve(root, ".devloop/tasks.db"), PathBuf::from("/repo/.devloop/tasks.db"));
        assert_eq!(Config::resolve(root, "/var/db"), PathBuf::from("/var/db"));
    }
}

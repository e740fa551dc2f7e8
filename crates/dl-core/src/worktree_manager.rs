use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Branch namespace for task workspaces.
pub const BRANCH_PREFIX: &str = "devloop/";

/// Identity used for commits the engine makes on the agent's behalf.
const COMMIT_IDENTITY: [&str; 4] = [
    "-c",
    "user.name=devloop",
    "-c",
    "user.email=devloop@localhost",
];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// The `git` executable is not installed. Fatal to a run.
    #[error("git executable not found")]
    GitMissing,
    #[error("git command failed: {0}")]
    GitCommand(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("workspace already exists: {0}")]
    AlreadyExists(String),
}

impl WorkspaceError {
    /// Infrastructure failures abort the whole run rather than one task.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, WorkspaceError::GitMissing)
    }
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

// ---------------------------------------------------------------------------
// MergeResult / DiffStat / CleanupReport
// ---------------------------------------------------------------------------

/// Outcome of merging a workspace branch into the shared tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeResult {
    Success,
    /// Merge was aborted; these files conflicted.
    Conflict(Vec<String>),
    /// The branch has no commits beyond the shared tree.
    NothingToMerge,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStat {
    pub files_changed: u64,
    pub lines_added: u64,
    pub lines_removed: u64,
}

impl DiffStat {
    /// Parse `git diff --numstat` output. Binary files count as changed
    /// files with no line delta.
    pub fn from_numstat(raw: &str) -> Self {
        let mut stat = DiffStat::default();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            let mut cols = line.split('\t');
            let added = cols.next().and_then(|c| c.parse::<u64>().ok()).unwrap_or(0);
            let removed = cols.next().and_then(|c| c.parse::<u64>().ok()).unwrap_or(0);
            stat.files_changed += 1;
            stat.lines_added += added;
            stat.lines_removed += removed;
        }
        stat
    }
}

/// What a best-effort removal managed to do. Failures are collected, never
/// raised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub worktree_removed: bool,
    pub branch_deleted: bool,
    pub directory_removed: bool,
    pub errors: Vec<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

// ---------------------------------------------------------------------------
// GitRunner trait (for testability)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GitSpawnError {
    #[error("git executable not found")]
    NotInstalled,
    #[error("failed to run git: {0}")]
    Io(String),
}

/// Abstraction over git CLI operations so they can be mocked in tests.
#[async_trait]
pub trait GitRunner: Send + Sync {
    async fn run_git(
        &self,
        dir: &Path,
        args: &[&str],
    ) -> std::result::Result<GitOutput, GitSpawnError>;
}

/// Real git runner that shells out to the `git` binary.
pub struct RealGitRunner;

#[async_trait]
impl GitRunner for RealGitRunner {
    async fn run_git(
        &self,
        dir: &Path,
        args: &[&str],
    ) -> std::result::Result<GitOutput, GitSpawnError> {
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => GitSpawnError::NotInstalled,
                _ => GitSpawnError::Io(e.to_string()),
            })?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

/// An isolated branch + working directory owned by one in-progress task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub task_id: Uuid,
    pub branch: String,
    pub path: PathBuf,
    /// Commit the branch was cut from.
    pub base_commit: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// WorkspaceManager
// ---------------------------------------------------------------------------

/// Creates, measures, merges and removes per-task git worktrees.
///
/// Workspaces live at `{worktree_dir}/{task-id}` on branch
/// `devloop/{task-id}`, cut from the shared tree's `HEAD`.
#[derive(Clone)]
pub struct WorkspaceManager {
    repo_root: PathBuf,
    worktree_dir: PathBuf,
    git: Arc<dyn GitRunner>,
}

impl WorkspaceManager {
    /// Create a manager with the real git runner.
    pub fn new(repo_root: impl Into<PathBuf>, worktree_dir: impl Into<PathBuf>) -> Self {
        Self::with_git_runner(repo_root, worktree_dir, Arc::new(RealGitRunner))
    }

    /// Create a manager with a custom git runner (for testing).
    pub fn with_git_runner(
        repo_root: impl Into<PathBuf>,
        worktree_dir: impl Into<PathBuf>,
        git: Arc<dyn GitRunner>,
    ) -> Self {
        Self {
            repo_root: repo_root.into(),
            worktree_dir: worktree_dir.into(),
            git,
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn branch_for(task_id: Uuid) -> String {
        format!("{BRANCH_PREFIX}{task_id}")
    }

    pub fn path_for(&self, task_id: Uuid) -> PathBuf {
        self.worktree_dir.join(task_id.to_string())
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<GitOutput> {
        debug!(dir = %dir.display(), args = ?args, "git");
        self.git.run_git(dir, args).await.map_err(|e| match e {
            GitSpawnError::NotInstalled => WorkspaceError::GitMissing,
            GitSpawnError::Io(msg) => WorkspaceError::GitCommand(msg),
        })
    }

    /// Run git and turn a non-zero exit into an error.
    async fn git_ok(&self, dir: &Path, args: &[&str]) -> Result<GitOutput> {
        let out = self.git(dir, args).await?;
        if out.success {
            Ok(out)
        } else {
            Err(WorkspaceError::GitCommand(format!(
                "git {}: {}",
                args.join(" "),
                out.stderr.trim()
            )))
        }
    }

    /// Create the branch and worktree for a task.
    ///
    /// If the worktree cannot be added, the freshly created branch is deleted
    /// before the error is returned.
    pub async fn create(&self, task_id: Uuid) -> Result<Workspace> {
        let branch = Self::branch_for(task_id);
        let path = self.path_for(task_id);

        if path.exists() {
            return Err(WorkspaceError::AlreadyExists(path.display().to_string()));
        }
        self.ensure_worktree_dir().await?;

        let head = self.git_ok(&self.repo_root, &["rev-parse", "HEAD"]).await?;
        let base_commit = head.stdout.trim().to_string();

        info!(
            task_id = %task_id,
            worktree = %path.display(),
            branch = %branch,
            "creating workspace"
        );

        self.git_ok(&self.repo_root, &["branch", &branch, "HEAD"])
            .await?;

        let path_str = path.to_string_lossy().to_string();
        if let Err(e) = self
            .git_ok(&self.repo_root, &["worktree", "add", &path_str, &branch])
            .await
        {
            warn!(branch = %branch, error = %e, "worktree add failed; deleting branch");
            if let Err(del) = self.git_ok(&self.repo_root, &["branch", "-D", &branch]).await {
                warn!(branch = %branch, error = %del, "failed to delete orphaned branch");
            }
            return Err(e);
        }

        Ok(Workspace {
            task_id,
            branch,
            path,
            base_commit,
            created_at: Utc::now(),
        })
    }

    /// Create the worktree directory. When it sits inside the repository it
    /// is listed in `.git/info/exclude`, which is local to this clone, so
    /// the tracked tree is never written to.
    async fn ensure_worktree_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.worktree_dir).await?;
        let Ok(relative) = self.worktree_dir.strip_prefix(&self.repo_root) else {
            return Ok(());
        };
        if relative.as_os_str().is_empty() {
            return Ok(());
        }
        // A linked worktree has a `.git` file, not a directory; leave it be.
        let git_dir = self.repo_root.join(".git");
        if !tokio::fs::metadata(&git_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Ok(());
        }

        let pattern = format!("/{}/", relative.to_string_lossy().replace('\\', "/"));
        let info = git_dir.join("info");
        tokio::fs::create_dir_all(&info).await?;
        let exclude = info.join("exclude");
        let mut content = tokio::fs::read_to_string(&exclude).await.unwrap_or_default();
        if content.lines().any(|line| line.trim() == pattern) {
            return Ok(());
        }
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&pattern);
        content.push('\n');
        tokio::fs::write(&exclude, content).await?;
        debug!(pattern = %pattern, "worktree directory excluded from status");
        Ok(())
    }

    /// Commit anything the agent left uncommitted in the workspace.
    /// Returns `true` when a commit was made.
    pub async fn commit_pending(&self, ws: &Workspace, message: &str) -> Result<bool> {
        self.git_ok(&ws.path, &["add", "-A"]).await?;
        let status = self.git_ok(&ws.path, &["status", "--porcelain"]).await?;
        if status.stdout.trim().is_empty() {
            return Ok(false);
        }
        let mut args: Vec<&str> = COMMIT_IDENTITY.to_vec();
        args.extend(["commit", "--no-verify", "-m", message]);
        self.git_ok(&ws.path, &args).await?;
        debug!(branch = %ws.branch, "committed pending workspace changes");
        Ok(true)
    }

    /// Lines added/removed on the workspace branch relative to its base.
    /// Pending changes are committed first so they are counted.
    pub async fn diff_stat(&self, ws: &Workspace) -> Result<DiffStat> {
        let message = format!("devloop: work for task {}", ws.task_id);
        self.commit_pending(ws, &message).await?;
        let range = format!("{}..{}", ws.base_commit, ws.branch);
        let out = self
            .git_ok(&self.repo_root, &["diff", "--numstat", &range])
            .await?;
        Ok(DiffStat::from_numstat(&out.stdout))
    }

    /// Merge the workspace branch into the shared tree with `--no-ff`.
    ///
    /// A conflicting merge is aborted so the shared tree is left untouched.
    pub async fn merge(&self, ws: &Workspace) -> Result<MergeResult> {
        info!(branch = %ws.branch, "attempting merge into shared tree");

        let range = format!("HEAD..{}", ws.branch);
        let ahead = self
            .git_ok(&self.repo_root, &["rev-list", "--count", &range])
            .await?;
        if ahead.stdout.trim() == "0" {
            info!(branch = %ws.branch, "nothing to merge");
            return Ok(MergeResult::NothingToMerge);
        }

        let message = format!("Merge branch '{}'", ws.branch);
        let mut args: Vec<&str> = COMMIT_IDENTITY.to_vec();
        args.extend(["merge", "--no-ff", "--no-edit", "-m", message.as_str(), ws.branch.as_str()]);
        let merged = self.git(&self.repo_root, &args).await?;
        if merged.success {
            info!(branch = %ws.branch, "merge successful");
            return Ok(MergeResult::Success);
        }

        let conflicts = self
            .git(&self.repo_root, &["diff", "--name-only", "--diff-filter=U"])
            .await
            .map(|out| {
                out.stdout
                    .lines()
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let abort = self.git(&self.repo_root, &["merge", "--abort"]).await;
        if let Ok(out) = &abort {
            if !out.success {
                warn!(branch = %ws.branch, stderr = %out.stderr.trim(), "merge --abort failed");
            }
        }

        if conflicts.is_empty() {
            return Err(WorkspaceError::GitCommand(format!(
                "merge of {} failed: {}",
                ws.branch,
                merged.stderr.trim()
            )));
        }
        warn!(branch = %ws.branch, conflicts = ?conflicts, "merge conflicts detected");
        Ok(MergeResult::Conflict(conflicts))
    }

    /// Remove the worktree, prune, delete the branch and, if anything is
    /// left on disk, the directory. Never fails; problems are logged and
    /// collected in the report.
    pub async fn remove(&self, ws: &Workspace) -> CleanupReport {
        let report = self.remove_parts(&ws.path, &ws.branch).await;
        if report.is_clean() {
            info!(task_id = %ws.task_id, branch = %ws.branch, "workspace removed");
        } else {
            warn!(
                task_id = %ws.task_id,
                branch = %ws.branch,
                errors = ?report.errors,
                "workspace cleanup incomplete"
            );
        }
        report
    }

    async fn remove_parts(&self, path: &Path, branch: &str) -> CleanupReport {
        let mut report = CleanupReport::default();
        let path_str = path.to_string_lossy().to_string();

        match self
            .git_ok(&self.repo_root, &["worktree", "remove", "--force", &path_str])
            .await
        {
            Ok(_) => report.worktree_removed = true,
            Err(e) => report.errors.push(e.to_string()),
        }

        if let Err(e) = self.git_ok(&self.repo_root, &["worktree", "prune"]).await {
            report.errors.push(e.to_string());
        }

        match self.git_ok(&self.repo_root, &["branch", "-D", branch]).await {
            Ok(_) => report.branch_deleted = true,
            Err(e) => report.errors.push(e.to_string()),
        }

        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            match tokio::fs::remove_dir_all(path).await {
                Ok(()) => report.directory_removed = true,
                Err(e) => report.errors.push(format!("remove {}: {e}", path.display())),
            }
        } else {
            report.directory_removed = true;
        }
        report
    }

    /// Remove workspaces older than `max_age` that a crashed process left
    /// behind. Workspaces of tasks in `live` (still claimed by some
    /// instance) are kept whatever their age. Returns the paths removed.
    pub async fn sweep_stale(
        &self,
        max_age: Duration,
        live: &HashSet<Uuid>,
    ) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        if !tokio::fs::try_exists(&self.worktree_dir).await.unwrap_or(false) {
            return Ok(removed);
        }

        let cutoff = std::time::SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);

        let mut entries = tokio::fs::read_dir(&self.worktree_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = entry.metadata().await?;
            if !metadata.is_dir() {
                continue;
            }
            let Some(task_id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| Uuid::parse_str(n).ok())
            else {
                continue;
            };
            let modified = metadata
                .modified()
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            if modified >= cutoff {
                continue;
            }
            if live.contains(&task_id) {
                debug!(path = %path.display(), "workspace belongs to a claimed task; keeping");
                continue;
            }

            info!(path = %path.display(), "removing stale workspace");
            let report = self.remove_parts(&path, &Self::branch_for(task_id)).await;
            if report.directory_removed {
                removed.push(path);
            } else {
                warn!(path = %path.display(), errors = ?report.errors, "failed to remove stale workspace");
            }
        }
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

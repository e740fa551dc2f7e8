//! Full task lifecycle against a real git repository and real shell gates.
//! Skipped when `git` is not installed.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use dl_agents::task_runner::{TaskFailure, TaskRunner};
use dl_core::cancel::CancelSignal;
use dl_core::claim::ClaimManager;
use dl_core::quality_gate::{GateCommand, GateKind, QualityGateRunner};
use dl_core::store::{InMemoryTaskStore, TaskStore};
use dl_core::types::{meta, Task, TaskFilter, TaskState, WorkCategory};
use dl_core::worktree_manager::WorkspaceManager;
use dl_harness::builtin_tools::builtin_registry;
use dl_harness::dispatch::DispatchLoop;
use dl_harness::provider::{Response, ScriptedProvider, ToolCall};

fn git(dir: &Path, args: &[&str]) -> Option<String> {
    let out = Command::new("git")
        .args(["-c", "user.name=test", "-c", "user.email=test@example.com"])
        .args(args)
        .current_dir(dir)
        .output()
        .ok()?;
    out.status
        .success()
        .then(|| String::from_utf8_lossy(&out.stdout).to_string())
}

fn init_repo(dir: &Path) -> bool {
    if git(dir, &["init", "-q"]).is_none() {
        return false;
    }
    std::fs::create_dir_all(dir.join("src")).unwrap();
    std::fs::write(dir.join("src/lib.rs"), "pub fn one() -> u32 { 1 }\n").unwrap();
    git(dir, &["add", "."]).is_some() && git(dir, &["commit", "-q", "-m", "init"]).is_some()
}

/// Gates that need nothing but a POSIX shell. Lint rejects `dbg!`.
fn shell_gates() -> Vec<GateCommand> {
    vec![
        GateCommand::new(GateKind::Test, "test -f src/lib.rs"),
        GateCommand::new(GateKind::Lint, "! grep -rn 'dbg!' src"),
        GateCommand::new(GateKind::Build, "true"),
    ]
}

fn write_lib(content: &str) -> ScriptedProvider {
    ScriptedProvider::new(vec![
        Ok(Response::tool_calls(vec![ToolCall {
            id: "w".into(),
            name: "write_file".into(),
            arguments: serde_json::json!({"path": "src/lib.rs", "content": content}).to_string(),
        }])
        .with_usage(1200, 150)),
        Ok(Response::text("Updated src/lib.rs").with_usage(1400, 20)),
    ])
}

async fn setup(repo: &Path, provider: ScriptedProvider) -> (TaskRunner, InMemoryTaskStore, Task) {
    let store = InMemoryTaskStore::new();
    let task = Task::new("extend lib", WorkCategory::Coding).with_description("Add two().");
    store.insert(&task).await.unwrap();

    let claims = ClaimManager::new(Arc::new(store.clone()), "lifecycle-test");
    let runner = TaskRunner::new(
        claims.clone(),
        WorkspaceManager::new(repo, repo.join(".devloop/worktrees")),
        QualityGateRunner::new(shell_gates()),
        DispatchLoop::new(Arc::new(provider), builtin_registry()),
    );
    let claimed = claims
        .claim_next(&TaskFilter::available())
        .await
        .unwrap()
        .unwrap();
    (runner, store, claimed)
}

fn branches(repo: &Path) -> String {
    git(repo, &["branch", "--list", "devloop/*"]).unwrap_or_default()
}

#[tokio::test]
async fn passing_task_is_merged_with_line_delta() {
    let repo = tempfile::tempdir().unwrap();
    if !init_repo(repo.path()) {
        eprintln!("git unavailable; skipping");
        return;
    }
    let new_lib = "pub fn one() -> u32 { 1 }\npub fn two() -> u32 { 2 }\n";
    let (runner, store, task) = setup(repo.path(), write_lib(new_lib)).await;

    let outcome = runner.run(task.clone(), &CancelSignal::new()).await.unwrap();

    assert!(outcome.completed(), "{:?}", outcome.failure);
    assert_eq!(
        std::fs::read_to_string(repo.path().join("src/lib.rs")).unwrap(),
        new_lib
    );
    let stored = store.get(task.id).await.unwrap().unwrap();
    assert_eq!(stored.state, TaskState::Completed);
    assert!(stored.meta_u64(meta::TOKENS_INPUT).unwrap() > 0);
    assert_eq!(stored.meta_u64(meta::LINES_ADDED), Some(1));

    assert!(branches(repo.path()).trim().is_empty());
    assert!(!repo
        .path()
        .join(".devloop/worktrees")
        .join(task.id.to_string())
        .exists());
}

#[tokio::test]
async fn lint_failure_leaves_shared_tree_byte_identical() {
    let repo = tempfile::tempdir().unwrap();
    if !init_repo(repo.path()) {
        eprintln!("git unavailable; skipping");
        return;
    }
    let head_before = git(repo.path(), &["rev-parse", "HEAD"]).unwrap();
    let lib_before = std::fs::read(repo.path().join("src/lib.rs")).unwrap();

    let sloppy = "pub fn one() -> u32 { dbg!(1) }\n";
    let (runner, store, task) = setup(repo.path(), write_lib(sloppy)).await;

    let outcome = runner.run(task.clone(), &CancelSignal::new()).await.unwrap();

    match &outcome.failure {
        Some(TaskFailure::Gate { kind, .. }) => assert_eq!(*kind, GateKind::Lint),
        other => panic!("Expected lint gate failure, got {other:?}"),
    }
    let gates = outcome.gates.as_ref().unwrap();
    assert!(gates.result_for(GateKind::Test).unwrap().passed);
    assert!(gates.result_for(GateKind::Build).unwrap().passed);
    assert!(gates
        .result_for(GateKind::Lint)
        .unwrap()
        .output
        .contains("dbg!"));

    assert_eq!(git(repo.path(), &["rev-parse", "HEAD"]).unwrap(), head_before);
    assert_eq!(std::fs::read(repo.path().join("src/lib.rs")).unwrap(), lib_before);
    assert!(git(repo.path(), &["status", "--porcelain"])
        .unwrap()
        .trim()
        .is_empty());

    assert_eq!(
        store.get(task.id).await.unwrap().unwrap().state,
        TaskState::Failed
    );
    assert!(branches(repo.path()).trim().is_empty());
}

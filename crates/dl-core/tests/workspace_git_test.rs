//! Workspace lifecycle against a real git repository. Skipped when `git`
//! is not installed.

use std::path::Path;
use std::process::Command;

use dl_core::worktree_manager::{MergeResult, WorkspaceManager};
use uuid::Uuid;

fn git(dir: &Path, args: &[&str]) -> bool {
    Command::new("git")
        .args(["-c", "user.name=test", "-c", "user.email=test@example.com"])
        .args(args)
        .current_dir(dir)
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn init_repo(dir: &Path) -> bool {
    if !git(dir, &["init", "-q"]) {
        return false;
    }
    std::fs::write(dir.join("README.md"), "hello\n").unwrap();
    git(dir, &["add", "."]) && git(dir, &["commit", "-q", "-m", "init"])
}

#[tokio::test]
async fn create_measure_merge_and_remove() {
    let repo = tempfile::tempdir().unwrap();
    if !init_repo(repo.path()) {
        eprintln!("git unavailable; skipping");
        return;
    }
    let mgr = WorkspaceManager::new(repo.path(), repo.path().join(".devloop/worktrees"));
    let id = Uuid::new_v4();

    let ws = mgr.create(id).await.unwrap();
    assert!(ws.path.join("README.md").exists());

    std::fs::write(ws.path.join("feature.txt"), "one\ntwo\nthree\n").unwrap();
    let stat = mgr.diff_stat(&ws).await.unwrap();
    assert_eq!(stat.lines_added, 3);
    assert_eq!(stat.files_changed, 1);

    assert_eq!(mgr.merge(&ws).await.unwrap(), MergeResult::Success);
    assert!(repo.path().join("feature.txt").exists());

    let report = mgr.remove(&ws).await;
    assert!(report.is_clean(), "{:?}", report.errors);
    assert!(!ws.path.exists());
}

#[tokio::test]
async fn conflicting_merge_leaves_shared_tree_untouched() {
    let repo = tempfile::tempdir().unwrap();
    if !init_repo(repo.path()) {
        eprintln!("git unavailable; skipping");
        return;
    }
    let mgr = WorkspaceManager::new(repo.path(), repo.path().join(".devloop/worktrees"));
    let ws = mgr.create(Uuid::new_v4()).await.unwrap();

    std::fs::write(ws.path.join("README.md"), "from the task\n").unwrap();
    mgr.diff_stat(&ws).await.unwrap();

    std::fs::write(repo.path().join("README.md"), "from main\n").unwrap();
    assert!(git(repo.path(), &["commit", "-q", "-am", "diverge"]));

    match mgr.merge(&ws).await.unwrap() {
        MergeResult::Conflict(files) => assert_eq!(files, vec!["README.md".to_string()]),
        other => panic!("Expected Conflict, got {other:?}"),
    }
    let readme = std::fs::read_to_string(repo.path().join("README.md")).unwrap();
    assert_eq!(readme, "from main\n");

    mgr.remove(&ws).await;
    assert!(!ws.path.exists());
}

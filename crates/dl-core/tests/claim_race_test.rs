//! Several engine instances racing over one store.

use std::collections::HashSet;
use std::sync::Arc;

use dl_core::claim::{ClaimManager, ClaimOutcome};
use dl_core::sqlite_store::SqliteTaskStore;
use dl_core::store::{InMemoryTaskStore, TaskStore};
use dl_core::types::{meta, Task, TaskFilter, TaskState, WorkCategory};

#[tokio::test]
async fn concurrent_claims_of_one_task_have_one_winner() {
    let store = InMemoryTaskStore::new();
    let task = Task::new("contended", WorkCategory::Coding);
    store.insert(&task).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let mgr = ClaimManager::new(Arc::new(store.clone()), format!("engine-{i}"));
        let task = task.clone();
        handles.push(tokio::spawn(async move { mgr.claim(&task).await.unwrap() }));
    }

    let mut winners = 0;
    for h in handles {
        match h.await.unwrap() {
            ClaimOutcome::Claimed(_) => winners += 1,
            ClaimOutcome::Conflict { actual } => assert_eq!(actual, TaskState::InProgress),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn claim_next_hands_each_task_to_exactly_one_instance() {
    let store = InMemoryTaskStore::new();
    for i in 0..20 {
        store
            .insert(&Task::new(format!("task-{i}"), WorkCategory::Coding).with_priority(i % 3))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for i in 0..4 {
        let mgr = ClaimManager::new(Arc::new(store.clone()), format!("engine-{i}"));
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(task) = mgr.claim_next(&TaskFilter::default()).await.unwrap() {
                claimed.push(task.id);
                tokio::task::yield_now().await;
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    for h in handles {
        for id in h.await.unwrap() {
            assert!(seen.insert(id), "task {id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 20);

    let in_progress = store
        .fetch(&TaskFilter {
            state: Some(TaskState::InProgress),
            ..TaskFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(in_progress.len(), 20);
    assert!(in_progress.iter().all(|t| t.meta_str(meta::CLAIMED_BY).is_some()));
}

#[tokio::test]
async fn two_processes_on_one_sqlite_file_do_not_double_claim() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.db");
    let a: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open(&path).await.unwrap());
    let b: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open(&path).await.unwrap());

    let task = Task::new("only one", WorkCategory::Documentation);
    a.insert(&task).await.unwrap();

    let engine_a = ClaimManager::new(a, "engine-a");
    let engine_b = ClaimManager::new(b, "engine-b");
    let (ra, rb) = tokio::join!(engine_a.claim(&task), engine_b.claim(&task));
    let outcomes = [ra.unwrap(), rb.unwrap()];
    let winners = outcomes
        .iter()
        .filter(|o| matches!(o, ClaimOutcome::Claimed(_)))
        .count();
    assert_eq!(winners, 1);
}

//! Exercises the durable run queue and lease dispatcher end to end against
//! a real on-disk SQLite database (WAL mode needs a real file, not
//! `:memory:`, to behave correctly across connections).

use chrono::Duration;
use taskhub_core::{NewRun, RunFilter, RunStatus, Store};
use taskhub_core::registry::TaskDefinition;
use std::sync::Arc;

async fn open_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("taskhub.db");
    let url = format!("sqlite://{}", db_path.display());
    let store = Store::open(&url).await.expect("open store");
    (store, dir)
}

fn task_def(task_id: &str, concurrency_limit: Option<i64>) -> TaskDefinition {
    TaskDefinition {
        task_id: task_id.to_string(),
        name: task_id.to_string(),
        description: "test task".to_string(),
        tags: vec![],
        version: "1.0.0".to_string(),
        params_schema: serde_json::json!({"type": "object"}),
        concurrency_limit,
        timeout_seconds: None,
        is_enabled: true,
        command_builder: Arc::new(|_| Ok(vec!["true".to_string()])),
    }
}

async fn enqueue(store: &Store, task_id: &str, run_id: &str, priority: i64) {
    store
        .create_run(NewRun {
            run_id: run_id.to_string(),
            task_id: task_id.to_string(),
            task_version: "1.0.0".to_string(),
            schema_hash: "hash".to_string(),
            params: serde_json::json!({}),
            workdir: format!("/tmp/{run_id}"),
            priority,
        })
        .await
        .expect("create_run");
}

#[tokio::test]
async fn happy_path_queue_dispatch_finalize() {
    let (store, _dir) = open_store().await;
    store.upsert_task(&task_def("demo", None)).await.unwrap();
    enqueue(&store, "demo", "r-1", 0).await;

    let run = store
        .acquire_lease("worker-1", Duration::seconds(30))
        .await
        .unwrap()
        .expect("a run should be claimable");
    assert_eq!(run.run_id, "r-1");
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.lease_owner.as_deref(), Some("worker-1"));

    // Nothing left in the queue.
    assert!(store.acquire_lease("worker-2", Duration::seconds(30)).await.unwrap().is_none());

    let finalized = store
        .finalize_run("r-1", RunStatus::Succeeded, Some(0), None)
        .await
        .unwrap();
    assert!(finalized);

    let run = store.get_run("r-1").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(run.finished_at.is_some());
    assert!(run.lease_expires_at.is_none());

    // Finalizing an already-terminal run is a no-op.
    let refinalized = store
        .finalize_run("r-1", RunStatus::Failed, Some(1), Some("should not apply"))
        .await
        .unwrap();
    assert!(!refinalized);
}

#[tokio::test]
async fn per_task_concurrency_limit_blocks_dispatch() {
    let (store, _dir) = open_store().await;
    store.upsert_task(&task_def("limited", Some(1))).await.unwrap();
    enqueue(&store, "limited", "r-1", 0).await;
    enqueue(&store, "limited", "r-2", 0).await;

    let first = store.acquire_lease("worker-1", Duration::seconds(30)).await.unwrap();
    assert_eq!(first.unwrap().run_id, "r-1");

    // Second run for the same task is still QUEUED: the limit is saturated.
    let second = store.acquire_lease("worker-2", Duration::seconds(30)).await.unwrap();
    assert!(second.is_none());

    let queued = store
        .list_runs(&RunFilter { task_id: Some("limited".to_string()), status: Some(RunStatus::Queued), limit: 10 })
        .await
        .unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].run_id, "r-2");
}

#[tokio::test]
async fn head_of_line_bypass_when_top_candidate_is_saturated() {
    let (store, _dir) = open_store().await;
    store.upsert_task(&task_def("limited", Some(1))).await.unwrap();
    store.upsert_task(&task_def("open", None)).await.unwrap();

    enqueue(&store, "limited", "r-limited-1", 0).await;
    enqueue(&store, "limited", "r-limited-2", 0).await;
    enqueue(&store, "open", "r-open-1", 0).await;

    // Saturate "limited".
    let claimed1 = store.acquire_lease("worker-1", Duration::seconds(30)).await.unwrap().unwrap();
    assert_eq!(claimed1.run_id, "r-limited-1");

    // The next candidate in FIFO order is r-limited-2, which is blocked by
    // the concurrency limit; the dispatcher must scan past it to r-open-1
    // instead of returning None.
    let claimed2 = store.acquire_lease("worker-2", Duration::seconds(30)).await.unwrap();
    assert_eq!(claimed2.unwrap().run_id, "r-open-1");
}

#[tokio::test]
async fn reaper_reclaims_expired_lease() {
    let (store, _dir) = open_store().await;
    store.upsert_task(&task_def("demo", None)).await.unwrap();
    enqueue(&store, "demo", "r-1", 0).await;

    // Grant a lease that is already expired.
    store.acquire_lease("dead-worker", Duration::seconds(-5)).await.unwrap();

    let expired = store.find_expired_runs(Duration::seconds(0)).await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].run_id, "r-1");

    let finalized = store
        .finalize_run("r-1", RunStatus::Failed, None, Some("Lease expired (Reaped)"))
        .await
        .unwrap();
    assert!(finalized);

    let run = store.get_run("r-1").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("Lease expired (Reaped)"));
}

#[tokio::test]
async fn cancel_request_is_idempotent_and_ignored_once_terminal() {
    let (store, _dir) = open_store().await;
    store.upsert_task(&task_def("demo", None)).await.unwrap();
    enqueue(&store, "demo", "r-1", 0).await;

    store.request_cancel("r-1").await.unwrap();
    assert!(store.poll_cancel("r-1").await.unwrap());

    let first = store.get_run("r-1").await.unwrap().unwrap();
    // Calling again must not disturb the original timestamp.
    store.request_cancel("r-1").await.unwrap();
    let second = store.get_run("r-1").await.unwrap().unwrap();
    assert_eq!(first.cancel_requested_at, second.cancel_requested_at);

    store.finalize_run("r-1", RunStatus::Canceled, None, Some("Canceled by user")).await.unwrap();
    store.request_cancel("r-1").await.unwrap(); // no-op, run is terminal
    let run = store.get_run("r-1").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Canceled);
}

#[tokio::test]
async fn dispatch_sets_deadline_from_task_timeout() {
    let (store, _dir) = open_store().await;
    let mut def = task_def("timed", None);
    def.timeout_seconds = Some(120);
    store.upsert_task(&def).await.unwrap();
    enqueue(&store, "timed", "r-1", 0).await;

    let before = chrono::Utc::now();
    let run = store.acquire_lease("worker-1", Duration::seconds(30)).await.unwrap().unwrap();

    let deadline = run.deadline_at.expect("deadline_at should be set when the task has a timeout");
    assert!(deadline >= before + Duration::seconds(119));
    assert!(deadline <= before + Duration::seconds(121));
}

#[tokio::test]
async fn dispatch_leaves_deadline_unset_without_task_timeout() {
    let (store, _dir) = open_store().await;
    store.upsert_task(&task_def("untimed", None)).await.unwrap();
    enqueue(&store, "untimed", "r-1", 0).await;

    let run = store.acquire_lease("worker-1", Duration::seconds(30)).await.unwrap().unwrap();
    assert!(run.deadline_at.is_none());
}

#[tokio::test]
async fn missing_task_fails_run_at_dispatch_time() {
    let (store, _dir) = open_store().await;
    // No upsert_task call: "ghost" references a task the registry never
    // registered (e.g. removed after being queued).
    enqueue(&store, "ghost", "r-1", 0).await;

    let claimed = store.acquire_lease("worker-1", Duration::seconds(30)).await.unwrap();
    assert!(claimed.is_none());

    let run = store.get_run("r-1").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("Task definition not found"));
}

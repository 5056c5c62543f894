//! Router-level tests driven through `tower::ServiceExt::oneshot`, with no
//! socket bound.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use taskhub_api::{router, AppState};
use taskhub_core::{Config, Registry, Store};

async fn test_state() -> (AppState, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("taskhub.db");
    let url = format!("sqlite://{}", db_path.display());
    let store = Store::open(&url).await.expect("open store");

    let def = taskhub_core::tasks::demo_task();
    store.upsert_task(&def).await.unwrap();
    let registry = Registry::new(vec![def]);

    let mut config = Config::default();
    config.data_root = dir.path().to_string_lossy().into_owned();

    let state = AppState {
        store: Arc::new(store),
        registry: Arc::new(registry),
        config: Arc::new(config),
    };
    (state, dir)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn list_tasks_returns_registered_demo_task() {
    let (state, _dir) = test_state().await;
    let app = router(state);

    let response = app
        .oneshot(Request::builder().uri("/api/tasks").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let tasks = body.as_array().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["task_id"], "demo_v2");
}

#[tokio::test]
async fn create_run_rejects_invalid_params() {
    let (state, _dir) = test_state().await;
    let app = router(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/tasks/demo_v2/runs")
                .header("content-type", "application/json")
                .body(Body::from(json!({"params": {"count": "not a number"}}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn create_run_then_fetch_and_cancel() {
    let (state, _dir) = test_state().await;
    let app = router(state);

    let create_response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/tasks/demo_v2/runs")
                .header("content-type", "application/json")
                .body(Body::from(json!({"params": {"count": 3, "message": "hi"}}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(create_response.status(), StatusCode::OK);
    let created = body_json(create_response).await;
    let run_id = created["run_id"].as_str().unwrap().to_string();
    assert_eq!(created["status"], "QUEUED");

    let get_response = app
        .clone()
        .oneshot(Request::builder().uri(format!("/api/runs/{run_id}")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(get_response.status(), StatusCode::OK);

    let cancel_response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/runs/{run_id}/cancel"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(cancel_response.status(), StatusCode::OK);

    let missing_response = app
        .oneshot(Request::builder().uri("/api/runs/r-does-not-exist").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(missing_response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cron_create_list_delete_round_trip() {
    let (state, _dir) = test_state().await;
    let app = router(state);

    let create_response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/cron")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "task_id": "demo_v2",
                        "name": "every minute",
                        "cron_expression": "*/5 * * * *",
                        "params": {}
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(create_response.status(), StatusCode::OK);
    let created = body_json(create_response).await;
    let cron_id = created["cron_id"].as_str().unwrap().to_string();

    let list_response = app
        .clone()
        .oneshot(Request::builder().uri("/api/cron").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let list = body_json(list_response).await;
    assert_eq!(list.as_array().unwrap().len(), 1);

    let delete_response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/cron/{cron_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(delete_response.status(), StatusCode::OK);
}

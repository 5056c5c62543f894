//! HTTP surface for TaskHub's control plane: tasks, runs, cron jobs.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use taskhub_core::{Config, NewRun, Registry, RunFilter, RunStatus, Store};

use crate::dto::*;
use crate::error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub registry: Arc<Registry>,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/:task_id/runs", post(create_run))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/:run_id", get(get_run))
        .route("/api/runs/:run_id/cancel", post(cancel_run))
        .route("/api/runs/:run_id/events", get(get_run_events))
        .route("/api/runs/:run_id/artifacts", get(get_run_artifacts))
        .route("/api/runs/:run_id/files/:file_id", get(download_file))
        .route("/api/cron", get(list_cron).post(create_cron))
        .route(
            "/api/cron/:cron_id",
            get(get_cron).patch(update_cron).delete(delete_cron),
        )
        .with_state(state)
}

async fn list_tasks(State(state): State<AppState>) -> Result<Json<Vec<TaskRead>>, ApiError> {
    let tasks = state.store.list_tasks().await?;
    Ok(Json(tasks.into_iter().map(TaskRead::from).collect()))
}

async fn create_run(
    State(state): State<AppState>,
    AxumPath(task_id): AxumPath<String>,
    Json(req): Json<RunCreate>,
) -> Result<Json<RunRead>, ApiError> {
    let task = state
        .store
        .get_task(&task_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("task {task_id} not found")))?;

    let def = state
        .registry
        .get(&task_id)
        .ok_or_else(|| ApiError::NotFound(format!("task definition {task_id} missing")))?;

    let params = def.validate(&req.params)?;

    let run_id = format!("r-{}", &Uuid::new_v4().simple().to_string()[..8]);
    let workdir = state.config.run_workdir(&run_id);

    let run = state
        .store
        .create_run(NewRun {
            run_id,
            task_id: task.task_id,
            task_version: task.version,
            schema_hash: task.schema_hash,
            params,
            workdir: workdir.to_string_lossy().into_owned(),
            priority: 0,
        })
        .await?;

    Ok(Json(run.into()))
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<RunRead>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .and_then(|s| RunStatus::from_db_str(&s.to_uppercase()));

    let filter = RunFilter {
        task_id: query.task_id,
        status,
        limit: query.limit.unwrap_or(50),
    };
    let runs = state.store.list_runs(&filter).await?;
    Ok(Json(runs.into_iter().map(RunRead::from).collect()))
}

async fn get_run(State(state): State<AppState>, AxumPath(run_id): AxumPath<String>) -> Result<Json<RunRead>, ApiError> {
    let run = state
        .store
        .get_run(&run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("run {run_id} not found")))?;
    Ok(Json(run.into()))
}

async fn cancel_run(State(state): State<AppState>, AxumPath(run_id): AxumPath<String>) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.request_cancel(&run_id).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

/// Tolerant of a partial last line while the Executor's drain task is
/// still appending.
async fn get_run_events(
    State(state): State<AppState>,
    AxumPath(run_id): AxumPath<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventList>, ApiError> {
    let run = state
        .store
        .get_run(&run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("run {run_id} not found")))?;

    let events_path = PathBuf::from(&run.workdir).join("events.jsonl");
    let mut items = Vec::new();
    let mut max_seq = query.cursor;

    if let Ok(contents) = tokio::fs::read_to_string(&events_path).await {
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(event) = serde_json::from_str::<EventRead>(line) else {
                continue; // malformed or partial trailing line; skip
            };
            if event.seq > query.cursor {
                max_seq = max_seq.max(event.seq);
                items.push(event);
            }
        }
    }

    Ok(Json(EventList { items, next_cursor: max_seq }))
}

async fn get_run_artifacts(
    State(state): State<AppState>,
    AxumPath(run_id): AxumPath<String>,
) -> Result<Json<ArtifactsRead>, ApiError> {
    let run = state
        .store
        .get_run(&run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("run {run_id} not found")))?;

    let artifacts_path = PathBuf::from(&run.workdir).join("artifacts.json");
    let parsed = match tokio::fs::read_to_string(&artifacts_path).await {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or(ArtifactsRead {
            run_id: run.run_id.clone(),
            items: Vec::new(),
        }),
        Err(_) => ArtifactsRead { run_id: run.run_id.clone(), items: Vec::new() },
    };

    Ok(Json(parsed))
}

async fn download_file(
    State(state): State<AppState>,
    AxumPath((run_id, file_id)): AxumPath<(String, String)>,
) -> Result<Vec<u8>, ApiError> {
    let run = state
        .store
        .get_run(&run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("run {run_id} not found")))?;

    let workdir = PathBuf::from(&run.workdir);
    let artifacts_path = workdir.join("artifacts.json");
    let contents = tokio::fs::read_to_string(&artifacts_path)
        .await
        .map_err(|_| ApiError::NotFound("no artifacts for run".to_string()))?;
    let index: ArtifactsRead = serde_json::from_str(&contents)
        .map_err(|e| ApiError::Other(anyhow::anyhow!("corrupt artifacts.json: {e}")))?;

    let item = index
        .items
        .into_iter()
        .find(|i| i.file_id.as_deref() == Some(file_id.as_str()))
        .ok_or_else(|| ApiError::NotFound(format!("unknown file_id {file_id}")))?;

    let rel_path = item.path.ok_or_else(|| ApiError::NotFound("artifact has no path".to_string()))?;
    let candidate = workdir.join(&rel_path);

    let workdir_canon = tokio::fs::canonicalize(&workdir)
        .await
        .map_err(|e| ApiError::Other(anyhow::anyhow!("workdir missing: {e}")))?;
    let candidate_canon = tokio::fs::canonicalize(&candidate)
        .await
        .map_err(|_| ApiError::NotFound("artifact file missing".to_string()))?;

    if !candidate_canon.starts_with(&workdir_canon) {
        return Err(ApiError::Forbidden("path escapes run workdir".to_string()));
    }

    let mut file = tokio::fs::File::open(&candidate_canon)
        .await
        .map_err(|_| ApiError::NotFound("artifact file missing".to_string()))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .await
        .map_err(|e| ApiError::Other(anyhow::anyhow!("read failed: {e}")))?;
    Ok(buf)
}

async fn list_cron(State(state): State<AppState>) -> Result<Json<Vec<CronRead>>, ApiError> {
    let jobs = state.store.list_cron_jobs().await?;
    Ok(Json(jobs.into_iter().map(CronRead::from).collect()))
}

async fn get_cron(State(state): State<AppState>, AxumPath(cron_id): AxumPath<String>) -> Result<Json<CronRead>, ApiError> {
    let job = state
        .store
        .get_cron_job(&cron_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("cron {cron_id} not found")))?;
    Ok(Json(job.into()))
}

async fn create_cron(State(state): State<AppState>, Json(req): Json<CronCreate>) -> Result<Json<CronRead>, ApiError> {
    let schedule = taskhub_core::parse_cron_schedule(&req.cron_expression)
        .map_err(|e| ApiError::Validation(taskhub_core::ValidationError::BadCronExpression(e.to_string())))?;
    let now = Utc::now();
    let next_run_at = schedule
        .after(&now)
        .next()
        .ok_or_else(|| ApiError::Validation(taskhub_core::ValidationError::BadCronExpression("no future occurrence".to_string())))?;

    let cron_id = format!("cron-{}", &Uuid::new_v4().simple().to_string()[..8]);
    let job = taskhub_core::CronJob {
        cron_id,
        task_id: req.task_id,
        name: req.name,
        cron_expression: req.cron_expression,
        params: req.params,
        is_enabled: req.is_enabled,
        last_run_at: None,
        next_run_at,
    };
    state.store.create_cron_job(&job).await?;
    Ok(Json(job.into()))
}

async fn update_cron(
    State(state): State<AppState>,
    AxumPath(cron_id): AxumPath<String>,
    Json(req): Json<CronUpdate>,
) -> Result<Json<CronRead>, ApiError> {
    let updated = state.store.set_cron_enabled(&cron_id, req.is_enabled).await?;
    if !updated {
        return Err(ApiError::NotFound(format!("cron {cron_id} not found")));
    }
    let job = state.store.get_cron_job(&cron_id).await?.expect("just updated");
    Ok(Json(job.into()))
}

async fn delete_cron(State(state): State<AppState>, AxumPath(cron_id): AxumPath<String>) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state.store.delete_cron_job(&cron_id).await?;
    if !deleted {
        return Err(ApiError::NotFound(format!("cron {cron_id} not found")));
    }
    Ok(Json(serde_json::json!({"ok": true})))
}

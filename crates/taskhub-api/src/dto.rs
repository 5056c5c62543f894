//! Request/response shapes for the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskhub_core::{Run, RunStatus, Task};

#[derive(Debug, Serialize)]
pub struct TaskRead {
    pub task_id: String,
    pub name: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub version: String,
    pub concurrency_limit: Option<i64>,
    pub timeout_seconds: Option<i64>,
    pub is_enabled: bool,
    pub params_schema: serde_json::Value,
}

impl From<Task> for TaskRead {
    fn from(t: Task) -> Self {
        TaskRead {
            task_id: t.task_id,
            name: t.name,
            description: t.description,
            tags: t.tags,
            version: t.version,
            concurrency_limit: t.concurrency_limit,
            timeout_seconds: t.timeout_seconds,
            is_enabled: t.is_enabled,
            params_schema: t.params_schema,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RunCreate {
    #[serde(default = "default_params")]
    pub params: serde_json::Value,
}

fn default_params() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Debug, Serialize)]
pub struct RunRead {
    pub run_id: String,
    pub task_id: String,
    pub task_version: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub params: serde_json::Value,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    pub lease_owner: Option<String>,
    pub duration_seconds: Option<i64>,
}

impl From<Run> for RunRead {
    fn from(r: Run) -> Self {
        let duration_seconds = r.duration().map(|d| d.num_seconds());
        RunRead {
            run_id: r.run_id,
            task_id: r.task_id,
            task_version: r.task_version,
            status: r.status,
            created_at: r.created_at,
            started_at: r.started_at,
            finished_at: r.finished_at,
            deadline_at: r.deadline_at,
            params: r.params,
            exit_code: r.exit_code,
            error: r.error,
            lease_owner: r.lease_owner,
            duration_seconds,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    pub task_id: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub cursor: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventRead {
    pub seq: i64,
    pub ts: DateTime<Utc>,
    pub run_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct EventList {
    pub items: Vec<EventRead>,
    pub next_cursor: i64,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ArtifactItem {
    pub artifact_id: String,
    pub kind: String,
    pub title: String,
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ArtifactsRead {
    pub run_id: String,
    #[serde(default)]
    pub items: Vec<ArtifactItem>,
}

#[derive(Debug, Deserialize)]
pub struct CronCreate {
    pub task_id: String,
    pub name: String,
    pub cron_expression: String,
    #[serde(default = "default_params")]
    pub params: serde_json::Value,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct CronUpdate {
    pub is_enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct CronRead {
    pub cron_id: String,
    pub task_id: String,
    pub name: String,
    pub cron_expression: String,
    pub params: serde_json::Value,
    pub is_enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
}

impl From<taskhub_core::CronJob> for CronRead {
    fn from(c: taskhub_core::CronJob) -> Self {
        CronRead {
            cron_id: c.cron_id,
            task_id: c.task_id,
            name: c.name,
            cron_expression: c.cron_expression,
            params: c.params,
            is_enabled: c.is_enabled,
            last_run_at: c.last_run_at,
            next_run_at: c.next_run_at,
        }
    }
}

//! Core entities: Task, Run, QueueEntry, WorkerHeartbeat, CronJob.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

/// Lifecycle state of a [`Run`]. QUEUED is the only non-terminal state
/// besides RUNNING; SUCCEEDED/FAILED/CANCELED are terminal and immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled)
    }

    pub fn as_db_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "QUEUED",
            RunStatus::Running => "RUNNING",
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Failed => "FAILED",
            RunStatus::Canceled => "CANCELED",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "QUEUED" => RunStatus::Queued,
            "RUNNING" => RunStatus::Running,
            "SUCCEEDED" => RunStatus::Succeeded,
            "FAILED" => RunStatus::Failed,
            "CANCELED" => RunStatus::Canceled,
            _ => return None,
        })
    }
}

/// Worker-reported status, distinct from Run status. Observability only;
/// never authoritative for scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkerStatus {
    Idle,
    Busy,
}

impl WorkerStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            WorkerStatus::Idle => "IDLE",
            WorkerStatus::Busy => "BUSY",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "IDLE" => WorkerStatus::Idle,
            "BUSY" => WorkerStatus::Busy,
            _ => return None,
        })
    }
}

/// Immutable-ish task definition, refreshed on boot by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub name: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub version: String,
    pub params_schema: serde_json::Value,
    pub schema_hash: String,
    pub concurrency_limit: Option<i64>,
    pub timeout_seconds: Option<i64>,
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FromRow<'_, SqliteRow> for Task {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let tags_json: String = row.try_get("tags")?;
        let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
        let schema_json: String = row.try_get("params_schema")?;
        let params_schema = serde_json::from_str(&schema_json).unwrap_or(serde_json::Value::Null);
        Ok(Task {
            task_id: row.try_get("task_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            tags,
            version: row.try_get("version")?,
            params_schema,
            schema_hash: row.try_get("schema_hash")?,
            concurrency_limit: row.try_get("concurrency_limit")?,
            timeout_seconds: row.try_get("timeout_seconds")?,
            is_enabled: row.try_get::<i64, _>("is_enabled")? != 0,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// One execution attempt of a [`Task`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub task_id: String,
    pub task_version: String,
    pub schema_hash: String,
    pub status: RunStatus,
    pub params: serde_json::Value,
    pub workdir: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub worker_pid: Option<i64>,
}

impl Run {
    /// Wall-clock duration for a Run that has started, if known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        let started = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some(end - started)
    }
}

impl FromRow<'_, SqliteRow> for Run {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let params_json: String = row.try_get("params")?;
        let params = serde_json::from_str(&params_json).unwrap_or(serde_json::Value::Null);
        let status_str: String = row.try_get("status")?;
        let status = RunStatus::from_db_str(&status_str)
            .ok_or_else(|| sqlx::Error::Decode(format!("unknown run status {status_str}").into()))?;
        Ok(Run {
            run_id: row.try_get("run_id")?,
            task_id: row.try_get("task_id")?,
            task_version: row.try_get("task_version")?,
            schema_hash: row.try_get("schema_hash")?,
            status,
            params,
            workdir: row.try_get("workdir")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            deadline_at: row.try_get("deadline_at")?,
            exit_code: row.try_get("exit_code")?,
            error: row.try_get("error")?,
            cancel_requested_at: row.try_get("cancel_requested_at")?,
            lease_owner: row.try_get("lease_owner")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            worker_pid: row.try_get("worker_pid")?,
        })
    }
}

/// Presence indicator that a Run is dispatchable. Exists iff the Run's
/// status is QUEUED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub run_id: String,
    pub priority: i64,
    pub enqueued_at: DateTime<Utc>,
}

/// Observability-only record of a worker's presence and current activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub hostname: String,
    pub pid: i64,
    pub status: WorkerStatus,
    pub current_run_id: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
}

impl FromRow<'_, SqliteRow> for WorkerHeartbeat {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let status_str: String = row.try_get("status")?;
        let status = WorkerStatus::from_db_str(&status_str)
            .ok_or_else(|| sqlx::Error::Decode(format!("unknown worker status {status_str}").into()))?;
        Ok(WorkerHeartbeat {
            worker_id: row.try_get("worker_id")?,
            hostname: row.try_get("hostname")?,
            pid: row.try_get("pid")?,
            status,
            current_run_id: row.try_get("current_run_id")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
        })
    }
}

/// A cron-triggered recurring Task invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub cron_id: String,
    pub task_id: String,
    pub name: String,
    pub cron_expression: String,
    pub params: serde_json::Value,
    pub is_enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
}

impl FromRow<'_, SqliteRow> for CronJob {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let params_json: String = row.try_get("params")?;
        let params = serde_json::from_str(&params_json).unwrap_or(serde_json::Value::Null);
        Ok(CronJob {
            cron_id: row.try_get("cron_id")?,
            task_id: row.try_get("task_id")?,
            name: row.try_get("name")?,
            cron_expression: row.try_get("cron_expression")?,
            params,
            is_enabled: row.try_get::<i64, _>("is_enabled")? != 0,
            last_run_at: row.try_get("last_run_at")?,
            next_run_at: row.try_get("next_run_at")?,
        })
    }
}

//! Durable state over SQLite. Every mutation is one short transaction;
//! callers never see raw SQL — this module is the only place run-state
//! invariants are enforced.

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::error::StoreError;
use crate::model::{CronJob, Run, RunStatus, Task, WorkerHeartbeat, WorkerStatus};
use crate::registry::TaskDefinition;

/// Number of candidate queue entries the Dispatcher scans per lease
/// acquisition attempt. Scanning more than one candidate avoids
/// head-of-line blocking when a saturated task sits atop the queue.
const DISPATCH_CANDIDATE_LIMIT: i64 = 10;

/// Input for [`Store::create_run`]: everything the caller decides, before
/// the Store assigns timestamps.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub run_id: String,
    pub task_id: String,
    pub task_version: String,
    pub schema_hash: String,
    pub params: serde_json::Value,
    pub workdir: String,
    pub priority: i64,
}

/// Optional filters for [`Store::list_runs`].
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub task_id: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: i64,
}

fn now_str(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if absent) a SQLite database at `path`, enables WAL +
    /// NORMAL synchronous mode, and runs embedded migrations.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Store { pool })
    }

    /// Constructs a Store from an already-open pool. Used by tests that
    /// need a shared in-process database across multiple Store handles.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Store { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---------------------------------------------------------------
    // Tasks
    // ---------------------------------------------------------------

    /// Idempotent task definition refresh, called once per definition on
    /// every boot.
    pub async fn upsert_task(&self, def: &TaskDefinition) -> Result<(), StoreError> {
        let now = now_str(Utc::now());
        let tags = serde_json::to_string(&def.tags).unwrap_or_else(|_| "[]".to_string());
        let schema = serde_json::to_string(&def.params_schema).unwrap_or_else(|_| "{}".to_string());
        let hash = crate::registry::schema_hash(&def.params_schema);

        sqlx::query(
            r#"
            INSERT INTO tasks (task_id, name, description, tags, params_schema, schema_hash,
                                version, concurrency_limit, timeout_seconds, is_enabled,
                                created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(task_id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                tags = excluded.tags,
                params_schema = excluded.params_schema,
                schema_hash = excluded.schema_hash,
                version = excluded.version,
                concurrency_limit = excluded.concurrency_limit,
                timeout_seconds = excluded.timeout_seconds,
                is_enabled = excluded.is_enabled,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&def.task_id)
        .bind(&def.name)
        .bind(&def.description)
        .bind(tags)
        .bind(schema)
        .bind(hash)
        .bind(&def.version)
        .bind(def.concurrency_limit)
        .bind(def.timeout_seconds)
        .bind(def.is_enabled as i64)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(task)
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let tasks = sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY task_id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(tasks)
    }

    // ---------------------------------------------------------------
    // Runs & queue
    // ---------------------------------------------------------------

    /// Atomically inserts a Run (QUEUED) and its QueueEntry.
    pub async fn create_run(&self, run: NewRun) -> Result<Run, StoreError> {
        let now = Utc::now();
        let now_s = now_str(now);
        let params = serde_json::to_string(&run.params).unwrap_or_else(|_| "{}".to_string());

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO runs (run_id, task_id, task_version, schema_hash, status, params,
                               workdir, created_at)
            VALUES (?, ?, ?, ?, 'QUEUED', ?, ?, ?)
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.task_id)
        .bind(&run.task_version)
        .bind(&run.schema_hash)
        .bind(&params)
        .bind(&run.workdir)
        .bind(&now_s)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO run_queue (run_id, priority, enqueued_at) VALUES (?, ?, ?)")
            .bind(&run.run_id)
            .bind(run.priority)
            .bind(&now_s)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        self.get_run(&run.run_id)
            .await?
            .ok_or_else(|| StoreError::Sqlx(sqlx::Error::RowNotFound))
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        let run = sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(run)
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, StoreError> {
        let mut sql = String::from("SELECT * FROM runs WHERE 1=1");
        if filter.task_id.is_some() {
            sql.push_str(" AND task_id = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?");

        let mut query = sqlx::query_as::<_, Run>(&sql);
        if let Some(task_id) = &filter.task_id {
            query = query.bind(task_id);
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_db_str());
        }
        let limit = if filter.limit > 0 { filter.limit } else { 50 };
        query = query.bind(limit);

        let runs = query.fetch_all(&self.pool).await?;
        Ok(runs)
    }

    /// Dispatcher: claims the next eligible QUEUED run for `worker_id`,
    /// enforcing per-task concurrency without head-of-line blocking. Scans
    /// up to [`DISPATCH_CANDIDATE_LIMIT`] candidates inside one transaction.
    pub async fn acquire_lease(
        &self,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<Run>, StoreError> {
        let now = Utc::now();
        let lease_expiry = now + lease_duration;

        let mut tx = self.pool.begin().await?;

        let candidates: Vec<String> = sqlx::query(
            "SELECT run_id FROM run_queue ORDER BY priority DESC, enqueued_at ASC LIMIT ?",
        )
        .bind(DISPATCH_CANDIDATE_LIMIT)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|row| row.get::<String, _>("run_id"))
        .collect();

        let mut claimed: Option<String> = None;

        for run_id in candidates {
            let run = sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE run_id = ?")
                .bind(&run_id)
                .fetch_optional(&mut *tx)
                .await?;

            let Some(run) = run else {
                sqlx::query("DELETE FROM run_queue WHERE run_id = ?")
                    .bind(&run_id)
                    .execute(&mut *tx)
                    .await?;
                continue;
            };

            let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE task_id = ?")
                .bind(&run.task_id)
                .fetch_optional(&mut *tx)
                .await?;

            let Some(task) = task else {
                sqlx::query(
                    "UPDATE runs SET status = 'FAILED', error = ?, finished_at = ?, lease_expires_at = NULL WHERE run_id = ?",
                )
                .bind("Task definition not found")
                .bind(now_str(now))
                .bind(&run_id)
                .execute(&mut *tx)
                .await?;
                sqlx::query("DELETE FROM run_queue WHERE run_id = ?")
                    .bind(&run_id)
                    .execute(&mut *tx)
                    .await?;
                continue;
            };

            if let Some(limit) = task.concurrency_limit {
                let running: i64 = sqlx::query(
                    "SELECT COUNT(*) AS c FROM runs WHERE task_id = ? AND status = 'RUNNING' AND lease_expires_at > ?",
                )
                .bind(&task.task_id)
                .bind(now_str(now))
                .fetch_one(&mut *tx)
                .await?
                .get("c");

                if running >= limit {
                    continue;
                }
            }

            let deleted = sqlx::query("DELETE FROM run_queue WHERE run_id = ?")
                .bind(&run_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();

            if deleted == 0 {
                // Lost to a concurrent dispatcher between select and delete.
                continue;
            }

            let deadline_at = task.timeout_seconds.map(|secs| now_str(now + Duration::seconds(secs)));

            sqlx::query(
                r#"
                UPDATE runs
                SET status = 'RUNNING', started_at = ?, lease_owner = ?, lease_expires_at = ?, deadline_at = ?
                WHERE run_id = ?
                "#,
            )
            .bind(now_str(now))
            .bind(worker_id)
            .bind(now_str(lease_expiry))
            .bind(deadline_at)
            .bind(&run_id)
            .execute(&mut *tx)
            .await?;

            claimed = Some(run_id);
            break;
        }

        tx.commit().await?;

        match claimed {
            Some(run_id) => self.get_run(&run_id).await,
            None => Ok(None),
        }
    }

    /// Extends the lease only if the Run is RUNNING and still owned by
    /// `worker_id`. Returns whether the update affected a row.
    pub async fn extend_lease(
        &self,
        run_id: &str,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<bool, StoreError> {
        let new_expiry = Utc::now() + lease_duration;
        let result = sqlx::query(
            r#"
            UPDATE runs SET lease_expires_at = ?
            WHERE run_id = ? AND lease_owner = ? AND status = 'RUNNING'
            "#,
        )
        .bind(now_str(new_expiry))
        .bind(run_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Stores the process-group id. Called immediately after spawn.
    pub async fn record_pid(&self, run_id: &str, pid: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE runs SET worker_pid = ? WHERE run_id = ?")
            .bind(pid)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn poll_cancel(&self, run_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT cancel_requested_at FROM runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .and_then(|r| r.try_get::<Option<String>, _>("cancel_requested_at").ok().flatten())
            .is_some())
    }

    /// Idempotent; has no effect on terminal Runs.
    pub async fn request_cancel(&self, run_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE runs SET cancel_requested_at = ?
            WHERE run_id = ? AND status IN ('QUEUED', 'RUNNING') AND cancel_requested_at IS NULL
            "#,
        )
        .bind(now_str(Utc::now()))
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Sets status, finished_at, clears lease_expires_at. No-op (returns
    /// false) if the Run is already terminal — first writer wins.
    pub async fn finalize_run(
        &self,
        run_id: &str,
        status: RunStatus,
        exit_code: Option<i64>,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = ?, finished_at = ?, lease_expires_at = NULL,
                exit_code = COALESCE(?, exit_code), error = COALESCE(?, error)
            WHERE run_id = ? AND status NOT IN ('SUCCEEDED', 'FAILED', 'CANCELED')
            "#,
        )
        .bind(status.as_db_str())
        .bind(now_str(Utc::now()))
        .bind(exit_code)
        .bind(error)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Runs with status RUNNING and `lease_expires_at < now - grace`.
    pub async fn find_expired_runs(&self, grace: Duration) -> Result<Vec<Run>, StoreError> {
        let threshold = Utc::now() - grace;
        let runs = sqlx::query_as::<_, Run>(
            "SELECT * FROM runs WHERE status = 'RUNNING' AND lease_expires_at < ?",
        )
        .bind(now_str(threshold))
        .fetch_all(&self.pool)
        .await?;
        Ok(runs)
    }

    // ---------------------------------------------------------------
    // Cron
    // ---------------------------------------------------------------

    pub async fn list_cron_jobs(&self) -> Result<Vec<CronJob>, StoreError> {
        let jobs = sqlx::query_as::<_, CronJob>("SELECT * FROM cron_jobs ORDER BY cron_id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    pub async fn get_cron_job(&self, cron_id: &str) -> Result<Option<CronJob>, StoreError> {
        let job = sqlx::query_as::<_, CronJob>("SELECT * FROM cron_jobs WHERE cron_id = ?")
            .bind(cron_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    pub async fn create_cron_job(&self, job: &CronJob) -> Result<(), StoreError> {
        let params = serde_json::to_string(&job.params).unwrap_or_else(|_| "{}".to_string());
        sqlx::query(
            r#"
            INSERT INTO cron_jobs (cron_id, task_id, name, cron_expression, params, is_enabled,
                                    last_run_at, next_run_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.cron_id)
        .bind(&job.task_id)
        .bind(&job.name)
        .bind(&job.cron_expression)
        .bind(params)
        .bind(job.is_enabled as i64)
        .bind(job.last_run_at.map(now_str))
        .bind(now_str(job.next_run_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_cron_job(&self, cron_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM cron_jobs WHERE cron_id = ?")
            .bind(cron_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_cron_enabled(&self, cron_id: &str, enabled: bool) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE cron_jobs SET is_enabled = ? WHERE cron_id = ?")
            .bind(enabled as i64)
            .bind(cron_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// CronJobs due to fire: enabled and `next_run_at <= now`.
    pub async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<CronJob>, StoreError> {
        let jobs = sqlx::query_as::<_, CronJob>(
            "SELECT * FROM cron_jobs WHERE is_enabled = 1 AND next_run_at <= ?",
        )
        .bind(now_str(now))
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    pub async fn advance(
        &self,
        cron_id: &str,
        last_run: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE cron_jobs SET last_run_at = ?, next_run_at = ? WHERE cron_id = ?")
            .bind(now_str(last_run))
            .bind(now_str(next_run))
            .bind(cron_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Worker registry
    // ---------------------------------------------------------------

    pub async fn register_worker(&self, worker_id: &str, hostname: &str, pid: i64) -> Result<(), StoreError> {
        let now = now_str(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO worker_heartbeats (worker_id, hostname, pid, status, current_run_id, last_heartbeat)
            VALUES (?, ?, ?, 'IDLE', NULL, ?)
            ON CONFLICT(worker_id) DO UPDATE SET
                hostname = excluded.hostname,
                pid = excluded.pid,
                status = 'IDLE',
                current_run_id = NULL,
                last_heartbeat = excluded.last_heartbeat
            "#,
        )
        .bind(worker_id)
        .bind(hostname)
        .bind(pid)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn heartbeat(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        current_run_id: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE worker_heartbeats SET status = ?, current_run_id = ?, last_heartbeat = ? WHERE worker_id = ?",
        )
        .bind(status.as_db_str())
        .bind(current_run_id)
        .bind(now_str(Utc::now()))
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_active(&self, timeout: Duration) -> Result<Vec<WorkerHeartbeat>, StoreError> {
        let threshold = Utc::now() - timeout;
        let workers = sqlx::query_as::<_, WorkerHeartbeat>(
            "SELECT * FROM worker_heartbeats WHERE last_heartbeat > ? ORDER BY worker_id ASC",
        )
        .bind(now_str(threshold))
        .fetch_all(&self.pool)
        .await?;
        Ok(workers)
    }

    pub async fn prune(&self, timeout: Duration) -> Result<u64, StoreError> {
        let threshold = Utc::now() - timeout;
        let result = sqlx::query("DELETE FROM worker_heartbeats WHERE last_heartbeat < ?")
            .bind(now_str(threshold))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

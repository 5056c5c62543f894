//! Cron scheduler: materializes due CronJobs into queued Runs.
//!
//! Catch-up policy: at most one Run per due CronJob per tick — missed
//! windows are skipped, not backfilled.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::store::{NewRun, Store};

/// Parses a cron expression, accepting both the standard 5-field POSIX form
/// (minute hour day-of-month month day-of-week) and the 6-field form the
/// `cron` crate natively expects (with a leading seconds field). A 5-field
/// expression gets `"0 "` prepended so it runs once per matched minute.
pub fn parse_cron_schedule(expr: &str) -> Result<Schedule, cron::error::Error> {
    let field_count = expr.split_whitespace().count();
    if field_count == 5 {
        Schedule::from_str(&format!("0 {expr}"))
    } else {
        Schedule::from_str(expr)
    }
}

pub struct CronScheduler {
    store: Arc<Store>,
    tick_interval: StdDuration,
    runs_dir: PathBuf,
}

impl CronScheduler {
    pub fn new(store: Arc<Store>, tick_interval: StdDuration, runs_dir: PathBuf) -> Self {
        CronScheduler { store, tick_interval, runs_dir }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!("cron scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.tick_interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
            }
        }
        info!("cron scheduler stopped");
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let due = self.store.list_due(now).await?;

        for job in due {
            let schedule = match parse_cron_schedule(&job.cron_expression) {
                Ok(s) => s,
                Err(e) => {
                    error!(cron_id = %job.cron_id, expr = %job.cron_expression, error = %e, "invalid cron expression, skipping");
                    continue;
                }
            };

            let next_fire = match schedule.after(&now).next() {
                Some(t) => t,
                None => {
                    warn!(cron_id = %job.cron_id, "cron expression has no future occurrence");
                    continue;
                }
            };

            let task = match self.store.get_task(&job.task_id).await? {
                Some(t) => t,
                None => {
                    warn!(cron_id = %job.cron_id, task_id = %job.task_id, "referenced task missing, advancing without enqueue");
                    self.store.advance(&job.cron_id, now, next_fire).await?;
                    continue;
                }
            };

            if !task.is_enabled {
                info!(cron_id = %job.cron_id, task_id = %job.task_id, "task disabled, advancing without enqueue");
                self.store.advance(&job.cron_id, now, next_fire).await?;
                continue;
            }

            let run_id = format!("r-cron-{}", &Uuid::new_v4().simple().to_string()[..8]);
            let workdir = self.runs_dir.join(&run_id);
            let new_run = NewRun {
                run_id: run_id.clone(),
                task_id: task.task_id.clone(),
                task_version: task.version.clone(),
                schema_hash: task.schema_hash.clone(),
                params: job.params.clone(),
                workdir: workdir.to_string_lossy().into_owned(),
                priority: 0,
            };

            self.store.create_run(new_run).await?;
            info!(cron_id = %job.cron_id, name = %job.name, run_id = %run_id, "cron fired");

            self.store.advance(&job.cron_id, now, next_fire).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TaskDefinition;
    use std::sync::Arc as StdArc;

    async fn open_store() -> (Arc<Store>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("taskhub.db");
        let url = format!("sqlite://{}", db_path.display());
        let store = Store::open(&url).await.expect("open store");
        (Arc::new(store), dir)
    }

    fn task_def(task_id: &str) -> TaskDefinition {
        TaskDefinition {
            task_id: task_id.to_string(),
            name: task_id.to_string(),
            description: "cron test task".to_string(),
            tags: vec![],
            version: "1.0.0".to_string(),
            params_schema: serde_json::json!({"type": "object"}),
            concurrency_limit: None,
            timeout_seconds: None,
            is_enabled: true,
            command_builder: StdArc::new(|_| Ok(vec!["true".to_string()])),
        }
    }

    #[tokio::test]
    async fn due_cron_job_fires_exactly_one_run_and_advances() {
        let (store, dir) = open_store().await;
        store.upsert_task(&task_def("cron_task")).await.unwrap();

        let now = Utc::now();
        let job = crate::model::CronJob {
            cron_id: "cron-1".to_string(),
            task_id: "cron_task".to_string(),
            name: "every minute".to_string(),
            cron_expression: "*/1 * * * *".to_string(),
            params: serde_json::json!({}),
            is_enabled: true,
            last_run_at: None,
            next_run_at: now - chrono::Duration::seconds(1),
        };
        store.create_cron_job(&job).await.unwrap();

        let scheduler = CronScheduler::new(Arc::clone(&store), StdDuration::from_secs(1), dir.path().to_path_buf());
        scheduler.tick().await.unwrap();

        let runs = store.list_runs(&crate::store::RunFilter::default()).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].run_id.starts_with("r-cron-"));

        let refreshed = store.get_cron_job("cron-1").await.unwrap().unwrap();
        assert!(refreshed.last_run_at.is_some());
        assert!(refreshed.next_run_at > now);

        // A second tick immediately after must not fire again: the coalesce
        // policy advances past missed windows instead of backfilling them.
        scheduler.tick().await.unwrap();
        let runs_after = store.list_runs(&crate::store::RunFilter::default()).await.unwrap();
        assert_eq!(runs_after.len(), 1);
    }

    #[tokio::test]
    async fn disabled_task_advances_without_enqueueing() {
        let (store, dir) = open_store().await;
        let mut def = task_def("disabled_task");
        def.is_enabled = false;
        store.upsert_task(&def).await.unwrap();

        let now = Utc::now();
        let job = crate::model::CronJob {
            cron_id: "cron-2".to_string(),
            task_id: "disabled_task".to_string(),
            name: "disabled".to_string(),
            cron_expression: "*/1 * * * *".to_string(),
            params: serde_json::json!({}),
            is_enabled: true,
            last_run_at: None,
            next_run_at: now - chrono::Duration::seconds(1),
        };
        store.create_cron_job(&job).await.unwrap();

        let scheduler = CronScheduler::new(Arc::clone(&store), StdDuration::from_secs(1), dir.path().to_path_buf());
        scheduler.tick().await.unwrap();

        let runs = store.list_runs(&crate::store::RunFilter::default()).await.unwrap();
        assert!(runs.is_empty());

        let refreshed = store.get_cron_job("cron-2").await.unwrap().unwrap();
        assert!(refreshed.next_run_at > now);
    }

    #[test]
    fn parse_cron_schedule_accepts_5_and_6_field_expressions() {
        assert!(parse_cron_schedule("*/5 * * * *").is_ok());
        assert!(parse_cron_schedule("0 */5 * * * *").is_ok());
        assert!(parse_cron_schedule("not a cron expression").is_err());
    }
}

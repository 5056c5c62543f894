//! Worker main loop: acquire a lease, hand it to the Executor, report
//! status.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::executor::Executor;
use crate::model::WorkerStatus;
use crate::registry::Registry;
use crate::store::Store;

pub struct Worker {
    store: Arc<Store>,
    executor: Executor,
    worker_id: String,
    hostname: String,
    lease_duration: StdDuration,
    idle_backoff: StdDuration,
    status_interval: StdDuration,
    busy: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<Registry>,
        worker_id: String,
        hostname: String,
        lease_seconds: u64,
        idle_backoff: StdDuration,
        status_interval: StdDuration,
    ) -> Self {
        let executor = Executor::new(Arc::clone(&store), registry);
        Worker {
            store,
            executor,
            worker_id,
            hostname,
            lease_duration: StdDuration::from_secs(lease_seconds),
            idle_backoff,
            status_interval,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(worker_id = %self.worker_id, "worker started");
        self.store
            .register_worker(&self.worker_id, &self.hostname, std::process::id() as i64)
            .await?;

        let status_loop = {
            let store = Arc::clone(&self.store);
            let worker_id = self.worker_id.clone();
            let busy = Arc::clone(&self.busy);
            let interval = self.status_interval;
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {
                            let status = if busy.load(Ordering::SeqCst) { WorkerStatus::Busy } else { WorkerStatus::Idle };
                            if let Err(e) = store.heartbeat(&worker_id, status, None).await {
                                error!(error = %e, "worker status heartbeat failed");
                            }
                        }
                    }
                }
            })
        };

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let lease = Duration::from_std(self.lease_duration).unwrap_or(Duration::seconds(30));
            let claimed = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.store.acquire_lease(&self.worker_id, lease) => result,
            };

            match claimed {
                Ok(Some(run)) => {
                    info!(run_id = %run.run_id, "claimed run");
                    self.busy.store(true, Ordering::SeqCst);
                    let _ = self
                        .store
                        .heartbeat(&self.worker_id, WorkerStatus::Busy, Some(&run.run_id))
                        .await;

                    if let Err(e) = self.executor.execute(run, &self.worker_id, self.lease_duration).await {
                        error!(error = %e, "executor failed");
                    }

                    self.busy.store(false, Ordering::SeqCst);
                    let _ = self.store.heartbeat(&self.worker_id, WorkerStatus::Idle, None).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.idle_backoff) => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "dispatch loop error");
                    tokio::time::sleep(StdDuration::from_secs(5)).await;
                }
            }
        }

        status_loop.abort();
        info!(worker_id = %self.worker_id, "worker stopped");
        Ok(())
    }
}

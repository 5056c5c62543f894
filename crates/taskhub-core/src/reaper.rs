//! Periodic loop that reclaims leases abandoned by dead workers.
//!
//! Single-node assumption: the Reaper signals pids on its local host only.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::model::RunStatus;
use crate::store::Store;

pub struct Reaper {
    store: Arc<Store>,
    check_interval: StdDuration,
    lease_grace: Duration,
}

impl Reaper {
    pub fn new(store: Arc<Store>, check_interval: StdDuration, lease_grace: StdDuration) -> Self {
        Reaper {
            store,
            check_interval,
            lease_grace: Duration::from_std(lease_grace).unwrap_or(Duration::seconds(10)),
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!("reaper started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.check_interval) => {
                    if let Err(e) = self.reap_once().await {
                        warn!(error = %e, "reaper pass failed");
                    }
                }
            }
        }
        info!("reaper stopped");
    }

    async fn reap_once(&self) -> anyhow::Result<()> {
        let zombies = self.store.find_expired_runs(self.lease_grace).await?;
        if zombies.is_empty() {
            return Ok(());
        }

        for run in &zombies {
            warn!(run_id = %run.run_id, pid = ?run.worker_pid, "reaping expired lease");

            if let Some(pid) = run.worker_pid {
                match signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    Ok(()) => info!(run_id = %run.run_id, pid, "sent SIGKILL to process group"),
                    Err(nix::errno::Errno::ESRCH) => info!(run_id = %run.run_id, pid, "process group already gone"),
                    Err(nix::errno::Errno::EPERM) => warn!(run_id = %run.run_id, pid, "no permission to signal process group"),
                    Err(e) => warn!(run_id = %run.run_id, pid, error = %e, "failed to signal process group"),
                }
            }

            self.store
                .finalize_run(&run.run_id, RunStatus::Failed, None, Some("Lease expired (Reaped)"))
                .await?;
        }

        info!(count = zombies.len(), "reap pass complete");
        Ok(())
    }
}

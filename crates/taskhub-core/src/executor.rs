//! Child-process lifecycle: spawn, heartbeat, drain, finalize.
//!
//! The process group is the unit of signaling: the child is placed in its
//! own group so a single SIGKILL reaches every descendant.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::model::{Run, RunStatus};
use crate::registry::Registry;
use crate::store::Store;

/// Prefix that marks a stdout line as an inline event, 14 bytes including
/// the trailing space.
const EVENT_PREFIX: &str = "TASKHUB_EVENT ";

/// Why the heartbeat loop terminated the child, if it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    /// The child exited on its own; the loop was stopped by the Executor.
    ChildExited,
    Canceled,
    LeaseLost,
    TimedOut(u64),
}

/// One record appended to `events.jsonl`.
#[derive(Debug, Serialize, Deserialize)]
struct EventRecord {
    seq: u64,
    ts: DateTime<Utc>,
    run_id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct InlineEvent {
    #[serde(rename = "type", default = "default_event_type")]
    event_type: String,
    #[serde(default)]
    data: serde_json::Value,
}

fn default_event_type() -> String {
    "log".to_string()
}

pub struct Executor {
    store: Arc<Store>,
    registry: Arc<Registry>,
}

impl Executor {
    pub fn new(store: Arc<Store>, registry: Arc<Registry>) -> Self {
        Executor { store, registry }
    }

    /// Runs `run`'s command to completion and leaves the Run in a terminal
    /// state. Never returns an `Err` for run-level failures — those are
    /// reported by finalizing the Run FAILED; `Err` is reserved for store
    /// errors that prevent even that.
    pub async fn execute(
        &self,
        run: Run,
        worker_id: &str,
        lease_duration: std::time::Duration,
    ) -> anyhow::Result<()> {
        let Some(def) = self.registry.get(&run.task_id) else {
            error!(run_id = %run.run_id, task_id = %run.task_id, "task definition missing");
            self.store
                .finalize_run(&run.run_id, RunStatus::Failed, None, Some("task definition missing"))
                .await?;
            return Ok(());
        };

        let normalized = match def.validate(&run.params) {
            Ok(p) => p,
            Err(e) => {
                let msg = format!("Build command failed: {e}");
                warn!(run_id = %run.run_id, %msg, "param validation failed");
                self.store
                    .finalize_run(&run.run_id, RunStatus::Failed, None, Some(&msg))
                    .await?;
                return Ok(());
            }
        };

        let argv = match def.build_command(&normalized) {
            Ok(argv) => argv,
            Err(e) => {
                let msg = format!("Build command failed: {e}");
                self.store
                    .finalize_run(&run.run_id, RunStatus::Failed, None, Some(&msg))
                    .await?;
                return Ok(());
            }
        };

        if argv.is_empty() {
            self.store
                .finalize_run(&run.run_id, RunStatus::Failed, None, Some("empty command"))
                .await?;
            return Ok(());
        }

        let workdir = PathBuf::from(&run.workdir);
        if let Err(e) = tokio::fs::create_dir_all(&workdir).await {
            let msg = format!("failed to create workdir: {e}");
            self.store
                .finalize_run(&run.run_id, RunStatus::Failed, None, Some(&msg))
                .await?;
            return Ok(());
        }

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(&workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("TASKHUB_RUN_ID", &run.run_id);
        // New process group rooted at the child's own pid (pgid == pid), so
        // a single `killpg` reaches every descendant.
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let msg = format!("failed to spawn child: {e}");
                self.store
                    .finalize_run(&run.run_id, RunStatus::Failed, None, Some(&msg))
                    .await?;
                return Ok(());
            }
        };

        let pid = match child.id() {
            Some(pid) => pid as i64,
            None => {
                let msg = "child exited before pid could be read".to_string();
                self.store
                    .finalize_run(&run.run_id, RunStatus::Failed, None, Some(&msg))
                    .await?;
                return Ok(());
            }
        };

        // Immediately persist the pgid so the Reaper can discover it even
        // if this worker dies before the child exits.
        if let Err(e) = self.store.record_pid(&run.run_id, pid).await {
            error!(run_id = %run.run_id, error = %e, "failed to persist PID, killing orphan group");
            let _ = signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
            self.store
                .finalize_run(&run.run_id, RunStatus::Failed, None, Some("failed to persist PID"))
                .await?;
            return Ok(());
        }

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let stop_heartbeat = CancellationToken::new();
        let termination = Arc::new(tokio::sync::Mutex::new(TerminationCause::ChildExited));

        let heartbeat_handle = {
            let store = Arc::clone(&self.store);
            let run_id = run.run_id.clone();
            let worker_id = worker_id.to_string();
            let token = stop_heartbeat.clone();
            let termination = Arc::clone(&termination);
            let timeout_seconds = def.timeout_seconds.map(|s| s as u64);
            let started_at = Utc::now();
            tokio::spawn(async move {
                let cause = heartbeat_loop(
                    store,
                    run_id,
                    worker_id,
                    pid,
                    lease_duration,
                    started_at,
                    timeout_seconds,
                    token,
                )
                .await;
                *termination.lock().await = cause;
            })
        };

        let seq = Arc::new(AtomicI64::new(0));
        let stdout_handle = tokio::spawn(drain_stream(
            stdout,
            workdir.join("stdout.log"),
            Some((workdir.join("events.jsonl"), run.run_id.clone(), Arc::clone(&seq))),
        ));
        let stderr_handle = tokio::spawn(drain_stream(stderr, workdir.join("stderr.log"), None));

        let exit_status = child.wait().await;

        stop_heartbeat.cancel();
        let _ = heartbeat_handle.await;
        let _ = tokio::join!(stdout_handle, stderr_handle);

        let canceled = self.store.poll_cancel(&run.run_id).await.unwrap_or(false);
        let cause = *termination.lock().await;

        let (status, exit_code, error) = match exit_status {
            Ok(status) => {
                let code = status.code();
                if canceled || cause == TerminationCause::Canceled {
                    (RunStatus::Canceled, code.map(|c| c as i64), Some("Canceled by user".to_string()))
                } else if let TerminationCause::TimedOut(secs) = cause {
                    (RunStatus::Failed, code.map(|c| c as i64), Some(format!("Timed out after {secs}s")))
                } else if code == Some(0) {
                    (RunStatus::Succeeded, Some(0), None)
                } else {
                    let err = format!("Process exited with {}", code.unwrap_or(-1));
                    (RunStatus::Failed, code.map(|c| c as i64), Some(err))
                }
            }
            Err(e) => (RunStatus::Failed, None, Some(format!("wait() failed: {e}"))),
        };

        info!(run_id = %run.run_id, ?status, exit_code, "run finished");

        if !self
            .store
            .finalize_run(&run.run_id, status, exit_code, error.as_deref())
            .await?
        {
            // Already terminal (e.g. the Reaper beat us to it). Retry once
            // in case this was a transient race, then accept the no-op.
            let _ = self
                .store
                .finalize_run(&run.run_id, status, exit_code, error.as_deref())
                .await;
        }

        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn heartbeat_loop(
    store: Arc<Store>,
    run_id: String,
    worker_id: String,
    pgid: i64,
    lease_duration: std::time::Duration,
    started_at: DateTime<Utc>,
    timeout_seconds: Option<u64>,
    stop: CancellationToken,
) -> TerminationCause {
    let poll_interval = std::time::Duration::from_secs(1);
    let extend_interval = lease_duration / 3;
    let lease_duration = ChronoDuration::from_std(lease_duration).unwrap_or(ChronoDuration::seconds(30));

    let mut poll_tick = tokio::time::interval(poll_interval);
    let mut extend_tick = tokio::time::interval(extend_interval.max(std::time::Duration::from_millis(100)));
    poll_tick.tick().await;
    extend_tick.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                return TerminationCause::ChildExited;
            }
            _ = poll_tick.tick() => {
                match store.poll_cancel(&run_id).await {
                    Ok(true) => {
                        kill_group(pgid);
                        return TerminationCause::Canceled;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(%run_id, error = %e, "poll_cancel failed"),
                }

                if let Some(timeout) = timeout_seconds {
                    let elapsed = (Utc::now() - started_at).num_seconds().max(0) as u64;
                    if elapsed > timeout {
                        kill_group(pgid);
                        return TerminationCause::TimedOut(timeout);
                    }
                }
            }
            _ = extend_tick.tick() => {
                match store.extend_lease(&run_id, &worker_id, lease_duration).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(%run_id, "lost lease, killing process group");
                        kill_group(pgid);
                        return TerminationCause::LeaseLost;
                    }
                    Err(e) => error!(%run_id, error = %e, "extend_lease failed"),
                }
            }
        }
    }
}

fn kill_group(pgid: i64) {
    match signal::killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) => {}
        Err(nix::errno::Errno::ESRCH) => {} // already gone
        Err(e) => warn!(pgid, error = %e, "failed to signal process group"),
    }
}

/// Drains a stream to `<stream>.log`, line-buffered. When `events` is
/// `Some`, also parses `TASKHUB_EVENT ` lines into `events.jsonl`.
async fn drain_stream(
    stream: impl tokio::io::AsyncRead + Unpin,
    log_path: PathBuf,
    events: Option<(PathBuf, String, Arc<AtomicI64>)>,
) {
    let mut log_file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await
    {
        Ok(f) => f,
        Err(e) => {
            error!(path = %log_path.display(), error = %e, "failed to open log file");
            return;
        }
    };

    let mut reader = BufReader::new(stream);
    let mut raw = Vec::new();

    loop {
        raw.clear();
        let n = match reader.read_until(b'\n', &mut raw).await {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "stream read error");
                break;
            }
        };
        if n == 0 {
            break;
        }

        if let Err(e) = log_file.write_all(&raw).await {
            error!(error = %e, "failed to append to log file");
        }
        let _ = log_file.flush().await;

        // Raw child output is not guaranteed to be valid UTF-8; replace
        // invalid sequences rather than aborting the drain.
        let line = String::from_utf8_lossy(&raw);

        if let Some((events_path, run_id, seq)) = &events {
            let trimmed = line.trim_end_matches(['\n', '\r']);
            if let Some(rest) = trimmed.strip_prefix(EVENT_PREFIX) {
                if let Err(e) = append_event(events_path, run_id, seq, rest).await {
                    warn!(error = %e, line = %trimmed, "event parse failed");
                }
            }
        }
    }
}

async fn append_event(events_path: &Path, run_id: &str, seq: &AtomicI64, raw_json: &str) -> anyhow::Result<()> {
    let parsed: InlineEvent = serde_json::from_str(raw_json)?;
    let next_seq = seq.fetch_add(1, Ordering::SeqCst) + 1;
    let record = EventRecord {
        seq: next_seq as u64,
        ts: Utc::now(),
        run_id: run_id.to_string(),
        event_type: parsed.event_type,
        data: parsed.data,
    };
    let mut line = serde_json::to_string(&record)?;
    line.push('\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(events_path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    Ok(())
}

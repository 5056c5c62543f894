//! Entry point: one binary, four subcommands (`api`, `worker`, `reaper`,
//! `scheduler`), each a standalone process sharing the same SQLite database.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use taskhub_api::http;
use taskhub_core::{Config, Registry, Store};

#[derive(Parser)]
#[command(name = "taskhub", about = "Single-node task execution platform")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP control plane.
    Api {
        #[arg(long, default_value = "taskhub.toml")]
        config: PathBuf,
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Run a dispatch worker: claims leases and executes runs.
    Worker {
        #[arg(long, default_value = "taskhub.toml")]
        config: PathBuf,
        #[arg(long)]
        worker_id: Option<String>,
    },
    /// Run the lease reaper.
    Reaper {
        #[arg(long, default_value = "taskhub.toml")]
        config: PathBuf,
        /// Overrides `reaper_interval_seconds` from the config file.
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Run the cron scheduler.
    Scheduler {
        #[arg(long, default_value = "taskhub.toml")]
        config: PathBuf,
        /// Overrides `scheduler_interval_seconds` from the config file.
        #[arg(long)]
        interval: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let cli = Cli::parse();
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    match cli.command {
        Command::Api { config, host, port } => run_api(config, host, port, shutdown).await,
        Command::Worker { config, worker_id } => run_worker(config, worker_id, shutdown).await,
        Command::Reaper { config, interval } => run_reaper(config, interval, shutdown).await,
        Command::Scheduler { config, interval } => run_scheduler(config, interval, shutdown).await,
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<Store>> {
    tokio::fs::create_dir_all(config.runs_dir()).await?;
    let store = Store::open(&config.db_path).await?;
    Ok(Arc::new(store))
}

fn registry() -> Arc<Registry> {
    Arc::new(Registry::new(vec![taskhub_core::tasks::demo_task()]))
}

async fn sync_registry(store: &Store, registry: &Registry) -> anyhow::Result<()> {
    for def in registry.all() {
        store.upsert_task(def).await?;
    }
    Ok(())
}

async fn run_api(config_path: PathBuf, host: String, port: u16, shutdown: CancellationToken) -> anyhow::Result<()> {
    let config = Config::load(&config_path)?;
    let store = open_store(&config).await?;
    let registry = registry();
    sync_registry(&store, &registry).await?;

    let state = http::AppState {
        store,
        registry,
        config: Arc::new(config),
    };
    let app = http::router(state);

    let addr = format!("{host}:{port}");
    info!(%addr, "taskhub-api listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("taskhub-api stopped");
    Ok(())
}

async fn run_worker(config_path: PathBuf, worker_id: Option<String>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let config = Config::load(&config_path)?;
    let store = open_store(&config).await?;
    let registry = registry();
    sync_registry(&store, &registry).await?;

    let worker_id = worker_id.unwrap_or_else(|| format!("worker-{}", std::process::id()));
    let hostname = hostname_or_unknown();

    let worker = taskhub_core::worker::Worker::new(
        store,
        registry,
        worker_id,
        hostname,
        config.lease_seconds,
        Duration::from_millis(config.dispatch_idle_backoff_ms),
        Duration::from_secs(config.worker_status_interval_seconds),
    );
    worker.run(shutdown).await
}

async fn run_reaper(config_path: PathBuf, interval: Option<u64>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let config = Config::load(&config_path)?;
    let store = open_store(&config).await?;

    let interval_seconds = interval.unwrap_or(config.reaper_interval_seconds);
    let reaper = taskhub_core::reaper::Reaper::new(
        store,
        Duration::from_secs(interval_seconds),
        Duration::from_secs(config.reaper_grace_seconds),
    );
    reaper.run(shutdown).await;
    Ok(())
}

async fn run_scheduler(config_path: PathBuf, interval: Option<u64>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let config = Config::load(&config_path)?;
    let store = open_store(&config).await?;

    let interval_seconds = interval.unwrap_or(config.scheduler_interval_seconds);
    let scheduler = taskhub_core::scheduler::CronScheduler::new(
        store,
        Duration::from_secs(interval_seconds),
        config.runs_dir(),
    );
    scheduler.run(shutdown).await;
    Ok(())
}

fn hostname_or_unknown() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

//! Layered configuration loaded from a TOML file, with defaults for every
//! field so an empty or partial file is valid.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file (or a full `sqlx` connection URL).
    pub db_path: String,
    /// Root directory under which `<data_root>/runs/<run_id>/...` lives.
    pub data_root: String,
    /// Default lease duration granted by the Dispatcher, in seconds.
    pub lease_seconds: u64,
    /// Reaper scan interval, in seconds.
    pub reaper_interval_seconds: u64,
    /// Grace period added to an expired lease before the Reaper reclaims it.
    pub reaper_grace_seconds: u64,
    /// Cron scheduler tick interval, in seconds.
    pub scheduler_interval_seconds: u64,
    /// Worker heartbeat-to-registry cadence, in seconds.
    pub worker_status_interval_seconds: u64,
    /// Idle backoff when no run is available to dispatch, in milliseconds.
    pub dispatch_idle_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db_path: "sqlite://data/taskhub.db".to_string(),
            data_root: "data".to_string(),
            lease_seconds: 30,
            reaper_interval_seconds: 60,
            reaper_grace_seconds: 10,
            scheduler_interval_seconds: 10,
            worker_status_interval_seconds: 15,
            dispatch_idle_backoff_ms: 2_000,
        }
    }
}

impl Config {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let text = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text)?;
        Ok(config)
    }

    pub fn runs_dir(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_root).join("runs")
    }

    pub fn run_workdir(&self, run_id: &str) -> std::path::PathBuf {
        self.runs_dir().join(run_id)
    }
}

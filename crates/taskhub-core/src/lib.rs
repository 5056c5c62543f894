//! TaskHub core: the durable run queue, lease-based dispatcher,
//! child-process executor, reaper and cron scheduler that together form a
//! single-node, at-most-one-active-executor-per-run task execution engine.
//!
//! Everything here is built over a single embedded SQLite store (see
//! [`store::Store`]); the HTTP surface, task discovery from disk, and the
//! static front end are out of scope and live in `taskhub-api`.

pub mod config;
pub mod error;
pub mod executor;
pub mod model;
pub mod reaper;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod tasks;
pub mod worker;

pub use config::Config;
pub use error::{ExecutorError, StoreError, ValidationError};
pub use model::{CronJob, Run, RunStatus, Task, WorkerHeartbeat, WorkerStatus};
pub use registry::{Registry, TaskDefinition};
pub use scheduler::parse_cron_schedule;
pub use store::{NewRun, RunFilter, Store};

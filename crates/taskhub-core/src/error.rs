//! Error taxonomy: ValidationError, StoreError, ExecutorError, each a
//! distinct type so callers can match on kind instead of string-sniffing a
//! blanket error.

use thiserror::Error;

/// Params failed schema validation, a cron expression didn't parse, or a
/// requested file_id isn't in a Run's artifact index. Never transitions a
/// Run; surfaced to the caller with a 4xx-class code at the HTTP boundary.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("params failed schema validation: {0}")]
    SchemaMismatch(String),
    #[error("invalid cron expression: {0}")]
    BadCronExpression(String),
    #[error("unknown file_id: {0}")]
    UnknownFileId(String),
    #[error("task definition missing: {0}")]
    TaskDefinitionMissing(String),
}

/// Transient database failure. Callers decide whether to retry; loops retry
/// on the next tick rather than propagating out.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Spawn failed or the pid could not be persisted. The Run transitions to
/// FAILED with a short message derived from this error.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("task definition missing")]
    TaskDefinitionMissing,
    #[error("failed to build command: {0}")]
    BuildCommand(#[from] ValidationError),
    #[error("failed to create workdir: {0}")]
    Workdir(#[source] std::io::Error),
    #[error("failed to spawn child: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to persist PID")]
    PersistPid,
    #[error(transparent)]
    Store(#[from] StoreError),
}

use convenient_coordinator::{ConfigError, CoordinationError, SchedulerError, StoreError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Catalog error: {0}")]
    Store(#[from] StoreError),

    #[error("Engine error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Nothing moved for a whole idle period
    #[error("{pending} tasks made no progress within {idle:?}")]
    Stalled { pending: usize, idle: Duration },
}

pub type CommandResult<T> = Result<T, CommandError>;

//! Error types for coordination

use crate::model::BuildTaskId;
use crate::status::BuildCoordinationStatus;
use convenient_graph::GraphError;
use convenient_rex::RexError;
use thiserror::Error;

/// Datastore failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid catalog: {0}")]
    InvalidCatalog(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Catalog parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Scheduler facade failures
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Graph or one of its tasks is already known to the engine. Retryable.
    #[error("Scheduling conflict: {0}")]
    Conflict(String),

    /// Any other rejection or transport failure. Not retryable.
    #[error("Scheduling failed: {0}")]
    Remote(String),

    #[error("Unknown task: {0}")]
    UnknownTask(BuildTaskId),

    #[error("Task {task} cannot complete from state {state}")]
    InvalidState { task: BuildTaskId, state: String },
}

impl SchedulerError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<RexError> for SchedulerError {
    fn from(error: RexError) -> Self {
        match error {
            RexError::Conflict(message) => Self::Conflict(message),
            other => Self::Remote(other.to_string()),
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Configuration loading failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level coordination errors
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// A running task depends on a task that would have to be rebuilt
    #[error("Build conflict: {0}")]
    BuildConflict(String),

    #[error("Illegal transition of task {task}: {from} -> {to}")]
    InvalidTransition {
        task: BuildTaskId,
        from: BuildCoordinationStatus,
        to: BuildCoordinationStatus,
    },

    #[error("Unknown task: {0}")]
    UnknownTask(BuildTaskId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type CoordinationResult<T> = Result<T, CoordinationError>;

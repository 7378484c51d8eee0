//! Scheduler facade
//!
//! A validated [`BuildGraph`] is handed to an execution engine that starts
//! tasks once their dependencies succeeded and reports every state change
//! back as a [`TaskTransition`]. Two engines exist:
//! - [`LocalScheduler`]: in-process, used by the CLI and tests
//! - [`RexScheduler`]: the remote Rex engine over HTTP

mod local;
mod retry;
mod rex;

pub use local::LocalScheduler;
pub use retry::{RetryPolicy, submit_with_retry};
pub use rex::RexScheduler;

use crate::config::SchedulerBackend;
use crate::error::SchedulerResult;
use crate::graph_builder::BuildGraph;
use crate::model::{BuildTask, BuildTaskId};
use crate::status::{BuildCoordinationStatus, BuildStatus};
use async_trait::async_trait;
use convenient_graph::Edge;
use convenient_rex::{Notification, RexClient, State, StopFlag, TaskDto};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Engine view of one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRef {
    pub id: BuildTaskId,
    pub state: State,
    pub stop_flag: StopFlag,
    pub correlation_id: Option<String>,
}

impl TaskRef {
    pub fn build_status(&self) -> BuildStatus {
        BuildStatus::from_remote(self.state, self.stop_flag)
    }
}

impl From<TaskDto> for TaskRef {
    fn from(dto: TaskDto) -> Self {
        Self {
            id: BuildTaskId::new(dto.name),
            state: dto.state,
            stop_flag: dto.stop_flag,
            correlation_id: dto.correlation_id,
        }
    }
}

/// A state change reported by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTransition {
    pub task_id: BuildTaskId,
    pub before: State,
    pub after: State,
    pub stop_flag: StopFlag,
}

impl TaskTransition {
    /// Coordination status the task moves to
    pub fn status(&self) -> BuildCoordinationStatus {
        BuildCoordinationStatus::from_remote(self.after, self.stop_flag)
    }
}

impl From<Notification> for TaskTransition {
    fn from(notification: Notification) -> Self {
        Self {
            task_id: BuildTaskId::new(notification.task.name),
            before: notification.before,
            after: notification.after,
            stop_flag: notification.task.stop_flag,
        }
    }
}

/// What actually goes to the engine for a graph.
///
/// Only unfinished new tasks without a no-rebuild cause are submitted. Edges are kept
/// when both ends are submitted or already running (but not both running);
/// edges to no-rebuild tasks are dropped since that dependency is satisfied.
#[derive(Debug)]
pub struct SubmissionPlan<'g> {
    pub tasks: Vec<&'g BuildTask>,
    pub edges: Vec<Edge<BuildTaskId>>,
}

impl<'g> SubmissionPlan<'g> {
    pub fn from_graph(graph: &'g BuildGraph) -> Self {
        let tasks: Vec<&BuildTask> = graph
            .vertices()
            .map(|(_, t)| t)
            .filter(|t| t.needs_execution() && !t.is_finished())
            .collect();
        let submitted: BTreeSet<&BuildTaskId> = tasks.iter().map(|t| &t.id).collect();
        let running: BTreeSet<&BuildTaskId> = graph
            .vertices()
            .filter(|(_, t)| t.already_running)
            .map(|(id, _)| id)
            .collect();

        let edges = graph
            .edges()
            .into_iter()
            .filter(|e| {
                let from_new = submitted.contains(&e.from);
                let to_new = submitted.contains(&e.to);
                (from_new || to_new)
                    && (from_new || running.contains(&e.from))
                    && (to_new || running.contains(&e.to))
            })
            .collect();

        Self { tasks, edges }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[async_trait]
pub trait RemoteScheduler: Send + Sync {
    /// Backend name (for logging)
    fn name(&self) -> &str;

    /// Submit the executable part of a graph under a correlation id.
    async fn submit(&self, graph: &BuildGraph, correlation_id: &str)
    -> SchedulerResult<Vec<TaskRef>>;

    /// Request cancellation. Returns `false` if the task is unknown or
    /// already finished.
    async fn cancel(&self, task_id: &BuildTaskId) -> SchedulerResult<bool>;

    async fn task(&self, task_id: &BuildTaskId) -> SchedulerResult<Option<TaskRef>>;

    async fn tasks_by_correlation(&self, correlation_id: &str) -> SchedulerResult<Vec<TaskRef>>;

    /// Report the outcome of a started task so its dependants can be
    /// released (or stopped).
    async fn report_completion(&self, task_id: &BuildTaskId, success: bool) -> SchedulerResult<()>;
}

/// A scheduler plus, for in-process engines, the stream of its transitions.
///
/// Remote engines deliver transitions through their notification callback
/// instead.
pub struct SchedulerHandle {
    pub scheduler: Arc<dyn RemoteScheduler>,
    pub transitions: Option<mpsc::UnboundedReceiver<TaskTransition>>,
}

/// Create the scheduler selected by configuration.
pub fn connect(backend: &SchedulerBackend) -> SchedulerResult<SchedulerHandle> {
    match backend {
        SchedulerBackend::Local => {
            let (scheduler, transitions) = LocalScheduler::new();
            Ok(SchedulerHandle {
                scheduler: Arc::new(scheduler),
                transitions: Some(transitions),
            })
        }
        SchedulerBackend::Rex {
            url,
            callback_url,
            token,
            mode,
        } => {
            let mut client = RexClient::new(url)?;
            if let Some(token) = token {
                client = client.with_token(token.clone());
            }
            Ok(SchedulerHandle {
                scheduler: Arc::new(RexScheduler::new(
                    client,
                    callback_url.clone(),
                    token.clone(),
                    *mode,
                )),
                transitions: None,
            })
        }
    }
}

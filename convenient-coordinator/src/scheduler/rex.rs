//! Rex-backed scheduler

use super::{RemoteScheduler, SubmissionPlan, TaskRef};
use crate::error::{SchedulerError, SchedulerResult};
use crate::graph_builder::BuildGraph;
use crate::model::{BuildTask, BuildTaskId};
use async_trait::async_trait;
use convenient_rex::{
    Configuration, CreateGraphRequest, CreateTask, EdgeDto, Method, Mode, Request, RexClient,
    RexError,
};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

pub struct RexScheduler {
    rex: RexClient,
    callback_url: String,
    token: Option<String>,
    mode: Mode,
}

impl RexScheduler {
    /// `callback_url` is the base URL the engine calls to start, cancel and
    /// notify; per-task paths are `build-tasks/{id}/{start,cancel,notify}`.
    pub fn new(rex: RexClient, callback_url: String, token: Option<String>, mode: Mode) -> Self {
        Self {
            rex,
            callback_url: callback_url.trim_end_matches('/').to_string(),
            token,
            mode,
        }
    }

    fn callback(&self, task: &BuildTaskId, action: &str, body: Option<serde_json::Value>) -> Request {
        let request = Request::json(
            Method::Post,
            format!("{}/build-tasks/{}/{}", self.callback_url, task, action),
            body,
        );
        match &self.token {
            Some(token) => request.with_header("Authorization", format!("Bearer {token}")),
            None => request,
        }
    }

    fn descriptor(&self, task: &BuildTask) -> CreateTask {
        let start = json!({
            "id": task.id,
            "idRev": task.id_rev().to_string(),
            "name": task.revision.name,
            "scmUrl": task.revision.scm_url,
            "scmRevision": task.revision.scm_revision,
            "buildScript": task.revision.build_script,
            "temporaryBuild": task.options.temporary_build,
            "username": task.user.username,
        });

        CreateTask {
            name: task.id.to_string(),
            remote_start: self.callback(&task.id, "start", Some(start)),
            remote_cancel: self.callback(&task.id, "cancel", None),
            caller_notifications: self.callback(&task.id, "notify", None),
            configuration: Configuration {
                mode: self.mode,
                pass_results_of_dependencies: false,
            },
        }
    }

    /// Engine request for the executable part of a graph.
    pub fn translate(&self, graph: &BuildGraph, correlation_id: &str) -> CreateGraphRequest {
        let plan = SubmissionPlan::from_graph(graph);
        CreateGraphRequest {
            correlation_id: correlation_id.to_string(),
            edges: plan
                .edges
                .iter()
                .map(|e| EdgeDto {
                    source: e.from.to_string(),
                    target: e.to.to_string(),
                })
                .collect::<BTreeSet<_>>(),
            vertices: plan
                .tasks
                .iter()
                .map(|t| (t.id.to_string(), self.descriptor(t)))
                .collect::<BTreeMap<_, _>>(),
        }
    }
}

#[async_trait]
impl RemoteScheduler for RexScheduler {
    fn name(&self) -> &str {
        "rex"
    }

    async fn submit(
        &self,
        graph: &BuildGraph,
        correlation_id: &str,
    ) -> SchedulerResult<Vec<TaskRef>> {
        let request = self.translate(graph, correlation_id);
        if request.vertices.is_empty() {
            debug!("Nothing to submit for {}", correlation_id);
            return Ok(Vec::new());
        }

        let tasks = self.rex.submit_graph(&request).await?;
        info!(
            "Rex accepted graph {} ({} tasks)",
            correlation_id,
            request.vertices.len()
        );
        Ok(tasks.into_iter().map(TaskRef::from).collect())
    }

    async fn cancel(&self, task_id: &BuildTaskId) -> SchedulerResult<bool> {
        match self.rex.cancel(task_id.as_str()).await {
            Ok(()) => Ok(true),
            Err(RexError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn task(&self, task_id: &BuildTaskId) -> SchedulerResult<Option<TaskRef>> {
        Ok(self.rex.task(task_id.as_str()).await?.map(TaskRef::from))
    }

    async fn tasks_by_correlation(&self, correlation_id: &str) -> SchedulerResult<Vec<TaskRef>> {
        Ok(self
            .rex
            .tasks_by_correlation(correlation_id)
            .await?
            .into_iter()
            .map(TaskRef::from)
            .collect())
    }

    async fn report_completion(
        &self,
        task_id: &BuildTaskId,
        success: bool,
    ) -> SchedulerResult<()> {
        self.rex
            .report(task_id.as_str(), success, None)
            .await
            .map_err(|e| match e {
                RexError::NotFound(_) => SchedulerError::UnknownTask(task_id.clone()),
                other => other.into(),
            })
    }
}

//! Trigger builds and, with the local engine, carry them out

use super::{BuildArgs, RunArgs, pinned};
use crate::error::CommandResult;
use crate::session::Session;
use convenient_coordinator::{
    BuildSetTask, BuildStatus, BuildTask, ConfigId, ConfigSetId, Datastore, IdRev,
    StatusChangedEvent,
};
use tokio::sync::broadcast;
use tracing::{info, instrument};

/// How a triggered build ended
#[derive(Debug)]
pub struct BuildSummary {
    pub correlation_id: String,
    pub rejection: Option<String>,
    pub tasks: Vec<BuildTask>,
    /// Derived from the tasks, or the set record for set builds
    pub status: BuildStatus,
}

impl BuildSummary {
    pub fn succeeded(&self) -> bool {
        self.status.completed_successfully()
    }

    fn print(&self) {
        println!("Build {}", self.correlation_id);
        for task in &self.tasks {
            let mark = if task.status.to_build_status().completed_successfully() {
                "✓"
            } else if task.is_finished() {
                "✗"
            } else {
                "…"
            };
            print!(
                "  {} {} {} ({}): {}",
                mark,
                task.id,
                task.revision.name,
                task.id_rev(),
                task.status
            );
            match &task.status_description {
                Some(description) => println!(" - {description}"),
                None => println!(),
            }
        }
        if let Some(rejection) = &self.rejection {
            println!("Rejected: {rejection}");
        }
        println!("Result: {}", self.status);
    }
}

/// Build one configuration.
#[instrument(skip_all, fields(config = id))]
pub async fn execute(
    session: &Session,
    id: u32,
    revision: Option<u32>,
    build: &BuildArgs,
    run: &RunArgs,
) -> CommandResult<BuildSummary> {
    let revision = match revision {
        Some(rev) => session.store.revision(IdRev::new(id, rev)).await?,
        None => session.store.latest_revision(ConfigId(id)).await?,
    };

    let events = session.coordinator.subscribe();
    let outcome = session
        .coordinator
        .build_config(revision, build.options(), build.user())
        .await?;
    finish(session, outcome, events, run).await
}

/// Build every member of a configuration set.
#[instrument(skip_all, fields(set = id))]
pub async fn execute_set(
    session: &Session,
    id: u32,
    pins: &[IdRev],
    build: &BuildArgs,
    run: &RunArgs,
) -> CommandResult<BuildSummary> {
    let events = session.coordinator.subscribe();
    let outcome = session
        .coordinator
        .build_set(ConfigSetId(id), &pinned(pins), build.options(), build.user())
        .await?;
    finish(session, outcome, events, run).await
}

async fn finish(
    session: &Session,
    outcome: BuildSetTask,
    events: broadcast::Receiver<StatusChangedEvent>,
    run: &RunArgs,
) -> CommandResult<BuildSummary> {
    let tasks = if session.runs_builds() && outcome.is_accepted() {
        info!(
            "Running {} tasks of build {}",
            outcome.submitted().count(),
            outcome.correlation_id
        );
        session
            .run(&outcome, events, &run.failing(), run.idle_timeout())
            .await?
    } else {
        outcome.tasks.clone()
    };

    let status = match outcome.set_record_id {
        Some(id) => match session.store.set_record(id).await? {
            Some(record) => record.status,
            None => derived(&tasks),
        },
        None => derived(&tasks),
    };

    let summary = BuildSummary {
        correlation_id: outcome.correlation_id,
        rejection: outcome.rejection.as_ref().map(ToString::to_string),
        tasks,
        status,
    };
    summary.print();
    Ok(summary)
}

fn derived(tasks: &[BuildTask]) -> BuildStatus {
    BuildStatus::aggregate(tasks.iter().map(|t| t.status.to_build_status()))
        .unwrap_or(BuildStatus::Rejected)
}

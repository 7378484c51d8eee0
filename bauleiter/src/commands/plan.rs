//! Plan a build without running it

use super::{BuildArgs, Format};
use crate::error::CommandResult;
use crate::session::Session;
use convenient_coordinator::{BuildPlan, BuildTask, ConfigId, ConfigSetId, Datastore, IdRev};
use serde::Serialize;
use std::collections::BTreeMap;

/// A planned task, as printed
#[derive(Debug, Serialize)]
pub struct PlannedTask {
    pub id: String,
    pub configuration: String,
    pub revision: String,
    pub action: String,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PlanReport {
    pub accepted: bool,
    pub rejection: Option<String>,
    pub tasks: Vec<PlannedTask>,
}

fn action(task: &BuildTask) -> String {
    if task.already_running {
        format!("running ({})", task.status)
    } else if let Some(cause) = &task.no_rebuild_cause {
        format!("reuse {cause}")
    } else {
        "build".to_string()
    }
}

impl PlanReport {
    pub fn new(plan: &BuildPlan) -> Self {
        let tasks = plan
            .graph
            .vertices()
            .map(|(id, task)| PlannedTask {
                id: id.to_string(),
                configuration: task.revision.name.clone(),
                revision: task.id_rev().to_string(),
                action: action(task),
                dependencies: plan
                    .graph
                    .dependencies(id)
                    .map(|deps| deps.iter().map(ToString::to_string).collect())
                    .unwrap_or_default(),
            })
            .collect();
        Self {
            accepted: plan.is_accepted(),
            rejection: plan.rejection.as_ref().map(ToString::to_string),
            tasks,
        }
    }

    fn print(&self) {
        println!("{} tasks:", self.tasks.len());
        for task in &self.tasks {
            println!(
                "  {} {} ({}): {}",
                task.id, task.configuration, task.revision, task.action
            );
            if !task.dependencies.is_empty() {
                println!("      after {}", task.dependencies.join(", "));
            }
        }
        match &self.rejection {
            Some(rejection) => println!("Rejected: {rejection}"),
            None => println!("Accepted"),
        }
    }
}

/// Plan one configuration, or a set when `set` is true.
pub async fn execute(
    session: &Session,
    id: u32,
    set: bool,
    revision: Option<u32>,
    args: &BuildArgs,
    format: Format,
) -> CommandResult<PlanReport> {
    let options = args.options();
    let user = args.user();
    let plan = if set {
        session
            .coordinator
            .plan_set(ConfigSetId(id), &BTreeMap::new(), options, &user)
            .await?
    } else {
        let revision = match revision {
            Some(rev) => session.store.revision(IdRev::new(id, rev)).await?,
            None => session.store.latest_revision(ConfigId(id)).await?,
        };
        session
            .coordinator
            .plan_config(revision, options, &user)
            .await?
    };

    let report = PlanReport::new(&plan);
    match format {
        Format::Text => report.print(),
        Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(report)
}

//! Build graph validation
//!
//! Rules, first match wins:
//! 1. no vertices
//! 2. nothing to do (unless forced)
//! 3. dependency cycle
//! 4. a running task depends on a task that still has to be built (conflict)

use crate::error::{CoordinationError, CoordinationResult};
use crate::graph_builder::BuildGraph;
use crate::model::{BuildOptions, BuildTask, BuildTaskId};
use crate::status::BuildCoordinationStatus;
use std::fmt;

/// Why a graph is not scheduled. Rejections are outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphRejection {
    EmptyBuildSet,
    NoRebuildRequired,
    /// Task ids along the cycle, first id repeated at the end
    CyclePresent { cycle: Vec<BuildTaskId>, description: String },
}

impl GraphRejection {
    /// Status given to the rejected tasks and the trigger response
    pub fn status(&self) -> BuildCoordinationStatus {
        match self {
            Self::NoRebuildRequired => BuildCoordinationStatus::RejectedAlreadyBuilt,
            Self::EmptyBuildSet | Self::CyclePresent { .. } => BuildCoordinationStatus::Rejected,
        }
    }
}

impl fmt::Display for GraphRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyBuildSet => write!(f, "Build config set is empty"),
            Self::NoRebuildRequired => write!(f, "All build configs were previously built"),
            Self::CyclePresent { description, .. } => {
                write!(f, "Cycle dependencies found: {description}")
            }
        }
    }
}

fn label(graph: &BuildGraph, id: &BuildTaskId) -> String {
    match graph.vertex(id) {
        Some(task) => format!("{} ({})", task.revision.name, task.id_rev()),
        None => id.to_string(),
    }
}

/// Check a graph before submission.
///
/// Returns `Ok(None)` when the graph can be scheduled and
/// `Err(CoordinationError::BuildConflict)` when an already running task
/// depends on a task that would have to be built again.
pub fn validate(
    graph: &BuildGraph,
    options: &BuildOptions,
) -> CoordinationResult<Option<GraphRejection>> {
    if graph.is_empty() {
        return Ok(Some(GraphRejection::EmptyBuildSet));
    }

    let nothing_to_do = graph
        .vertices()
        .all(|(_, t)| t.already_running || t.no_rebuild_cause.is_some());
    if !options.force_rebuild() && nothing_to_do {
        return Ok(Some(GraphRejection::NoRebuildRequired));
    }

    if let Some(cycle) = graph.find_cycle() {
        let description = cycle
            .iter()
            .map(|id| label(graph, id))
            .collect::<Vec<_>>()
            .join(" -> ");
        return Ok(Some(GraphRejection::CyclePresent { cycle, description }));
    }

    for (id, task) in graph.vertices().filter(|(_, t)| t.already_running) {
        for dep in graph.dependencies(id)? {
            let satisfied = graph
                .vertex(dep)
                .is_some_and(|d: &BuildTask| d.already_running || d.no_rebuild_cause.is_some());
            if !satisfied {
                return Err(CoordinationError::BuildConflict(format!(
                    "Task {} of {} is already running but its dependency {} has to be rebuilt",
                    task.id,
                    label(graph, id),
                    label(graph, dep)
                )));
            }
        }
    }

    Ok(None)
}

//! In-process task graph engine
//!
//! Mirrors the remote engine's life cycle: tasks wait for their dependencies,
//! are enqueued and started once all of them succeeded, and are stopped with
//! `DEPENDENCY_FAILED` when one of them fails. Nothing is executed here; a
//! started task stays `UP` until [`RemoteScheduler::report_completion`].

use super::{RemoteScheduler, SubmissionPlan, TaskRef, TaskTransition};
use crate::error::{SchedulerError, SchedulerResult};
use crate::graph_builder::BuildGraph;
use crate::model::BuildTaskId;
use async_trait::async_trait;
use convenient_rex::{State, StopFlag};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug)]
struct LocalTask {
    state: State,
    stop_flag: StopFlag,
    correlation_id: String,
    dependencies: BTreeSet<BuildTaskId>,
    dependants: BTreeSet<BuildTaskId>,
}

#[derive(Debug)]
struct Engine {
    tasks: BTreeMap<BuildTaskId, LocalTask>,
    events: mpsc::UnboundedSender<TaskTransition>,
}

impl Engine {
    fn task_ref(&self, id: &BuildTaskId) -> Option<TaskRef> {
        self.tasks.get(id).map(|t| TaskRef {
            id: id.clone(),
            state: t.state,
            stop_flag: t.stop_flag,
            correlation_id: Some(t.correlation_id.clone()),
        })
    }

    fn transition(&mut self, id: &BuildTaskId, after: State, stop_flag: StopFlag) {
        let Some(task) = self.tasks.get_mut(id) else {
            return;
        };
        let before = task.state;
        task.state = after;
        task.stop_flag = stop_flag;
        debug!("Task {}: {} -> {}", id, before, after);

        let event = TaskTransition {
            task_id: id.clone(),
            before,
            after,
            stop_flag,
        };
        if self.events.send(event).is_err() {
            debug!("No listener for transitions of task {}", id);
        }
    }

    /// Re-evaluate waiting tasks until nothing changes. Tasks reaching a
    /// final state queue their dependants.
    fn settle(&mut self, mut queue: VecDeque<BuildTaskId>) {
        while let Some(id) = queue.pop_front() {
            let Some(task) = self.tasks.get(&id) else {
                continue;
            };

            let state = task.state;
            if state.is_final() {
                queue.extend(task.dependants.iter().cloned());
                continue;
            }
            if !matches!(state, State::New | State::Waiting) {
                continue;
            }

            let mut failed = false;
            let mut cancelled = false;
            let mut pending = false;
            for dep in &task.dependencies {
                match self.tasks.get(dep).map(|d| (d.state, d.stop_flag)) {
                    Some((State::Successful, _)) => {}
                    Some((State::Stopped, StopFlag::Cancelled)) => cancelled = true,
                    Some((other, _)) if other.is_final() => failed = true,
                    _ => pending = true,
                }
            }

            if failed || cancelled {
                let flag = if failed {
                    StopFlag::DependencyFailed
                } else {
                    StopFlag::Cancelled
                };
                self.transition(&id, State::Stopped, flag);
                queue.push_back(id);
            } else if !pending {
                self.transition(&id, State::Enqueued, StopFlag::None);
                self.transition(&id, State::Up, StopFlag::None);
            } else if state == State::New {
                self.transition(&id, State::Waiting, StopFlag::None);
            }
        }
    }
}

/// In-process engine. Transitions are delivered on the channel returned by
/// [`LocalScheduler::new`].
#[derive(Debug)]
pub struct LocalScheduler {
    engine: Mutex<Engine>,
}

impl LocalScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TaskTransition>) {
        let (events, transitions) = mpsc::unbounded_channel();
        let scheduler = Self {
            engine: Mutex::new(Engine {
                tasks: BTreeMap::new(),
                events,
            }),
        };
        (scheduler, transitions)
    }

    fn engine(&self) -> MutexGuard<'_, Engine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RemoteScheduler for LocalScheduler {
    fn name(&self) -> &str {
        "local"
    }

    async fn submit(
        &self,
        graph: &BuildGraph,
        correlation_id: &str,
    ) -> SchedulerResult<Vec<TaskRef>> {
        let plan = SubmissionPlan::from_graph(graph);
        let mut engine = self.engine();

        if let Some(existing) = plan.tasks.iter().find(|t| engine.tasks.contains_key(&t.id)) {
            return Err(SchedulerError::Conflict(format!(
                "task {} already exists",
                existing.id
            )));
        }
        let new_ids: BTreeSet<&BuildTaskId> = plan.tasks.iter().map(|t| &t.id).collect();
        for edge in &plan.edges {
            for end in [&edge.from, &edge.to] {
                if !new_ids.contains(end) && !engine.tasks.contains_key(end) {
                    return Err(SchedulerError::Remote(format!(
                        "edge {} -> {} references unknown task {}",
                        edge.from, edge.to, end
                    )));
                }
            }
        }

        for task in &plan.tasks {
            let _ = engine.tasks.insert(
                task.id.clone(),
                LocalTask {
                    state: State::New,
                    stop_flag: StopFlag::None,
                    correlation_id: correlation_id.to_string(),
                    dependencies: BTreeSet::new(),
                    dependants: BTreeSet::new(),
                },
            );
        }
        for edge in &plan.edges {
            if let Some(from) = engine.tasks.get_mut(&edge.from) {
                let _ = from.dependencies.insert(edge.to.clone());
            }
            if let Some(to) = engine.tasks.get_mut(&edge.to) {
                let _ = to.dependants.insert(edge.from.clone());
            }
        }

        info!(
            "Local engine accepted graph {} ({} tasks, {} edges)",
            correlation_id,
            plan.tasks.len(),
            plan.edges.len()
        );
        engine.settle(plan.tasks.iter().map(|t| t.id.clone()).collect());

        Ok(plan
            .tasks
            .iter()
            .filter_map(|t| engine.task_ref(&t.id))
            .collect())
    }

    async fn cancel(&self, task_id: &BuildTaskId) -> SchedulerResult<bool> {
        let mut engine = self.engine();
        let Some(state) = engine.tasks.get(task_id).map(|t| t.state) else {
            return Ok(false);
        };
        if state.is_final() {
            return Ok(false);
        }

        if matches!(state, State::Starting | State::Up) {
            engine.transition(task_id, State::Stopping, StopFlag::Cancelled);
        }
        engine.transition(task_id, State::Stopped, StopFlag::Cancelled);
        engine.settle(VecDeque::from([task_id.clone()]));
        Ok(true)
    }

    async fn task(&self, task_id: &BuildTaskId) -> SchedulerResult<Option<TaskRef>> {
        Ok(self.engine().task_ref(task_id))
    }

    async fn tasks_by_correlation(&self, correlation_id: &str) -> SchedulerResult<Vec<TaskRef>> {
        let engine = self.engine();
        Ok(engine
            .tasks
            .iter()
            .filter(|(_, t)| t.correlation_id == correlation_id)
            .filter_map(|(id, _)| engine.task_ref(id))
            .collect())
    }

    async fn report_completion(
        &self,
        task_id: &BuildTaskId,
        success: bool,
    ) -> SchedulerResult<()> {
        let mut engine = self.engine();
        let state = engine
            .tasks
            .get(task_id)
            .map(|t| t.state)
            .ok_or_else(|| SchedulerError::UnknownTask(task_id.clone()))?;
        if !state.is_running() {
            return Err(SchedulerError::InvalidState {
                task: task_id.clone(),
                state: state.to_string(),
            });
        }

        if success {
            engine.transition(task_id, State::Successful, StopFlag::None);
        } else {
            engine.transition(task_id, State::Failed, StopFlag::Unsuccessful);
        }
        engine.settle(VecDeque::from([task_id.clone()]));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BuildConfigRevision, BuildOptions, BuildTask, IdRev, User};

    fn graph(ids: &[&str], edges: &[(&str, &str)]) -> BuildGraph {
        let mut graph = BuildGraph::new();
        for (n, id) in ids.iter().enumerate() {
            let task = BuildTask::new(
                BuildTaskId::new(*id),
                BuildConfigRevision {
                    id_rev: IdRev::new(u32::try_from(n).unwrap(), 1),
                    name: id.to_lowercase(),
                    build_script: String::new(),
                    scm_url: String::new(),
                    scm_revision: String::new(),
                    alignment_parameters: String::new(),
                    build_type: String::new(),
                    dependencies: BTreeSet::new(),
                },
                BuildOptions::default(),
                User::new(1, "demo"),
            );
            let _ = graph.add_vertex(task.id.clone(), task);
        }
        for (from, to) in edges {
            graph
                .add_edge(BuildTaskId::new(*from), BuildTaskId::new(*to))
                .unwrap();
        }
        graph
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TaskTransition>) -> Vec<(String, State)> {
        let mut seen = Vec::new();
        while let Ok(t) = rx.try_recv() {
            seen.push((t.task_id.to_string(), t.after));
        }
        seen
    }

    async fn state(scheduler: &LocalScheduler, id: &str) -> State {
        scheduler
            .task(&BuildTaskId::new(id))
            .await
            .unwrap()
            .unwrap()
            .state
    }

    #[tokio::test]
    async fn test_dependencies_release_in_order() {
        let (scheduler, mut rx) = LocalScheduler::new();
        // X -> Y -> Z
        let g = graph(&["X", "Y", "Z"], &[("X", "Y"), ("Y", "Z")]);
        let refs = scheduler.submit(&g, "c-1").await.unwrap();
        assert_eq!(refs.len(), 3);

        assert_eq!(state(&scheduler, "Z").await, State::Up);
        assert_eq!(state(&scheduler, "Y").await, State::Waiting);
        assert_eq!(state(&scheduler, "X").await, State::Waiting);

        scheduler
            .report_completion(&BuildTaskId::new("Z"), true)
            .await
            .unwrap();
        assert_eq!(state(&scheduler, "Y").await, State::Up);
        assert_eq!(state(&scheduler, "X").await, State::Waiting);

        let events = drain(&mut rx);
        assert!(events.contains(&("Z".to_string(), State::Successful)));
        assert!(events.contains(&("Y".to_string(), State::Up)));
    }

    #[tokio::test]
    async fn test_failure_stops_dependants() {
        let (scheduler, _rx) = LocalScheduler::new();
        let g = graph(&["X", "Y", "Z"], &[("X", "Y"), ("Y", "Z")]);
        let _ = scheduler.submit(&g, "c-2").await.unwrap();

        scheduler
            .report_completion(&BuildTaskId::new("Z"), false)
            .await
            .unwrap();

        for id in ["X", "Y"] {
            let task = scheduler.task(&BuildTaskId::new(id)).await.unwrap().unwrap();
            assert_eq!(task.state, State::Stopped);
            assert_eq!(task.stop_flag, StopFlag::DependencyFailed);
        }
    }

    #[tokio::test]
    async fn test_cancel_propagates() {
        let (scheduler, _rx) = LocalScheduler::new();
        let g = graph(&["X", "Y"], &[("X", "Y")]);
        let _ = scheduler.submit(&g, "c-3").await.unwrap();

        assert!(scheduler.cancel(&BuildTaskId::new("Y")).await.unwrap());
        let x = scheduler.task(&BuildTaskId::new("X")).await.unwrap().unwrap();
        assert_eq!(x.state, State::Stopped);
        assert_eq!(x.stop_flag, StopFlag::Cancelled);

        // Finished and unknown tasks cannot be cancelled
        assert!(!scheduler.cancel(&BuildTaskId::new("Y")).await.unwrap());
        assert!(!scheduler.cancel(&BuildTaskId::new("nope")).await.unwrap());
    }

    #[tokio::test]
    async fn test_resubmission_conflicts() {
        let (scheduler, _rx) = LocalScheduler::new();
        let g = graph(&["X"], &[]);
        let _ = scheduler.submit(&g, "c-4").await.unwrap();
        let error = scheduler.submit(&g, "c-5").await.unwrap_err();
        assert!(error.is_conflict());
    }

    #[tokio::test]
    async fn test_completion_requires_running_task() {
        let (scheduler, _rx) = LocalScheduler::new();
        let g = graph(&["X", "Y"], &[("X", "Y")]);
        let _ = scheduler.submit(&g, "c-6").await.unwrap();

        assert!(matches!(
            scheduler.report_completion(&BuildTaskId::new("X"), true).await,
            Err(SchedulerError::InvalidState { .. })
        ));
        assert!(matches!(
            scheduler.report_completion(&BuildTaskId::new("W"), true).await,
            Err(SchedulerError::UnknownTask(_))
        ));
        assert_eq!(
            scheduler.tasks_by_correlation("c-6").await.unwrap().len(),
            2
        );
    }
}

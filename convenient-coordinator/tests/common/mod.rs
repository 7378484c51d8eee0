//! Shared fixtures for coordinator scenarios

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use convenient_coordinator::scheduler::SubmissionPlan;
use convenient_coordinator::{
    AlignmentPreference, BuildConfigRevision, BuildCoordinationStatus, BuildCoordinator,
    BuildGraph, BuildRecord, BuildRecordId, BuildStatus, BuildTask, BuildTaskId,
    ConfigId, CoordinatorConfig, Datastore, IdRev, InMemoryDatastore, LocalScheduler,
    RemoteScheduler, SchedulerError, SchedulerResult, TaskRef, TaskTransition, User,
};
use convenient_rex::{State, StopFlag};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub fn user() -> User {
    User::new(7, "builder")
}

/// First revision of a configuration
pub fn revision(id: u32, deps: &[u32]) -> BuildConfigRevision {
    BuildConfigRevision {
        id_rev: IdRev::new(id, 1),
        name: format!("config-{id}"),
        build_script: "mvn deploy".to_string(),
        scm_url: format!("https://git.example.com/config-{id}.git"),
        scm_revision: "main".to_string(),
        alignment_parameters: String::new(),
        build_type: "MVN".to_string(),
        dependencies: deps.iter().map(|d| ConfigId(*d)).collect(),
    }
}

/// Next revision of `revision`, pointing at another SCM revision
pub fn bumped(revision: &BuildConfigRevision, scm_revision: &str) -> BuildConfigRevision {
    BuildConfigRevision {
        id_rev: IdRev::new(revision.id_rev.id.0, revision.id_rev.rev + 1),
        scm_revision: scm_revision.to_string(),
        ..revision.clone()
    }
}

/// Successful persistent build of `revision`, finished `age_minutes` ago
pub fn record(
    id: &str,
    revision: &BuildConfigRevision,
    deps: &[(u32, &str)],
    age_minutes: i64,
) -> BuildRecord {
    let end_time = Utc::now() - ChronoDuration::minutes(age_minutes);
    BuildRecord {
        id: BuildRecordId::new(id),
        id_rev: revision.id_rev,
        status: BuildStatus::Success,
        temporary_build: false,
        alignment_preference: AlignmentPreference::default(),
        fingerprint: revision.fingerprint(),
        dependency_records: deps
            .iter()
            .map(|(config, record)| (ConfigId(*config), BuildRecordId::new(*record)))
            .collect::<BTreeMap<_, _>>(),
        no_rebuild_cause: None,
        set_record_id: None,
        user: User::new(0, "catalog"),
        submit_time: end_time,
        end_time,
        description: None,
    }
}

pub async fn seeded(revisions: &[BuildConfigRevision], records: Vec<BuildRecord>) -> Arc<InMemoryDatastore> {
    let store = Arc::new(InMemoryDatastore::new());
    for revision in revisions {
        store.insert_revision(revision.clone()).await;
    }
    for record in records {
        store.save_record(record).await.unwrap();
    }
    store
}

/// Coordinator wired to a store and a scheduler, with transitions pumped by
/// hand so every test step is deterministic.
pub struct Harness {
    pub store: Arc<InMemoryDatastore>,
    pub coordinator: BuildCoordinator,
    transitions: mpsc::UnboundedReceiver<TaskTransition>,
}

impl Harness {
    /// Against the in-process engine
    pub async fn local(revisions: &[BuildConfigRevision], records: Vec<BuildRecord>) -> Self {
        let store = seeded(revisions, records).await;
        let (scheduler, transitions) = LocalScheduler::new();
        Self::assemble(store, Arc::new(scheduler), transitions, CoordinatorConfig::default())
    }

    /// Against a scripted engine that never reports transitions
    pub async fn stub(
        revisions: &[BuildConfigRevision],
        records: Vec<BuildRecord>,
        scheduler: Arc<StubScheduler>,
        config: CoordinatorConfig,
    ) -> Self {
        let store = seeded(revisions, records).await;
        let (_events, transitions) = mpsc::unbounded_channel();
        Self::assemble(store, scheduler, transitions, config)
    }

    fn assemble(
        store: Arc<InMemoryDatastore>,
        scheduler: Arc<dyn RemoteScheduler>,
        transitions: mpsc::UnboundedReceiver<TaskTransition>,
        config: CoordinatorConfig,
    ) -> Self {
        let coordinator = BuildCoordinator::builder()
            .config(config)
            .datastore(store.clone())
            .scheduler(scheduler)
            .build()
            .unwrap();
        Self {
            store,
            coordinator,
            transitions,
        }
    }

    /// Wait for submissions and apply every transition reported so far.
    pub async fn settle(&mut self) {
        self.coordinator.drain_dispatches().await;
        while let Ok(transition) = self.transitions.try_recv() {
            self.coordinator.handle_transition(transition).await.unwrap();
        }
    }

    pub async fn task(&self, id: &BuildTaskId) -> BuildTask {
        self.store.task(id).await.unwrap().unwrap()
    }

    pub async fn status(&self, id: &BuildTaskId) -> BuildCoordinationStatus {
        self.task(id).await.status
    }

    pub async fn latest(&self, config: u32) -> BuildConfigRevision {
        self.store.latest_revision(ConfigId(config)).await.unwrap()
    }
}

/// Engine that records submissions and answers from a script
#[derive(Default)]
pub struct StubScheduler {
    pub submissions: Mutex<Vec<(String, Vec<BuildTaskId>)>>,
    /// Conflict responses to give before accepting
    pub conflicts: AtomicUsize,
    /// Reject every submission
    pub unavailable: bool,
    pub cancel_requests: Mutex<Vec<BuildTaskId>>,
}

impl StubScheduler {
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn conflicting(times: usize) -> Self {
        Self {
            conflicts: AtomicUsize::new(times),
            ..Self::default()
        }
    }

    pub fn submitted_tasks(&self) -> Vec<BuildTaskId> {
        self.submissions
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, ids)| ids.clone())
            .collect()
    }
}

#[async_trait]
impl RemoteScheduler for StubScheduler {
    fn name(&self) -> &str {
        "stub"
    }

    async fn submit(&self, graph: &BuildGraph, correlation_id: &str) -> SchedulerResult<Vec<TaskRef>> {
        if self.unavailable {
            return Err(SchedulerError::Remote("engine unavailable".to_string()));
        }
        if self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SchedulerError::Conflict(correlation_id.to_string()));
        }

        let plan = SubmissionPlan::from_graph(graph);
        let ids: Vec<BuildTaskId> = plan.tasks.iter().map(|t| t.id.clone()).collect();
        self.submissions
            .lock()
            .unwrap()
            .push((correlation_id.to_string(), ids.clone()));
        Ok(ids
            .into_iter()
            .map(|id| TaskRef {
                id,
                state: State::New,
                stop_flag: StopFlag::None,
                correlation_id: Some(correlation_id.to_string()),
            })
            .collect())
    }

    /// Only tasks it was given can be cancelled
    async fn cancel(&self, task_id: &BuildTaskId) -> SchedulerResult<bool> {
        self.cancel_requests.lock().unwrap().push(task_id.clone());
        Ok(self.submitted_tasks().contains(task_id))
    }

    async fn task(&self, _task_id: &BuildTaskId) -> SchedulerResult<Option<TaskRef>> {
        Ok(None)
    }

    async fn tasks_by_correlation(&self, _correlation_id: &str) -> SchedulerResult<Vec<TaskRef>> {
        Ok(Vec::new())
    }

    async fn report_completion(&self, _task_id: &BuildTaskId, _success: bool) -> SchedulerResult<()> {
        Ok(())
    }
}

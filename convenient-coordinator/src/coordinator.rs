//! Build coordinator
//!
//! Ties graph construction, validation, submission and status tracking
//! together. A trigger call builds and validates the graph under the build
//! lock, persists the new tasks and returns; submission to the engine runs on
//! a spawned task. From then on engine transitions and completion reports
//! move tasks through their lifecycle, and every terminal task re-derives its
//! batch.

use crate::completion::{self, BuildResult};
use crate::config::CoordinatorConfig;
use crate::datastore::Datastore;
use crate::error::{ConfigError, CoordinationError, CoordinationResult, StoreError};
use crate::graph_builder::{BuildGraph, GraphBuilder};
use crate::ids::TaskIdSequence;
use crate::model::{
    BuildConfigRevision, BuildConfigSetRecord, BuildOptions, BuildRecord, BuildTask, BuildTaskId,
    ConfigId, ConfigSetId, IdRev, SetRecordId, User,
};
use crate::notify::{Notifier, StatusChangedEvent};
use crate::rebuild::{ProcessedCache, RebuildOracle};
use crate::reconciler::{ReconcileSummary, Reconciler};
use crate::scheduler::{RemoteScheduler, TaskTransition, submit_with_retry};
use crate::status::{BuildCoordinationStatus, BuildStatus};
use crate::validation::{self, GraphRejection};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, MutexGuard, PoisonError};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// A validated graph that was not submitted
#[derive(Debug)]
pub struct BuildPlan {
    pub graph: BuildGraph,
    pub rejection: Option<GraphRejection>,
}

impl BuildPlan {
    pub fn is_accepted(&self) -> bool {
        self.rejection.is_none()
    }
}

/// What one trigger call produced
#[derive(Debug, Clone)]
pub struct BuildSetTask {
    /// Correlation id the graph was submitted under
    pub correlation_id: String,
    /// Batch record, for configuration set builds
    pub set_record_id: Option<SetRecordId>,
    pub rejection: Option<GraphRejection>,
    /// Every task of the graph, including reused running ones
    pub tasks: Vec<BuildTask>,
}

impl BuildSetTask {
    pub fn is_accepted(&self) -> bool {
        self.rejection.is_none()
    }

    pub fn task_for(&self, config: ConfigId) -> Option<&BuildTask> {
        self.tasks.iter().find(|t| t.config_id() == config)
    }

    /// Tasks handed to the engine by this call
    pub fn submitted(&self) -> impl Iterator<Item = &BuildTask> {
        let accepted = self.is_accepted();
        self.tasks
            .iter()
            .filter(move |t| accepted && t.needs_execution())
    }
}

/// Builder for [`BuildCoordinator`]
#[derive(Default)]
pub struct BuildCoordinatorBuilder {
    config: CoordinatorConfig,
    store: Option<Arc<dyn Datastore>>,
    scheduler: Option<Arc<dyn RemoteScheduler>>,
}

impl BuildCoordinatorBuilder {
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn datastore(mut self, store: Arc<dyn Datastore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn RemoteScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn build(self) -> CoordinationResult<BuildCoordinator> {
        self.config.validate()?;
        let store = self
            .store
            .ok_or_else(|| ConfigError::Invalid("a datastore is required".to_string()))?;
        let scheduler = self
            .scheduler
            .ok_or_else(|| ConfigError::Invalid("a scheduler is required".to_string()))?;

        let notifier = Notifier::new(self.config.notification_capacity);
        let reconciler = Reconciler::new(store.clone(), scheduler.clone(), notifier.clone());
        info!("Build coordinator using scheduler '{}'", scheduler.name());

        Ok(BuildCoordinator {
            inner: Arc::new(Inner {
                ids: TaskIdSequence::starting_at(self.config.first_task_id),
                config: self.config,
                store,
                scheduler,
                notifier,
                reconciler,
                build_lock: Mutex::new(()),
                status_lock: Mutex::new(()),
                dispatches: std::sync::Mutex::new(JoinSet::new()),
                cancel_monitors: std::sync::Mutex::new(HashMap::new()),
            }),
        })
    }
}

struct Inner {
    config: CoordinatorConfig,
    store: Arc<dyn Datastore>,
    scheduler: Arc<dyn RemoteScheduler>,
    notifier: Notifier,
    reconciler: Reconciler,
    ids: TaskIdSequence,

    /// Serializes trigger calls
    build_lock: Mutex<()>,

    /// Serializes read-modify-write of task status
    status_lock: Mutex<()>,

    /// Submissions still in flight
    dispatches: std::sync::Mutex<JoinSet<()>>,

    /// Pending cancellation timeouts by task
    cancel_monitors: std::sync::Mutex<HashMap<BuildTaskId, AbortHandle>>,
}

/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct BuildCoordinator {
    inner: Arc<Inner>,
}

impl BuildCoordinator {
    pub fn builder() -> BuildCoordinatorBuilder {
        BuildCoordinatorBuilder::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChangedEvent> {
        self.inner.notifier.subscribe()
    }

    pub fn datastore(&self) -> &Arc<dyn Datastore> {
        &self.inner.store
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.inner.reconciler
    }

    pub async fn task(&self, id: &BuildTaskId) -> CoordinationResult<Option<BuildTask>> {
        Ok(self.inner.store.task(id).await?)
    }

    /// Graph and verdict for a single configuration, without side effects
    /// beyond allocating task ids.
    pub async fn plan_config(
        &self,
        revision: BuildConfigRevision,
        options: BuildOptions,
        user: &User,
    ) -> CoordinationResult<BuildPlan> {
        let _guard = self.inner.build_lock.lock().await;
        let graph = self.graph_for_config(revision, options, user).await?;
        let rejection = validation::validate(&graph, &options)?;
        Ok(BuildPlan { graph, rejection })
    }

    /// Like [`plan_config`](Self::plan_config) for a configuration set.
    pub async fn plan_set(
        &self,
        set_id: ConfigSetId,
        pinned: &BTreeMap<ConfigId, IdRev>,
        options: BuildOptions,
        user: &User,
    ) -> CoordinationResult<BuildPlan> {
        let _guard = self.inner.build_lock.lock().await;
        let graph = self.graph_for_set(set_id, pinned, options, user).await?;
        let rejection = validation::validate(&graph, &options)?;
        Ok(BuildPlan { graph, rejection })
    }

    /// Build one configuration revision and whatever of its dependency tree
    /// needs building.
    ///
    /// A rejected graph is not an error: the returned value carries the
    /// rejection and the tasks end in the matching terminal status. An
    /// already running task that depends on something that has to be
    /// rebuilt is a [`CoordinationError::BuildConflict`].
    #[instrument(skip_all, fields(config = %revision.id_rev, user = %user.username))]
    pub async fn build_config(
        &self,
        revision: BuildConfigRevision,
        options: BuildOptions,
        user: User,
    ) -> CoordinationResult<BuildSetTask> {
        let _guard = self.inner.build_lock.lock().await;
        info!("Build of {} ({}) requested", revision.name, revision.id_rev);

        let graph = self.graph_for_config(revision, options, &user).await?;
        let rejection = validation::validate(&graph, &options)?;
        let correlation_id = Uuid::new_v4().to_string();
        self.accept_or_reject(graph, rejection, correlation_id, None)
            .await
    }

    /// Build every member of a configuration set as one batch.
    #[instrument(skip_all, fields(set = %set_id, user = %user.username))]
    pub async fn build_set(
        &self,
        set_id: ConfigSetId,
        pinned: &BTreeMap<ConfigId, IdRev>,
        options: BuildOptions,
        user: User,
    ) -> CoordinationResult<BuildSetTask> {
        let _guard = self.inner.build_lock.lock().await;
        info!("Build of configuration set {} requested", set_id);

        let graph = self.graph_for_set(set_id, pinned, options, &user).await?;
        let rejection = validation::validate(&graph, &options)?;

        let set_record_id = self.inner.store.next_set_record_id().await?;
        let start_time = Utc::now();
        let mut batch = BuildConfigSetRecord {
            id: set_record_id,
            config_set_id: set_id,
            status: BuildStatus::Building,
            description: None,
            temporary_build: options.temporary_build,
            user,
            correlation_id: set_record_id.to_string(),
            start_time,
            end_time: None,
            build_record_ids: BTreeSet::new(),
        };
        if let Some(rejection) = &rejection {
            batch.status = rejection.status().to_build_status();
            batch.description = Some(rejection.to_string());
            batch.end_time = Some(start_time);
        }
        self.inner.store.save_set_record(batch.clone()).await?;
        let _ = self.inner.notifier.set_changed(&batch, BuildStatus::New);

        self.accept_or_reject(graph, rejection, batch.correlation_id, Some(set_record_id))
            .await
    }

    async fn graph_for_config(
        &self,
        revision: BuildConfigRevision,
        options: BuildOptions,
        user: &User,
    ) -> CoordinationResult<BuildGraph> {
        let submitted = self.inner.store.unfinished_tasks().await?;
        GraphBuilder::new(&*self.inner.store, &self.inner.ids)
            .build_for_config(revision, options, user, &submitted)
            .await
    }

    async fn graph_for_set(
        &self,
        set_id: ConfigSetId,
        pinned: &BTreeMap<ConfigId, IdRev>,
        options: BuildOptions,
        user: &User,
    ) -> CoordinationResult<BuildGraph> {
        let set = self.inner.store.config_set(set_id).await?;
        let submitted = self.inner.store.unfinished_tasks().await?;
        GraphBuilder::new(&*self.inner.store, &self.inner.ids)
            .build_for_set(&set, pinned, options, user, &submitted)
            .await
    }

    /// Persist the graph's new tasks and either finish them as rejected or
    /// hand the graph to the engine.
    async fn accept_or_reject(
        &self,
        graph: BuildGraph,
        rejection: Option<GraphRejection>,
        correlation_id: String,
        set_record_id: Option<SetRecordId>,
    ) -> CoordinationResult<BuildSetTask> {
        let mut tasks = Vec::with_capacity(graph.vertex_count());
        let mut executable = Vec::new();

        for (_, task) in graph.vertices() {
            if task.already_running {
                debug!("Task {} of {} is already running", task.id, task.id_rev());
                tasks.push(task.clone());
                continue;
            }

            let mut task = task.clone();
            task.set_record_id = set_record_id;
            task.correlation_id = Some(correlation_id.clone());

            let outcome = match (&rejection, &task.no_rebuild_cause) {
                (Some(rejection), _) => Some((rejection.status(), rejection.to_string())),
                (None, Some(cause)) => Some((
                    BuildCoordinationStatus::RejectedAlreadyBuilt,
                    format!("No rebuild required, reusing build {cause}"),
                )),
                (None, None) => None,
            };

            let task = match outcome {
                Some((status, description)) => self.apply(task, status, Some(description)).await?,
                None => {
                    self.inner.store.save_task(task.clone()).await?;
                    executable.push(task.id.clone());
                    task
                }
            };
            tasks.push(task);
        }

        match &rejection {
            Some(rejection) => warn!("Build {} rejected: {}", correlation_id, rejection),
            None if executable.is_empty() => {
                info!("Build {} accepted, nothing to submit", correlation_id);
                self.reconcile_batch(set_record_id).await;
            }
            None => {
                info!(
                    "Build {} accepted, submitting {} tasks",
                    correlation_id,
                    executable.len()
                );
                self.spawn_dispatch(graph, correlation_id.clone(), set_record_id, executable);
            }
        }

        Ok(BuildSetTask {
            correlation_id,
            set_record_id,
            rejection,
            tasks,
        })
    }

    fn spawn_dispatch(
        &self,
        graph: BuildGraph,
        correlation_id: String,
        set_record_id: Option<SetRecordId>,
        submitted: Vec<BuildTaskId>,
    ) {
        let coordinator = self.clone();
        let _ = self.dispatches().spawn(async move {
            coordinator
                .dispatch(graph, correlation_id, set_record_id, submitted)
                .await
        });
    }

    async fn dispatch(
        &self,
        mut graph: BuildGraph,
        correlation_id: String,
        set_record_id: Option<SetRecordId>,
        submitted: Vec<BuildTaskId>,
    ) {
        let scheduler = &*self.inner.scheduler;
        let correlation = correlation_id.as_str();

        // Held across submission so a cancellation either sees the task at
        // the engine or finishes it before it is withdrawn here
        let status_guard = self.inner.status_lock.lock().await;
        let withdrawn = match self.withdraw_finished(&mut graph, &submitted).await {
            Ok(withdrawn) => withdrawn,
            Err(e) => {
                warn!("Could not check tasks of {} before submission: {}", correlation_id, e);
                BTreeSet::new()
            }
        };
        let result = if withdrawn.len() < submitted.len() {
            let graph = &graph;
            Some(
                submit_with_retry(&self.inner.config.submit_retry, correlation, move || {
                    scheduler.submit(graph, correlation)
                })
                .await,
            )
        } else {
            None
        };
        drop(status_guard);

        match result {
            None => {
                info!("Nothing of graph {} left to submit", correlation_id);
                self.reconcile_batch(set_record_id).await;
            }
            Some(Ok(refs)) => {
                info!(
                    "Graph {} submitted to {} ({} tasks)",
                    correlation_id,
                    scheduler.name(),
                    refs.len()
                );
                if !withdrawn.is_empty() {
                    self.reconcile_batch(set_record_id).await;
                }
            }
            Some(Err(e)) => {
                error!("Scheduling graph {} failed: {}", correlation_id, e);
                let description = format!("Scheduling failed: {e}");
                for id in submitted.iter().filter(|id| !withdrawn.contains(*id)) {
                    let update = self
                        .update_status(id, BuildCoordinationStatus::SystemError, Some(description.clone()))
                        .await;
                    if let Err(e) = update {
                        warn!("Could not mark task {} as failed: {}", id, e);
                    }
                }
                self.reconcile_batch(set_record_id).await;
            }
        }
    }

    /// Take tasks that finished before submission (a cancellation that
    /// reached them first) out of `graph`, and stop their dependants in it.
    ///
    /// The caller holds the status lock. Returns the ids left out.
    async fn withdraw_finished(
        &self,
        graph: &mut BuildGraph,
        submitted: &[BuildTaskId],
    ) -> CoordinationResult<BTreeSet<BuildTaskId>> {
        let pending: BTreeSet<&BuildTaskId> = submitted.iter().collect();
        let mut queue = VecDeque::new();
        for id in submitted {
            if let Some(task) = self.inner.store.task(id).await? {
                if task.is_finished() {
                    queue.push_back(task);
                }
            }
        }

        let mut withdrawn: BTreeSet<BuildTaskId> = queue.iter().map(|t| t.id.clone()).collect();
        while let Some(task) = queue.pop_front() {
            debug!("Task {} is {} before submission, withdrawn", task.id, task.status);
            let dependants: Vec<BuildTaskId> = graph
                .dependants(&task.id)?
                .iter()
                .filter(|d| pending.contains(d) && !withdrawn.contains(*d))
                .cloned()
                .collect();

            for id in dependants {
                let _ = withdrawn.insert(id.clone());
                let Some(dependant) = self.inner.store.task(&id).await? else {
                    continue;
                };
                let dependant = if dependant.is_finished() {
                    dependant
                } else if task.status == BuildCoordinationStatus::Cancelled {
                    let description = format!("Dependency {} was cancelled", task.id);
                    self.apply(dependant, BuildCoordinationStatus::Cancelled, Some(description))
                        .await?
                } else {
                    let description = format!("Dependency {} did not succeed", task.id);
                    self.apply(
                        dependant,
                        BuildCoordinationStatus::RejectedFailedDependencies,
                        Some(description),
                    )
                    .await?
                };
                queue.push_back(dependant);
            }

            if let Some(vertex) = graph.vertex_mut(&task.id) {
                *vertex = task;
            }
        }
        Ok(withdrawn)
    }

    /// Wait until every pending submission finished.
    pub async fn drain_dispatches(&self) {
        loop {
            let mut pending = std::mem::take(&mut *self.dispatches());
            if pending.is_empty() {
                break;
            }
            while let Some(joined) = pending.join_next().await {
                if let Err(e) = joined {
                    error!("Dispatch task failed: {}", e);
                }
            }
        }
    }

    /// Apply a state change reported by the engine.
    ///
    /// Changes the lifecycle does not allow (a late report for a task that
    /// already finished, for instance) are ignored.
    pub async fn handle_transition(&self, transition: TaskTransition) -> CoordinationResult<()> {
        let status = transition.status();
        let description = match status {
            BuildCoordinationStatus::RejectedFailedDependencies => {
                Some("A dependency failed".to_string())
            }
            BuildCoordinationStatus::Cancelled => Some("Build cancelled".to_string()),
            BuildCoordinationStatus::SystemError => {
                Some(format!("Engine reported {}", transition.after))
            }
            _ => None,
        };

        match self
            .update_status(&transition.task_id, status, description)
            .await
        {
            Ok(task) => {
                if status.is_final() {
                    self.reconcile_batch(task.set_record_id).await;
                }
                Ok(())
            }
            Err(CoordinationError::InvalidTransition { task, from, to }) => {
                debug!("Ignoring engine transition of {}: {} -> {}", task, from, to);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Record the outcome of a build and release (or stop) its dependants.
    #[instrument(skip(self, result), fields(task = %task_id))]
    pub async fn complete_build(
        &self,
        task_id: &BuildTaskId,
        result: BuildResult,
    ) -> CoordinationResult<BuildTask> {
        let (status, description) = completion::classify(task_id, &result);
        let task = self.update_status(task_id, status, description).await?;
        info!("Build {} of {} finished: {}", task.id, task.id_rev(), task.status);

        let success = status.to_build_status().completed_successfully();
        if let Err(e) = self
            .inner
            .scheduler
            .report_completion(task_id, success)
            .await
        {
            warn!(
                "Could not report completion of {} to {}: {}",
                task_id,
                self.inner.scheduler.name(),
                e
            );
        }

        self.reconcile_batch(task.set_record_id).await;
        Ok(task)
    }

    /// Request cancellation of a task.
    ///
    /// Returns `false` if the task is unknown or already finished. If the
    /// engine does not confirm within the configured timeout the task is
    /// cancelled locally.
    pub async fn cancel(&self, task_id: &BuildTaskId) -> CoordinationResult<bool> {
        // Serialized with submission: the engine either already has the task
        // or it is finished here before the dispatch looks at it
        let status_guard = self.inner.status_lock.lock().await;
        let Some(task) = self.inner.store.task(task_id).await? else {
            return Ok(false);
        };
        if task.is_finished() {
            return Ok(false);
        }

        self.start_cancel_monitor(task_id.clone());
        let requested = match self.inner.scheduler.cancel(task_id).await {
            Ok(requested) => requested,
            Err(e) => {
                self.stop_cancel_monitor(task_id);
                return Err(e.into());
            }
        };
        if requested {
            info!("Cancellation of {} requested", task_id);
            return Ok(true);
        }

        // The engine never saw it
        self.stop_cancel_monitor(task_id);
        let task = self
            .apply(
                task,
                BuildCoordinationStatus::Cancelled,
                Some("Cancelled before execution".to_string()),
            )
            .await?;
        drop(status_guard);

        self.reconcile_batch(task.set_record_id).await;
        Ok(true)
    }

    /// Cancel every unfinished task of a batch and mark the batch cancelled.
    pub async fn cancel_set(&self, id: SetRecordId) -> CoordinationResult<bool> {
        let batch = self
            .inner
            .store
            .set_record(id)
            .await?
            .ok_or_else(|| StoreError::not_found("Build config set record", id))?;
        if batch.is_finished() {
            return Ok(false);
        }

        let members = self.inner.store.unfinished_tasks().await?;
        for task in members.iter().filter(|t| t.set_record_id == Some(id)) {
            let _ = self.cancel(&task.id).await?;
        }
        self.inner.reconciler.cancel_set(id).await
    }

    /// Feed engine transitions into the coordinator until the stream closes.
    pub fn listen(&self, mut transitions: mpsc::UnboundedReceiver<TaskTransition>) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            while let Some(transition) = transitions.recv().await {
                let id = transition.task_id.clone();
                if let Err(e) = coordinator.handle_transition(transition).await {
                    warn!("Transition of {} not applied: {}", id, e);
                }
            }
            debug!("Transition stream closed");
        })
    }

    /// Run the reconciler on the configured interval until `shutdown` fires.
    pub fn spawn_reconciler(&self, shutdown: mpsc::Receiver<()>) -> JoinHandle<ReconcileSummary> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let interval = coordinator.inner.config.reconcile_interval;
            coordinator.inner.reconciler.run(interval, shutdown).await
        })
    }

    async fn update_status(
        &self,
        id: &BuildTaskId,
        status: BuildCoordinationStatus,
        description: Option<String>,
    ) -> CoordinationResult<BuildTask> {
        let _status = self.inner.status_lock.lock().await;
        let task = self
            .inner
            .store
            .task(id)
            .await?
            .ok_or_else(|| CoordinationError::UnknownTask(id.clone()))?;
        self.apply(task, status, description).await
    }

    /// Move a task to `status`, persist it (and its record once final) and
    /// notify listeners.
    async fn apply(
        &self,
        mut task: BuildTask,
        status: BuildCoordinationStatus,
        description: Option<String>,
    ) -> CoordinationResult<BuildTask> {
        let old = task.status;
        if !old.can_transition_to(status) {
            return Err(CoordinationError::InvalidTransition {
                task: task.id.clone(),
                from: old,
                to: status,
            });
        }
        if old == status {
            return Ok(task);
        }

        let now = Utc::now();
        task.status = status;
        if description.is_some() {
            task.status_description = description;
        }
        if status == BuildCoordinationStatus::Building && task.start_time.is_none() {
            task.start_time = Some(now);
        }
        if status.is_final() {
            task.end_time = Some(now);
        }
        self.inner.store.save_task(task.clone()).await?;

        if status.is_final() {
            let record = self.record_for(&task).await?;
            self.inner.store.save_record(record).await?;
            self.stop_cancel_monitor(&task.id);
            info!("Task {} of {}: {} -> {}", task.id, task.id_rev(), old, status);
        } else {
            debug!("Task {} of {}: {} -> {}", task.id, task.id_rev(), old, status);
        }

        let _ = self.inner.notifier.task_changed(&task, old);
        Ok(task)
    }

    /// Build record for a finished task. Each direct dependency maps to the
    /// build it was produced against.
    async fn record_for(&self, task: &BuildTask) -> CoordinationResult<BuildRecord> {
        let mut dependency_records = BTreeMap::new();
        for dep in &task.dependencies {
            let Some(dep) = self.inner.store.task(dep).await? else {
                continue;
            };
            let used = match dep.status {
                BuildCoordinationStatus::Done => Some(dep.id.clone()),
                BuildCoordinationStatus::RejectedAlreadyBuilt => dep.no_rebuild_cause.clone(),
                _ => None,
            };
            if let Some(used) = used {
                let _ = dependency_records.insert(dep.config_id(), used);
            }
        }
        let oracle = RebuildOracle::new(&*self.inner.store);
        let mut cache = ProcessedCache::new();
        for config in &task.revision.dependencies {
            if dependency_records.contains_key(config) {
                continue;
            }
            if let Some(latest) = oracle
                .select_record(
                    *config,
                    task.options.temporary_build,
                    task.options.alignment_preference,
                    &mut cache,
                )
                .await?
            {
                let _ = dependency_records.insert(*config, latest.id);
            }
        }

        Ok(BuildRecord {
            id: task.id.clone(),
            id_rev: task.id_rev(),
            status: task.status.to_build_status(),
            temporary_build: task.options.temporary_build,
            alignment_preference: task.options.alignment_preference,
            fingerprint: task.revision.fingerprint(),
            dependency_records,
            no_rebuild_cause: task.no_rebuild_cause.clone(),
            set_record_id: task.set_record_id,
            user: task.user.clone(),
            submit_time: task.submit_time,
            end_time: task.end_time.unwrap_or_else(Utc::now),
            description: task.status_description.clone(),
        })
    }

    async fn reconcile_batch(&self, id: Option<SetRecordId>) {
        let Some(id) = id else {
            return;
        };
        if let Err(e) = self.inner.reconciler.reconcile_set(id).await {
            warn!("Reconciling build set {} failed: {}", id, e);
        }
    }

    fn start_cancel_monitor(&self, task_id: BuildTaskId) {
        let coordinator = self.clone();
        let timeout = self.inner.config.cancel_timeout;
        let id = task_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // Deregister first so finishing the task does not abort us
            let _ = coordinator.cancel_monitors().remove(&id);
            coordinator.force_cancel(&id).await;
        });

        if let Some(previous) = self
            .cancel_monitors()
            .insert(task_id, handle.abort_handle())
        {
            previous.abort();
        }
    }

    fn stop_cancel_monitor(&self, task_id: &BuildTaskId) {
        if let Some(monitor) = self.cancel_monitors().remove(task_id) {
            monitor.abort();
            debug!("Cancellation monitor of {} stopped", task_id);
        }
    }

    async fn force_cancel(&self, id: &BuildTaskId) {
        match self.inner.store.task(id).await {
            Ok(Some(task)) if !task.is_finished() => {}
            Ok(_) => return,
            Err(e) => {
                error!("Cannot load task {} after cancellation timeout: {}", id, e);
                return;
            }
        }

        let description = format!(
            "Cancellation not confirmed within {:?}, cancelled locally",
            self.inner.config.cancel_timeout
        );
        match self
            .update_status(id, BuildCoordinationStatus::Cancelled, Some(description))
            .await
        {
            Ok(task) => {
                warn!("Cancellation of {} timed out, marked {}", id, task.status);
                self.reconcile_batch(task.set_record_id).await;
            }
            Err(CoordinationError::InvalidTransition { .. }) => {
                debug!("Task {} finished before the cancellation timeout", id);
            }
            Err(e) => error!("Forcing cancellation of {} failed: {}", id, e),
        }
    }

    fn dispatches(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.inner
            .dispatches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_monitors(&self) -> MutexGuard<'_, HashMap<BuildTaskId, AbortHandle>> {
        self.inner
            .cancel_monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

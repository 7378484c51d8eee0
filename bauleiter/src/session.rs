//! A coordinator over a catalog-backed datastore
//!
//! With the local engine the session also plays the build workers: every
//! task that starts is completed right away, successfully unless its
//! configuration was marked as failing.

use crate::error::{CommandError, CommandResult};
use convenient_coordinator::scheduler::{self, SchedulerHandle};
use convenient_coordinator::{
    BuildCoordinationStatus, BuildCoordinator, BuildResult, BuildSetTask, BuildTask, BuildTaskId,
    Catalog, ConfigId, CoordinatorConfig, Datastore, InMemoryDatastore, StatusChangedEvent,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct Session {
    pub store: Arc<InMemoryDatastore>,
    pub coordinator: BuildCoordinator,
    listener: Option<JoinHandle<()>>,
}

impl Session {
    /// Load configuration and catalog from disk.
    pub fn open(config: Option<&Path>, catalog: &Path) -> CommandResult<Self> {
        let config = match config {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                CoordinatorConfig::from_file(path)?
            }
            None => CoordinatorConfig::default(),
        };
        info!("Loading catalog from {}", catalog.display());
        let catalog = Catalog::from_file(catalog)?;
        Self::new(config, catalog)
    }

    /// Must be called from within a tokio runtime.
    pub fn new(config: CoordinatorConfig, catalog: Catalog) -> CommandResult<Self> {
        debug!(
            "Catalog: {} revisions, {} sets, {} builds",
            catalog.configurations.len(),
            catalog.sets.len(),
            catalog.records.len()
        );
        let store = Arc::new(InMemoryDatastore::from_catalog(catalog)?);
        let SchedulerHandle {
            scheduler,
            transitions,
        } = scheduler::connect(&config.scheduler)?;
        let name = scheduler.name().to_string();

        let coordinator = BuildCoordinator::builder()
            .config(config)
            .datastore(store.clone())
            .scheduler(scheduler)
            .build()?;
        let listener = transitions.map(|rx| coordinator.listen(rx));
        info!("Coordinator ready, engine {}", name);

        Ok(Self {
            store,
            coordinator,
            listener,
        })
    }

    /// Whether builds run in this process
    pub fn runs_builds(&self) -> bool {
        self.listener.is_some()
    }

    /// Drive the tasks of `outcome` to a final status.
    ///
    /// `events` must have been subscribed before the build was triggered.
    /// Returns the tasks as they ended.
    pub async fn run(
        &self,
        outcome: &BuildSetTask,
        mut events: broadcast::Receiver<StatusChangedEvent>,
        failing: &BTreeSet<ConfigId>,
        idle: Duration,
    ) -> CommandResult<Vec<BuildTask>> {
        let mut pending: BTreeSet<BuildTaskId> = outcome
            .tasks
            .iter()
            .filter(|t| !t.is_finished())
            .map(|t| t.id.clone())
            .collect();
        let mut completed = BTreeSet::new();

        loop {
            self.step(&mut pending, &mut completed, failing).await?;
            if pending.is_empty() {
                break;
            }
            match tokio::time::timeout(idle, events.recv()).await {
                Ok(Ok(_) | Err(RecvError::Lagged(_))) => {}
                Ok(Err(RecvError::Closed)) | Err(_) => {
                    // One last look before giving up
                    self.step(&mut pending, &mut completed, failing).await?;
                    if pending.is_empty() {
                        break;
                    }
                    return Err(CommandError::Stalled {
                        pending: pending.len(),
                        idle,
                    });
                }
            }
        }

        if let Some(id) = outcome.set_record_id {
            let _ = self.coordinator.reconciler().reconcile_set(id).await?;
        }

        let mut finished = Vec::with_capacity(outcome.tasks.len());
        for task in &outcome.tasks {
            match self.coordinator.task(&task.id).await? {
                Some(task) => finished.push(task),
                None => finished.push(task.clone()),
            }
        }
        Ok(finished)
    }

    /// Complete every pending task that started and forget the finished ones.
    async fn step(
        &self,
        pending: &mut BTreeSet<BuildTaskId>,
        completed: &mut BTreeSet<BuildTaskId>,
        failing: &BTreeSet<ConfigId>,
    ) -> CommandResult<()> {
        let mut finished = Vec::new();
        for id in pending.iter() {
            let Some(task) = self.store.task(id).await? else {
                continue;
            };
            if task.is_finished() {
                finished.push(task.id);
                continue;
            }
            if task.status != BuildCoordinationStatus::Building || completed.contains(&task.id) {
                continue;
            }

            let result = if failing.contains(&task.config_id()) {
                BuildResult::build_failed(format!("{} failed on request", task.revision.name))
            } else {
                BuildResult::success()
            };
            debug!("Completing {} ({})", task.id, task.revision.name);
            match self.coordinator.complete_build(&task.id, result).await {
                Ok(task) => finished.push(task.id),
                Err(e) => warn!("Completing {} failed: {}", task.id, e),
            }
            let _ = completed.insert(task.id);
        }
        for id in finished {
            let _ = pending.remove(&id);
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

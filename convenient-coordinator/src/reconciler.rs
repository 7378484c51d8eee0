//! Batch status reconciliation
//!
//! A batch's status is derived from what is known about its members: build
//! records already persisted, the engine's view of tasks still in flight, and
//! tasks the engine has not seen yet. Passes are serialized so concurrent
//! callers never interleave their read-modify-write of a set record.

use crate::datastore::Datastore;
use crate::error::{CoordinationResult, StoreError};
use crate::model::{BuildRecordId, BuildTaskId, SetRecordId};
use crate::notify::Notifier;
use crate::scheduler::RemoteScheduler;
use crate::status::BuildStatus;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Outcome of one or more passes
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Batches looked at
    pub examined: usize,
    /// Batches whose status changed
    pub updated: usize,
    /// Batches that could not be reconciled
    pub failed: usize,
}

impl ReconcileSummary {
    fn absorb(&mut self, other: ReconcileSummary) {
        self.examined += other.examined;
        self.updated += other.updated;
        self.failed += other.failed;
    }
}

pub struct Reconciler {
    store: Arc<dyn Datastore>,
    scheduler: Arc<dyn RemoteScheduler>,
    notifier: Notifier,
    pass: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Datastore>,
        scheduler: Arc<dyn RemoteScheduler>,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            scheduler,
            notifier,
            pass: Mutex::new(()),
        }
    }

    /// Reconcile every batch that is still in progress.
    pub async fn reconcile(&self) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let batches = match self.store.set_records_in_progress().await {
            Ok(batches) => batches,
            Err(e) => {
                error!("Cannot list build sets in progress: {}", e);
                summary.failed += 1;
                return summary;
            }
        };

        for batch in batches {
            summary.examined += 1;
            match self.reconcile_set(batch.id).await {
                Ok(Some(_)) => summary.updated += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!("Reconciling build set {} failed: {}", batch.id, e);
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    /// Re-derive one batch. Returns the new status if it changed.
    pub async fn reconcile_set(&self, id: SetRecordId) -> CoordinationResult<Option<BuildStatus>> {
        let _pass = self.pass.lock().await;

        let mut batch = self
            .store
            .set_record(id)
            .await?
            .ok_or_else(|| StoreError::not_found("Build config set record", id))?;
        if batch.is_finished() {
            return Ok(None);
        }

        let records = self.store.records_for_set(id).await?;
        let refs = self
            .scheduler
            .tasks_by_correlation(&batch.correlation_id)
            .await?;
        let pending = self.store.unfinished_tasks().await?;

        let record_ids: BTreeSet<BuildRecordId> = records.iter().map(|r| r.id.clone()).collect();
        let mut seen: BTreeSet<BuildTaskId> = record_ids.clone();
        let mut statuses: Vec<BuildStatus> = records.iter().map(|r| r.status).collect();
        for task in refs {
            if seen.insert(task.id.clone()) {
                statuses.push(task.build_status());
            }
        }
        // Accepted but not yet handed to the engine
        for task in pending.iter().filter(|t| t.set_record_id == Some(id)) {
            if seen.insert(task.id.clone()) {
                statuses.push(task.status.to_build_status());
            }
        }

        let old = batch.status;
        let (status, description) = match BuildStatus::aggregate(statuses) {
            Some(status) => (status, batch.description.clone()),
            None => {
                error!(
                    "Build set {} (correlation {}) has neither tasks nor records",
                    id, batch.correlation_id
                );
                (
                    BuildStatus::Rejected,
                    Some("No tasks or build records found for build set".to_string()),
                )
            }
        };

        if status == old && record_ids == batch.build_record_ids {
            debug!("Build set {} unchanged ({})", id, old);
            return Ok(None);
        }

        batch.status = status;
        batch.description = description;
        batch.build_record_ids = record_ids;
        if status.is_final() {
            batch.end_time = Some(Utc::now());
        }
        self.store.save_set_record(batch.clone()).await?;
        let _ = self.notifier.set_changed(&batch, old);

        if status == old {
            return Ok(None);
        }
        info!("Build set {} {} -> {}", id, old, status);
        Ok(Some(status))
    }

    /// Mark a batch cancelled. Returns `false` if it had already finished.
    pub async fn cancel_set(&self, id: SetRecordId) -> CoordinationResult<bool> {
        let _pass = self.pass.lock().await;

        let mut batch = self
            .store
            .set_record(id)
            .await?
            .ok_or_else(|| StoreError::not_found("Build config set record", id))?;
        if batch.is_finished() {
            return Ok(false);
        }

        let old = batch.status;
        batch.status = BuildStatus::Cancelled;
        batch.description = Some("Build set cancelled".to_string());
        batch.end_time = Some(Utc::now());
        self.store.save_set_record(batch.clone()).await?;
        let _ = self.notifier.set_changed(&batch, old);
        info!("Build set {} cancelled", id);
        Ok(true)
    }

    /// Reconcile on a fixed interval until `shutdown` fires or its sender is
    /// dropped.
    pub async fn run(&self, period: Duration, mut shutdown: mpsc::Receiver<()>) -> ReconcileSummary {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut total = ReconcileSummary::default();

        info!("Reconciler started, interval {:?}", period);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Reconciler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let pass = self.reconcile().await;
                    if pass.examined > 0 {
                        debug!(
                            "Reconcile pass: {} examined, {} updated, {} failed",
                            pass.examined, pass.updated, pass.failed
                        );
                    }
                    total.absorb(pass);
                }
            }
        }
        total
    }
}

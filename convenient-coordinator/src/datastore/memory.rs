//! In-memory datastore, seeded programmatically or from a YAML catalog

use super::Datastore;
use crate::error::{StoreError, StoreResult};
use crate::model::{
    AlignmentPreference, BuildConfigRevision, BuildConfigSetRecord, BuildConfigurationSet,
    BuildRecord, BuildRecordId, BuildTask, BuildTaskId, ConfigId, ConfigSetId, IdRev,
    SetRecordId, User,
};
use crate::status::BuildStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::debug;

/// A build that happened before the coordinator started
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorBuild {
    pub id: BuildRecordId,
    pub id_rev: IdRev,
    #[serde(default)]
    pub temporary_build: bool,
    /// Defaults to the fingerprint of `id_rev` as listed in the catalog
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub dependency_records: BTreeMap<ConfigId, BuildRecordId>,
    #[serde(default = "PriorBuild::default_status")]
    pub status: BuildStatus,
    pub end_time: DateTime<Utc>,
}

impl PriorBuild {
    fn default_status() -> BuildStatus {
        BuildStatus::Success
    }
}

/// Seed data for [`InMemoryDatastore`]
///
/// ```yaml
/// configurations:
///   - id_rev: { id: 1, rev: 1 }
///     name: app
///     build_script: mvn deploy
///     scm_url: https://git.example.com/app.git
///     scm_revision: main
///     dependencies: [2]
/// sets:
///   - id: 10
///     name: product
///     members: [1, 2]
/// records:
///   - id: AAAAAAAAAAAAC
///     id_rev: { id: 2, rev: 1 }
///     end_time: 2024-03-01T10:00:00Z
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Catalog {
    pub configurations: Vec<BuildConfigRevision>,
    pub sets: Vec<BuildConfigurationSet>,
    pub records: Vec<PriorBuild>,
}

impl Catalog {
    pub fn from_file(path: impl AsRef<Path>) -> StoreResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_yaml::from_str(&content)?)
    }
}

#[derive(Debug, Default)]
struct Inner {
    revisions: BTreeMap<ConfigId, BTreeMap<u32, BuildConfigRevision>>,
    sets: BTreeMap<ConfigSetId, BuildConfigurationSet>,
    records: BTreeMap<BuildRecordId, BuildRecord>,
    tasks: BTreeMap<BuildTaskId, BuildTask>,
    set_records: BTreeMap<SetRecordId, BuildConfigSetRecord>,
    last_set_record: u64,
}

impl Inner {
    fn insert_revision(&mut self, revision: BuildConfigRevision) {
        let _ = self
            .revisions
            .entry(revision.config_id())
            .or_default()
            .insert(revision.id_rev.rev, revision);
    }

    fn find_revision(&self, id_rev: IdRev) -> Option<&BuildConfigRevision> {
        self.revisions.get(&id_rev.id)?.get(&id_rev.rev)
    }
}

/// [`Datastore`] backed by ordered maps behind a `tokio` read-write lock
#[derive(Debug, Default)]
pub struct InMemoryDatastore {
    inner: RwLock<Inner>,
}

impl InMemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a datastore from a catalog, checking that every referenced
    /// configuration exists.
    pub fn from_catalog(catalog: Catalog) -> StoreResult<Self> {
        let mut inner = Inner::default();
        for revision in catalog.configurations {
            if inner.find_revision(revision.id_rev).is_some() {
                return Err(StoreError::InvalidCatalog(format!(
                    "duplicate revision {}",
                    revision.id_rev
                )));
            }
            inner.insert_revision(revision);
        }

        for (id, revisions) in &inner.revisions {
            for revision in revisions.values() {
                if let Some(missing) = revision
                    .dependencies
                    .iter()
                    .find(|dep| !inner.revisions.contains_key(dep))
                {
                    return Err(StoreError::InvalidCatalog(format!(
                        "configuration {id} depends on unknown configuration {missing}"
                    )));
                }
            }
        }

        for set in catalog.sets {
            if let Some(missing) = set
                .members
                .iter()
                .find(|member| !inner.revisions.contains_key(member))
            {
                return Err(StoreError::InvalidCatalog(format!(
                    "set {} lists unknown configuration {missing}",
                    set.name
                )));
            }
            let _ = inner.sets.insert(set.id, set);
        }

        let system = User::new(0, "catalog");
        for prior in catalog.records {
            let revision = inner.find_revision(prior.id_rev).ok_or_else(|| {
                StoreError::InvalidCatalog(format!(
                    "record {} references unknown revision {}",
                    prior.id, prior.id_rev
                ))
            })?;
            let record = BuildRecord {
                id: prior.id.clone(),
                id_rev: prior.id_rev,
                status: prior.status,
                temporary_build: prior.temporary_build,
                alignment_preference: AlignmentPreference::default(),
                fingerprint: prior
                    .fingerprint
                    .unwrap_or_else(|| revision.fingerprint()),
                dependency_records: prior.dependency_records,
                no_rebuild_cause: None,
                set_record_id: None,
                user: system.clone(),
                submit_time: prior.end_time,
                end_time: prior.end_time,
                description: None,
            };
            let _ = inner.records.insert(prior.id, record);
        }

        debug!(
            "Catalog loaded: {} configurations, {} sets, {} records",
            inner.revisions.len(),
            inner.sets.len(),
            inner.records.len()
        );
        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    pub async fn insert_revision(&self, revision: BuildConfigRevision) {
        self.inner.write().await.insert_revision(revision);
    }

    pub async fn insert_config_set(&self, set: BuildConfigurationSet) {
        let _ = self.inner.write().await.sets.insert(set.id, set);
    }

    /// Every configuration with its latest revision
    pub async fn configurations(&self) -> Vec<BuildConfigRevision> {
        self.inner
            .read()
            .await
            .revisions
            .values()
            .filter_map(|revisions| revisions.values().next_back().cloned())
            .collect()
    }

    pub async fn records(&self) -> Vec<BuildRecord> {
        self.inner.read().await.records.values().cloned().collect()
    }

    pub async fn tasks(&self) -> Vec<BuildTask> {
        self.inner.read().await.tasks.values().cloned().collect()
    }
}

#[async_trait]
impl Datastore for InMemoryDatastore {
    async fn latest_revision(&self, id: ConfigId) -> StoreResult<BuildConfigRevision> {
        self.inner
            .read()
            .await
            .revisions
            .get(&id)
            .and_then(|revisions| revisions.values().next_back())
            .cloned()
            .ok_or_else(|| StoreError::not_found("Build configuration", id))
    }

    async fn revision(&self, id_rev: IdRev) -> StoreResult<BuildConfigRevision> {
        self.inner
            .read()
            .await
            .find_revision(id_rev)
            .cloned()
            .ok_or_else(|| StoreError::not_found("Build configuration revision", id_rev))
    }

    async fn config_set(&self, id: ConfigSetId) -> StoreResult<BuildConfigurationSet> {
        self.inner
            .read()
            .await
            .sets
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("Build configuration set", id))
    }

    async fn latest_successful_record(
        &self,
        id: ConfigId,
        temporary: bool,
    ) -> StoreResult<Option<BuildRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .records
            .values()
            .filter(|r| {
                r.id_rev.id == id && r.temporary_build == temporary && r.status == BuildStatus::Success
            })
            .max_by(|a, b| a.end_time.cmp(&b.end_time).then_with(|| a.id.cmp(&b.id)))
            .cloned())
    }

    async fn record(&self, id: &BuildRecordId) -> StoreResult<Option<BuildRecord>> {
        Ok(self.inner.read().await.records.get(id).cloned())
    }

    async fn save_record(&self, record: BuildRecord) -> StoreResult<()> {
        let _ = self
            .inner
            .write()
            .await
            .records
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn records_for_set(&self, id: SetRecordId) -> StoreResult<Vec<BuildRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .records
            .values()
            .filter(|r| r.set_record_id == Some(id))
            .cloned()
            .collect())
    }

    async fn save_task(&self, task: BuildTask) -> StoreResult<()> {
        let _ = self.inner.write().await.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn task(&self, id: &BuildTaskId) -> StoreResult<Option<BuildTask>> {
        Ok(self.inner.read().await.tasks.get(id).cloned())
    }

    async fn unfinished_tasks(&self) -> StoreResult<Vec<BuildTask>> {
        Ok(self
            .inner
            .read()
            .await
            .tasks
            .values()
            .filter(|t| !t.is_finished())
            .cloned()
            .collect())
    }

    async fn next_set_record_id(&self) -> StoreResult<SetRecordId> {
        let mut inner = self.inner.write().await;
        inner.last_set_record += 1;
        Ok(SetRecordId(inner.last_set_record))
    }

    async fn save_set_record(&self, record: BuildConfigSetRecord) -> StoreResult<()> {
        let _ = self.inner.write().await.set_records.insert(record.id, record);
        Ok(())
    }

    async fn set_record(&self, id: SetRecordId) -> StoreResult<Option<BuildConfigSetRecord>> {
        Ok(self.inner.read().await.set_records.get(&id).cloned())
    }

    async fn set_records_in_progress(&self) -> StoreResult<Vec<BuildConfigSetRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .set_records
            .values()
            .filter(|r| !r.is_finished())
            .cloned()
            .collect())
    }
}

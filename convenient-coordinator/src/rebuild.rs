//! Rebuild decision oracle
//!
//! Decides whether a configuration revision has to be built again or whether
//! an earlier successful build can stand in for it. Forced rebuilds never
//! reach the oracle; the caller checks that flag first.

use crate::datastore::Datastore;
use crate::error::StoreResult;
use crate::model::{AlignmentPreference, BuildConfigRevision, BuildRecord, BuildRecordId, ConfigId};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use tracing::debug;

/// Why a rebuild is needed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildReason {
    /// No usable earlier build exists
    NoPreviousBuild,
    /// Script, sources or parameters differ from the last build
    InputsChanged,
    /// A direct dependency has a different latest build than the one used
    DependencyRebuilt(ConfigId),
    /// A transitive dependency was built after the last build
    ImplicitDependencyRebuilt(ConfigId),
}

impl fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoPreviousBuild => write!(f, "no previous successful build"),
            Self::InputsChanged => write!(f, "build inputs changed"),
            Self::DependencyRebuilt(id) => write!(f, "dependency {id} was rebuilt"),
            Self::ImplicitDependencyRebuilt(id) => {
                write!(f, "transitive dependency {id} was rebuilt")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildDecision {
    Required(RebuildReason),
    /// `cause` is the record that makes a new build unnecessary
    NotRequired { cause: BuildRecordId },
}

impl RebuildDecision {
    pub fn is_required(&self) -> bool {
        matches!(self, Self::Required(_))
    }
}

/// Lookups already made during one graph-build call.
///
/// Only saves datastore round trips; decisions are the same without it.
#[derive(Debug, Default)]
pub struct ProcessedCache {
    records: HashMap<(ConfigId, bool, AlignmentPreference), Option<BuildRecord>>,
    revisions: HashMap<ConfigId, BuildConfigRevision>,
}

impl ProcessedCache {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct RebuildOracle<'a> {
    store: &'a dyn Datastore,
}

impl<'a> RebuildOracle<'a> {
    pub fn new(store: &'a dyn Datastore) -> Self {
        Self { store }
    }

    pub async fn requires_rebuild(
        &self,
        revision: &BuildConfigRevision,
        check_implicit_dependencies: bool,
        temporary_build: bool,
        alignment_preference: AlignmentPreference,
        cache: &mut ProcessedCache,
    ) -> StoreResult<bool> {
        Ok(self
            .decide(
                revision,
                check_implicit_dependencies,
                temporary_build,
                alignment_preference,
                cache,
            )
            .await?
            .is_required())
    }

    pub async fn decide(
        &self,
        revision: &BuildConfigRevision,
        check_implicit_dependencies: bool,
        temporary_build: bool,
        alignment_preference: AlignmentPreference,
        cache: &mut ProcessedCache,
    ) -> StoreResult<RebuildDecision> {
        let id = revision.config_id();
        let Some(last) = self
            .select_record(id, temporary_build, alignment_preference, cache)
            .await?
        else {
            return Ok(RebuildDecision::Required(RebuildReason::NoPreviousBuild));
        };

        if last.fingerprint != revision.fingerprint() {
            debug!("{} inputs differ from record {}", revision.id_rev, last.id);
            return Ok(RebuildDecision::Required(RebuildReason::InputsChanged));
        }

        for dep in &revision.dependencies {
            let current = self
                .select_record(*dep, temporary_build, alignment_preference, cache)
                .await?
                .map(|r| r.id);
            if current.as_ref() != last.dependency_records.get(dep) {
                debug!(
                    "{} was built against {:?} of {}, latest is {:?}",
                    revision.id_rev,
                    last.dependency_records.get(dep),
                    dep,
                    current
                );
                return Ok(RebuildDecision::Required(RebuildReason::DependencyRebuilt(
                    *dep,
                )));
            }
        }

        if check_implicit_dependencies {
            let mut visited = BTreeSet::from([id]);
            let mut queue: VecDeque<ConfigId> = revision.dependencies.iter().copied().collect();

            while let Some(dep) = queue.pop_front() {
                if !visited.insert(dep) {
                    continue;
                }
                let newer = self
                    .select_record(dep, temporary_build, alignment_preference, cache)
                    .await?
                    .is_some_and(|r| r.end_time > last.end_time);
                if newer {
                    return Ok(RebuildDecision::Required(
                        RebuildReason::ImplicitDependencyRebuilt(dep),
                    ));
                }
                queue.extend(self.latest_revision(dep, cache).await?.dependencies);
            }
        }

        Ok(RebuildDecision::NotRequired { cause: last.id })
    }

    /// Record an up-to-date check compares against.
    ///
    /// Persistent builds only look at persistent records. Temporary builds
    /// try the preferred kind first and fall back to the other one.
    pub async fn select_record(
        &self,
        id: ConfigId,
        temporary_build: bool,
        preference: AlignmentPreference,
        cache: &mut ProcessedCache,
    ) -> StoreResult<Option<BuildRecord>> {
        let preference = if temporary_build {
            preference
        } else {
            AlignmentPreference::PreferPersistent
        };
        let key = (id, temporary_build, preference);
        if let Some(hit) = cache.records.get(&key) {
            return Ok(hit.clone());
        }

        let selected = if !temporary_build {
            self.store.latest_successful_record(id, false).await?
        } else {
            let prefer_temporary = preference == AlignmentPreference::PreferTemporary;
            match self.store.latest_successful_record(id, prefer_temporary).await? {
                Some(record) => Some(record),
                None => {
                    self.store
                        .latest_successful_record(id, !prefer_temporary)
                        .await?
                }
            }
        };

        let _ = cache.records.insert(key, selected.clone());
        Ok(selected)
    }

    async fn latest_revision(
        &self,
        id: ConfigId,
        cache: &mut ProcessedCache,
    ) -> StoreResult<BuildConfigRevision> {
        if let Some(revision) = cache.revisions.get(&id) {
            return Ok(revision.clone());
        }
        let revision = self.store.latest_revision(id).await?;
        let _ = cache.revisions.insert(id, revision.clone());
        Ok(revision)
    }
}

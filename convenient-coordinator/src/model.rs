//! Build configurations, tasks and records

use crate::status::{BuildCoordinationStatus, BuildStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Build configuration identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigId(pub u32);

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Build configuration set identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigSetId(pub u32);

impl fmt::Display for ConfigSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Build config set record (batch) identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SetRecordId(pub u64);

impl fmt::Display for SetRecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique task id. Build records reuse the id of the task that
/// produced them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildTaskId(String);

impl BuildTaskId {
    /// Wrap an existing id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id as string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Build records are keyed by the id of the task that produced them.
pub type BuildRecordId = BuildTaskId;

/// Identity of one immutable configuration revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdRev {
    pub id: ConfigId,
    pub rev: u32,
}

impl IdRev {
    pub fn new(id: u32, rev: u32) -> Self {
        Self {
            id: ConfigId(id),
            rev,
        }
    }
}

impl fmt::Display for IdRev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.rev)
    }
}

/// Which earlier builds a temporary build may treat as up to date
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlignmentPreference {
    /// Prefer the latest temporary build, fall back to persistent ones
    PreferTemporary,
    /// Prefer the latest persistent build, fall back to temporary ones
    #[default]
    PreferPersistent,
}

/// How eagerly to rebuild
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RebuildMode {
    /// Always rebuild
    Force,
    /// Rebuild when own inputs or a direct dependency's build changed
    ExplicitDependencyCheck,
    /// Additionally rebuild when any transitive dependency was rebuilt
    #[default]
    ImplicitDependencyCheck,
}

/// Options supplied with a build request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    /// Artifacts and record have a bounded lifespan
    pub temporary_build: bool,
    /// Walk and rebuild dependencies as needed
    pub build_dependencies: bool,
    /// Rebuild policy
    pub rebuild_mode: RebuildMode,
    /// Record selection for temporary builds
    pub alignment_preference: AlignmentPreference,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            temporary_build: false,
            build_dependencies: true,
            rebuild_mode: RebuildMode::default(),
            alignment_preference: AlignmentPreference::default(),
        }
    }
}

impl BuildOptions {
    pub fn force_rebuild(&self) -> bool {
        self.rebuild_mode == RebuildMode::Force
    }

    pub fn check_implicit_dependencies(&self) -> bool {
        self.rebuild_mode == RebuildMode::ImplicitDependencyCheck
    }

    pub fn forced(mut self) -> Self {
        self.rebuild_mode = RebuildMode::Force;
        self
    }

    pub fn without_dependencies(mut self) -> Self {
        self.build_dependencies = false;
        self
    }

    pub fn temporary(mut self, preference: AlignmentPreference) -> Self {
        self.temporary_build = true;
        self.alignment_preference = preference;
        self
    }
}

/// Submitting user
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub id: u32,
    pub username: String,
}

impl User {
    pub fn new(id: u32, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
        }
    }
}

/// Immutable snapshot of a build configuration at one revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfigRevision {
    pub id_rev: IdRev,
    pub name: String,
    pub build_script: String,
    pub scm_url: String,
    pub scm_revision: String,
    /// Parameters passed to dependency alignment
    #[serde(default)]
    pub alignment_parameters: String,
    #[serde(default)]
    pub build_type: String,
    /// Direct dependencies on other configurations
    #[serde(default)]
    pub dependencies: BTreeSet<ConfigId>,
}

impl BuildConfigRevision {
    pub fn config_id(&self) -> ConfigId {
        self.id_rev.id
    }

    /// SHA-256 over every input that influences the build output.
    ///
    /// Two revisions with equal fingerprints produce equivalent builds, even
    /// if their revision numbers differ.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.build_script.as_str(),
            self.scm_url.as_str(),
            self.scm_revision.as_str(),
            self.alignment_parameters.as_str(),
            self.build_type.as_str(),
        ] {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        for dep in &self.dependencies {
            hasher.update(dep.0.to_le_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Named group of configurations built together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfigurationSet {
    pub id: ConfigSetId,
    pub name: String,
    pub members: BTreeSet<ConfigId>,
}

/// One scheduled or executing build of a revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTask {
    pub id: BuildTaskId,
    pub revision: BuildConfigRevision,
    pub options: BuildOptions,
    pub user: User,
    pub status: BuildCoordinationStatus,
    pub status_description: Option<String>,
    /// The task was already submitted by an earlier request
    pub already_running: bool,
    /// Record that makes this build unnecessary
    pub no_rebuild_cause: Option<BuildRecordId>,
    pub set_record_id: Option<SetRecordId>,
    pub correlation_id: Option<String>,
    /// Tasks this one depends on
    pub dependencies: BTreeSet<BuildTaskId>,
    pub submit_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl BuildTask {
    pub fn new(
        id: BuildTaskId,
        revision: BuildConfigRevision,
        options: BuildOptions,
        user: User,
    ) -> Self {
        Self {
            id,
            revision,
            options,
            user,
            status: BuildCoordinationStatus::New,
            status_description: None,
            already_running: false,
            no_rebuild_cause: None,
            set_record_id: None,
            correlation_id: None,
            dependencies: BTreeSet::new(),
            submit_time: Utc::now(),
            start_time: None,
            end_time: None,
        }
    }

    pub fn id_rev(&self) -> IdRev {
        self.revision.id_rev
    }

    pub fn config_id(&self) -> ConfigId {
        self.revision.id_rev.id
    }

    /// Neither already running nor made unnecessary by an earlier build
    pub fn needs_execution(&self) -> bool {
        !self.already_running && self.no_rebuild_cause.is_none()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_final()
    }
}

/// Durable result of a finished task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub id: BuildRecordId,
    pub id_rev: IdRev,
    pub status: BuildStatus,
    pub temporary_build: bool,
    pub alignment_preference: AlignmentPreference,
    /// Fingerprint of the revision inputs at build time
    pub fingerprint: String,
    /// Which build of each direct dependency this one was produced against
    #[serde(default)]
    pub dependency_records: BTreeMap<ConfigId, BuildRecordId>,
    pub no_rebuild_cause: Option<BuildRecordId>,
    pub set_record_id: Option<SetRecordId>,
    pub user: User,
    pub submit_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub description: Option<String>,
}

/// One execution of a configuration set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfigSetRecord {
    pub id: SetRecordId,
    pub config_set_id: ConfigSetId,
    pub status: BuildStatus,
    pub description: Option<String>,
    pub temporary_build: bool,
    pub user: User,
    pub correlation_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub build_record_ids: BTreeSet<BuildRecordId>,
}

impl BuildConfigSetRecord {
    pub fn is_finished(&self) -> bool {
        self.status.is_final()
    }
}

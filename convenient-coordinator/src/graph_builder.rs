//! Build graph construction
//!
//! Walks configuration dependencies, asks the [`RebuildOracle`] which ones
//! need a new build, and turns the result into a graph of [`BuildTask`]s
//! with an edge `(parent, child)` wherever the parent configuration lists the
//! child configuration as a direct dependency.

use crate::datastore::Datastore;
use crate::error::{CoordinationResult, StoreResult};
use crate::ids::TaskIdSequence;
use crate::model::{
    BuildConfigRevision, BuildConfigurationSet, BuildOptions, BuildRecordId, BuildTask,
    BuildTaskId, ConfigId, IdRev, User,
};
use crate::rebuild::{ProcessedCache, RebuildDecision, RebuildOracle};
use convenient_graph::Graph;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use tracing::debug;

/// Tasks keyed by id; an edge `from -> to` means `from` depends on `to`.
pub type BuildGraph = Graph<BuildTaskId, BuildTask>;

type BoxFuture<'b, T> = Pin<Box<dyn Future<Output = T> + Send + 'b>>;

struct Candidate {
    revision: BuildConfigRevision,
    no_rebuild_cause: Option<BuildRecordId>,
}

/// State of one graph-build call
struct Collector<'c> {
    options: BuildOptions,
    pinned: &'c BTreeMap<ConfigId, IdRev>,
    to_build: BTreeMap<ConfigId, Candidate>,
    visited: BTreeSet<ConfigId>,
    cache: ProcessedCache,
}

impl<'c> Collector<'c> {
    fn new(options: BuildOptions, pinned: &'c BTreeMap<ConfigId, IdRev>) -> Self {
        Self {
            options,
            pinned,
            to_build: BTreeMap::new(),
            visited: BTreeSet::new(),
            cache: ProcessedCache::new(),
        }
    }

    fn needs_build(&self, id: ConfigId) -> bool {
        self.to_build
            .get(&id)
            .is_some_and(|c| c.no_rebuild_cause.is_none())
    }
}

pub struct GraphBuilder<'a> {
    store: &'a dyn Datastore,
    ids: &'a TaskIdSequence,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(store: &'a dyn Datastore, ids: &'a TaskIdSequence) -> Self {
        Self { store, ids }
    }

    /// Graph for one configuration revision and whatever of its dependency
    /// tree needs building.
    pub async fn build_for_config(
        &self,
        root: BuildConfigRevision,
        options: BuildOptions,
        user: &User,
        submitted: &[BuildTask],
    ) -> CoordinationResult<BuildGraph> {
        let pinned = BTreeMap::from([(root.config_id(), root.id_rev)]);
        let mut collector = Collector::new(options, &pinned);
        self.add_root(&mut collector, root).await?;
        self.materialize(collector, user, submitted)
    }

    /// Graph for every member of a set. Members listed in `pinned` are built
    /// at that revision, all other configurations at their latest one.
    pub async fn build_for_set(
        &self,
        set: &BuildConfigurationSet,
        pinned: &BTreeMap<ConfigId, IdRev>,
        options: BuildOptions,
        user: &User,
        submitted: &[BuildTask],
    ) -> CoordinationResult<BuildGraph> {
        let mut collector = Collector::new(options, pinned);
        for member in &set.members {
            let revision = self.revision_for(&collector, *member).await?;
            self.add_root(&mut collector, revision).await?;
        }
        self.materialize(collector, user, submitted)
    }

    async fn revision_for(
        &self,
        collector: &Collector<'_>,
        id: ConfigId,
    ) -> StoreResult<BuildConfigRevision> {
        match collector.pinned.get(&id) {
            Some(id_rev) => self.store.revision(*id_rev).await,
            None => self.store.latest_revision(id).await,
        }
    }

    /// Explicitly requested revisions are always part of the graph. When no
    /// build is needed they carry the record that makes it unnecessary.
    async fn add_root(
        &self,
        collector: &mut Collector<'_>,
        revision: BuildConfigRevision,
    ) -> StoreResult<()> {
        let id = revision.config_id();
        let _ = collector.visited.insert(id);

        let mut dependency_needs_build = false;
        if collector.options.build_dependencies {
            for dep in &revision.dependencies {
                dependency_needs_build |= self.visit(collector, *dep).await?;
            }
        }

        if collector.needs_build(id) {
            return Ok(());
        }

        let no_rebuild_cause = if collector.options.force_rebuild() || dependency_needs_build {
            None
        } else {
            match self.decide(collector, &revision).await? {
                RebuildDecision::Required(reason) => {
                    debug!("{} ({}) needs a build: {}", revision.name, revision.id_rev, reason);
                    None
                }
                RebuildDecision::NotRequired { cause } => Some(cause),
            }
        };

        let _ = collector.to_build.insert(
            id,
            Candidate {
                revision,
                no_rebuild_cause,
            },
        );
        Ok(())
    }

    /// Post-order visit of a dependency. Returns whether it needs a build.
    fn visit<'b, 'c: 'b>(
        &'b self,
        collector: &'b mut Collector<'c>,
        id: ConfigId,
    ) -> BoxFuture<'b, StoreResult<bool>> {
        Box::pin(async move {
            if !collector.visited.insert(id) {
                return Ok(collector.needs_build(id));
            }

            let revision = self.revision_for(collector, id).await?;

            // Every dependency is visited, even after one already needs a build
            let mut dependency_needs_build = false;
            for dep in &revision.dependencies {
                dependency_needs_build |= self.visit(collector, *dep).await?;
            }

            let required = dependency_needs_build
                || collector.options.force_rebuild()
                || match self.decide(collector, &revision).await? {
                    RebuildDecision::Required(reason) => {
                        debug!(
                            "Dependency {} ({}) needs a build: {}",
                            revision.name, revision.id_rev, reason
                        );
                        true
                    }
                    RebuildDecision::NotRequired { .. } => false,
                };

            if required {
                let _ = collector.to_build.insert(
                    id,
                    Candidate {
                        revision,
                        no_rebuild_cause: None,
                    },
                );
            }
            Ok(required)
        })
    }

    async fn decide(
        &self,
        collector: &mut Collector<'_>,
        revision: &BuildConfigRevision,
    ) -> StoreResult<RebuildDecision> {
        let options = collector.options;
        RebuildOracle::new(self.store)
            .decide(
                revision,
                options.check_implicit_dependencies(),
                options.temporary_build,
                options.alignment_preference,
                &mut collector.cache,
            )
            .await
    }

    fn materialize(
        &self,
        collector: Collector<'_>,
        user: &User,
        submitted: &[BuildTask],
    ) -> CoordinationResult<BuildGraph> {
        let options = collector.options;
        let mut graph = BuildGraph::new();
        let mut task_ids: BTreeMap<ConfigId, BuildTaskId> = BTreeMap::new();

        for (config, candidate) in collector.to_build {
            let running = submitted
                .iter()
                .find(|t| t.id_rev() == candidate.revision.id_rev && !t.is_finished());

            let task = match running {
                Some(existing) => {
                    debug!("Reusing running task {} for {}", existing.id, existing.id_rev());
                    let mut task = existing.clone();
                    task.already_running = true;
                    task
                }
                None => {
                    let mut task = BuildTask::new(
                        self.ids.next_id(),
                        candidate.revision,
                        options,
                        user.clone(),
                    );
                    task.no_rebuild_cause = candidate.no_rebuild_cause;
                    task
                }
            };

            let _ = task_ids.insert(config, task.id.clone());
            let _ = graph.add_vertex(task.id.clone(), task);
        }

        for parent in task_ids.values() {
            let dependencies = match graph.vertex(parent) {
                Some(task) => task.revision.dependencies.clone(),
                None => continue,
            };
            for dep in dependencies {
                if let Some(child) = task_ids.get(&dep) {
                    graph.add_edge(parent.clone(), child.clone())?;
                    if let Some(task) = graph.vertex_mut(parent) {
                        let _ = task.dependencies.insert(child.clone());
                    }
                }
            }
        }

        debug!(
            "Build graph: {} tasks, {} edges",
            graph.vertex_count(),
            graph.edge_count()
        );
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::InMemoryDatastore;
    use crate::model::{BuildRecord, ConfigSetId};
    use crate::status::{BuildCoordinationStatus, BuildStatus};
    use chrono::Utc;

    fn revision(id: u32, deps: &[u32]) -> BuildConfigRevision {
        BuildConfigRevision {
            id_rev: IdRev::new(id, 1),
            name: format!("config-{id}"),
            build_script: "make".to_string(),
            scm_url: format!("https://git.example.com/{id}.git"),
            scm_revision: "main".to_string(),
            alignment_parameters: String::new(),
            build_type: String::new(),
            dependencies: deps.iter().map(|d| ConfigId(*d)).collect(),
        }
    }

    fn up_to_date(id: &str, rev: &BuildConfigRevision) -> BuildRecord {
        BuildRecord {
            id: BuildRecordId::new(id),
            id_rev: rev.id_rev,
            status: BuildStatus::Success,
            temporary_build: false,
            alignment_preference: Default::default(),
            fingerprint: rev.fingerprint(),
            dependency_records: BTreeMap::new(),
            no_rebuild_cause: None,
            set_record_id: None,
            user: User::new(1, "demo"),
            submit_time: Utc::now(),
            end_time: Utc::now(),
            description: None,
        }
    }

    async fn store(revisions: &[BuildConfigRevision], records: Vec<BuildRecord>) -> InMemoryDatastore {
        let store = InMemoryDatastore::new();
        for rev in revisions {
            store.insert_revision(rev.clone()).await;
        }
        for rec in records {
            store.save_record(rec).await.unwrap();
        }
        store
    }

    fn config_ids(graph: &BuildGraph) -> BTreeSet<u32> {
        graph.vertices().map(|(_, t)| t.config_id().0).collect()
    }

    #[tokio::test]
    async fn test_single_configuration_without_dependencies() {
        let z = revision(3, &[]);
        let store = store(&[z.clone()], vec![]).await;
        let ids = TaskIdSequence::default();
        let graph = GraphBuilder::new(&store, &ids)
            .build_for_config(z, BuildOptions::default(), &User::new(1, "demo"), &[])
            .await
            .unwrap();

        assert_eq!(graph.vertex_count(), 1);
        assert_eq!(graph.edge_count(), 0);
    }

    #[tokio::test]
    async fn test_diamond_is_deduplicated() {
        // 1 -> 2, 1 -> 3, 2 -> 4, 3 -> 4
        let revs = [
            revision(1, &[2, 3]),
            revision(2, &[4]),
            revision(3, &[4]),
            revision(4, &[]),
        ];
        let store = store(&revs, vec![]).await;
        let ids = TaskIdSequence::default();
        let graph = GraphBuilder::new(&store, &ids)
            .build_for_config(revs[0].clone(), BuildOptions::default(), &User::new(1, "demo"), &[])
            .await
            .unwrap();

        assert_eq!(config_ids(&graph), BTreeSet::from([1, 2, 3, 4]));
        assert_eq!(graph.edge_count(), 4);
        let four = graph
            .vertices()
            .find(|(_, t)| t.config_id() == ConfigId(4))
            .map(|(id, _)| id.clone())
            .unwrap();
        assert_eq!(graph.dependants(&four).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_dependency_change_pulls_in_dependants() {
        // 1 -> 2 -> 3; only 3 changed, 2 is up to date on its own
        let revs = [revision(1, &[2]), revision(2, &[3]), revision(3, &[])];
        let store = store(
            &revs,
            vec![up_to_date("R1", &revs[0]), up_to_date("R2", &revs[1])],
        )
        .await;
        let ids = TaskIdSequence::default();
        let graph = GraphBuilder::new(&store, &ids)
            .build_for_config(revs[0].clone(), BuildOptions::default(), &User::new(1, "demo"), &[])
            .await
            .unwrap();

        assert_eq!(config_ids(&graph), BTreeSet::from([1, 2, 3]));
        assert!(graph.vertices().all(|(_, t)| t.no_rebuild_cause.is_none()));
    }

    #[tokio::test]
    async fn test_up_to_date_root_carries_cause() {
        let z = revision(3, &[]);
        let store = store(&[z.clone()], vec![up_to_date("R3", &z)]).await;
        let ids = TaskIdSequence::default();
        let graph = GraphBuilder::new(&store, &ids)
            .build_for_config(z.clone(), BuildOptions::default(), &User::new(1, "demo"), &[])
            .await
            .unwrap();

        let (_, task) = graph.vertices().next().unwrap();
        assert_eq!(task.no_rebuild_cause, Some(BuildRecordId::new("R3")));
        assert_eq!(task.status, BuildCoordinationStatus::New);

        let forced = GraphBuilder::new(&store, &ids)
            .build_for_config(z, BuildOptions::default().forced(), &User::new(1, "demo"), &[])
            .await
            .unwrap();
        let (_, task) = forced.vertices().next().unwrap();
        assert!(task.no_rebuild_cause.is_none());
    }

    #[tokio::test]
    async fn test_without_dependencies_only_root() {
        let revs = [revision(1, &[2]), revision(2, &[])];
        let store = store(&revs, vec![]).await;
        let ids = TaskIdSequence::default();
        let graph = GraphBuilder::new(&store, &ids)
            .build_for_config(
                revs[0].clone(),
                BuildOptions::default().without_dependencies(),
                &User::new(1, "demo"),
                &[],
            )
            .await
            .unwrap();

        assert_eq!(config_ids(&graph), BTreeSet::from([1]));
    }

    #[tokio::test]
    async fn test_running_task_is_reused() {
        let revs = [revision(1, &[2]), revision(2, &[])];
        let store = store(&revs, vec![]).await;
        let ids = TaskIdSequence::starting_at(100);
        let mut running = BuildTask::new(
            BuildTaskId::new("RUNNING"),
            revs[1].clone(),
            BuildOptions::default(),
            User::new(2, "other"),
        );
        running.status = BuildCoordinationStatus::Building;

        let graph = GraphBuilder::new(&store, &ids)
            .build_for_config(
                revs[0].clone(),
                BuildOptions::default(),
                &User::new(1, "demo"),
                &[running],
            )
            .await
            .unwrap();

        let reused = graph.vertex(&BuildTaskId::new("RUNNING")).unwrap();
        assert!(reused.already_running);
        assert_eq!(graph.edge_count(), 1);
    }

    #[tokio::test]
    async fn test_set_uses_pinned_revisions() {
        let mut lib_v2 = revision(2, &[]);
        lib_v2.id_rev.rev = 2;
        lib_v2.scm_revision = "next".to_string();
        let revs = [revision(1, &[2]), revision(2, &[]), lib_v2];
        let store = store(&revs, vec![]).await;
        let ids = TaskIdSequence::default();
        let set = BuildConfigurationSet {
            id: ConfigSetId(10),
            name: "product".to_string(),
            members: BTreeSet::from([ConfigId(1), ConfigId(2)]),
        };
        let pinned = BTreeMap::from([(ConfigId(2), IdRev::new(2, 1))]);

        let graph = GraphBuilder::new(&store, &ids)
            .build_for_set(&set, &pinned, BuildOptions::default(), &User::new(1, "demo"), &[])
            .await
            .unwrap();

        let lib = graph
            .vertices()
            .map(|(_, t)| t)
            .find(|t| t.config_id() == ConfigId(2))
            .unwrap();
        assert_eq!(lib.id_rev(), IdRev::new(2, 1));
        assert_eq!(graph.vertex_count(), 2);
        assert_eq!(graph.edge_count(), 1);
    }
}

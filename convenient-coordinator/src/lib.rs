//! Dependency-graph build coordination.
//!
//! Given a build configuration (or a set of them) the coordinator works out
//! which revisions actually need building, arranges them in a task graph,
//! validates it and hands it to an execution engine. Engine transitions and
//! completion reports then drive each task through its lifecycle, and the
//! status of a batch is derived from its members.
//!
//! # Pipeline
//!
//! 1. [`RebuildOracle`]: does a revision need building?
//! 2. [`GraphBuilder`]: collect what needs building, one task per revision
//! 3. [`validation::validate`]: empty, nothing to do, cycles, conflicts
//! 4. [`RemoteScheduler`]: submit, cancel, query ([`LocalScheduler`] or
//!    [`RexScheduler`])
//! 5. [`Reconciler`]: derive batch status
//! 6. [`BuildCoordinator`]: the facade tying it together
//!
//! # Example
//!
//! ```no_run
//! use convenient_coordinator::{
//!     BuildCoordinator, BuildOptions, ConfigId, Datastore, InMemoryDatastore, LocalScheduler,
//!     User,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let store = Arc::new(InMemoryDatastore::new());
//! let (scheduler, transitions) = LocalScheduler::new();
//! let coordinator = BuildCoordinator::builder()
//!     .datastore(store.clone())
//!     .scheduler(Arc::new(scheduler))
//!     .build()?;
//! let _listener = coordinator.listen(transitions);
//!
//! let revision = store.latest_revision(ConfigId(1)).await?;
//! let outcome = coordinator
//!     .build_config(revision, BuildOptions::default(), User::new(1, "demo"))
//!     .await?;
//! println!("{} tasks submitted", outcome.submitted().count());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(unused_results)]

pub mod completion;
pub mod config;
pub mod coordinator;
pub mod datastore;
pub mod error;
pub mod graph_builder;
pub mod ids;
pub mod model;
pub mod notify;
pub mod rebuild;
pub mod reconciler;
pub mod scheduler;
pub mod status;
pub mod validation;

pub use completion::{BuildResult, CompletionStatus};
pub use config::{CoordinatorConfig, SchedulerBackend};
pub use coordinator::{BuildCoordinator, BuildCoordinatorBuilder, BuildPlan, BuildSetTask};
pub use datastore::{Catalog, Datastore, InMemoryDatastore, PriorBuild};
pub use error::{
    ConfigError, CoordinationError, CoordinationResult, SchedulerError, SchedulerResult,
    StoreError, StoreResult,
};
pub use graph_builder::{BuildGraph, GraphBuilder};
pub use ids::TaskIdSequence;
pub use model::{
    AlignmentPreference, BuildConfigRevision, BuildConfigSetRecord, BuildConfigurationSet,
    BuildOptions, BuildRecord, BuildRecordId, BuildTask, BuildTaskId, ConfigId, ConfigSetId,
    IdRev, RebuildMode, SetRecordId, User,
};
pub use notify::{Notifier, StatusChangedEvent};
pub use rebuild::{RebuildDecision, RebuildOracle, RebuildReason};
pub use reconciler::{ReconcileSummary, Reconciler};
pub use scheduler::{
    LocalScheduler, RemoteScheduler, RetryPolicy, RexScheduler, SchedulerHandle, TaskRef,
    TaskTransition, connect,
};
pub use status::{BuildCoordinationStatus, BuildStatus};
pub use validation::GraphRejection;

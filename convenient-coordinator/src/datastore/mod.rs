//! Persistence collaborator
//!
//! The coordinator never owns durable state. Everything it reads (revisions,
//! prior build records) or writes (tasks, records, set records) goes through
//! [`Datastore`].

mod memory;

pub use memory::{Catalog, InMemoryDatastore, PriorBuild};

use crate::error::StoreResult;
use crate::model::{
    BuildConfigRevision, BuildConfigSetRecord, BuildConfigurationSet, BuildRecord, BuildRecordId,
    BuildTask, BuildTaskId, ConfigId, ConfigSetId, IdRev, SetRecordId,
};
use async_trait::async_trait;

#[async_trait]
pub trait Datastore: Send + Sync {
    /// Latest revision of a configuration
    async fn latest_revision(&self, id: ConfigId) -> StoreResult<BuildConfigRevision>;

    /// One specific revision
    async fn revision(&self, id_rev: IdRev) -> StoreResult<BuildConfigRevision>;

    async fn config_set(&self, id: ConfigSetId) -> StoreResult<BuildConfigurationSet>;

    /// Most recent `SUCCESS` record of a configuration among temporary
    /// (`temporary == true`) or persistent records
    async fn latest_successful_record(
        &self,
        id: ConfigId,
        temporary: bool,
    ) -> StoreResult<Option<BuildRecord>>;

    async fn record(&self, id: &BuildRecordId) -> StoreResult<Option<BuildRecord>>;

    async fn save_record(&self, record: BuildRecord) -> StoreResult<()>;

    /// Records produced for a batch
    async fn records_for_set(&self, id: SetRecordId) -> StoreResult<Vec<BuildRecord>>;

    async fn save_task(&self, task: BuildTask) -> StoreResult<()>;

    async fn task(&self, id: &BuildTaskId) -> StoreResult<Option<BuildTask>>;

    /// Tasks not yet in a final state
    async fn unfinished_tasks(&self) -> StoreResult<Vec<BuildTask>>;

    /// Allocate the id of a new batch
    async fn next_set_record_id(&self) -> StoreResult<SetRecordId>;

    async fn save_set_record(&self, record: BuildConfigSetRecord) -> StoreResult<()>;

    async fn set_record(&self, id: SetRecordId) -> StoreResult<Option<BuildConfigSetRecord>>;

    /// Batches whose status is not final
    async fn set_records_in_progress(&self) -> StoreResult<Vec<BuildConfigSetRecord>>;
}

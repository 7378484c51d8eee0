//! Status change notifications
//!
//! Listeners subscribe to a `tokio::sync::broadcast` bus. An event is only
//! published when the status actually changed, and never for a move between
//! two terminal states (a late engine report after a forced cancellation, for
//! instance).

use crate::model::{BuildConfigSetRecord, BuildTask, BuildTaskId, ConfigSetId, IdRev, SetRecordId};
use crate::status::{BuildCoordinationStatus, BuildStatus};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChangedEvent {
    Task {
        task_id: BuildTaskId,
        id_rev: IdRev,
        name: String,
        set_record_id: Option<SetRecordId>,
        old: BuildCoordinationStatus,
        new: BuildCoordinationStatus,
        description: Option<String>,
    },
    Set {
        set_record_id: SetRecordId,
        config_set_id: ConfigSetId,
        old: BuildStatus,
        new: BuildStatus,
        description: Option<String>,
    },
}

impl StatusChangedEvent {
    pub fn is_task(&self) -> bool {
        matches!(self, Self::Task { .. })
    }
}

/// Publishing side of the bus. Clones share the same channel.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<StatusChangedEvent>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChangedEvent> {
        self.sender.subscribe()
    }

    /// Publish a task change. Returns whether an event went out.
    pub fn task_changed(&self, task: &BuildTask, old: BuildCoordinationStatus) -> bool {
        if old == task.status || (old.is_final() && task.status.is_final()) {
            return false;
        }
        self.publish(StatusChangedEvent::Task {
            task_id: task.id.clone(),
            id_rev: task.id_rev(),
            name: task.revision.name.clone(),
            set_record_id: task.set_record_id,
            old,
            new: task.status,
            description: task.status_description.clone(),
        });
        true
    }

    /// Publish a batch change. Returns whether an event went out.
    pub fn set_changed(&self, record: &BuildConfigSetRecord, old: BuildStatus) -> bool {
        if old == record.status || (old.is_final() && record.status.is_final()) {
            return false;
        }
        self.publish(StatusChangedEvent::Set {
            set_record_id: record.id,
            config_set_id: record.config_set_id,
            old,
            new: record.status,
            description: record.description.clone(),
        });
        true
    }

    fn publish(&self, event: StatusChangedEvent) {
        // No subscribers is fine
        if self.sender.send(event).is_err() {
            debug!("Status change dropped, nobody is listening");
        }
    }
}

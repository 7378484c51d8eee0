//! Task lifecycle and aggregate build status
//!
//! Two vocabularies exist side by side:
//! - [`BuildCoordinationStatus`] tracks a task through the coordinator
//! - [`BuildStatus`] is what build records and set records store
//!
//! The engine's own task [`State`] maps onto both.

use convenient_rex::{State, StopFlag};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a build task inside the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildCoordinationStatus {
    New,
    Enqueued,
    WaitingForDependencies,
    Building,
    Done,
    DoneWithErrors,
    SystemError,
    Cancelled,
    RejectedAlreadyBuilt,
    RejectedFailedDependencies,
    Rejected,
}

impl BuildCoordinationStatus {
    /// Terminal states never change again
    pub fn is_final(self) -> bool {
        !matches!(
            self,
            Self::New | Self::Enqueued | Self::WaitingForDependencies | Self::Building
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Staying in the same state is allowed (and a no-op for callers).
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        if self.is_final() || next == Self::New {
            return false;
        }
        match next {
            Self::Enqueued | Self::WaitingForDependencies => self != Self::Building,
            // Completion can arrive before the engine reports UP, and an up-to-date
            // verdict (DONE/REJECTED_ALREADY_BUILT) may settle a task that never ran
            _ => true,
        }
    }

    /// Status stored in records for this lifecycle state
    pub fn to_build_status(self) -> BuildStatus {
        match self {
            Self::New => BuildStatus::New,
            Self::Enqueued => BuildStatus::Enqueued,
            Self::WaitingForDependencies => BuildStatus::WaitingForDependencies,
            Self::Building => BuildStatus::Building,
            Self::Done => BuildStatus::Success,
            Self::DoneWithErrors => BuildStatus::Failed,
            Self::SystemError => BuildStatus::SystemError,
            Self::Cancelled => BuildStatus::Cancelled,
            Self::RejectedAlreadyBuilt => BuildStatus::NoRebuildRequired,
            Self::RejectedFailedDependencies => BuildStatus::RejectedFailedDependencies,
            Self::Rejected => BuildStatus::Rejected,
        }
    }

    /// Lifecycle state implied by an engine state
    pub fn from_remote(state: State, stop_flag: StopFlag) -> Self {
        match state {
            State::New => Self::New,
            State::Waiting => Self::WaitingForDependencies,
            State::Enqueued => Self::Enqueued,
            State::Starting | State::Up | State::Stopping => Self::Building,
            State::StartFailed | State::StopFailed => Self::SystemError,
            State::Failed => Self::DoneWithErrors,
            State::Successful => Self::Done,
            State::Stopped => match stop_flag {
                StopFlag::DependencyFailed => Self::RejectedFailedDependencies,
                _ => Self::Cancelled,
            },
        }
    }
}

impl fmt::Display for BuildCoordinationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::Enqueued => "ENQUEUED",
            Self::WaitingForDependencies => "WAITING_FOR_DEPENDENCIES",
            Self::Building => "BUILDING",
            Self::Done => "DONE",
            Self::DoneWithErrors => "DONE_WITH_ERRORS",
            Self::SystemError => "SYSTEM_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::RejectedAlreadyBuilt => "REJECTED_ALREADY_BUILT",
            Self::RejectedFailedDependencies => "REJECTED_FAILED_DEPENDENCIES",
            Self::Rejected => "REJECTED",
        };
        f.write_str(name)
    }
}

/// Status of a build record or set record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    New,
    Enqueued,
    WaitingForDependencies,
    Building,
    Success,
    Failed,
    NoRebuildRequired,
    Rejected,
    RejectedFailedDependencies,
    Cancelled,
    SystemError,
}

impl BuildStatus {
    pub fn is_final(self) -> bool {
        !matches!(
            self,
            Self::New | Self::Enqueued | Self::WaitingForDependencies | Self::Building
        )
    }

    pub fn completed_successfully(self) -> bool {
        matches!(self, Self::Success | Self::NoRebuildRequired)
    }

    /// Record status implied by an engine state
    pub fn from_remote(state: State, stop_flag: StopFlag) -> Self {
        BuildCoordinationStatus::from_remote(state, stop_flag).to_build_status()
    }

    /// Aggregate status of a batch from its members' statuses.
    ///
    /// - any member still running: `Building`
    /// - else any member cancelled: `Cancelled`
    /// - else every member `NoRebuildRequired`: `NoRebuildRequired`
    /// - else every member completed successfully: `Success`
    /// - else `Failed`
    ///
    /// The result depends only on which statuses occur, never on their order
    /// or multiplicity. Returns `None` for an empty batch.
    pub fn aggregate<I>(statuses: I) -> Option<Self>
    where
        I: IntoIterator<Item = Self>,
    {
        let mut any = false;
        let mut running = false;
        let mut cancelled = false;
        let mut all_no_rebuild = true;
        let mut all_successful = true;

        for status in statuses {
            any = true;
            running |= !status.is_final();
            cancelled |= status == Self::Cancelled;
            all_no_rebuild &= status == Self::NoRebuildRequired;
            all_successful &= status.completed_successfully();
        }

        if !any {
            return None;
        }

        Some(if running {
            Self::Building
        } else if cancelled {
            Self::Cancelled
        } else if all_no_rebuild {
            Self::NoRebuildRequired
        } else if all_successful {
            Self::Success
        } else {
            Self::Failed
        })
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::Enqueued => "ENQUEUED",
            Self::WaitingForDependencies => "WAITING_FOR_DEPENDENCIES",
            Self::Building => "BUILDING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::NoRebuildRequired => "NO_REBUILD_REQUIRED",
            Self::Rejected => "REJECTED",
            Self::RejectedFailedDependencies => "REJECTED_FAILED_DEPENDENCIES",
            Self::Cancelled => "CANCELLED",
            Self::SystemError => "SYSTEM_ERROR",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BuildCoordinationStatus as C;
    use BuildStatus as B;

    #[test]
    fn test_batch_all_done_is_success() {
        let statuses = [C::Done, C::Done].map(C::to_build_status);
        assert_eq!(B::aggregate(statuses), Some(B::Success));
    }

    #[test]
    fn test_batch_with_errors_is_failed() {
        let statuses = [C::Done, C::DoneWithErrors].map(C::to_build_status);
        assert_eq!(B::aggregate(statuses), Some(B::Failed));
    }

    #[test]
    fn test_batch_all_no_rebuild() {
        assert_eq!(
            B::aggregate([B::NoRebuildRequired, B::NoRebuildRequired]),
            Some(B::NoRebuildRequired)
        );
        // Mixed with a real success the batch succeeded
        assert_eq!(
            B::aggregate([B::NoRebuildRequired, B::Success]),
            Some(B::Success)
        );
    }

    #[test]
    fn test_batch_running_member_wins() {
        let statuses = [C::Building, C::Done].map(C::to_build_status);
        assert_eq!(B::aggregate(statuses), Some(B::Building));
        assert_eq!(
            B::aggregate([B::Cancelled, B::Enqueued]),
            Some(B::Building)
        );
    }

    #[test]
    fn test_batch_cancelled_before_failure() {
        assert_eq!(
            B::aggregate([B::Failed, B::Cancelled, B::Success]),
            Some(B::Cancelled)
        );
    }

    #[test]
    fn test_batch_empty() {
        assert_eq!(B::aggregate(std::iter::empty()), None);
    }

    #[test]
    fn test_aggregate_is_order_independent_and_idempotent() {
        let all = [
            B::New,
            B::Enqueued,
            B::WaitingForDependencies,
            B::Building,
            B::Success,
            B::Failed,
            B::NoRebuildRequired,
            B::Rejected,
            B::RejectedFailedDependencies,
            B::Cancelled,
            B::SystemError,
        ];
        // Every ordered pair and triple of statuses
        for a in all {
            for b in all {
                assert_eq!(B::aggregate([a, b]), B::aggregate([b, a]));
                for c in all {
                    let forward = B::aggregate([a, b, c]);
                    assert_eq!(forward, B::aggregate([c, a, b]));
                    assert_eq!(forward, B::aggregate([a, b, c, a, b, c]));
                }
            }
        }
    }

    #[test]
    fn test_terminal_states_do_not_transition() {
        assert!(!C::Done.can_transition_to(C::Building));
        assert!(!C::Cancelled.can_transition_to(C::Done));
        assert!(C::Done.can_transition_to(C::Done));
    }

    #[test]
    fn test_lifecycle_transitions() {
        assert!(C::New.can_transition_to(C::Enqueued));
        assert!(C::New.can_transition_to(C::WaitingForDependencies));
        assert!(C::WaitingForDependencies.can_transition_to(C::Building));
        assert!(C::Building.can_transition_to(C::Done));
        assert!(C::Building.can_transition_to(C::SystemError));
        assert!(C::Enqueued.can_transition_to(C::Cancelled));
        assert!(C::New.can_transition_to(C::RejectedAlreadyBuilt));
        assert!(C::Enqueued.can_transition_to(C::Done));
        assert!(C::Building.can_transition_to(C::RejectedAlreadyBuilt));

        assert!(!C::Building.can_transition_to(C::Enqueued));
        assert!(!C::Enqueued.can_transition_to(C::New));
        assert!(!C::Done.can_transition_to(C::RejectedAlreadyBuilt));
    }

    #[test]
    fn test_remote_state_mapping() {
        assert_eq!(B::from_remote(State::Waiting, StopFlag::None), B::WaitingForDependencies);
        assert_eq!(B::from_remote(State::Up, StopFlag::None), B::Building);
        assert_eq!(B::from_remote(State::Stopping, StopFlag::Cancelled), B::Building);
        assert_eq!(B::from_remote(State::StartFailed, StopFlag::None), B::SystemError);
        assert_eq!(B::from_remote(State::Failed, StopFlag::Unsuccessful), B::Failed);
        assert_eq!(B::from_remote(State::Successful, StopFlag::None), B::Success);
        assert_eq!(B::from_remote(State::Stopped, StopFlag::Cancelled), B::Cancelled);
        assert_eq!(
            B::from_remote(State::Stopped, StopFlag::DependencyFailed),
            B::RejectedFailedDependencies
        );
    }

    #[test]
    fn test_final_status_agreement() {
        for c in [
            C::New,
            C::Enqueued,
            C::WaitingForDependencies,
            C::Building,
            C::Done,
            C::DoneWithErrors,
            C::SystemError,
            C::Cancelled,
            C::RejectedAlreadyBuilt,
            C::RejectedFailedDependencies,
            C::Rejected,
        ] {
            assert_eq!(c.is_final(), c.to_build_status().is_final(), "{c}");
        }
    }
}

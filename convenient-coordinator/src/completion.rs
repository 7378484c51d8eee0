//! Completion reports and how they map onto a terminal task status

use crate::model::BuildTaskId;
use crate::status::BuildCoordinationStatus;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Outcome reported by whatever executed the build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionStatus {
    Success,
    Failed,
    NoRebuildRequired,
    Cancelled,
    TimedOut,
    SystemError,
}

/// Result of the alignment step that runs before the build proper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentResult {
    pub status: CompletionStatus,
    #[serde(default)]
    pub log: String,
}

/// Result of the build driver running the build script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDriverResult {
    pub status: CompletionStatus,
    #[serde(default)]
    pub log: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub completion_status: CompletionStatus,
    #[serde(default)]
    pub process_exception: Option<String>,
    #[serde(default)]
    pub alignment_result: Option<AlignmentResult>,
    #[serde(default)]
    pub build_driver_result: Option<BuildDriverResult>,
}

impl BuildResult {
    fn bare(completion_status: CompletionStatus) -> Self {
        Self {
            completion_status,
            process_exception: None,
            alignment_result: None,
            build_driver_result: None,
        }
    }

    pub fn success() -> Self {
        Self::bare(CompletionStatus::Success)
    }

    pub fn cancelled() -> Self {
        Self::bare(CompletionStatus::Cancelled)
    }

    /// The build script ran and failed
    pub fn build_failed(log: impl Into<String>) -> Self {
        Self {
            build_driver_result: Some(BuildDriverResult {
                status: CompletionStatus::Failed,
                log: log.into(),
            }),
            ..Self::bare(CompletionStatus::Failed)
        }
    }

    /// The build could not run at all
    pub fn process_failed(exception: impl Into<String>) -> Self {
        Self {
            process_exception: Some(exception.into()),
            ..Self::bare(CompletionStatus::Failed)
        }
    }

    pub fn alignment_failed(log: impl Into<String>) -> Self {
        Self {
            alignment_result: Some(AlignmentResult {
                status: CompletionStatus::Failed,
                log: log.into(),
            }),
            ..Self::bare(CompletionStatus::Failed)
        }
    }
}

/// Terminal status and description for a completion report.
pub fn classify(
    task_id: &BuildTaskId,
    result: &BuildResult,
) -> (BuildCoordinationStatus, Option<String>) {
    match result.completion_status {
        CompletionStatus::Success => (BuildCoordinationStatus::Done, None),
        CompletionStatus::NoRebuildRequired => (
            BuildCoordinationStatus::RejectedAlreadyBuilt,
            Some("No rebuild required".to_string()),
        ),
        CompletionStatus::Cancelled => (
            BuildCoordinationStatus::Cancelled,
            Some("Build cancelled".to_string()),
        ),
        CompletionStatus::TimedOut => (
            BuildCoordinationStatus::SystemError,
            Some("Build timed out".to_string()),
        ),
        CompletionStatus::SystemError => (
            BuildCoordinationStatus::SystemError,
            Some(
                result
                    .process_exception
                    .clone()
                    .unwrap_or_else(|| "System error".to_string()),
            ),
        ),
        CompletionStatus::Failed => classify_failure(task_id, result),
    }
}

fn classify_failure(
    task_id: &BuildTaskId,
    result: &BuildResult,
) -> (BuildCoordinationStatus, Option<String>) {
    if let Some(exception) = &result.process_exception {
        return (
            BuildCoordinationStatus::SystemError,
            Some(format!("Build process failed: {exception}")),
        );
    }

    if let Some(alignment) = result
        .alignment_result
        .as_ref()
        .filter(|a| a.status != CompletionStatus::Success)
    {
        return (
            BuildCoordinationStatus::SystemError,
            Some(format!("Alignment failed with status {:?}", alignment.status)),
        );
    }

    if result.build_driver_result.is_some() {
        return (
            BuildCoordinationStatus::DoneWithErrors,
            Some("Build script failed".to_string()),
        );
    }

    error!(
        task = %task_id,
        result = ?result,
        "Build failed with missing failure detail: no process exception, alignment or build driver result"
    );
    (
        BuildCoordinationStatus::SystemError,
        Some("Build failed with missing failure detail".to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn id() -> BuildTaskId {
        BuildTaskId::new("AAAAAAAAAAAAE")
    }

    #[test]
    fn test_plain_outcomes() {
        assert_eq!(
            classify(&id(), &BuildResult::success()).0,
            BuildCoordinationStatus::Done
        );
        assert_eq!(
            classify(&id(), &BuildResult::cancelled()).0,
            BuildCoordinationStatus::Cancelled
        );
        assert_eq!(
            classify(&id(), &BuildResult::bare(CompletionStatus::TimedOut)).0,
            BuildCoordinationStatus::SystemError
        );
        assert_eq!(
            classify(&id(), &BuildResult::bare(CompletionStatus::NoRebuildRequired)).0,
            BuildCoordinationStatus::RejectedAlreadyBuilt
        );
    }

    #[test]
    fn test_failures_by_detail() {
        assert_eq!(
            classify(&id(), &BuildResult::build_failed("mvn: BUILD FAILURE")).0,
            BuildCoordinationStatus::DoneWithErrors
        );
        assert_eq!(
            classify(&id(), &BuildResult::process_failed("pod evicted")).0,
            BuildCoordinationStatus::SystemError
        );
        assert_eq!(
            classify(&id(), &BuildResult::alignment_failed("no such tag")).0,
            BuildCoordinationStatus::SystemError
        );
    }

    #[test]
    fn test_process_exception_wins_over_driver_result() {
        let mut result = BuildResult::build_failed("compile error");
        result.process_exception = Some("connection reset".to_string());
        let (status, description) = classify(&id(), &result);
        assert_eq!(status, BuildCoordinationStatus::SystemError);
        assert!(description.unwrap().contains("connection reset"));
    }

    #[test]
    #[traced_test]
    fn test_failure_without_detail_is_logged() {
        let (status, description) = classify(&id(), &BuildResult::bare(CompletionStatus::Failed));
        assert_eq!(status, BuildCoordinationStatus::SystemError);
        assert!(description.unwrap().contains("missing failure detail"));
        assert!(logs_contain("missing failure detail"));
    }

    #[test]
    fn test_result_from_json() {
        let result: BuildResult = serde_json::from_str(
            r#"{"completion_status":"FAILED","build_driver_result":{"status":"FAILED"}}"#,
        )
        .unwrap();
        assert_eq!(
            classify(&id(), &result).0,
            BuildCoordinationStatus::DoneWithErrors
        );
    }
}

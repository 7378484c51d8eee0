//! Wire types of the Rex task-graph API.
//!
//! Field names follow the engine's JSON (camelCase, upper-case enums).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Lifecycle state of a task inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Created, not yet evaluated
    New,
    /// Waiting for dependencies to finish
    Waiting,
    /// Dependencies satisfied, queued for a free slot
    Enqueued,
    /// Remote start request in flight
    Starting,
    /// Remote entity is running the task
    Up,
    /// Remote cancel request in flight
    Stopping,
    /// Remote start request failed
    StartFailed,
    /// Remote cancel request failed
    StopFailed,
    /// Remote entity reported failure
    Failed,
    /// Remote entity reported success
    Successful,
    /// Task was stopped before finishing
    Stopped,
}

impl State {
    /// Whether the engine will never move the task out of this state.
    #[must_use]
    pub fn is_final(self) -> bool {
        matches!(
            self,
            State::StartFailed
                | State::StopFailed
                | State::Failed
                | State::Successful
                | State::Stopped
        )
    }

    /// Whether the task is actively holding a remote slot.
    #[must_use]
    pub fn is_running(self) -> bool {
        matches!(self, State::Starting | State::Up | State::Stopping)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::New => "NEW",
            State::Waiting => "WAITING",
            State::Enqueued => "ENQUEUED",
            State::Starting => "STARTING",
            State::Up => "UP",
            State::Stopping => "STOPPING",
            State::StartFailed => "START_FAILED",
            State::StopFailed => "STOP_FAILED",
            State::Failed => "FAILED",
            State::Successful => "SUCCESSFUL",
            State::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Why a task ended up `STOPPED` (or failed).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopFlag {
    /// No stop happened
    #[default]
    None,
    /// Cancelled on request
    Cancelled,
    /// A dependency did not succeed
    DependencyFailed,
    /// Remote entity reported an unsuccessful result
    Unsuccessful,
    /// Remote entity did not answer in time
    TimedOut,
}

/// Scheduling mode of a submitted task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    /// Start as soon as dependencies allow
    #[default]
    Active,
    /// Keep the task queued until it is explicitly released
    Idle,
}

/// HTTP method of a remote request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
}

/// A single request header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Header name
    pub name: String,
    /// Header value
    pub value: String,
}

/// A request the engine performs on our behalf (start, cancel, notify).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// HTTP method
    pub method: Method,
    /// Absolute target URI
    pub uri: String,
    /// Headers sent with the request
    #[serde(default)]
    pub headers: Vec<Header>,
    /// JSON body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<serde_json::Value>,
}

impl Request {
    /// JSON request with a `Content-Type` header.
    #[must_use]
    pub fn json(method: Method, uri: impl Into<String>, body: Option<serde_json::Value>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: vec![Header {
                name: "Content-Type".to_string(),
                value: "application/json".to_string(),
            }],
            attachment: body,
        }
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header {
            name: name.into(),
            value: value.into(),
        });
        self
    }
}

/// Per-task engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    /// Scheduling mode
    pub mode: Mode,
    /// Forward results of dependencies in the start request
    #[serde(default)]
    pub pass_results_of_dependencies: bool,
}

/// Descriptor of one task in a graph submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTask {
    /// Task name, unique within the engine
    pub name: String,
    /// Request that starts the work
    pub remote_start: Request,
    /// Request that cancels the work
    pub remote_cancel: Request,
    /// Callback invoked on every state transition
    pub caller_notifications: Request,
    /// Task configuration
    #[serde(default)]
    pub configuration: Configuration,
}

/// `source` depends on `target`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeDto {
    /// Dependent task name
    pub source: String,
    /// Dependency task name
    pub target: String,
}

/// Graph submission body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGraphRequest {
    /// Correlates every task of one submission
    pub correlation_id: String,
    /// Dependency edges; endpoints may reference already existing tasks
    pub edges: BTreeSet<EdgeDto>,
    /// New tasks keyed by name
    pub vertices: BTreeMap<String, CreateTask>,
}

/// Task as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDto {
    /// Task name
    pub name: String,
    /// Current state
    pub state: State,
    /// Reason for stopping, if any
    #[serde(default)]
    pub stop_flag: StopFlag,
    /// Correlation id of the submission
    #[serde(default, rename = "correlationID")]
    pub correlation_id: Option<String>,
    /// Names of tasks this one depends on
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Names of tasks depending on this one
    #[serde(default)]
    pub dependants: BTreeSet<String>,
}

/// Transition notification the engine posts to `callerNotifications`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// State before the transition
    pub before: State,
    /// State after the transition
    pub after: State,
    /// Task snapshot after the transition
    pub task: TaskDto,
}

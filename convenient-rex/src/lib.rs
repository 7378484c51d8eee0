//! Rex remote task-graph engine client
//!
//! This crate provides an async client for the Rex scheduling engine, which
//! accepts whole task graphs, releases tasks once their dependencies succeed,
//! and calls back into the submitter on every state transition.
//!
//! # Features
//!
//! - Graph submission with dependency edges
//! - Task lookup by name and by correlation id
//! - Cancellation requests
//! - Completion callbacks (`succeed` / `fail`) for remote work
//! - Conflict responses (HTTP 409) reported as a distinct error
//!
//! # Example
//!
//! ```no_run
//! use convenient_rex::RexClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let rex = RexClient::new("http://localhost:8080")?;
//!
//!     for task in rex.tasks_by_correlation("set-42").await? {
//!         println!("{} is {}", task.name, task.state);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(unused_results)]

pub mod model;

pub use model::{
    Configuration, CreateGraphRequest, CreateTask, EdgeDto, Header, Method, Mode, Notification,
    Request, State, StopFlag, TaskDto,
};

use reqwest::{Client, StatusCode};
use tracing::debug;

/// Error types for engine operations
#[derive(Debug, thiserror::Error)]
pub enum RexError {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The engine already knows the graph or one of its tasks
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Task not found
    #[error("Task not found: {0}")]
    NotFound(String),

    /// Engine answered with an unexpected status
    #[error("Server error ({status}): {message}")]
    ServerError {
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl RexError {
    /// Whether re-submitting the same request may succeed.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, RexError::Conflict(_))
    }
}

/// Result type for engine operations
pub type RexResult<T> = Result<T, RexError>;

/// Map a non-success status to an error.
fn classify(status: StatusCode, subject: &str, body: String) -> RexError {
    match status {
        StatusCode::CONFLICT => RexError::Conflict(if body.is_empty() {
            subject.to_string()
        } else {
            body
        }),
        StatusCode::NOT_FOUND => RexError::NotFound(subject.to_string()),
        other => RexError::ServerError {
            status: other.as_u16(),
            message: if body.is_empty() {
                other.canonical_reason().unwrap_or("unknown").to_string()
            } else {
                body
            },
        },
    }
}

/// Rex client
#[derive(Clone)]
pub struct RexClient {
    base_url: String,
    client: Client,
    token: Option<String>,
}

impl RexClient {
    /// Create a new client
    ///
    /// # Arguments
    ///
    /// * `base_url` - Base URL of the engine (e.g., "<http://localhost:8080>")
    ///
    /// # Errors
    ///
    /// Returns `RexError::InvalidUrl` if the URL is malformed
    pub fn new(base_url: &str) -> RexResult<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(RexError::InvalidUrl(base_url));
        }

        Ok(Self {
            base_url,
            client: Client::new(),
            token: None,
        })
    }

    /// Send a bearer token with every request.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Base URL without trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn check(response: reqwest::Response, subject: &str) -> RexResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify(status, subject, body))
    }

    /// Submit a task graph.
    ///
    /// # Errors
    ///
    /// Returns `RexError::Conflict` if the graph or a task already exists,
    /// `RexError::Http` if the request fails and `RexError::ServerError` for
    /// any other rejection
    pub async fn submit_graph(&self, request: &CreateGraphRequest) -> RexResult<Vec<TaskDto>> {
        let url = format!("{}/rest/tasks", self.base_url);
        debug!(
            "Submitting graph {} ({} tasks, {} edges)",
            request.correlation_id,
            request.vertices.len(),
            request.edges.len()
        );

        let response = self
            .authorize(self.client.post(&url))
            .json(request)
            .send()
            .await?;
        let response = Self::check(response, &request.correlation_id).await?;

        // Older engines answer with an empty body
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&bytes).map_err(|e| RexError::ServerError {
            status: 200,
            message: format!("Unreadable submission response: {e}"),
        })
    }

    /// Fetch one task.
    ///
    /// # Errors
    ///
    /// Returns `RexError::Http` if the request fails and
    /// `RexError::ServerError` if the engine rejects it
    pub async fn task(&self, name: &str) -> RexResult<Option<TaskDto>> {
        let url = format!("{}/rest/tasks/{}", self.base_url, name);

        let response = self.authorize(self.client.get(&url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response, name).await?;
        Ok(Some(response.json().await?))
    }

    /// Fetch every task submitted under a correlation id.
    ///
    /// # Errors
    ///
    /// Returns `RexError::Http` if the request fails and
    /// `RexError::ServerError` if the engine rejects it
    pub async fn tasks_by_correlation(&self, correlation_id: &str) -> RexResult<Vec<TaskDto>> {
        let url = format!(
            "{}/rest/tasks/by-correlation/{}",
            self.base_url, correlation_id
        );

        let response = self.authorize(self.client.get(&url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = Self::check(response, correlation_id).await?;
        Ok(response.json().await?)
    }

    /// Ask the engine to cancel a task. Cancellation is best effort: the
    /// final `STOPPED` state arrives later through the notification callback.
    ///
    /// # Errors
    ///
    /// Returns `RexError::NotFound` if the engine doesn't know the task
    pub async fn cancel(&self, name: &str) -> RexResult<()> {
        let url = format!("{}/rest/tasks/{}/cancel", self.base_url, name);

        let response = self.authorize(self.client.put(&url)).send().await?;
        let _ = Self::check(response, name).await?;
        Ok(())
    }

    /// Report the outcome of remote work for a task.
    ///
    /// # Errors
    ///
    /// Returns `RexError::NotFound` if the engine doesn't know the task
    pub async fn report(
        &self,
        name: &str,
        success: bool,
        payload: Option<&serde_json::Value>,
    ) -> RexResult<()> {
        let outcome = if success { "succeed" } else { "fail" };
        let url = format!("{}/rest/callback/{}/{}", self.base_url, name, outcome);

        let mut builder = self.authorize(self.client.post(&url));
        if let Some(payload) = payload {
            builder = builder.json(payload);
        }
        let response = builder.send().await?;
        let _ = Self::check(response, name).await?;
        Ok(())
    }
}

//! Coordinator configuration
//!
//! Loaded from YAML; every field has a default so an empty document yields a
//! working local setup:
//!
//! ```yaml
//! scheduler:
//!   type: rex
//!   url: http://rex.internal:8080
//!   callback_url: http://coordinator.internal:8080
//! cancel_timeout_ms: 300000
//! submit_retry:
//!   max_attempts: 5
//! ```

use crate::error::ConfigError;
use crate::scheduler::RetryPolicy;
use convenient_rex::Mode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Which engine executes submitted graphs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SchedulerBackend {
    /// In-process engine
    #[default]
    Local,
    /// Remote Rex engine
    Rex {
        /// Engine base URL
        url: String,
        /// Base URL the engine calls back into
        callback_url: String,
        /// Bearer token for the engine and for callbacks
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        mode: Mode,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub scheduler: SchedulerBackend,

    /// How long a cancelled task may take to reach a final state before it
    /// is cancelled locally
    #[serde(rename = "cancel_timeout_ms", with = "millis")]
    pub cancel_timeout: Duration,

    /// Period of the batch status reconciler
    #[serde(rename = "reconcile_interval_ms", with = "millis")]
    pub reconcile_interval: Duration,

    /// Capacity of the status notification bus
    pub notification_capacity: usize,

    /// Retry policy for conflicting graph submissions
    pub submit_retry: RetryPolicy,

    /// First value of the task id sequence
    pub first_task_id: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerBackend::Local,
            cancel_timeout: Duration::from_secs(5 * 60),
            reconcile_interval: Duration::from_secs(60),
            notification_capacity: 256,
            submit_retry: RetryPolicy::default(),
            first_task_id: 1,
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        // An empty document parses to null, which means "all defaults"
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.notification_capacity == 0 {
            return Err(ConfigError::Invalid(
                "notification_capacity must be positive".to_string(),
            ));
        }
        if self.submit_retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "submit_retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.reconcile_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "reconcile_interval_ms must be positive".to_string(),
            ));
        }
        if let SchedulerBackend::Rex { url, callback_url, .. } = &self.scheduler {
            for value in [url, callback_url] {
                if !value.starts_with("http://") && !value.starts_with("https://") {
                    return Err(ConfigError::Invalid(format!("not an http(s) URL: {value}")));
                }
            }
        }
        Ok(())
    }
}

/// Durations as integer milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

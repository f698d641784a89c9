// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource models as reported by the remote platform.
//!
//! These are observed-state snapshots. They are fetched fresh on every step
//! invocation and never cached between steps.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of an asynchronous platform job.
pub type JobId = String;

/// Free-form parameters attached to services, keys and bindings.
pub type Parameters = BTreeMap<String, Value>;

/// Labels and annotations attached to a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Selector labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Informational annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl Metadata {
    /// Whether neither labels nor annotations are set.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.annotations.is_empty()
    }

    /// Builder-style label setter.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Builder-style annotation setter.
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// Last operations
// ============================================================================

/// Kind of the last operation performed on a service, key or binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Resource creation.
    Create,
    /// Resource update.
    Update,
    /// Resource deletion.
    Delete,
}

impl OperationType {
    /// Returns the string representation used by the platform.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// State of the last operation as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Accepted, not started yet.
    Initial,
    /// Still running.
    InProgress,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed,
}

impl OperationState {
    /// Returns the string representation used by the platform.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::InProgress => "in progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Parse a platform state string. Unknown values map to `Initial`.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().replace('_', " ").as_str() {
            "in progress" => Self::InProgress,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            _ => Self::Initial,
        }
    }

    /// Whether the operation has finished one way or the other.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Last operation reported for a service instance, key or binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastOperation {
    /// What the operation was doing.
    #[serde(rename = "type")]
    pub operation_type: OperationType,
    /// Where it currently stands.
    pub state: OperationState,
    /// Platform-provided detail, usually set on failure.
    #[serde(default)]
    pub description: Option<String>,
}

impl LastOperation {
    /// Create a last operation without a description.
    pub fn new(operation_type: OperationType, state: OperationState) -> Self {
        Self {
            operation_type,
            state,
            description: None,
        }
    }

    /// Builder-style description setter.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

// ============================================================================
// Services
// ============================================================================

/// A service instance, managed or user-provided.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Platform identifier, absent before creation.
    #[serde(default)]
    pub guid: Option<String>,
    /// Service instance name, unique within a space.
    pub name: String,
    /// Service offering label (managed services only).
    #[serde(default)]
    pub offering: Option<String>,
    /// Service plan (managed services only).
    #[serde(default)]
    pub plan: Option<String>,
    /// Whether this is a user-provided service.
    #[serde(default)]
    pub user_provided: bool,
    /// Tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Parameters for managed services, credentials for user-provided ones.
    #[serde(default)]
    pub parameters: Parameters,
    /// Syslog drain URL (user-provided services only).
    #[serde(default)]
    pub syslog_drain_url: Option<String>,
    /// Labels and annotations.
    #[serde(default)]
    pub metadata: Metadata,
    /// Last operation performed on the instance.
    #[serde(default)]
    pub last_operation: Option<LastOperation>,
}

/// A service key (credentials issued by a service instance).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceKey {
    /// Platform identifier.
    #[serde(default)]
    pub guid: Option<String>,
    /// Key name, unique per service instance.
    pub name: String,
    /// Owning service instance name.
    pub service_name: String,
    /// Parameters the key was created with.
    #[serde(default)]
    pub parameters: Parameters,
    /// Labels and annotations.
    #[serde(default)]
    pub metadata: Metadata,
    /// Last operation performed on the key.
    #[serde(default)]
    pub last_operation: Option<LastOperation>,
}

/// A binding between an application and a service instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceBinding {
    /// Platform identifier.
    #[serde(default)]
    pub guid: Option<String>,
    /// Bound application.
    pub app_name: String,
    /// Bound service instance.
    pub service_name: String,
    /// Binding parameters.
    #[serde(default)]
    pub parameters: Parameters,
    /// Last operation performed on the binding.
    #[serde(default)]
    pub last_operation: Option<LastOperation>,
}

/// A service broker registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceBroker {
    /// Platform identifier.
    #[serde(default)]
    pub guid: Option<String>,
    /// Broker name.
    pub name: String,
    /// Basic auth user.
    pub username: String,
    /// Basic auth password.
    pub password: String,
    /// Broker endpoint.
    pub url: String,
    /// Space the broker is scoped to, if any.
    #[serde(default)]
    pub space_guid: Option<String>,
    /// Labels and annotations.
    #[serde(default)]
    pub metadata: Metadata,
}

// ============================================================================
// Applications
// ============================================================================

/// Requested running state of an application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    /// Application is stopped.
    #[default]
    Stopped,
    /// Application is started.
    Started,
}

/// Staging configuration of an application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Staging {
    /// Buildpacks in order.
    #[serde(default)]
    pub buildpacks: Vec<String>,
    /// Stack name.
    #[serde(default)]
    pub stack: Option<String>,
    /// Start command.
    #[serde(default)]
    pub command: Option<String>,
    /// Health check type (port, process, http).
    #[serde(default)]
    pub health_check_type: Option<String>,
    /// Health check endpoint for http checks.
    #[serde(default)]
    pub health_check_endpoint: Option<String>,
}

/// Docker image information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerInfo {
    /// Image reference.
    pub image: String,
    /// Registry user.
    #[serde(default)]
    pub username: Option<String>,
    /// Registry password.
    #[serde(default)]
    pub password: Option<String>,
}

/// An application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Application {
    /// Platform identifier.
    #[serde(default)]
    pub guid: Option<String>,
    /// Application name, unique within a space.
    pub name: String,
    /// Memory per instance in MB.
    #[serde(default)]
    pub memory_mb: u64,
    /// Disk quota per instance in MB.
    #[serde(default)]
    pub disk_quota_mb: u64,
    /// Desired instance count.
    #[serde(default)]
    pub instances: u32,
    /// Mapped routes.
    #[serde(default)]
    pub routes: Vec<String>,
    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Staging configuration.
    #[serde(default)]
    pub staging: Staging,
    /// Docker image, for docker applications.
    #[serde(default)]
    pub docker: Option<DockerInfo>,
    /// Requested state.
    #[serde(default)]
    pub state: AppState,
    /// Labels and annotations.
    #[serde(default)]
    pub metadata: Metadata,
}

/// State of a single application instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    /// Being started.
    Starting,
    /// Running and healthy.
    Running,
    /// Crashed.
    Crashed,
    /// Crashing repeatedly.
    Flapping,
    /// Stopped.
    Down,
    /// Not reported.
    Unknown,
}

impl InstanceState {
    /// Returns the string representation used by the platform.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Crashed => "CRASHED",
            Self::Flapping => "FLAPPING",
            Self::Down => "DOWN",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Reported information about one application instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Instance index.
    pub index: u32,
    /// Current state.
    pub state: InstanceState,
}

/// Stream a log line was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl MessageType {
    /// Parse `STDOUT` / `STDERR` (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "STDOUT" => Some(Self::Stdout),
            "STDERR" => Some(Self::Stderr),
            _ => None,
        }
    }
}

/// A recent application log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppLog {
    /// Log source (`APP`, `STG`, `RTR`, ...).
    pub source_name: String,
    /// Output stream.
    pub message_type: MessageType,
    /// Message text.
    pub message: String,
    /// When the line was written.
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Builds
// ============================================================================

/// State of an application build (staging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildState {
    /// The droplet is being built.
    Staging,
    /// The droplet is ready.
    Staged,
    /// Staging failed.
    Failed,
}

/// A staging run of an application's package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    /// Build identifier.
    pub id: String,
    /// Application being staged.
    pub app_name: String,
    /// Current state.
    pub state: BuildState,
    /// Reason reported by a failed build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Jobs
// ============================================================================

/// State of an asynchronous platform job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Queued or running.
    Processing,
    /// Waiting on an external system (for example a broker).
    Polling,
    /// Finished successfully.
    Complete,
    /// Finished with errors.
    Failed,
}

/// An asynchronous platform job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Job identifier.
    pub id: JobId,
    /// Current state.
    pub state: JobState,
    /// Errors reported by a failed job.
    #[serde(default)]
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_state_parse() {
        assert_eq!(OperationState::parse("succeeded"), OperationState::Succeeded);
        assert_eq!(OperationState::parse("failed"), OperationState::Failed);
        assert_eq!(OperationState::parse("in progress"), OperationState::InProgress);
        assert_eq!(OperationState::parse("IN_PROGRESS"), OperationState::InProgress);
        assert_eq!(OperationState::parse("initial"), OperationState::Initial);
        assert_eq!(OperationState::parse("whatever"), OperationState::Initial);
    }

    #[test]
    fn test_operation_state_terminal() {
        assert!(OperationState::Succeeded.is_terminal());
        assert!(OperationState::Failed.is_terminal());
        assert!(!OperationState::InProgress.is_terminal());
        assert!(!OperationState::Initial.is_terminal());
    }

    #[test]
    fn test_last_operation_json_shape() {
        let op = LastOperation::new(OperationType::Create, OperationState::InProgress);
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "create");
        assert_eq!(json["state"], "in_progress");
    }

    #[test]
    fn test_service_instance_defaults_from_sparse_json() {
        let service: ServiceInstance =
            serde_json::from_str(r#"{"name":"db","offering":"postgres"}"#).unwrap();
        assert_eq!(service.name, "db");
        assert!(service.tags.is_empty());
        assert!(service.metadata.is_empty());
        assert!(service.last_operation.is_none());
    }

    #[test]
    fn test_message_type_parse() {
        assert_eq!(MessageType::parse("stdout"), Some(MessageType::Stdout));
        assert_eq!(MessageType::parse("STDERR"), Some(MessageType::Stderr));
        assert_eq!(MessageType::parse("other"), None);
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Platform client traits.
//!
//! The process core only needs a narrow slice of the platform API: lookups by
//! name, mutations that may hand back a job id, and operation-status reads.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::*;

/// The (user, org, space) triple a client is authenticated against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CloudTarget {
    /// User the client acts as.
    pub user: String,
    /// Organization name.
    pub org: String,
    /// Space name.
    pub space: String,
}

impl CloudTarget {
    /// Create a new target.
    pub fn new(user: impl Into<String>, org: impl Into<String>, space: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            org: org.into(),
            space: space.into(),
        }
    }
}

impl std::fmt::Display for CloudTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}/{}", self.user, self.org, self.space)
    }
}

/// Remote platform API used by steps and async executions.
///
/// Lookups return `Ok(None)` when the platform reports the resource as
/// missing. Mutations return the id of the job the platform started, if the
/// operation is asynchronous.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    // ------------------------------------------------------------------
    // Applications
    // ------------------------------------------------------------------

    /// Get an application by name.
    async fn get_application(&self, name: &str) -> Result<Option<Application>>;

    /// Create an application.
    async fn create_application(&self, app: &Application) -> Result<()>;

    /// Replace the attributes of an existing application.
    async fn update_application(&self, app: &Application) -> Result<()>;

    /// Delete an application.
    async fn delete_application(&self, name: &str) -> Result<()>;

    /// Rename an application.
    async fn rename_application(&self, name: &str, new_name: &str) -> Result<()>;

    /// Start an application.
    async fn start_application(&self, name: &str) -> Result<()>;

    /// Stop an application.
    async fn stop_application(&self, name: &str) -> Result<()>;

    /// Scale an application to the given number of instances.
    async fn update_application_instances(&self, name: &str, instances: u32) -> Result<()>;

    /// Get per-instance state of an application.
    async fn get_application_instances(&self, name: &str) -> Result<Vec<InstanceInfo>>;

    /// Get recent logs of an application, optionally only newer than `since`.
    async fn get_recent_logs(
        &self,
        name: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<AppLog>>;

    /// Enable or disable the autoscaler for an application.
    async fn set_application_autoscaling(&self, name: &str, enabled: bool) -> Result<()>;

    /// Stage the current package of an application.
    async fn stage_application(&self, name: &str) -> Result<Build>;

    /// Get a build by id.
    async fn get_build(&self, build_id: &str) -> Result<Build>;

    // ------------------------------------------------------------------
    // Service instances
    // ------------------------------------------------------------------

    /// Get a service instance by name.
    async fn get_service_instance(&self, name: &str) -> Result<Option<ServiceInstance>>;

    /// Create a service instance.
    async fn create_service_instance(&self, service: &ServiceInstance) -> Result<Option<JobId>>;

    /// Change the plan of a managed service.
    async fn update_service_plan(&self, name: &str, plan: &str) -> Result<Option<JobId>>;

    /// Replace service parameters (credentials for user-provided services).
    async fn update_service_parameters(
        &self,
        name: &str,
        parameters: &Parameters,
    ) -> Result<Option<JobId>>;

    /// Replace service tags.
    async fn update_service_tags(&self, name: &str, tags: &[String]) -> Result<Option<JobId>>;

    /// Replace the syslog drain URL of a user-provided service.
    async fn update_service_syslog_drain_url(&self, name: &str, url: &str) -> Result<()>;

    /// Replace the labels and annotations of a service.
    async fn update_service_metadata(&self, name: &str, metadata: &Metadata) -> Result<()>;

    /// Delete a service instance.
    async fn delete_service_instance(&self, name: &str) -> Result<Option<JobId>>;

    // ------------------------------------------------------------------
    // Service keys
    // ------------------------------------------------------------------

    /// List the keys of a service instance.
    async fn get_service_keys(&self, service_name: &str) -> Result<Vec<ServiceKey>>;

    /// Get a single key of a service instance.
    async fn get_service_key(&self, service_name: &str, key_name: &str)
    -> Result<Option<ServiceKey>>;

    /// Create a service key.
    async fn create_service_key(&self, key: &ServiceKey) -> Result<Option<JobId>>;

    /// Delete a service key.
    async fn delete_service_key(&self, service_name: &str, key_name: &str)
    -> Result<Option<JobId>>;

    /// Replace the labels and annotations of a service key.
    async fn update_service_key_metadata(
        &self,
        service_name: &str,
        key_name: &str,
        metadata: &Metadata,
    ) -> Result<()>;

    // ------------------------------------------------------------------
    // Service bindings
    // ------------------------------------------------------------------

    /// Get the binding between an application and a service.
    async fn get_service_binding(
        &self,
        app_name: &str,
        service_name: &str,
    ) -> Result<Option<ServiceBinding>>;

    /// List all bindings of an application.
    async fn get_application_bindings(&self, app_name: &str) -> Result<Vec<ServiceBinding>>;

    /// Bind a service to an application.
    async fn bind_service(
        &self,
        app_name: &str,
        service_name: &str,
        parameters: &Parameters,
    ) -> Result<Option<JobId>>;

    /// Unbind a service from an application.
    async fn unbind_service(&self, app_name: &str, service_name: &str) -> Result<Option<JobId>>;

    // ------------------------------------------------------------------
    // Service brokers
    // ------------------------------------------------------------------

    /// Get a service broker by name.
    async fn get_service_broker(&self, name: &str) -> Result<Option<ServiceBroker>>;

    /// Register a service broker.
    async fn create_service_broker(&self, broker: &ServiceBroker) -> Result<Option<JobId>>;

    /// Update a service broker registration.
    async fn update_service_broker(&self, broker: &ServiceBroker) -> Result<Option<JobId>>;

    /// Remove a service broker registration.
    async fn delete_service_broker(&self, name: &str) -> Result<Option<JobId>>;

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Get the state of an asynchronous job.
    async fn get_job(&self, job_id: &str) -> Result<Job>;
}

/// Produces authenticated clients for a target.
///
/// Implementations are free to reuse connections; callers cache the
/// returned handle per target for the lifetime of a process context.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Create a client for the given target.
    async fn create_client(&self, target: &CloudTarget) -> Result<Arc<dyn PlatformClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloud_target_display() {
        let target = CloudTarget::new("admin", "acme", "dev");
        assert_eq!(target.to_string(), "admin@acme/dev");
    }

    #[test]
    fn test_cloud_target_ordering_is_total() {
        let a = CloudTarget::new("a", "org", "space");
        let b = CloudTarget::new("b", "org", "space");
        assert!(a < b);
        assert_eq!(a.clone(), a);
    }
}

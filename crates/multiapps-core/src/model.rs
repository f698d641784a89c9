// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Desired-state resource descriptors.
//!
//! Built upstream from the deployment descriptor and handed to steps through
//! the process context. A descriptor is never mutated while a step runs.

use std::collections::BTreeMap;

use multiapps_platform::{
    AppState, Application, DockerInfo, Metadata, Parameters, ServiceInstance, ServiceKey,
    Staging,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Desired state of a service instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Service instance name on the platform.
    pub name: String,
    /// Name of the resource in the deployment descriptor.
    #[serde(default)]
    pub resource_name: Option<String>,
    /// Offering label, `None` for user-provided services.
    #[serde(default)]
    pub offering: Option<String>,
    /// Plan name.
    #[serde(default)]
    pub plan: Option<String>,
    /// Whether this is a user-provided service.
    #[serde(default)]
    pub user_provided: bool,
    /// Tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Creation parameters or credentials.
    #[serde(default)]
    pub parameters: Parameters,
    /// Syslog drain URL (user-provided only).
    #[serde(default)]
    pub syslog_drain_url: Option<String>,
    /// Labels and annotations.
    #[serde(default)]
    pub metadata: Metadata,
    /// Failures on an optional service do not abort the deployment.
    #[serde(default)]
    pub optional: bool,
    /// Do not touch the parameters of an existing service.
    #[serde(default)]
    pub skip_parameters_update: bool,
    /// Desired service keys.
    #[serde(default)]
    pub keys: Vec<ServiceKeyDescriptor>,
}

impl ServiceDescriptor {
    /// Resource name, falling back to the service name.
    pub fn resource_name(&self) -> &str {
        self.resource_name.as_deref().unwrap_or(&self.name)
    }

    /// Human-readable type, for example `postgresql/small`.
    pub fn service_type(&self) -> String {
        service_type(self.user_provided, self.offering.as_deref(), self.plan.as_deref())
    }

    /// The service instance to create on the platform.
    pub fn to_instance(&self) -> ServiceInstance {
        ServiceInstance {
            guid: None,
            name: self.name.clone(),
            offering: self.offering.clone(),
            plan: self.plan.clone(),
            user_provided: self.user_provided,
            tags: self.tags.clone(),
            parameters: self.parameters.clone(),
            syslog_drain_url: self.syslog_drain_url.clone(),
            metadata: self.metadata.clone(),
            last_operation: None,
        }
    }
}

/// Human-readable service type of an instance.
pub fn service_type(user_provided: bool, offering: Option<&str>, plan: Option<&str>) -> String {
    if user_provided {
        return "user-provided-service".to_string();
    }
    format!(
        "{}/{}",
        offering.filter(|s| !s.is_empty()).unwrap_or("unknown-label"),
        plan.filter(|s| !s.is_empty()).unwrap_or("unknown-plan")
    )
}

/// Desired state of a service key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceKeyDescriptor {
    /// Key name.
    pub name: String,
    /// Key parameters.
    #[serde(default)]
    pub parameters: Parameters,
    /// Labels and annotations.
    #[serde(default)]
    pub metadata: Metadata,
}

impl ServiceKeyDescriptor {
    /// The key to create for `service_name`.
    pub fn to_key(&self, service_name: &str) -> ServiceKey {
        ServiceKey {
            guid: None,
            name: self.name.clone(),
            service_name: service_name.to_string(),
            parameters: self.parameters.clone(),
            metadata: self.metadata.clone(),
            last_operation: None,
        }
    }
}

/// A service an application wants to be bound to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindingDescriptor {
    /// Service instance name.
    pub service: String,
    /// Binding parameters.
    #[serde(default)]
    pub parameters: Parameters,
    /// Leave an existing binding as it is, even if the parameters differ.
    #[serde(default)]
    pub keep_existing: bool,
    /// The bound service is optional.
    #[serde(default)]
    pub optional: bool,
}

/// Desired state of an application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppDescriptor {
    /// Application name on the platform.
    pub name: String,
    /// Module the application was built from.
    #[serde(default)]
    pub module_name: Option<String>,
    /// Memory in MB.
    #[serde(default)]
    pub memory_mb: u64,
    /// Disk quota in MB.
    #[serde(default)]
    pub disk_quota_mb: u64,
    /// Instance count.
    #[serde(default = "default_instances")]
    pub instances: u32,
    /// Routes.
    #[serde(default)]
    pub routes: Vec<String>,
    /// Environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Staging configuration.
    #[serde(default)]
    pub staging: Staging,
    /// Docker image, for docker applications.
    #[serde(default)]
    pub docker: Option<DockerInfo>,
    /// Services to bind.
    #[serde(default)]
    pub bindings: Vec<BindingDescriptor>,
    /// Labels and annotations.
    #[serde(default)]
    pub metadata: Metadata,
    /// Free-form descriptor attributes (`service-broker-name`, `execute-app`, ...).
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

fn default_instances() -> u32 {
    1
}

impl AppDescriptor {
    /// Look up a string attribute.
    pub fn attribute_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Value::as_str)
    }

    /// Look up a boolean attribute, accepting `true`/`"true"`.
    pub fn attribute_bool(&self, name: &str) -> Option<bool> {
        match self.attributes.get(name)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Binding for `service`, if the application declares one.
    pub fn binding(&self, service: &str) -> Option<&BindingDescriptor> {
        self.bindings.iter().find(|b| b.service == service)
    }

    /// The application to create on the platform.
    pub fn to_application(&self) -> Application {
        Application {
            guid: None,
            name: self.name.clone(),
            memory_mb: self.memory_mb,
            disk_quota_mb: self.disk_quota_mb,
            instances: self.instances,
            routes: self.routes.clone(),
            env: self.env.clone(),
            staging: self.staging.clone(),
            docker: self.docker.clone(),
            state: AppState::Stopped,
            metadata: self.metadata.clone(),
        }
    }
}

/// A previously deployed application, as recorded by the deployed-MTA detector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedApp {
    /// Application name on the platform.
    pub name: String,
    /// Module the application was built from.
    #[serde(default)]
    pub module_name: Option<String>,
    /// Service names the application was bound to.
    #[serde(default)]
    pub services: Vec<String>,
}

/// A previously deployed MTA.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedMta {
    /// MTA id.
    pub id: String,
    /// Deployed version, `None` when unknown.
    #[serde(default)]
    pub version: Option<String>,
    /// Deployed applications.
    #[serde(default)]
    pub apps: Vec<DeployedApp>,
    /// Services owned by the deployed MTA.
    #[serde(default)]
    pub services: Vec<String>,
}

/// A configuration entry provided by the MTA being deployed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvidedDependency {
    /// Provider id, unique within the MTA (`mta-id:name`).
    pub provider_id: String,
    /// Provider version.
    pub version: String,
    /// JSON content published for consumers.
    #[serde(default)]
    pub content: Option<String>,
}

/// A configuration dependency declared by an application of the MTA.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredDependency {
    /// Consuming application.
    pub app_name: String,
    /// Resource declaring the dependency.
    pub resource_name: String,
    /// Provider namespace id to match.
    #[serde(default)]
    pub provider_nid: Option<String>,
    /// Provider id to match.
    #[serde(default)]
    pub provider_id: Option<String>,
    /// Exact version or requirement such as `>=1.0.0`.
    #[serde(default)]
    pub version: Option<String>,
    /// Target space filter.
    #[serde(default)]
    pub target_space: Option<String>,
    /// JSON properties of the resource.
    #[serde(default)]
    pub properties: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_service_type() {
        let service = ServiceDescriptor {
            name: "db".into(),
            offering: Some("postgresql".into()),
            plan: Some("small".into()),
            ..Default::default()
        };
        assert_eq!(service.service_type(), "postgresql/small");

        let service = ServiceDescriptor {
            name: "db".into(),
            offering: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(service.service_type(), "unknown-label/unknown-plan");

        assert_eq!(service_type(true, None, None), "user-provided-service");
    }

    #[test]
    fn test_app_descriptor_defaults_to_one_instance() {
        let app: AppDescriptor = serde_json::from_value(json!({"name": "web"})).unwrap();
        assert_eq!(app.instances, 1);
        assert!(app.bindings.is_empty());
    }

    #[test]
    fn test_attributes() {
        let mut app = AppDescriptor {
            name: "broker".into(),
            ..Default::default()
        };
        app.attributes
            .insert("create-service-broker".into(), json!("true"));
        app.attributes
            .insert("service-broker-url".into(), json!("https://broker"));
        app.attributes
            .insert("service-broker-space-scoped".into(), json!(false));

        assert_eq!(app.attribute_bool("create-service-broker"), Some(true));
        assert_eq!(app.attribute_bool("service-broker-space-scoped"), Some(false));
        assert_eq!(app.attribute_str("service-broker-url"), Some("https://broker"));
        assert_eq!(app.attribute_str("missing"), None);
    }

    #[test]
    fn test_to_application_is_stopped() {
        let app = AppDescriptor {
            name: "web".into(),
            memory_mb: 256,
            instances: 2,
            ..Default::default()
        };
        let application = app.to_application();
        assert_eq!(application.state, AppState::Stopped);
        assert_eq!(application.instances, 2);
        assert_eq!(application.memory_mb, 256);
    }
}

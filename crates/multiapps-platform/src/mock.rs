// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory platform client for testing.
//!
//! Keeps all resources in memory, records every call and lets tests inject
//! failures per operation or per `operation:resource` pair.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use crate::client::{ClientFactory, CloudTarget, PlatformClient};
use crate::error::{PlatformError, Result};
use crate::model::*;

#[derive(Debug, Default)]
struct MockState {
    apps: HashMap<String, Application>,
    instances: HashMap<String, Vec<InstanceInfo>>,
    logs: HashMap<String, Vec<AppLog>>,
    autoscaling: HashMap<String, bool>,
    services: HashMap<String, ServiceInstance>,
    keys: BTreeMap<(String, String), ServiceKey>,
    bindings: BTreeMap<(String, String), ServiceBinding>,
    brokers: HashMap<String, ServiceBroker>,
    jobs: HashMap<String, Job>,
    builds: HashMap<String, Build>,
    failures: HashMap<String, PlatformError>,
    calls: Vec<String>,
}

/// Mock platform client for testing.
pub struct MockPlatformClient {
    state: Arc<Mutex<MockState>>,
    /// If true, service, key and binding mutations and builds stay in
    /// progress until completed explicitly; mutations hand back a job id.
    pub asynchronous: bool,
    /// If true, broker mutations hand back a job id in `Processing` state.
    pub broker_jobs: bool,
}

impl Default for MockPlatformClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatformClient {
    /// Create a mock where every mutation completes immediately.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            asynchronous: false,
            broker_jobs: false,
        }
    }

    /// Create a mock where service, key and binding operations stay in progress.
    pub fn asynchronous() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            asynchronous: true,
            broker_jobs: true,
        }
    }

    /// Fail every call to `operation` (or to `operation:name`) with `error`.
    pub async fn fail_on(&self, operation: &str, error: PlatformError) {
        self.state
            .lock()
            .await
            .failures
            .insert(operation.to_string(), error);
    }

    /// Remove all injected failures.
    pub async fn clear_failures(&self) {
        self.state.lock().await.failures.clear();
    }

    /// All recorded calls as `operation:name`.
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    /// Count calls matching `operation` or `operation:name`.
    pub async fn call_count(&self, pattern: &str) -> usize {
        let state = self.state.lock().await;
        state
            .calls
            .iter()
            .filter(|call| {
                call.as_str() == pattern
                    || (!pattern.contains(':')
                        && call.split(':').next().is_some_and(|op| op == pattern))
            })
            .count()
    }

    /// Insert or replace an application.
    pub async fn insert_application(&self, app: Application) {
        let mut state = self.state.lock().await;
        state.instances.entry(app.name.clone()).or_default();
        state.apps.insert(app.name.clone(), app);
    }

    /// Current copy of an application.
    pub async fn application(&self, name: &str) -> Option<Application> {
        self.state.lock().await.apps.get(name).cloned()
    }

    /// Replace the instance states of an application.
    pub async fn set_instances(&self, name: &str, states: &[InstanceState]) {
        let instances = states
            .iter()
            .enumerate()
            .map(|(index, state)| InstanceInfo {
                index: index as u32,
                state: *state,
            })
            .collect();
        self.state
            .lock()
            .await
            .instances
            .insert(name.to_string(), instances);
    }

    /// Append a log line to an application.
    pub async fn push_log(&self, name: &str, log: AppLog) {
        self.state
            .lock()
            .await
            .logs
            .entry(name.to_string())
            .or_default()
            .push(log);
    }

    /// Autoscaler flag last set for an application.
    pub async fn autoscaling(&self, name: &str) -> Option<bool> {
        self.state.lock().await.autoscaling.get(name).copied()
    }

    /// Insert or replace a service instance.
    pub async fn insert_service(&self, service: ServiceInstance) {
        self.state
            .lock()
            .await
            .services
            .insert(service.name.clone(), service);
    }

    /// Mark a build as staged.
    pub async fn complete_build(&self, build_id: &str) {
        if let Some(build) = self.state.lock().await.builds.get_mut(build_id) {
            build.state = BuildState::Staged;
        }
    }

    /// Mark a build as failed with `error`.
    pub async fn fail_build(&self, build_id: &str, error: &str) {
        if let Some(build) = self.state.lock().await.builds.get_mut(build_id) {
            build.state = BuildState::Failed;
            build.error = Some(error.to_string());
        }
    }

    /// Current copy of a service instance.
    pub async fn service(&self, name: &str) -> Option<ServiceInstance> {
        self.state.lock().await.services.get(name).cloned()
    }

    /// Remove a service instance, as if deleted by someone else.
    pub async fn remove_service(&self, name: &str) {
        self.state.lock().await.services.remove(name);
    }

    /// Overwrite the last operation of a service instance.
    pub async fn set_service_operation(&self, name: &str, operation: Option<LastOperation>) {
        if let Some(service) = self.state.lock().await.services.get_mut(name) {
            service.last_operation = operation;
        }
    }

    /// Finish the in-flight operation of a service; a finished delete removes it.
    pub async fn complete_service_operation(&self, name: &str) {
        let mut state = self.state.lock().await;
        let is_delete = state
            .services
            .get(name)
            .and_then(|s| s.last_operation.as_ref())
            .is_some_and(|op| op.operation_type == OperationType::Delete);
        if is_delete {
            state.services.remove(name);
        } else if let Some(service) = state.services.get_mut(name)
            && let Some(op) = service.last_operation.as_mut()
        {
            op.state = OperationState::Succeeded;
        }
    }

    /// Insert or replace a service key.
    pub async fn insert_service_key(&self, key: ServiceKey) {
        self.state
            .lock()
            .await
            .keys
            .insert((key.service_name.clone(), key.name.clone()), key);
    }

    /// Keys currently registered for a service.
    pub async fn service_keys(&self, service_name: &str) -> Vec<ServiceKey> {
        self.state
            .lock()
            .await
            .keys
            .values()
            .filter(|k| k.service_name == service_name)
            .cloned()
            .collect()
    }

    /// Finish the in-flight operation of a key; a finished delete removes it.
    pub async fn complete_service_key_operation(&self, service_name: &str, key_name: &str) {
        let mut state = self.state.lock().await;
        let id = (service_name.to_string(), key_name.to_string());
        let is_delete = state
            .keys
            .get(&id)
            .and_then(|k| k.last_operation.as_ref())
            .is_some_and(|op| op.operation_type == OperationType::Delete);
        if is_delete {
            state.keys.remove(&id);
        } else if let Some(key) = state.keys.get_mut(&id)
            && let Some(op) = key.last_operation.as_mut()
        {
            op.state = OperationState::Succeeded;
        }
    }

    /// Insert or replace a binding.
    pub async fn insert_binding(&self, binding: ServiceBinding) {
        self.state.lock().await.bindings.insert(
            (binding.app_name.clone(), binding.service_name.clone()),
            binding,
        );
    }

    /// Overwrite the last operation of a binding.
    pub async fn set_binding_operation(
        &self,
        app_name: &str,
        service_name: &str,
        operation: Option<LastOperation>,
    ) {
        let key = (app_name.to_string(), service_name.to_string());
        if let Some(binding) = self.state.lock().await.bindings.get_mut(&key) {
            binding.last_operation = operation;
        }
    }

    /// Remove a binding, as if deleted by someone else.
    pub async fn remove_binding(&self, app_name: &str, service_name: &str) {
        let key = (app_name.to_string(), service_name.to_string());
        self.state.lock().await.bindings.remove(&key);
    }

    /// Insert or replace a service broker.
    pub async fn insert_broker(&self, broker: ServiceBroker) {
        self.state
            .lock()
            .await
            .brokers
            .insert(broker.name.clone(), broker);
    }

    /// Current copy of a service broker.
    pub async fn broker(&self, name: &str) -> Option<ServiceBroker> {
        self.state.lock().await.brokers.get(name).cloned()
    }

    /// Insert or replace a job.
    pub async fn set_job(&self, job: Job) {
        self.state.lock().await.jobs.insert(job.id.clone(), job);
    }

    /// Record the call and return the injected failure, if any.
    async fn record(&self, operation: &str, name: &str) -> Result<MutexGuard<'_, MockState>> {
        let mut state = self.state.lock().await;
        let call = format!("{}:{}", operation, name);
        debug!(call = %call, "Mock platform call");
        let failure = state
            .failures
            .get(&call)
            .or_else(|| state.failures.get(operation))
            .cloned();
        state.calls.push(call);
        match failure {
            Some(err) => Err(err),
            None => Ok(state),
        }
    }

    fn new_job(&self, state: &mut MockState, pending: bool) -> Option<JobId> {
        if !pending {
            return None;
        }
        let id = Uuid::new_v4().to_string();
        state.jobs.insert(
            id.clone(),
            Job {
                id: id.clone(),
                state: JobState::Processing,
                errors: Vec::new(),
            },
        );
        Some(id)
    }

    fn operation(&self, operation_type: OperationType) -> LastOperation {
        let state = if self.asynchronous {
            OperationState::InProgress
        } else {
            OperationState::Succeeded
        };
        LastOperation::new(operation_type, state)
    }
}

fn not_found(kind: &str, name: &str) -> PlatformError {
    PlatformError::not_found(format!("{} {} not found", kind, name))
}

#[async_trait]
impl PlatformClient for MockPlatformClient {
    async fn get_application(&self, name: &str) -> Result<Option<Application>> {
        let state = self.record("get_application", name).await?;
        Ok(state.apps.get(name).cloned())
    }

    async fn create_application(&self, app: &Application) -> Result<()> {
        let mut state = self.record("create_application", &app.name).await?;
        if state.apps.contains_key(&app.name) {
            return Err(PlatformError::http(
                422,
                format!("The app name is taken: {}", app.name),
            ));
        }
        let mut app = app.clone();
        app.guid.get_or_insert_with(|| Uuid::new_v4().to_string());
        state.instances.entry(app.name.clone()).or_default();
        state.apps.insert(app.name.clone(), app);
        Ok(())
    }

    async fn update_application(&self, app: &Application) -> Result<()> {
        let mut state = self.record("update_application", &app.name).await?;
        let existing = state
            .apps
            .get_mut(&app.name)
            .ok_or_else(|| not_found("Application", &app.name))?;
        let guid = existing.guid.clone();
        *existing = app.clone();
        existing.guid = guid;
        Ok(())
    }

    async fn delete_application(&self, name: &str) -> Result<()> {
        let mut state = self.record("delete_application", name).await?;
        state
            .apps
            .remove(name)
            .ok_or_else(|| not_found("Application", name))?;
        state.instances.remove(name);
        state.bindings.retain(|(app, _), _| app != name);
        Ok(())
    }

    async fn rename_application(&self, name: &str, new_name: &str) -> Result<()> {
        let mut state = self.record("rename_application", name).await?;
        let mut app = state
            .apps
            .remove(name)
            .ok_or_else(|| not_found("Application", name))?;
        app.name = new_name.to_string();
        state.apps.insert(new_name.to_string(), app);
        if let Some(instances) = state.instances.remove(name) {
            state.instances.insert(new_name.to_string(), instances);
        }
        Ok(())
    }

    async fn start_application(&self, name: &str) -> Result<()> {
        let mut state = self.record("start_application", name).await?;
        let app = state
            .apps
            .get_mut(name)
            .ok_or_else(|| not_found("Application", name))?;
        app.state = AppState::Started;
        Ok(())
    }

    async fn stop_application(&self, name: &str) -> Result<()> {
        let mut state = self.record("stop_application", name).await?;
        let app = state
            .apps
            .get_mut(name)
            .ok_or_else(|| not_found("Application", name))?;
        app.state = AppState::Stopped;
        Ok(())
    }

    async fn update_application_instances(&self, name: &str, instances: u32) -> Result<()> {
        let mut state = self.record("update_application_instances", name).await?;
        let app = state
            .apps
            .get_mut(name)
            .ok_or_else(|| not_found("Application", name))?;
        app.instances = instances;
        let infos = state.instances.entry(name.to_string()).or_default();
        infos.truncate(instances as usize);
        while infos.len() < instances as usize {
            infos.push(InstanceInfo {
                index: infos.len() as u32,
                state: InstanceState::Starting,
            });
        }
        Ok(())
    }

    async fn get_application_instances(&self, name: &str) -> Result<Vec<InstanceInfo>> {
        let state = self.record("get_application_instances", name).await?;
        if !state.apps.contains_key(name) {
            return Err(not_found("Application", name));
        }
        Ok(state.instances.get(name).cloned().unwrap_or_default())
    }

    async fn get_recent_logs(
        &self,
        name: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<AppLog>> {
        let state = self.record("get_recent_logs", name).await?;
        let logs = state.logs.get(name).cloned().unwrap_or_default();
        Ok(logs
            .into_iter()
            .filter(|log| since.is_none_or(|since| log.timestamp > since))
            .collect())
    }

    async fn set_application_autoscaling(&self, name: &str, enabled: bool) -> Result<()> {
        let mut state = self.record("set_application_autoscaling", name).await?;
        state.autoscaling.insert(name.to_string(), enabled);
        Ok(())
    }

    async fn stage_application(&self, name: &str) -> Result<Build> {
        let mut state = self.record("stage_application", name).await?;
        if !state.apps.contains_key(name) {
            return Err(not_found("Application", name));
        }
        let build = Build {
            id: Uuid::new_v4().to_string(),
            app_name: name.to_string(),
            state: if self.asynchronous {
                BuildState::Staging
            } else {
                BuildState::Staged
            },
            error: None,
        };
        state.builds.insert(build.id.clone(), build.clone());
        Ok(build)
    }

    async fn get_build(&self, build_id: &str) -> Result<Build> {
        let state = self.record("get_build", build_id).await?;
        state
            .builds
            .get(build_id)
            .cloned()
            .ok_or_else(|| not_found("Build", build_id))
    }

    async fn get_service_instance(&self, name: &str) -> Result<Option<ServiceInstance>> {
        let state = self.record("get_service_instance", name).await?;
        Ok(state.services.get(name).cloned())
    }

    async fn create_service_instance(&self, service: &ServiceInstance) -> Result<Option<JobId>> {
        let mut state = self.record("create_service_instance", &service.name).await?;
        if state.services.contains_key(&service.name) {
            return Err(PlatformError::http(
                422,
                format!("The service instance name is taken: {}", service.name),
            ));
        }
        let mut created = service.clone();
        created.guid.get_or_insert_with(|| Uuid::new_v4().to_string());
        let pending = self.asynchronous && !service.user_provided;
        created.last_operation = Some(if service.user_provided {
            LastOperation::new(OperationType::Create, OperationState::Succeeded)
        } else {
            self.operation(OperationType::Create)
        });
        state.services.insert(created.name.clone(), created);
        Ok(self.new_job(&mut state, pending))
    }

    async fn update_service_plan(&self, name: &str, plan: &str) -> Result<Option<JobId>> {
        let mut state = self.record("update_service_plan", name).await?;
        let last_operation = self.operation(OperationType::Update);
        let service = state
            .services
            .get_mut(name)
            .ok_or_else(|| not_found("Service instance", name))?;
        service.plan = Some(plan.to_string());
        service.last_operation = Some(last_operation);
        let pending = self.asynchronous;
        Ok(self.new_job(&mut state, pending))
    }

    async fn update_service_parameters(
        &self,
        name: &str,
        parameters: &Parameters,
    ) -> Result<Option<JobId>> {
        let mut state = self.record("update_service_parameters", name).await?;
        let last_operation = self.operation(OperationType::Update);
        let service = state
            .services
            .get_mut(name)
            .ok_or_else(|| not_found("Service instance", name))?;
        service.parameters = parameters.clone();
        let pending = self.asynchronous && !service.user_provided;
        if !service.user_provided {
            service.last_operation = Some(last_operation);
        }
        Ok(self.new_job(&mut state, pending))
    }

    async fn update_service_tags(&self, name: &str, tags: &[String]) -> Result<Option<JobId>> {
        let mut state = self.record("update_service_tags", name).await?;
        let service = state
            .services
            .get_mut(name)
            .ok_or_else(|| not_found("Service instance", name))?;
        service.tags = tags.to_vec();
        Ok(None)
    }

    async fn update_service_syslog_drain_url(&self, name: &str, url: &str) -> Result<()> {
        let mut state = self.record("update_service_syslog_drain_url", name).await?;
        let service = state
            .services
            .get_mut(name)
            .ok_or_else(|| not_found("Service instance", name))?;
        service.syslog_drain_url = Some(url.to_string());
        Ok(())
    }

    async fn update_service_metadata(&self, name: &str, metadata: &Metadata) -> Result<()> {
        let mut state = self.record("update_service_metadata", name).await?;
        let service = state
            .services
            .get_mut(name)
            .ok_or_else(|| not_found("Service instance", name))?;
        service.metadata = metadata.clone();
        Ok(())
    }

    async fn delete_service_instance(&self, name: &str) -> Result<Option<JobId>> {
        let mut state = self.record("delete_service_instance", name).await?;
        if !state.services.contains_key(name) {
            return Err(not_found("Service instance", name));
        }
        state.keys.retain(|(service, _), _| service != name);
        state.bindings.retain(|(_, service), _| service != name);
        let user_provided = state.services.get(name).is_some_and(|s| s.user_provided);
        if self.asynchronous && !user_provided {
            let last_operation = self.operation(OperationType::Delete);
            if let Some(service) = state.services.get_mut(name) {
                service.last_operation = Some(last_operation);
            }
            return Ok(self.new_job(&mut state, true));
        }
        state.services.remove(name);
        Ok(None)
    }

    async fn get_service_keys(&self, service_name: &str) -> Result<Vec<ServiceKey>> {
        let state = self.record("get_service_keys", service_name).await?;
        if !state.services.contains_key(service_name) {
            return Err(not_found("Service instance", service_name));
        }
        Ok(state
            .keys
            .values()
            .filter(|k| k.service_name == service_name)
            .cloned()
            .collect())
    }

    async fn get_service_key(
        &self,
        service_name: &str,
        key_name: &str,
    ) -> Result<Option<ServiceKey>> {
        let state = self.record("get_service_key", key_name).await?;
        Ok(state
            .keys
            .get(&(service_name.to_string(), key_name.to_string()))
            .cloned())
    }

    async fn create_service_key(&self, key: &ServiceKey) -> Result<Option<JobId>> {
        let mut state = self.record("create_service_key", &key.name).await?;
        let id = (key.service_name.clone(), key.name.clone());
        if state.keys.contains_key(&id) {
            return Err(PlatformError::http(
                422,
                format!("The service key name is taken: {}", key.name),
            ));
        }
        let mut created = key.clone();
        created.guid.get_or_insert_with(|| Uuid::new_v4().to_string());
        created.last_operation = Some(self.operation(OperationType::Create));
        state.keys.insert(id, created);
        let pending = self.asynchronous;
        Ok(self.new_job(&mut state, pending))
    }

    async fn delete_service_key(
        &self,
        service_name: &str,
        key_name: &str,
    ) -> Result<Option<JobId>> {
        let mut state = self.record("delete_service_key", key_name).await?;
        let id = (service_name.to_string(), key_name.to_string());
        if !state.keys.contains_key(&id) {
            return Err(not_found("Service key", key_name));
        }
        if self.asynchronous {
            let last_operation = self.operation(OperationType::Delete);
            if let Some(key) = state.keys.get_mut(&id) {
                key.last_operation = Some(last_operation);
            }
            return Ok(self.new_job(&mut state, true));
        }
        state.keys.remove(&id);
        Ok(None)
    }

    async fn update_service_key_metadata(
        &self,
        service_name: &str,
        key_name: &str,
        metadata: &Metadata,
    ) -> Result<()> {
        let mut state = self.record("update_service_key_metadata", key_name).await?;
        let key = state
            .keys
            .get_mut(&(service_name.to_string(), key_name.to_string()))
            .ok_or_else(|| not_found("Service key", key_name))?;
        key.metadata = metadata.clone();
        Ok(())
    }

    async fn get_service_binding(
        &self,
        app_name: &str,
        service_name: &str,
    ) -> Result<Option<ServiceBinding>> {
        let state = self.record("get_service_binding", service_name).await?;
        Ok(state
            .bindings
            .get(&(app_name.to_string(), service_name.to_string()))
            .cloned())
    }

    async fn get_application_bindings(&self, app_name: &str) -> Result<Vec<ServiceBinding>> {
        let state = self.record("get_application_bindings", app_name).await?;
        Ok(state
            .bindings
            .values()
            .filter(|b| b.app_name == app_name)
            .cloned()
            .collect())
    }

    async fn bind_service(
        &self,
        app_name: &str,
        service_name: &str,
        parameters: &Parameters,
    ) -> Result<Option<JobId>> {
        let mut state = self.record("bind_service", service_name).await?;
        if !state.apps.contains_key(app_name) {
            return Err(not_found("Application", app_name));
        }
        if !state.services.contains_key(service_name) {
            return Err(not_found("Service instance", service_name));
        }
        let binding = ServiceBinding {
            guid: Some(Uuid::new_v4().to_string()),
            app_name: app_name.to_string(),
            service_name: service_name.to_string(),
            parameters: parameters.clone(),
            last_operation: Some(self.operation(OperationType::Create)),
        };
        state
            .bindings
            .insert((app_name.to_string(), service_name.to_string()), binding);
        let pending = self.asynchronous;
        Ok(self.new_job(&mut state, pending))
    }

    async fn unbind_service(&self, app_name: &str, service_name: &str) -> Result<Option<JobId>> {
        let mut state = self.record("unbind_service", service_name).await?;
        let id = (app_name.to_string(), service_name.to_string());
        if !state.bindings.contains_key(&id) {
            return Err(not_found("Service binding", service_name));
        }
        if self.asynchronous {
            let last_operation = self.operation(OperationType::Delete);
            if let Some(binding) = state.bindings.get_mut(&id) {
                binding.last_operation = Some(last_operation);
            }
            return Ok(self.new_job(&mut state, true));
        }
        state.bindings.remove(&id);
        Ok(None)
    }

    async fn get_service_broker(&self, name: &str) -> Result<Option<ServiceBroker>> {
        let state = self.record("get_service_broker", name).await?;
        Ok(state.brokers.get(name).cloned())
    }

    async fn create_service_broker(&self, broker: &ServiceBroker) -> Result<Option<JobId>> {
        let mut state = self.record("create_service_broker", &broker.name).await?;
        let mut created = broker.clone();
        created.guid.get_or_insert_with(|| Uuid::new_v4().to_string());
        state.brokers.insert(created.name.clone(), created);
        let pending = self.broker_jobs;
        Ok(self.new_job(&mut state, pending))
    }

    async fn update_service_broker(&self, broker: &ServiceBroker) -> Result<Option<JobId>> {
        let mut state = self.record("update_service_broker", &broker.name).await?;
        if !state.brokers.contains_key(&broker.name) {
            return Err(not_found("Service broker", &broker.name));
        }
        state.brokers.insert(broker.name.clone(), broker.clone());
        let pending = self.broker_jobs;
        Ok(self.new_job(&mut state, pending))
    }

    async fn delete_service_broker(&self, name: &str) -> Result<Option<JobId>> {
        let mut state = self.record("delete_service_broker", name).await?;
        state
            .brokers
            .remove(name)
            .ok_or_else(|| not_found("Service broker", name))?;
        let pending = self.broker_jobs;
        Ok(self.new_job(&mut state, pending))
    }

    async fn get_job(&self, job_id: &str) -> Result<Job> {
        let state = self.record("get_job", job_id).await?;
        state
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| not_found("Job", job_id))
    }
}

/// Client factory that always hands out the same mock client.
pub struct MockClientFactory {
    client: Arc<MockPlatformClient>,
    created: AtomicUsize,
}

impl MockClientFactory {
    /// Create a factory around an existing mock client.
    pub fn new(client: Arc<MockPlatformClient>) -> Self {
        Self {
            client,
            created: AtomicUsize::new(0),
        }
    }

    /// How many clients have been requested so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientFactory for MockClientFactory {
    async fn create_client(&self, target: &CloudTarget) -> Result<Arc<dyn PlatformClient>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        debug!(target = %target, "Creating mock platform client");
        Ok(self.client.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn managed_service(name: &str) -> ServiceInstance {
        ServiceInstance {
            name: name.to_string(),
            offering: Some("postgres".to_string()),
            plan: Some("small".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_synchronous_service_create_completes() {
        let client = MockPlatformClient::new();
        let job = client
            .create_service_instance(&managed_service("db"))
            .await
            .unwrap();
        assert!(job.is_none());

        let service = client.get_service_instance("db").await.unwrap().unwrap();
        assert_eq!(
            service.last_operation.unwrap().state,
            OperationState::Succeeded
        );
    }

    #[tokio::test]
    async fn test_asynchronous_service_create_stays_in_progress() {
        let client = MockPlatformClient::asynchronous();
        let job = client
            .create_service_instance(&managed_service("db"))
            .await
            .unwrap();
        assert!(job.is_some());

        let service = client.service("db").await.unwrap();
        assert_eq!(
            service.last_operation.as_ref().unwrap().state,
            OperationState::InProgress
        );

        client.complete_service_operation("db").await;
        let service = client.service("db").await.unwrap();
        assert_eq!(
            service.last_operation.unwrap().state,
            OperationState::Succeeded
        );
    }

    #[tokio::test]
    async fn test_asynchronous_delete_removes_on_completion() {
        let client = MockPlatformClient::asynchronous();
        client.insert_service(managed_service("db")).await;
        client.delete_service_instance("db").await.unwrap();
        assert!(client.service("db").await.is_some());

        client.complete_service_operation("db").await;
        assert!(client.service("db").await.is_none());
    }

    #[tokio::test]
    async fn test_asynchronous_build_stays_staging() {
        let client = MockPlatformClient::asynchronous();
        assert!(client.stage_application("web").await.unwrap_err().is_not_found());

        client
            .insert_application(Application {
                name: "web".to_string(),
                ..Default::default()
            })
            .await;
        let build = client.stage_application("web").await.unwrap();
        assert_eq!(build.state, BuildState::Staging);

        client.fail_build(&build.id, "buildpack compile failed").await;
        let build = client.get_build(&build.id).await.unwrap();
        assert_eq!(build.state, BuildState::Failed);
        assert_eq!(build.error.as_deref(), Some("buildpack compile failed"));
    }

    #[tokio::test]
    async fn test_injected_failure_by_operation_and_name() {
        let client = MockPlatformClient::new();
        client
            .fail_on("get_service_keys:db", PlatformError::unavailable("down"))
            .await;
        client.insert_service(managed_service("db")).await;
        client.insert_service(managed_service("cache")).await;

        assert!(client.get_service_keys("db").await.is_err());
        assert!(client.get_service_keys("cache").await.is_ok());
        assert_eq!(client.call_count("get_service_keys").await, 2);
        assert_eq!(client.call_count("get_service_keys:db").await, 1);
    }

    #[tokio::test]
    async fn test_scaling_adjusts_instance_list() {
        let client = MockPlatformClient::new();
        client
            .insert_application(Application {
                name: "web".to_string(),
                instances: 1,
                ..Default::default()
            })
            .await;
        client.set_instances("web", &[InstanceState::Running]).await;

        client.update_application_instances("web", 3).await.unwrap();
        let instances = client.get_application_instances("web").await.unwrap();
        assert_eq!(instances.len(), 3);
        assert_eq!(instances[0].state, InstanceState::Running);
        assert_eq!(instances[2].state, InstanceState::Starting);
    }

    #[tokio::test]
    async fn test_factory_counts_clients() {
        let client = Arc::new(MockPlatformClient::new());
        let factory = MockClientFactory::new(client);
        let target = CloudTarget::new("u", "o", "s");
        factory.create_client(&target).await.unwrap();
        factory.create_client(&target).await.unwrap();
        assert_eq!(factory.created(), 2);
    }
}

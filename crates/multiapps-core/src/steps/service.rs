// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Creating, updating and polling service instances.

use std::sync::Arc;

use async_trait::async_trait;
use multiapps_platform::{
    OperationState, OperationType, PlatformClient, PlatformError, ServiceInstance,
};
use tracing::debug;

use crate::actions::Action;
use crate::actions::service::{ServiceFlags, determine_service_actions};
use crate::classifier::{Intent, Tolerance, resolve};
use crate::conflict::{ResourceKind, ResourceLock};
use crate::context::{ProcessContext, variables};
use crate::error::{CoreError, Result};
use crate::model::ServiceDescriptor;
use crate::pool::{BoundedPool, Submission};
use crate::step::{AsyncExecution, AsyncExecutionState, Step, StepPhase, report_failure};

/// Message used when the platform reports a failed operation without details.
pub const DEFAULT_FAILURE_DESCRIPTION: &str = "Operation failed without a description";

fn service_name(ctx: &ProcessContext) -> String {
    ctx.get(variables::SERVICE_TO_PROCESS)
        .ok()
        .flatten()
        .map(|s| s.name)
        .unwrap_or_default()
}

fn verb(operation: OperationType) -> &'static str {
    match operation {
        OperationType::Create => "creating",
        OperationType::Update => "updating",
        OperationType::Delete => "deleting",
    }
}

/// Creates the service in `SERVICE_TO_PROCESS` or brings it up to date.
pub struct CreateOrUpdateServiceStep {
    pool: BoundedPool,
}

impl CreateOrUpdateServiceStep {
    /// Create the step; `pool` bounds the parallel status fetches while polling.
    pub fn new(pool: BoundedPool) -> Self {
        Self { pool }
    }

    async fn perform(
        &self,
        ctx: &mut ProcessContext,
        client: &Arc<dyn PlatformClient>,
        service: &ServiceDescriptor,
        action: Action,
    ) -> std::result::Result<Option<OperationType>, PlatformError> {
        let name = service.name.as_str();
        match action {
            Action::Create => {
                ctx.logger().info(format!("Creating service \"{}\"", name));
                client.create_service_instance(&service.to_instance()).await?;
                Ok(Some(OperationType::Create))
            }
            Action::Recreate => {
                ctx.logger().info(format!("Recreating service \"{}\"", name));
                match client.delete_service_instance(name).await {
                    Ok(Some(_job)) => return Ok(Some(OperationType::Delete)),
                    Ok(None) => {}
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return Err(err),
                }
                client.create_service_instance(&service.to_instance()).await?;
                Ok(Some(OperationType::Create))
            }
            Action::UpdatePlan => {
                let plan = service.plan.as_deref().unwrap_or_default();
                ctx.logger()
                    .info(format!("Updating plan of service \"{}\" to \"{}\"", name, plan));
                client.update_service_plan(name, plan).await?;
                Ok(Some(OperationType::Update))
            }
            Action::UpdateCredentials => {
                ctx.logger()
                    .info(format!("Updating parameters of service \"{}\"", name));
                client
                    .update_service_parameters(name, &service.parameters)
                    .await?;
                Ok(Some(OperationType::Update))
            }
            Action::UpdateTags => {
                ctx.logger().info(format!("Updating tags of service \"{}\"", name));
                client.update_service_tags(name, &service.tags).await?;
                Ok(None)
            }
            Action::UpdateSyslogUrl => {
                ctx.logger()
                    .info(format!("Updating syslog drain URL of service \"{}\"", name));
                let url = service.syslog_drain_url.as_deref().unwrap_or_default();
                client.update_service_syslog_drain_url(name, url).await?;
                Ok(None)
            }
            Action::UpdateMetadata => {
                ctx.logger()
                    .info(format!("Updating metadata of service \"{}\"", name));
                client
                    .update_service_metadata(name, &service.metadata)
                    .await?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl Step for CreateOrUpdateServiceStep {
    fn name(&self) -> &'static str {
        "createOrUpdateService"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        let service = ctx.require(variables::SERVICE_TO_PROCESS)?;
        let mut triggered = ctx.require(variables::TRIGGERED_SERVICE_OPERATIONS)?;
        if triggered.contains_key(&service.name) {
            ctx.logger().debug(format!(
                "Operation on service \"{}\" already triggered, polling",
                service.name
            ));
            return Ok(StepPhase::Poll);
        }

        let client = ctx.client().await?;
        let tolerance = Tolerance::for_context(ctx, service.optional)?;
        let existing = match client.get_service_instance(&service.name).await {
            Ok(existing) => existing,
            Err(err) => {
                let what = format!("Retrieving service \"{}\"", service.name);
                resolve(err.into(), Intent::Read, tolerance, &what).apply(ctx.logger())?;
                return Ok(StepPhase::Done);
            }
        };

        let flags = ServiceFlags {
            delete_services: ctx.require(variables::DELETE_SERVICES)?,
            delete_service_keys: ctx.require(variables::DELETE_SERVICE_KEYS)?,
        };
        let determination = determine_service_actions(&service, existing.as_ref(), flags)?;
        for warning in determination.warnings {
            ctx.logger().warn(warning);
        }
        ctx.set(variables::SERVICE_ACTIONS_TO_EXECUTE, &determination.actions)?;
        debug!(service = %service.name, actions = ?determination.actions, "Determined service actions");

        let mut operation = None;
        let mut updated = false;
        for action in determination.actions {
            let intent = match action {
                Action::Create | Action::Recreate => Intent::Create,
                _ => Intent::Update,
            };
            match self.perform(ctx, &client, &service, action).await {
                Ok(triggered_operation) => {
                    updated |= intent == Intent::Update && action != Action::UpdateKeys;
                    if triggered_operation == Some(OperationType::Delete) {
                        let mut pending = ctx.require(variables::SERVICES_TO_RECREATE)?;
                        pending.push(service.name.clone());
                        ctx.set(variables::SERVICES_TO_RECREATE, &pending)?;
                    }
                    if triggered_operation.is_some() {
                        operation = triggered_operation;
                    }
                }
                Err(err) => {
                    let what = format!("{} service \"{}\"", capitalized(intent), service.name);
                    resolve(err.into(), intent, tolerance, &what).apply(ctx.logger())?;
                }
            }
        }
        ctx.set(variables::IS_SERVICE_UPDATED, &updated)?;

        let Some(operation) = operation.filter(|_| !service.user_provided) else {
            return Ok(StepPhase::Done);
        };
        triggered.insert(service.name.clone(), operation);
        ctx.set(variables::TRIGGERED_SERVICE_OPERATIONS, &triggered)?;
        let mut to_poll = ctx.require(variables::SERVICES_TO_POLL)?;
        if !to_poll.iter().any(|s| s.name == service.name) {
            to_poll.push(service);
        }
        ctx.set(variables::SERVICES_TO_POLL, &to_poll)?;
        Ok(StepPhase::Poll)
    }

    fn step_error_message(&self, ctx: &ProcessContext) -> String {
        format!("Error creating or updating service \"{}\"", service_name(ctx))
    }

    fn async_executions(&self) -> Vec<Arc<dyn AsyncExecution>> {
        vec![Arc::new(PollServiceOperationsExecution::new(
            self.pool.clone(),
        ))]
    }

    fn locked_resources(&self, ctx: &ProcessContext) -> Result<Vec<ResourceLock>> {
        let service = ctx.require(variables::SERVICE_TO_PROCESS)?;
        super::lock_in_space(ctx, ResourceKind::Service, &service.name)
    }
}

/// Deletes the services in `SERVICES_TO_DELETE` when `DELETE_SERVICES` is
/// set, and polls the asynchronous deletions.
pub struct DeleteServicesStep {
    pool: BoundedPool,
}

impl DeleteServicesStep {
    /// Create the step; `pool` bounds the parallel status fetches while polling.
    pub fn new(pool: BoundedPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Step for DeleteServicesStep {
    fn name(&self) -> &'static str {
        "deleteServices"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        let services = ctx.require(variables::SERVICES_TO_DELETE)?;
        if services.is_empty() {
            return Ok(StepPhase::Done);
        }
        if !ctx.require(variables::DELETE_SERVICES)? {
            for service in &services {
                ctx.logger().warn(format!(
                    "Service \"{}\" is no longer part of the deployment and is kept",
                    service.name
                ));
            }
            return Ok(StepPhase::Done);
        }

        let mut triggered = ctx.require(variables::TRIGGERED_SERVICE_OPERATIONS)?;
        let mut to_poll = ctx.require(variables::SERVICES_TO_POLL)?;
        let client = ctx.client().await?;
        for service in services {
            if triggered.get(&service.name) == Some(&OperationType::Delete) {
                continue;
            }
            ctx.logger()
                .info(format!("Deleting service \"{}\"", service.name));
            match client.delete_service_instance(&service.name).await {
                Ok(Some(_job)) => {
                    triggered.insert(service.name.clone(), OperationType::Delete);
                    ctx.set(variables::TRIGGERED_SERVICE_OPERATIONS, &triggered)?;
                    if !to_poll.iter().any(|s| s.name == service.name) {
                        to_poll.push(service);
                    }
                    ctx.set(variables::SERVICES_TO_POLL, &to_poll)?;
                }
                Ok(None) => ctx
                    .logger()
                    .info(format!("Service \"{}\" deleted", service.name)),
                Err(err) => {
                    let tolerance = Tolerance::for_context(ctx, service.optional)?;
                    let what = format!("Deleting service \"{}\"", service.name);
                    resolve(err.into(), Intent::Delete, tolerance, &what).apply(ctx.logger())?;
                }
            }
        }
        Ok(if to_poll.is_empty() {
            StepPhase::Done
        } else {
            StepPhase::Poll
        })
    }

    fn step_error_message(&self, _ctx: &ProcessContext) -> String {
        "Error deleting services".to_string()
    }

    fn async_executions(&self) -> Vec<Arc<dyn AsyncExecution>> {
        vec![Arc::new(PollServiceOperationsExecution::new(
            self.pool.clone(),
        ))]
    }

    fn locked_resources(&self, ctx: &ProcessContext) -> Result<Vec<ResourceLock>> {
        let mut locks = Vec::new();
        for service in ctx.require(variables::SERVICES_TO_DELETE)? {
            locks.extend(super::lock_in_space(ctx, ResourceKind::Service, &service.name)?);
        }
        Ok(locks)
    }
}

fn capitalized(intent: Intent) -> &'static str {
    match intent {
        Intent::Create => "Creating",
        Intent::Update => "Updating",
        Intent::Delete => "Deleting",
        Intent::Read => "Retrieving",
    }
}

/// Where one polled service stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceProgress {
    /// The operation completed.
    Done,
    /// Poll again.
    InProgress,
    /// The operation failed on an optional service.
    Tolerated(String),
    /// The operation failed.
    Failed(String),
}

/// Interpret the observed state of a service after `operation` was triggered.
pub fn evaluate_service(
    service: &ServiceDescriptor,
    operation: OperationType,
    instance: Option<&ServiceInstance>,
) -> ServiceProgress {
    let Some(instance) = instance else {
        return match operation {
            OperationType::Delete => ServiceProgress::Done,
            OperationType::Create if service.optional => ServiceProgress::Tolerated(format!(
                "Service \"{}\" is optional and was not created",
                service.name
            )),
            _ => ServiceProgress::InProgress,
        };
    };
    let Some(last) = &instance.last_operation else {
        return ServiceProgress::Done;
    };
    match last.state {
        OperationState::Succeeded => ServiceProgress::Done,
        OperationState::Failed => {
            let description = last
                .description
                .as_deref()
                .filter(|d| !d.is_empty())
                .unwrap_or(DEFAULT_FAILURE_DESCRIPTION);
            let message = format!(
                "Error {} service \"{}\": {}",
                verb(last.operation_type),
                service.name,
                description
            );
            if service.optional {
                ServiceProgress::Tolerated(message)
            } else {
                ServiceProgress::Failed(message)
            }
        }
        OperationState::Initial | OperationState::InProgress => ServiceProgress::InProgress,
    }
}

/// Polls every service in `SERVICES_TO_POLL` until its triggered operation
/// is done. Status fetches run in parallel on a bounded pool; a fetch the
/// pool rejects counts as still in progress.
pub struct PollServiceOperationsExecution {
    pool: BoundedPool,
}

impl PollServiceOperationsExecution {
    /// Create the execution over `pool`.
    pub fn new(pool: BoundedPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AsyncExecution for PollServiceOperationsExecution {
    fn name(&self) -> &'static str {
        "pollServiceOperations"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<AsyncExecutionState> {
        let services = ctx.require(variables::SERVICES_TO_POLL)?;
        let mut triggered = ctx.require(variables::TRIGGERED_SERVICE_OPERATIONS)?;
        let mut recreate = ctx.require(variables::SERVICES_TO_RECREATE)?;
        let client = ctx.client().await?;

        let submissions: Vec<_> = services
            .iter()
            .map(|service| {
                let client = client.clone();
                let name = service.name.clone();
                self.pool
                    .try_submit(async move { client.get_service_instance(&name).await })
            })
            .collect();

        let mut remaining = Vec::new();
        let mut failures = Vec::new();
        for (service, submission) in services.into_iter().zip(submissions) {
            let fetched = match submission {
                Submission::Accepted(handle) => handle.await.map_err(|e| {
                    CoreError::platform(format!("Polling service \"{}\" failed: {}", service.name, e))
                })?,
                Submission::Rejected => {
                    remaining.push(service);
                    continue;
                }
            };
            let operation = triggered
                .get(&service.name)
                .copied()
                .unwrap_or(OperationType::Create);
            let instance = match fetched {
                Ok(instance) => instance,
                Err(err) => {
                    let tolerance = Tolerance::for_context(ctx, service.optional)?;
                    let what = format!("Polling service \"{}\"", service.name);
                    resolve(err.into(), Intent::Read, tolerance, &what).apply(ctx.logger())?;
                    triggered.remove(&service.name);
                    continue;
                }
            };

            match evaluate_service(&service, operation, instance.as_ref()) {
                ServiceProgress::Done => {
                    triggered.remove(&service.name);
                    if operation == OperationType::Delete
                        && let Some(position) = recreate.iter().position(|n| *n == service.name)
                    {
                        recreate.remove(position);
                        ctx.logger()
                            .info(format!("Creating service \"{}\" again", service.name));
                        client.create_service_instance(&service.to_instance()).await?;
                        triggered.insert(service.name.clone(), OperationType::Create);
                        remaining.push(service);
                        continue;
                    }
                    ctx.logger().info(format!(
                        "Operation on service \"{}\" completed",
                        service.name
                    ));
                }
                ServiceProgress::InProgress => remaining.push(service),
                ServiceProgress::Tolerated(message) => {
                    triggered.remove(&service.name);
                    ctx.logger().warn(message);
                }
                ServiceProgress::Failed(message) => {
                    // Forget the operation so a retry determines the actions again.
                    triggered.remove(&service.name);
                    recreate.retain(|n| *n != service.name);
                    failures.push(message);
                }
            }
        }

        let finished = remaining.is_empty();
        ctx.set(variables::SERVICES_TO_POLL, &remaining)?;
        ctx.set(variables::TRIGGERED_SERVICE_OPERATIONS, &triggered)?;
        ctx.set(variables::SERVICES_TO_RECREATE, &recreate)?;

        if !failures.is_empty() {
            for failure in failures {
                report_failure(ctx, failure)?;
            }
            return Ok(AsyncExecutionState::Error);
        }
        Ok(if finished {
            AsyncExecutionState::Finished
        } else {
            AsyncExecutionState::Running
        })
    }

    fn polling_error_message(&self, ctx: &ProcessContext) -> String {
        let names: Vec<String> = ctx
            .get(variables::SERVICES_TO_POLL)
            .ok()
            .flatten()
            .unwrap_or_default()
            .into_iter()
            .map(|s| format!("\"{}\"", s.name))
            .collect();
        if names.is_empty() {
            return "Error monitoring operations on services".to_string();
        }
        format!("Error monitoring operations on services {}", names.join(", "))
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registering applications as service brokers, and removing the brokers of
//! undeployed applications.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use multiapps_platform::{JobState, PlatformError, ServiceBroker};

use crate::classifier::{Intent, Tolerance, resolve};
use crate::conflict::{ResourceKind, ResourceLock};
use crate::context::{ProcessContext, variables};
use crate::error::{CoreError, Result};
use crate::model::AppDescriptor;
use crate::step::{AsyncExecution, AsyncExecutionState, Step, StepPhase, report_failure};

/// Application attribute that turns the application into a service broker.
pub const CREATE_SERVICE_BROKER: &str = "create-service-broker";
/// Broker name; defaults to the application name.
pub const SERVICE_BROKER_NAME: &str = "service-broker-name";
/// Basic auth user of the broker.
pub const SERVICE_BROKER_USERNAME: &str = "service-broker-user";
/// Basic auth password of the broker.
pub const SERVICE_BROKER_PASSWORD: &str = "service-broker-password";
/// Broker endpoint.
pub const SERVICE_BROKER_URL: &str = "service-broker-url";
/// Register the broker in the deployment space only.
pub const SERVICE_BROKER_SPACE_SCOPED: &str = "service-broker-space-scoped";

/// How long broker jobs are polled unless configured otherwise.
pub const DEFAULT_BROKER_POLL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// The broker `app` asks for, if any.
pub fn broker_from_app(app: &AppDescriptor, space_guid: &str) -> Result<Option<ServiceBroker>> {
    if !app.attribute_bool(CREATE_SERVICE_BROKER).unwrap_or(false) {
        return Ok(None);
    }
    let required = |attribute: &str| {
        app.attribute_str(attribute).map(str::to_string).ok_or_else(|| {
            CoreError::content(format!(
                "Missing attribute \"{}\" of application \"{}\" required to create a service broker",
                attribute, app.name
            ))
        })
    };
    let space_scoped = app
        .attribute_bool(SERVICE_BROKER_SPACE_SCOPED)
        .unwrap_or(false);

    Ok(Some(ServiceBroker {
        guid: None,
        name: app
            .attribute_str(SERVICE_BROKER_NAME)
            .unwrap_or(&app.name)
            .to_string(),
        username: required(SERVICE_BROKER_USERNAME)?,
        password: required(SERVICE_BROKER_PASSWORD)?,
        url: required(SERVICE_BROKER_URL)?,
        space_guid: space_scoped.then(|| space_guid.to_string()),
        metadata: Default::default(),
    }))
}

fn broker_error(err: PlatformError) -> CoreError {
    CoreError::from(err).with_prefix("Service broker operation failed")
}

/// Creates or updates the service broker declared by `APP_TO_PROCESS`.
pub struct CreateOrUpdateServiceBrokerStep {
    timeout: Duration,
}

impl Default for CreateOrUpdateServiceBrokerStep {
    fn default() -> Self {
        Self::new(DEFAULT_BROKER_POLL_TIMEOUT)
    }
}

impl CreateOrUpdateServiceBrokerStep {
    /// Create the step; `timeout` bounds how long the broker job is polled.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn merge_existing(
        ctx: &mut ProcessContext,
        mut broker: ServiceBroker,
        existing: &ServiceBroker,
    ) -> ServiceBroker {
        broker.metadata = existing.metadata.clone();
        broker.guid = existing.guid.clone();
        match (&existing.space_guid, &broker.space_guid) {
            (Some(_), None) => ctx.logger().warn(format!(
                "Visibility of service broker \"{}\" cannot be changed from space-scoped to global",
                broker.name
            )),
            (None, Some(_)) => ctx.logger().warn(format!(
                "Visibility of service broker \"{}\" cannot be changed from global to space-scoped",
                broker.name
            )),
            _ => {}
        }
        broker
    }
}

#[async_trait]
impl Step for CreateOrUpdateServiceBrokerStep {
    fn name(&self) -> &'static str {
        "createOrUpdateServiceBroker"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        let app = ctx.require(variables::APP_TO_PROCESS)?;
        let space_guid = ctx.require(variables::SPACE_GUID)?;
        let Some(broker) = broker_from_app(&app, &space_guid)? else {
            return Ok(StepPhase::Done);
        };
        ctx.logger().debug(format!(
            "Constructed service broker \"{}\" from application \"{}\"",
            broker.name, app.name
        ));

        let client = ctx.client().await?;
        let tolerance = Tolerance::for_context(ctx, false)?;
        let existing = client.get_service_broker(&broker.name).await?;
        let (broker, intent, result) = match existing {
            Some(existing) => {
                let broker = Self::merge_existing(ctx, broker, &existing);
                ctx.logger()
                    .info(format!("Updating service broker \"{}\"", broker.name));
                let result = client.update_service_broker(&broker).await;
                (broker, Intent::Update, result)
            }
            None => {
                ctx.logger()
                    .info(format!("Creating service broker \"{}\"", broker.name));
                let result = client.create_service_broker(&broker).await;
                (broker, Intent::Create, result)
            }
        };

        let job = match result {
            Ok(job) => job,
            Err(err) if err.status() == Some(501) => {
                ctx.logger().warn(format!(
                    "Service broker \"{}\" could not be updated: the broker does not support updates",
                    broker.name
                ));
                None
            }
            Err(err) => {
                let verb = if intent == Intent::Update {
                    "Updating"
                } else {
                    "Creating"
                };
                let what = format!("{} service broker \"{}\"", verb, broker.name);
                resolve(broker_error(err), intent, tolerance, &what).apply(ctx.logger())?;
                None
            }
        };

        ctx.set(variables::CREATED_OR_UPDATED_SERVICE_BROKER, &broker)?;
        match job {
            Some(job_id) => {
                ctx.set(variables::SERVICE_BROKER_ASYNC_JOB_ID, &job_id)?;
                Ok(StepPhase::Poll)
            }
            None => Ok(StepPhase::Done),
        }
    }

    fn step_error_message(&self, _ctx: &ProcessContext) -> String {
        "Error creating or updating service brokers".to_string()
    }

    fn async_executions(&self) -> Vec<Arc<dyn AsyncExecution>> {
        vec![Arc::new(PollServiceBrokerJobExecution)]
    }

    fn timeout(&self, _ctx: &ProcessContext) -> Option<Duration> {
        Some(self.timeout)
    }

    fn locked_resources(&self, ctx: &ProcessContext) -> Result<Vec<ResourceLock>> {
        let app = ctx.require(variables::APP_TO_PROCESS)?;
        let space_guid = ctx.require(variables::SPACE_GUID)?;
        match broker_from_app(&app, &space_guid)? {
            Some(broker) => super::lock_in_space(ctx, ResourceKind::Broker, &broker.name),
            None => Ok(Vec::new()),
        }
    }
}

/// Polls the platform job of a broker registration.
pub struct PollServiceBrokerJobExecution;

#[async_trait]
impl AsyncExecution for PollServiceBrokerJobExecution {
    fn name(&self) -> &'static str {
        "pollServiceBrokerJob"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<AsyncExecutionState> {
        let job_id = ctx.require(variables::SERVICE_BROKER_ASYNC_JOB_ID)?;
        let broker = ctx.require(variables::CREATED_OR_UPDATED_SERVICE_BROKER)?;
        let client = ctx.client().await?;
        let job = client.get_job(&job_id).await?;

        match job.state {
            JobState::Complete => {
                ctx.logger().info(format!(
                    "Service broker \"{}\" created or updated",
                    broker.name
                ));
                Ok(AsyncExecutionState::Finished)
            }
            JobState::Failed => {
                report_failure(
                    ctx,
                    format!(
                        "Job \"{}\" for service broker \"{}\" failed: {}",
                        job.id,
                        broker.name,
                        job.errors.join("; ")
                    ),
                )?;
                Ok(AsyncExecutionState::Error)
            }
            JobState::Processing | JobState::Polling => {
                ctx.logger().debug(format!(
                    "Job \"{}\" for service broker \"{}\" is still running",
                    job.id, broker.name
                ));
                Ok(AsyncExecutionState::Running)
            }
        }
    }

    fn polling_error_message(&self, ctx: &ProcessContext) -> String {
        let name = ctx
            .get(variables::CREATED_OR_UPDATED_SERVICE_BROKER)
            .ok()
            .flatten()
            .map(|b| b.name)
            .unwrap_or_default();
        format!("Error polling job of service broker \"{}\"", name)
    }
}

/// Deletes the brokers in `SERVICE_BROKERS_TO_DELETE`.
///
/// A broker that an application in `APPS_TO_DEPLOY` still declares belongs
/// to a renamed module and is kept. A missing broker counts as deleted.
pub struct DeleteServiceBrokersStep {
    timeout: Duration,
}

impl Default for DeleteServiceBrokersStep {
    fn default() -> Self {
        Self::new(DEFAULT_BROKER_POLL_TIMEOUT)
    }
}

impl DeleteServiceBrokersStep {
    /// Create the step; `timeout` bounds how long deletion jobs are polled.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn brokers_to_delete(ctx: &ProcessContext) -> Result<Vec<String>> {
        let space_guid = ctx.require(variables::SPACE_GUID)?;
        let kept: BTreeSet<String> = ctx
            .require(variables::APPS_TO_DEPLOY)?
            .iter()
            .filter_map(|app| broker_from_app(app, &space_guid).ok().flatten())
            .map(|broker| broker.name)
            .collect();
        Ok(ctx
            .require(variables::SERVICE_BROKERS_TO_DELETE)?
            .into_iter()
            .filter(|name| !kept.contains(name))
            .collect())
    }
}

#[async_trait]
impl Step for DeleteServiceBrokersStep {
    fn name(&self) -> &'static str {
        "deleteServiceBrokers"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        let mut jobs = ctx.require(variables::SERVICE_BROKER_DELETION_JOBS)?;
        if !jobs.is_empty() {
            return Ok(StepPhase::Poll);
        }
        let names = Self::brokers_to_delete(ctx)?;
        if names.is_empty() {
            ctx.logger().debug("No service brokers to delete");
            return Ok(StepPhase::Done);
        }

        let client = ctx.client().await?;
        let tolerance = Tolerance::for_context(ctx, false)?;
        for name in names {
            ctx.logger()
                .info(format!("Deleting service broker \"{}\"", name));
            match client.delete_service_broker(&name).await {
                Ok(Some(job_id)) => {
                    jobs.insert(name, job_id);
                    ctx.set(variables::SERVICE_BROKER_DELETION_JOBS, &jobs)?;
                }
                Ok(None) => ctx
                    .logger()
                    .info(format!("Service broker \"{}\" deleted", name)),
                Err(err) => {
                    let what = format!("Deleting service broker \"{}\"", name);
                    resolve(broker_error(err), Intent::Delete, tolerance, &what)
                        .apply(ctx.logger())?;
                }
            }
        }
        Ok(if jobs.is_empty() {
            StepPhase::Done
        } else {
            StepPhase::Poll
        })
    }

    fn step_error_message(&self, _ctx: &ProcessContext) -> String {
        "Error deleting service brokers".to_string()
    }

    fn async_executions(&self) -> Vec<Arc<dyn AsyncExecution>> {
        vec![Arc::new(PollServiceBrokerDeletionExecution)]
    }

    fn timeout(&self, _ctx: &ProcessContext) -> Option<Duration> {
        Some(self.timeout)
    }

    fn locked_resources(&self, ctx: &ProcessContext) -> Result<Vec<ResourceLock>> {
        let mut locks = Vec::new();
        for name in Self::brokers_to_delete(ctx)? {
            locks.extend(super::lock_in_space(ctx, ResourceKind::Broker, &name)?);
        }
        Ok(locks)
    }
}

/// Polls the deletion jobs started by [`DeleteServiceBrokersStep`].
pub struct PollServiceBrokerDeletionExecution;

#[async_trait]
impl AsyncExecution for PollServiceBrokerDeletionExecution {
    fn name(&self) -> &'static str {
        "pollServiceBrokerDeletion"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<AsyncExecutionState> {
        let mut jobs = ctx.require(variables::SERVICE_BROKER_DELETION_JOBS)?;
        let client = ctx.client().await?;

        let mut failed = false;
        for (name, job_id) in jobs.clone() {
            let job = client.get_job(&job_id).await?;
            match job.state {
                JobState::Complete => {
                    jobs.remove(&name);
                    ctx.logger()
                        .info(format!("Service broker \"{}\" deleted", name));
                }
                JobState::Failed => {
                    jobs.remove(&name);
                    report_failure(
                        ctx,
                        format!(
                            "Job \"{}\" deleting service broker \"{}\" failed: {}",
                            job.id,
                            name,
                            job.errors.join("; ")
                        ),
                    )?;
                    failed = true;
                }
                JobState::Processing | JobState::Polling => {}
            }
        }
        ctx.set(variables::SERVICE_BROKER_DELETION_JOBS, &jobs)?;

        Ok(if failed {
            AsyncExecutionState::Error
        } else if jobs.is_empty() {
            AsyncExecutionState::Finished
        } else {
            AsyncExecutionState::Running
        })
    }

    fn polling_error_message(&self, _ctx: &ProcessContext) -> String {
        "Error polling deletion of service brokers".to_string()
    }
}

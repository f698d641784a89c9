// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Binding and unbinding services to the application being deployed.

use std::sync::Arc;

use async_trait::async_trait;
use multiapps_platform::{LastOperation, OperationState, OperationType};

use crate::actions::bindings::determine_binding;
use crate::classifier::{Intent, Tolerance, resolve};
use crate::conflict::{ResourceKind, ResourceLock};
use crate::context::{ProcessContext, variables};
use crate::error::Result;
use crate::step::{AsyncExecution, AsyncExecutionState, Step, StepPhase, report_failure};

use super::service::DEFAULT_FAILURE_DESCRIPTION;

/// Interpret the last operation of a binding.
pub fn binding_state(operation: Option<&LastOperation>) -> AsyncExecutionState {
    match operation.map(|op| op.state) {
        None | Some(OperationState::Succeeded) => AsyncExecutionState::Finished,
        Some(OperationState::Failed) => AsyncExecutionState::Error,
        Some(OperationState::Initial | OperationState::InProgress) => AsyncExecutionState::Running,
    }
}

struct Pair {
    app: String,
    service: String,
    optional: bool,
}

impl Pair {
    fn from_context(ctx: &ProcessContext) -> Result<Self> {
        let app = ctx.require(variables::APP_TO_PROCESS)?;
        let service = ctx.require(variables::SERVICE_TO_UNBIND_BIND)?;
        let optional = app.binding(&service).is_some_and(|b| b.optional);
        Ok(Self {
            app: app.name,
            service,
            optional,
        })
    }

    fn key(&self) -> String {
        format!("{}/{}", self.app, self.service)
    }
}

fn describe(ctx: &ProcessContext) -> (String, String) {
    let app = ctx
        .get(variables::APP_TO_PROCESS)
        .ok()
        .flatten()
        .map(|a| a.name)
        .unwrap_or_default();
    let service = ctx
        .get(variables::SERVICE_TO_UNBIND_BIND)
        .ok()
        .flatten()
        .unwrap_or_default();
    (app, service)
}

fn lock_app(ctx: &ProcessContext) -> Result<Vec<ResourceLock>> {
    let app = ctx.require(variables::APP_TO_PROCESS)?;
    super::lock_in_space(ctx, ResourceKind::Application, &app.name)
}

/// Decides whether `SERVICE_TO_UNBIND_BIND` must be unbound from and/or
/// bound to `APP_TO_PROCESS`.
pub struct DetermineBindingActionsStep;

#[async_trait]
impl Step for DetermineBindingActionsStep {
    fn name(&self) -> &'static str {
        "determineServiceBindUnbind"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        let app = ctx.require(variables::APP_TO_PROCESS)?;
        let pair = Pair::from_context(ctx)?;
        let recreate = ctx.require(variables::SHOULD_RECREATE_SERVICE_BINDING)?;
        let client = ctx.client().await?;

        let existing = match client.get_service_binding(&pair.app, &pair.service).await {
            Ok(existing) => existing,
            Err(err) => {
                let tolerance = Tolerance::for_context(ctx, pair.optional)?;
                let what = format!(
                    "Retrieving binding of service \"{}\" to application \"{}\"",
                    pair.service, pair.app
                );
                resolve(err.into(), Intent::Read, tolerance, &what).apply(ctx.logger())?;
                None
            }
        };

        let decision = determine_binding(&app, &pair.service, existing.as_ref(), recreate);
        ctx.logger().debug(format!(
            "Binding of service \"{}\" to application \"{}\": unbind {}, bind {}",
            pair.service, pair.app, decision.unbind, decision.bind
        ));
        ctx.set(variables::SHOULD_UNBIND_SERVICE, &decision.unbind)?;
        ctx.set(variables::SHOULD_BIND_SERVICE, &decision.bind)?;
        ctx.set(variables::SERVICE_BINDING_PARAMETERS, &decision.parameters)?;
        Ok(StepPhase::Done)
    }

    fn step_error_message(&self, ctx: &ProcessContext) -> String {
        let (app, service) = describe(ctx);
        format!(
            "Error determining binding actions for service \"{}\" and application \"{}\"",
            service, app
        )
    }
}

/// Removes the binding between `SERVICE_TO_UNBIND_BIND` and `APP_TO_PROCESS`.
pub struct UnbindServiceStep;

#[async_trait]
impl Step for UnbindServiceStep {
    fn name(&self) -> &'static str {
        "unbindServiceFromApplication"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        if !ctx.require(variables::SHOULD_UNBIND_SERVICE)? {
            return Ok(StepPhase::Done);
        }
        let pair = Pair::from_context(ctx)?;
        let mut triggered = ctx.require(variables::TRIGGERED_BINDING_OPERATIONS)?;
        if triggered.contains_key(&pair.key()) {
            return Ok(StepPhase::Poll);
        }

        let client = ctx.client().await?;
        ctx.logger().info(format!(
            "Unbinding service \"{}\" from application \"{}\"",
            pair.service, pair.app
        ));
        match client.unbind_service(&pair.app, &pair.service).await {
            Ok(Some(_job)) => {
                triggered.insert(pair.key(), OperationType::Delete);
                ctx.set(variables::TRIGGERED_BINDING_OPERATIONS, &triggered)?;
                Ok(StepPhase::Poll)
            }
            Ok(None) => Ok(StepPhase::Done),
            Err(err) => {
                let tolerance = Tolerance::for_context(ctx, pair.optional)?;
                let what = format!(
                    "Unbinding service \"{}\" from application \"{}\"",
                    pair.service, pair.app
                );
                resolve(err.into(), Intent::Delete, tolerance, &what).apply(ctx.logger())?;
                Ok(StepPhase::Done)
            }
        }
    }

    fn step_error_message(&self, ctx: &ProcessContext) -> String {
        let (app, service) = describe(ctx);
        format!(
            "Error unbinding service \"{}\" from application \"{}\"",
            service, app
        )
    }

    fn async_executions(&self) -> Vec<Arc<dyn AsyncExecution>> {
        vec![Arc::new(PollServiceBindingExecution)]
    }

    fn locked_resources(&self, ctx: &ProcessContext) -> Result<Vec<ResourceLock>> {
        lock_app(ctx)
    }
}

/// Binds `SERVICE_TO_UNBIND_BIND` to `APP_TO_PROCESS` with the parameters
/// chosen by [`DetermineBindingActionsStep`].
pub struct BindServiceStep;

#[async_trait]
impl Step for BindServiceStep {
    fn name(&self) -> &'static str {
        "bindServiceToApplication"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        if !ctx.require(variables::SHOULD_BIND_SERVICE)? {
            return Ok(StepPhase::Done);
        }
        let pair = Pair::from_context(ctx)?;
        let mut triggered = ctx.require(variables::TRIGGERED_BINDING_OPERATIONS)?;
        if triggered.contains_key(&pair.key()) {
            return Ok(StepPhase::Poll);
        }

        let parameters = ctx.require(variables::SERVICE_BINDING_PARAMETERS)?;
        let client = ctx.client().await?;
        ctx.logger().info(format!(
            "Binding service \"{}\" to application \"{}\"",
            pair.service, pair.app
        ));
        match client
            .bind_service(&pair.app, &pair.service, &parameters)
            .await
        {
            Ok(Some(_job)) => {
                triggered.insert(pair.key(), OperationType::Create);
                ctx.set(variables::TRIGGERED_BINDING_OPERATIONS, &triggered)?;
                Ok(StepPhase::Poll)
            }
            Ok(None) => Ok(StepPhase::Done),
            Err(err) => {
                let tolerance = Tolerance::for_context(ctx, pair.optional)?;
                let what = format!(
                    "Binding service \"{}\" to application \"{}\"",
                    pair.service, pair.app
                );
                resolve(err.into(), Intent::Create, tolerance, &what).apply(ctx.logger())?;
                Ok(StepPhase::Done)
            }
        }
    }

    fn step_error_message(&self, ctx: &ProcessContext) -> String {
        let (app, service) = describe(ctx);
        format!(
            "Error binding service \"{}\" to application \"{}\"",
            service, app
        )
    }

    fn async_executions(&self) -> Vec<Arc<dyn AsyncExecution>> {
        vec![Arc::new(PollServiceBindingExecution)]
    }

    fn locked_resources(&self, ctx: &ProcessContext) -> Result<Vec<ResourceLock>> {
        lock_app(ctx)
    }
}

/// Polls the binding operation triggered for the current app/service pair.
pub struct PollServiceBindingExecution;

#[async_trait]
impl AsyncExecution for PollServiceBindingExecution {
    fn name(&self) -> &'static str {
        "pollServiceBindingOperation"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<AsyncExecutionState> {
        let pair = Pair::from_context(ctx)?;
        let mut triggered = ctx.require(variables::TRIGGERED_BINDING_OPERATIONS)?;
        let Some(operation) = triggered.get(&pair.key()).copied() else {
            return Ok(AsyncExecutionState::Finished);
        };

        let client = ctx.client().await?;
        let binding = client.get_service_binding(&pair.app, &pair.service).await?;
        let last = match (&binding, operation) {
            (None, OperationType::Delete) => None,
            (None, _) => return Ok(AsyncExecutionState::Running),
            (Some(binding), _) => binding.last_operation.clone(),
        };

        let state = binding_state(last.as_ref());
        match state {
            AsyncExecutionState::Running => return Ok(state),
            AsyncExecutionState::Finished => ctx.logger().info(format!(
                "Binding operation between service \"{}\" and application \"{}\" finished",
                pair.service, pair.app
            )),
            AsyncExecutionState::Error => {
                let description = last
                    .as_ref()
                    .and_then(|op| op.description.as_deref())
                    .unwrap_or(DEFAULT_FAILURE_DESCRIPTION);
                let message = format!(
                    "Error during {} of binding between service \"{}\" and application \"{}\": {}",
                    operation.as_str(),
                    pair.service,
                    pair.app,
                    description
                );
                if pair.optional {
                    ctx.logger().warn(message);
                } else {
                    report_failure(ctx, message)?;
                }
            }
        }

        triggered.remove(&pair.key());
        ctx.set(variables::TRIGGERED_BINDING_OPERATIONS, &triggered)?;
        if state == AsyncExecutionState::Error && pair.optional {
            return Ok(AsyncExecutionState::Finished);
        }
        Ok(state)
    }

    fn polling_error_message(&self, ctx: &ProcessContext) -> String {
        let (app, service) = describe(ctx);
        format!(
            "Error polling binding operation between service \"{}\" and application \"{}\"",
            service, app
        )
    }
}

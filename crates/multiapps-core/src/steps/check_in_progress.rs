// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Waiting for service operations started outside this process.

use std::sync::Arc;

use async_trait::async_trait;
use multiapps_platform::OperationState;

use super::service::PollServiceOperationsExecution;
use crate::classifier::{Intent, Tolerance, resolve};
use crate::conflict::{ResourceKind, ResourceLock};
use crate::context::{ProcessContext, variables};
use crate::error::Result;
use crate::pool::BoundedPool;
use crate::step::{AsyncExecution, Step, StepPhase};

/// Waits until the service in `SERVICE_TO_PROCESS` has no operation in
/// flight, so later steps never race an earlier deployment.
pub struct CheckServiceOperationsInProgressStep {
    pool: BoundedPool,
}

impl CheckServiceOperationsInProgressStep {
    /// Create the step; `pool` bounds the status fetches while polling.
    pub fn new(pool: BoundedPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Step for CheckServiceOperationsInProgressStep {
    fn name(&self) -> &'static str {
        "checkServiceOperationsInProgress"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        let service = ctx.require(variables::SERVICE_TO_PROCESS)?;
        let client = ctx.client().await?;
        let instance = match client.get_service_instance(&service.name).await {
            Ok(instance) => instance,
            Err(err) => {
                let tolerance = Tolerance::for_context(ctx, service.optional)?;
                let what = format!("Retrieving service \"{}\"", service.name);
                resolve(err.into(), Intent::Read, tolerance, &what).apply(ctx.logger())?;
                return Ok(StepPhase::Done);
            }
        };

        let in_flight = instance
            .and_then(|i| i.last_operation)
            .filter(|op| matches!(op.state, OperationState::Initial | OperationState::InProgress));
        let Some(operation) = in_flight else {
            return Ok(StepPhase::Done);
        };

        ctx.logger().info(format!(
            "Service \"{}\" has a {} operation in progress, waiting for it to finish",
            service.name,
            operation.operation_type.as_str()
        ));
        let mut triggered = ctx.require(variables::TRIGGERED_SERVICE_OPERATIONS)?;
        triggered.insert(service.name.clone(), operation.operation_type);
        ctx.set(variables::TRIGGERED_SERVICE_OPERATIONS, &triggered)?;
        ctx.set(variables::SERVICES_TO_POLL, &vec![service])?;
        Ok(StepPhase::Poll)
    }

    fn step_error_message(&self, ctx: &ProcessContext) -> String {
        let name = ctx
            .get(variables::SERVICE_TO_PROCESS)
            .ok()
            .flatten()
            .map(|s| s.name)
            .unwrap_or_default();
        format!("Error checking operations in progress on service \"{}\"", name)
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

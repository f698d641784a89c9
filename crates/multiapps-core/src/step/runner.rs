// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Drives one invocation of a step.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use super::{AsyncExecution, AsyncExecutionState, Step, StepPhase};
use crate::conflict::ConflictPreventer;
use crate::context::{ProcessContext, variables};
use crate::error::{CoreError, ErrorKind, Result};
use crate::guard::HistoricEventGuard;
use crate::persistence::{HistoricEventType, Persistence};

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// All steps completed.
    Finished,
    /// An operator aborted the process.
    Aborted,
}

/// Runs a [`Step`] for one scheduler invocation.
///
/// Reads the persisted phase, executes or polls, classifies failures and
/// writes the resulting phase back before flushing the context.
pub struct StepRunner {
    step: Arc<dyn Step>,
}

impl StepRunner {
    /// Create a runner for `step`.
    pub fn new(step: Arc<dyn Step>) -> Self {
        Self { step }
    }

    /// Run one invocation. Returns the phase the step is in afterwards.
    #[instrument(skip(self, ctx), fields(process_id = %ctx.process_id(), step = self.step.name()))]
    pub async fn run(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        ctx.logger().set_step(self.step.name());
        let guard = HistoricEventGuard::new(ctx.persistence().clone());
        let process_id = ctx.process_id().to_string();

        guard.ensure_not_aborted(&process_id).await?;

        let phase = match ctx.require(variables::STEP_PHASE)? {
            StepPhase::Retry => {
                info!("Retrying failed step");
                guard.record(&process_id, HistoricEventType::Retried).await?;
                ctx.remove(variables::STEP_START_TIME);
                StepPhase::Execute
            }
            // A stored DONE belongs to the previous step.
            StepPhase::Done => StepPhase::Execute,
            phase => phase,
        };

        let outcome = match phase {
            StepPhase::Poll => self.poll(ctx).await,
            _ => {
                let result = self.execute(ctx).await;
                result.map_err(|err| err.with_prefix(&self.step.step_error_message(ctx)))
            }
        };

        let result = match outcome {
            Ok(next) => {
                self.advance(ctx, next).await?;
                Ok(next)
            }
            Err(err) => Err(self.fail(ctx, &guard, err).await?),
        };
        ctx.flush().await?;
        result
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        let locks = self.step.locked_resources(ctx)?;
        if !locks.is_empty() {
            ConflictPreventer::new(ctx.persistence().clone())
                .acquire(ctx.process_id(), &locks)
                .await?;
        }
        if !ctx.contains(variables::STEP_START_TIME) {
            ctx.set(variables::STEP_START_TIME, &Utc::now())?;
        }
        ctx.remove(variables::ASYNC_STEP_EXECUTION_INDEX);
        debug!("Executing step");
        self.step.execute(ctx).await
    }

    async fn poll(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        self.check_timeout(ctx)?;

        let executions = self.step.async_executions();
        let index = ctx.require(variables::ASYNC_STEP_EXECUTION_INDEX)?;
        let Some(execution) = executions.get(index) else {
            return Ok(StepPhase::Done);
        };

        ctx.remove(variables::ASYNC_FAILURE_DETAILS);
        let state = execution.execute(ctx).await;
        let state = state.map_err(|err| err.with_prefix(&execution.polling_error_message(ctx)))?;
        debug!(execution = execution.name(), index, state = ?state, "Polled");

        match state {
            AsyncExecutionState::Running => {
                forget_hook(ctx, execution.as_ref(), Hook::Success)?;
                Ok(StepPhase::Poll)
            }
            AsyncExecutionState::Finished => {
                run_hook_once(ctx, execution.as_ref(), Hook::Success).await?;
                let next = index + 1;
                if next < executions.len() {
                    ctx.set(variables::ASYNC_STEP_EXECUTION_INDEX, &next)?;
                    Ok(StepPhase::Poll)
                } else {
                    Ok(StepPhase::Done)
                }
            }
            AsyncExecutionState::Error => {
                run_hook_once(ctx, execution.as_ref(), Hook::Error).await?;
                let message = execution.polling_error_message(ctx);
                let details = ctx.get(variables::ASYNC_FAILURE_DETAILS)?;
                ctx.remove(variables::ASYNC_FAILURE_DETAILS);
                Err(CoreError::platform(match details {
                    Some(details) => format!("{}: {}", message, details),
                    None => message,
                }))
            }
        }
    }

    fn check_timeout(&self, ctx: &ProcessContext) -> Result<()> {
        let Some(timeout) = self.step.timeout(ctx) else {
            return Ok(());
        };
        let Some(started) = ctx.get(variables::STEP_START_TIME)? else {
            return Ok(());
        };
        let elapsed = (Utc::now() - started).to_std().unwrap_or_default();
        if elapsed > timeout {
            return Err(CoreError::platform(format!(
                "Execution of step \"{}\" has timed out after {} seconds",
                self.step.name(),
                timeout.as_secs()
            )));
        }
        Ok(())
    }

    async fn advance(&self, ctx: &mut ProcessContext, next: StepPhase) -> Result<()> {
        ctx.set(variables::STEP_PHASE, &next)?;
        if next != StepPhase::Done {
            return Ok(());
        }
        let locks = self.step.locked_resources(ctx)?;
        if !locks.is_empty() {
            ConflictPreventer::new(ctx.persistence().clone())
                .release(ctx.process_id(), &locks)
                .await?;
        }
        ctx.remove(variables::ASYNC_STEP_EXECUTION_INDEX);
        ctx.remove(variables::STEP_START_TIME);
        ctx.remove(variables::COMPLETED_HOOKS);
        info!("Step completed");
        Ok(())
    }

    async fn fail(
        &self,
        ctx: &mut ProcessContext,
        guard: &HistoricEventGuard<dyn Persistence>,
        err: CoreError,
    ) -> Result<CoreError> {
        let kind = err.kind();
        let event = match kind {
            ErrorKind::ContentError => HistoricEventType::FailedByContentError,
            _ => HistoricEventType::FailedByInfrastructureError,
        };
        error!(error_code = err.error_code(), kind = kind.as_str(), "Step failed: {}", err);
        guard.record(ctx.process_id(), event).await?;
        ctx.logger().error(err.to_string());
        ctx.set(variables::ERROR_TYPE, &kind)?;
        ctx.set(variables::STEP_PHASE, &StepPhase::Retry)?;
        Ok(err)
    }
}

#[derive(Clone, Copy)]
enum Hook {
    Success,
    Error,
}

fn hook_key(execution: &dyn AsyncExecution, hook: Hook) -> String {
    let suffix = match hook {
        Hook::Success => "success",
        Hook::Error => "error",
    };
    format!("{}:{}", execution.name(), suffix)
}

async fn run_hook_once(
    ctx: &mut ProcessContext,
    execution: &dyn AsyncExecution,
    hook: Hook,
) -> Result<()> {
    let key = hook_key(execution, hook);
    let mut completed = ctx.require(variables::COMPLETED_HOOKS)?;
    if completed.contains(&key) {
        debug!(hook = %key, "Hook already ran");
        return Ok(());
    }
    match hook {
        Hook::Success => execution.on_success(ctx).await?,
        Hook::Error => execution.on_error(ctx).await?,
    }
    completed.push(key);
    ctx.set(variables::COMPLETED_HOOKS, &completed)
}

fn forget_hook(ctx: &mut ProcessContext, execution: &dyn AsyncExecution, hook: Hook) -> Result<()> {
    let key = hook_key(execution, hook);
    let mut completed = ctx.require(variables::COMPLETED_HOOKS)?;
    if let Some(position) = completed.iter().position(|k| *k == key) {
        completed.remove(position);
        ctx.set(variables::COMPLETED_HOOKS, &completed)?;
    }
    Ok(())
}

/// Close a process: record the outcome, release its resource locks and
/// flush the context.
pub async fn end_process(ctx: &mut ProcessContext, outcome: ProcessOutcome) -> Result<()> {
    let process_id = ctx.process_id().to_string();
    let guard = HistoricEventGuard::new(ctx.persistence().clone());
    match outcome {
        ProcessOutcome::Finished => {
            guard
                .record(&process_id, HistoricEventType::Finished)
                .await?
        }
        ProcessOutcome::Aborted => guard.abort(&process_id).await?,
    }
    let released = ConflictPreventer::new(ctx.persistence().clone())
        .release_all(&process_id)
        .await?;
    if outcome == ProcessOutcome::Aborted && released > 0 {
        warn!(process_id = %process_id, released, "Aborted process held resource locks");
    }
    ctx.flush().await
}

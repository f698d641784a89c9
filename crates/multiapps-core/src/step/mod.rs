// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step model.
//!
//! A [`Step`] does the synchronous part of its work in [`Step::execute`] and
//! reports a [`StepPhase`]. If it started remote operations it returns
//! [`StepPhase::Poll`], and the [`StepRunner`] drives its
//! [`AsyncExecution`]s on later invocations until they are terminal.
//!
//! ```text
//!   EXECUTE ──execute()──▶ DONE
//!      │
//!      └──────────────────▶ POLL ──async executions FINISHED──▶ DONE
//!                             │
//!                             └──ERROR / error──▶ RETRY ──scheduler retry──▶ EXECUTE
//! ```
//!
//! Steps keep no state of their own between invocations: everything they
//! need on the next invocation goes through the [`ProcessContext`].

mod logger;
mod runner;

pub use logger::StepLogger;
pub use runner::{ProcessOutcome, StepRunner, end_process};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::conflict::ResourceLock;
use crate::context::{ProcessContext, variables};
use crate::error::Result;

/// Progress of a step across scheduler invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepPhase {
    /// Run the synchronous part.
    Execute,
    /// Poll the outstanding operations.
    Poll,
    /// Finished; never invoked again for this token.
    Done,
    /// The last invocation failed and the scheduler may retry it.
    Retry,
}

impl StepPhase {
    /// Returns the string representation of the phase.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execute => "EXECUTE",
            Self::Poll => "POLL",
            Self::Done => "DONE",
            Self::Retry => "RETRY",
        }
    }
}

/// Result of one poll of one outstanding operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AsyncExecutionState {
    /// Not terminal yet, poll again.
    Running,
    /// Completed successfully.
    Finished,
    /// Completed with a failure.
    Error,
}

/// A unit of work bound to one resource.
#[async_trait]
pub trait Step: Send + Sync {
    /// Stable step name, used in logs.
    fn name(&self) -> &'static str;

    /// Perform the synchronous part of the step.
    ///
    /// Must be safe to call again with the same context: operations already
    /// recorded in the context are not triggered a second time.
    async fn execute(&self, ctx: &mut ProcessContext) -> Result<StepPhase>;

    /// Prefix for errors raised by [`Step::execute`].
    fn step_error_message(&self, ctx: &ProcessContext) -> String;

    /// Polling units run in order while the step is in [`StepPhase::Poll`].
    fn async_executions(&self) -> Vec<Arc<dyn AsyncExecution>> {
        Vec::new()
    }

    /// How long the step may stay in [`StepPhase::Poll`].
    fn timeout(&self, _ctx: &ProcessContext) -> Option<Duration> {
        None
    }

    /// Resources to lock against other processes before executing.
    fn locked_resources(&self, _ctx: &ProcessContext) -> Result<Vec<ResourceLock>> {
        Ok(Vec::new())
    }
}

/// Polls one outstanding remote operation.
#[async_trait]
pub trait AsyncExecution: Send + Sync {
    /// Stable name, used to remember which hooks already ran.
    fn name(&self) -> &'static str;

    /// Check the operation once.
    async fn execute(&self, ctx: &mut ProcessContext) -> Result<AsyncExecutionState>;

    /// Prefix for errors raised while polling.
    fn polling_error_message(&self, ctx: &ProcessContext) -> String;

    /// Runs once after [`AsyncExecutionState::Finished`].
    async fn on_success(&self, _ctx: &mut ProcessContext) -> Result<()> {
        Ok(())
    }

    /// Runs once after [`AsyncExecutionState::Error`].
    async fn on_error(&self, _ctx: &mut ProcessContext) -> Result<()> {
        Ok(())
    }
}

/// Log why a remote operation failed and keep the reason for the error the
/// runner raises once the execution reports [`AsyncExecutionState::Error`].
pub fn report_failure(ctx: &mut ProcessContext, message: impl Into<String>) -> Result<()> {
    let message = message.into();
    ctx.logger().error(message.clone());
    let details = match ctx.get(variables::ASYNC_FAILURE_DETAILS)? {
        Some(previous) => format!("{}; {}", previous, message),
        None => message,
    };
    ctx.set(variables::ASYNC_FAILURE_DETAILS, &details)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_serializes_like_the_engine() {
        assert_eq!(
            serde_json::to_string(&StepPhase::Poll).unwrap(),
            "\"POLL\""
        );
        assert_eq!(
            serde_json::from_str::<StepPhase>("\"RETRY\"").unwrap(),
            StepPhase::Retry
        );
        assert_eq!(StepPhase::Done.as_str(), "DONE");
    }
}

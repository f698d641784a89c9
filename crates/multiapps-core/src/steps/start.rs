// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Starting applications and waiting for their instances.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use multiapps_platform::{InstanceInfo, InstanceState, PlatformClient};

use crate::conflict::{ResourceKind, ResourceLock};
use crate::context::{ProcessContext, variables};
use crate::error::Result;
use crate::step::{AsyncExecution, AsyncExecutionState, Step, StepPhase};

/// Application attribute that leaves the application stopped after deploy.
pub const NO_START: &str = "no-start";

/// How far an application's instances have come.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartProgress {
    /// Poll result.
    pub state: AsyncExecutionState,
    /// Human-readable summary.
    pub message: String,
}

/// Evaluate the instances of an application expected to run `expected`
/// instances.
///
/// All expected instances running means finished. Otherwise, a starting
/// instance keeps the poll going, a flapping one is an error, and crashed
/// instances are an error only with `fail_on_crash`.
pub fn evaluate_instances(
    app_name: &str,
    instances: &[InstanceInfo],
    expected: u32,
    fail_on_crash: bool,
) -> StartProgress {
    let count = |state| instances.iter().filter(|i| i.state == state).count();
    let running = count(InstanceState::Running);
    let starting = count(InstanceState::Starting);
    let crashed = count(InstanceState::Crashed);
    let flapping = count(InstanceState::Flapping);

    let summary = format!(
        "{} of {} instances running ({} running, {} starting, {} crashed, {} flapping)",
        running, expected, running, starting, crashed, flapping
    );
    let progress = |state, message: String| StartProgress { state, message };

    if running as u32 >= expected {
        return progress(
            AsyncExecutionState::Finished,
            format!("Application \"{}\" started: {}", app_name, summary),
        );
    }
    if starting > 0 {
        return progress(AsyncExecutionState::Running, summary);
    }
    if flapping > 0 {
        return progress(
            AsyncExecutionState::Error,
            format!(
                "Error starting application \"{}\": some instances are flapping, {}",
                app_name, summary
            ),
        );
    }
    if crashed > 0 && fail_on_crash {
        return progress(
            AsyncExecutionState::Error,
            format!(
                "Error starting application \"{}\": some instances have crashed, {}",
                app_name, summary
            ),
        );
    }
    progress(AsyncExecutionState::Running, summary)
}

/// Poll the start of `app_name` once and log the outcome.
pub(crate) async fn poll_start(
    ctx: &mut ProcessContext,
    client: &Arc<dyn PlatformClient>,
    app_name: &str,
    expected: u32,
) -> Result<AsyncExecutionState> {
    let fail_on_crash = ctx.require(variables::FAIL_ON_CRASH)?;
    let instances = client.get_application_instances(app_name).await?;
    let progress = evaluate_instances(app_name, &instances, expected, fail_on_crash);
    match progress.state {
        AsyncExecutionState::Error => ctx.logger().error(progress.message),
        _ => ctx.logger().info(progress.message),
    }
    Ok(progress.state)
}

fn start_timeout(ctx: &ProcessContext) -> Option<Duration> {
    ctx.require(variables::START_TIMEOUT_SECS)
        .ok()
        .map(Duration::from_secs)
}

/// Starts the application and waits until its instances run.
pub struct StartAppStep;

#[async_trait]
impl Step for StartAppStep {
    fn name(&self) -> &'static str {
        "startApp"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        let app = ctx.require(variables::APP_TO_PROCESS)?;
        if app.attribute_bool(NO_START).unwrap_or(false) {
            ctx.logger()
                .info(format!("Application \"{}\" is not started", app.name));
            return Ok(StepPhase::Done);
        }
        let client = ctx.client().await?;
        ctx.logger()
            .info(format!("Starting application \"{}\"", app.name));
        client.start_application(&app.name).await?;
        if app.instances == 0 {
            return Ok(StepPhase::Done);
        }
        Ok(StepPhase::Poll)
    }

    fn step_error_message(&self, ctx: &ProcessContext) -> String {
        let name = ctx
            .get(variables::APP_TO_PROCESS)
            .ok()
            .flatten()
            .map(|a| a.name)
            .unwrap_or_default();
        format!("Error starting application \"{}\"", name)
    }

    fn async_executions(&self) -> Vec<Arc<dyn AsyncExecution>> {
        vec![Arc::new(PollStartAppExecution)]
    }

    fn timeout(&self, ctx: &ProcessContext) -> Option<Duration> {
        start_timeout(ctx)
    }

    fn locked_resources(&self, ctx: &ProcessContext) -> Result<Vec<ResourceLock>> {
        let app = ctx.require(variables::APP_TO_PROCESS)?;
        super::lock_in_space(ctx, ResourceKind::Application, &app.name)
    }
}

/// Polls the instances of `APP_TO_PROCESS`.
pub struct PollStartAppExecution;

#[async_trait]
impl AsyncExecution for PollStartAppExecution {
    fn name(&self) -> &'static str {
        "pollStartApp"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<AsyncExecutionState> {
        let app = ctx.require(variables::APP_TO_PROCESS)?;
        let client = ctx.client().await?;
        poll_start(ctx, &client, &app.name, app.instances).await
    }

    fn polling_error_message(&self, ctx: &ProcessContext) -> String {
        let name = ctx
            .get(variables::APP_TO_PROCESS)
            .ok()
            .flatten()
            .map(|a| a.name)
            .unwrap_or_default();
        format!("Error starting application \"{}\"", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::model::AppDescriptor;
    use crate::step::StepRunner;
    use crate::steps::testing;
    use multiapps_platform::MockPlatformClient;
    use serde_json::json;

    fn instances(states: &[InstanceState]) -> Vec<InstanceInfo> {
        states
            .iter()
            .enumerate()
            .map(|(index, state)| InstanceInfo {
                index: index as u32,
                state: *state,
            })
            .collect()
    }

    use InstanceState::*;

    #[test]
    fn test_crashed_instance_is_tolerated_without_fail_on_crash() {
        let progress = evaluate_instances("web", &instances(&[Running, Running, Crashed]), 3, false);
        assert_eq!(progress.state, AsyncExecutionState::Running);
        assert!(progress.message.starts_with("2 of 3 instances running"));
    }

    #[test]
    fn test_all_crashed_with_fail_on_crash_is_error() {
        let progress = evaluate_instances("web", &instances(&[Crashed, Crashed, Crashed]), 3, true);
        assert_eq!(progress.state, AsyncExecutionState::Error);
        assert!(progress.message.starts_with("Error starting application \"web\""));
    }

    #[test]
    fn test_starting_instances_win_over_crashes() {
        let progress = evaluate_instances("web", &instances(&[Starting, Crashed]), 2, true);
        assert_eq!(progress.state, AsyncExecutionState::Running);
    }

    #[test]
    fn test_flapping_is_always_error() {
        let progress = evaluate_instances("web", &instances(&[Running, Flapping]), 2, false);
        assert_eq!(progress.state, AsyncExecutionState::Error);
    }

    #[test]
    fn test_all_running_is_finished() {
        let progress = evaluate_instances("web", &instances(&[Running, Running]), 2, true);
        assert_eq!(progress.state, AsyncExecutionState::Finished);
        assert_eq!(
            evaluate_instances("web", &[], 0, true).state,
            AsyncExecutionState::Finished
        );
    }

    async fn started_app(client: &MockPlatformClient) -> AppDescriptor {
        let app = AppDescriptor {
            name: "web".into(),
            instances: 2,
            ..Default::default()
        };
        client.insert_application(app.to_application()).await;
        app
    }

    #[tokio::test]
    async fn test_start_and_poll() {
        let client = Arc::new(MockPlatformClient::new());
        let app = started_app(&client).await;
        let mut ctx = testing::context(client.clone()).await;
        ctx.set(variables::APP_TO_PROCESS, &app).unwrap();

        let runner = StepRunner::new(Arc::new(StartAppStep));
        client.set_instances("web", &[Starting, Starting]).await;
        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Poll);
        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Poll);

        client.set_instances("web", &[Running, Running]).await;
        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Done);
        assert_eq!(client.call_count("start_application:web").await, 1);
    }

    #[tokio::test]
    async fn test_crash_fails_the_step() {
        let client = Arc::new(MockPlatformClient::new());
        let app = started_app(&client).await;
        let mut ctx = testing::context(client.clone()).await;
        ctx.set(variables::APP_TO_PROCESS, &app).unwrap();

        let runner = StepRunner::new(Arc::new(StartAppStep));
        runner.run(&mut ctx).await.unwrap();
        client.set_instances("web", &[Running, Crashed]).await;

        let err = runner.run(&mut ctx).await.unwrap_err();
        assert!(matches!(err, CoreError::Platform { .. }));
        assert_eq!(err.to_string(), "Error starting application \"web\"");
        assert!(
            testing::warnings(&mut ctx)
                .iter()
                .any(|w| w.contains("some instances have crashed"))
        );
    }

    #[tokio::test]
    async fn test_no_start_attribute() {
        let client = Arc::new(MockPlatformClient::new());
        let mut app = started_app(&client).await;
        app.attributes.insert(NO_START.into(), json!(true));
        let mut ctx = testing::context(client.clone()).await;
        ctx.set(variables::APP_TO_PROCESS, &app).unwrap();

        assert_eq!(
            testing::run(StartAppStep, &mut ctx).await.unwrap(),
            StepPhase::Done
        );
        assert_eq!(client.call_count("start_application").await, 0);
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Incremental instance update.
//!
//! The new application is scaled up one instance at a time while the old
//! application is scaled down by one, waiting for the new instance to run
//! before the next round. If the new application crashes, both are rolled
//! back once: the new application to a single instance and the old one to
//! its initial count with the autoscaler enabled again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use multiapps_platform::{AppState, InstanceState, PlatformClient};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::start::poll_start;
use crate::conflict::{ResourceKind, ResourceLock};
use crate::context::{ProcessContext, variables};
use crate::error::Result;
use crate::step::{AsyncExecution, AsyncExecutionState, Step, StepPhase};

/// Scaling progress of one incremental update, kept across polls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalUpdateState {
    /// Application being replaced, if there is one.
    #[serde(default)]
    pub old_app: Option<String>,
    /// Instances the old application had when the update started.
    #[serde(default)]
    pub old_initial_count: u32,
    /// Current instances of the old application.
    #[serde(default)]
    pub old_count: u32,
    /// Current instances of the new application.
    #[serde(default)]
    pub new_count: u32,
    /// Whether the autoscaler of the old application was switched off.
    #[serde(default)]
    pub autoscaler_disabled: bool,
}

const POLL_OLD_APP: usize = 0;
const POLL_NEW_APP: usize = 1;
const SCALE: usize = 2;

fn step_state(ctx: &ProcessContext) -> Result<IncrementalUpdateState> {
    ctx.require(variables::INCREMENTAL_UPDATE_STATE)
}

fn new_app_name(ctx: &ProcessContext) -> String {
    ctx.get(variables::APP_TO_PROCESS)
        .ok()
        .flatten()
        .map(|a| a.name)
        .unwrap_or_default()
}

/// Replaces the instances of the deployed application with those of the
/// new one, one instance at a time.
pub struct IncrementalAppInstancesUpdateStep;

#[async_trait]
impl Step for IncrementalAppInstancesUpdateStep {
    fn name(&self) -> &'static str {
        "incrementalAppInstancesUpdate"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        let app = ctx.require(variables::APP_TO_PROCESS)?;
        let old_name = ctx
            .get(variables::DEPLOYED_MTA)?
            .and_then(|mta| {
                mta.apps
                    .into_iter()
                    .find(|a| a.name != app.name && a.module_name == app.module_name)
            })
            .map(|a| a.name);
        let client = ctx.client().await?;

        let old_app = match &old_name {
            Some(name) => client.get_application(name).await?,
            None => None,
        };
        let Some(old_app) = old_app else {
            ctx.logger().info(format!(
                "No deployed application to replace, scaling \"{}\" to {} instances",
                app.name, app.instances
            ));
            client
                .update_application_instances(&app.name, app.instances)
                .await?;
            let state = IncrementalUpdateState {
                new_count: app.instances,
                ..Default::default()
            };
            ctx.set(variables::INCREMENTAL_UPDATE_STATE, &state)?;
            ctx.set(variables::ASYNC_STEP_EXECUTION_INDEX, &POLL_NEW_APP)?;
            return Ok(StepPhase::Poll);
        };

        let instances = client.get_application_instances(&old_app.name).await?;
        let new_instances = client.get_application_instances(&app.name).await?;
        let state = IncrementalUpdateState {
            old_app: Some(old_app.name.clone()),
            old_initial_count: old_app.instances,
            old_count: old_app.instances,
            new_count: new_instances.len() as u32,
            autoscaler_disabled: false,
        };
        ctx.set(variables::INCREMENTAL_UPDATE_STATE, &state)?;

        if state.new_count >= app.instances {
            ctx.logger().info(format!(
                "Application \"{}\" already has {} instances",
                app.name, state.new_count
            ));
            return Ok(StepPhase::Done);
        }

        let all_running = !instances.is_empty()
            && instances.iter().all(|i| i.state == InstanceState::Running);
        let index = if all_running { SCALE } else { POLL_OLD_APP };
        ctx.set(variables::ASYNC_STEP_EXECUTION_INDEX, &index)?;
        Ok(StepPhase::Poll)
    }

    fn step_error_message(&self, ctx: &ProcessContext) -> String {
        format!(
            "Error updating instances of application \"{}\" incrementally",
            new_app_name(ctx)
        )
    }

    fn async_executions(&self) -> Vec<Arc<dyn AsyncExecution>> {
        vec![
            Arc::new(PollOldAppStartExecution),
            Arc::new(PollNewAppStartExecution),
            Arc::new(ScaleIncrementallyExecution),
        ]
    }

    fn timeout(&self, ctx: &ProcessContext) -> Option<Duration> {
        ctx.require(variables::START_TIMEOUT_SECS)
            .ok()
            .map(Duration::from_secs)
    }

    fn locked_resources(&self, ctx: &ProcessContext) -> Result<Vec<ResourceLock>> {
        let app = ctx.require(variables::APP_TO_PROCESS)?;
        super::lock_in_space(ctx, ResourceKind::Application, &app.name)
    }
}

/// Waits until the old application runs all its instances before scaling.
struct PollOldAppStartExecution;

#[async_trait]
impl AsyncExecution for PollOldAppStartExecution {
    fn name(&self) -> &'static str {
        "pollOldAppStart"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<AsyncExecutionState> {
        let state = step_state(ctx)?;
        let Some(old_app) = state.old_app else {
            return Ok(AsyncExecutionState::Finished);
        };
        let client = ctx.client().await?;
        poll_start(ctx, &client, &old_app, state.old_count).await
    }

    fn polling_error_message(&self, ctx: &ProcessContext) -> String {
        let old = step_state(ctx).ok().and_then(|s| s.old_app).unwrap_or_default();
        format!("Error waiting for deployed application \"{}\" to start", old)
    }
}

/// Waits for the new instance; rolls both applications back on a crash.
struct PollNewAppStartExecution;

#[async_trait]
impl AsyncExecution for PollNewAppStartExecution {
    fn name(&self) -> &'static str {
        "pollNewAppStart"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<AsyncExecutionState> {
        let state = step_state(ctx)?;
        let app = ctx.require(variables::APP_TO_PROCESS)?;
        let client = ctx.client().await?;
        poll_start(ctx, &client, &app.name, state.new_count).await
    }

    fn polling_error_message(&self, ctx: &ProcessContext) -> String {
        format!("Error starting application \"{}\"", new_app_name(ctx))
    }

    async fn on_error(&self, ctx: &mut ProcessContext) -> Result<()> {
        if ctx.require(variables::ROLLBACK_PERFORMED)? {
            return Ok(());
        }
        let state = step_state(ctx)?;
        let app = ctx.require(variables::APP_TO_PROCESS)?;
        let client = ctx.client().await?;
        rollback(ctx, &client, &app.name, &state).await?;
        ctx.set(variables::ROLLBACK_PERFORMED, &true)
    }
}

async fn rollback(
    ctx: &mut ProcessContext,
    client: &Arc<dyn PlatformClient>,
    new_app: &str,
    state: &IncrementalUpdateState,
) -> Result<()> {
    ctx.logger().warn(format!(
        "Rolling back instances of application \"{}\" to 1",
        new_app
    ));
    client.update_application_instances(new_app, 1).await?;
    if let Some(old_app) = &state.old_app {
        ctx.logger().warn(format!(
            "Rolling back instances of application \"{}\" to {}",
            old_app, state.old_initial_count
        ));
        client
            .update_application_instances(old_app, state.old_initial_count)
            .await?;
        if state.autoscaler_disabled {
            client.set_application_autoscaling(old_app, true).await?;
        }
    }
    info!(process_id = %ctx.process_id(), app = %new_app, "Incremental update rolled back");
    Ok(())
}

/// Adds one instance to the new application and removes one from the old.
struct ScaleIncrementallyExecution;

#[async_trait]
impl AsyncExecution for ScaleIncrementallyExecution {
    fn name(&self) -> &'static str {
        "scaleIncrementally"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<AsyncExecutionState> {
        let mut state = step_state(ctx)?;
        let app = ctx.require(variables::APP_TO_PROCESS)?;
        if state.new_count >= app.instances {
            return Ok(AsyncExecutionState::Finished);
        }
        let client = ctx.client().await?;

        if let Some(old_app) = state.old_app.clone() {
            if !state.autoscaler_disabled {
                client.set_application_autoscaling(&old_app, false).await?;
                state.autoscaler_disabled = true;
            }
            if state.old_count > 1 {
                state.old_count -= 1;
                client
                    .update_application_instances(&old_app, state.old_count)
                    .await?;
            }
        }
        state.new_count += 1;
        client
            .update_application_instances(&app.name, state.new_count)
            .await?;
        ctx.logger().info(format!(
            "Scaled application \"{}\" to {} of {} instances",
            app.name, state.new_count, app.instances
        ));
        ctx.set(variables::INCREMENTAL_UPDATE_STATE, &state)?;

        let started = client
            .get_application(&app.name)
            .await?
            .is_some_and(|a| a.state == AppState::Started);
        let next = if started { POLL_NEW_APP } else { SCALE };
        ctx.set(variables::ASYNC_STEP_EXECUTION_INDEX, &next)?;
        Ok(AsyncExecutionState::Running)
    }

    fn polling_error_message(&self, ctx: &ProcessContext) -> String {
        format!("Error scaling application \"{}\"", new_app_name(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AppDescriptor, DeployedApp, DeployedMta};
    use crate::step::StepRunner;
    use crate::steps::testing;
    use multiapps_platform::MockPlatformClient;

    use InstanceState::*;

    async fn setup(client: &Arc<MockPlatformClient>) -> ProcessContext {
        let mut old = AppDescriptor {
            name: "web-blue".into(),
            module_name: Some("web".into()),
            instances: 2,
            ..Default::default()
        }
        .to_application();
        old.state = AppState::Started;
        client.insert_application(old).await;
        client.set_instances("web-blue", &[Running, Running]).await;

        let new = AppDescriptor {
            name: "web-green".into(),
            module_name: Some("web".into()),
            instances: 2,
            ..Default::default()
        };
        let mut application = new.to_application();
        application.instances = 0;
        application.state = AppState::Started;
        client.insert_application(application).await;

        let mut ctx = testing::context(client.clone()).await;
        ctx.set(variables::APP_TO_PROCESS, &new).unwrap();
        ctx.set(
            variables::DEPLOYED_MTA,
            &DeployedMta {
                id: "shop".into(),
                version: Some("1.0.0".into()),
                apps: vec![DeployedApp {
                    name: "web-blue".into(),
                    module_name: Some("web".into()),
                    services: Vec::new(),
                }],
                services: Vec::new(),
            },
        )
        .unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_scales_one_instance_at_a_time() {
        let client = Arc::new(MockPlatformClient::new());
        let mut ctx = setup(&client).await;
        let runner = StepRunner::new(Arc::new(IncrementalAppInstancesUpdateStep));

        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Poll);
        assert_eq!(ctx.require(variables::ASYNC_STEP_EXECUTION_INDEX).unwrap(), SCALE);

        // First round: new 1, old 1.
        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Poll);
        assert_eq!(client.autoscaling("web-blue").await, Some(false));
        assert_eq!(client.application("web-blue").await.unwrap().instances, 1);
        assert_eq!(client.application("web-green").await.unwrap().instances, 1);

        client.set_instances("web-green", &[Running]).await;
        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Poll);

        // Second round: the old app keeps its last instance.
        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Poll);
        assert_eq!(client.application("web-blue").await.unwrap().instances, 1);
        assert_eq!(client.application("web-green").await.unwrap().instances, 2);

        client.set_instances("web-green", &[Running, Running]).await;
        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Poll);
        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Done);

        let state = ctx.require(variables::INCREMENTAL_UPDATE_STATE).unwrap();
        assert_eq!(state.new_count, 2);
        assert_eq!(state.old_initial_count, 2);
    }

    #[tokio::test]
    async fn test_crash_rolls_back_once() {
        let client = Arc::new(MockPlatformClient::new());
        let mut ctx = setup(&client).await;
        let runner = StepRunner::new(Arc::new(IncrementalAppInstancesUpdateStep));

        runner.run(&mut ctx).await.unwrap();
        runner.run(&mut ctx).await.unwrap();
        client.set_instances("web-green", &[Crashed]).await;

        assert!(runner.run(&mut ctx).await.is_err());
        assert!(ctx.require(variables::ROLLBACK_PERFORMED).unwrap());
        assert_eq!(client.application("web-blue").await.unwrap().instances, 2);
        assert_eq!(client.application("web-green").await.unwrap().instances, 1);
        assert_eq!(client.autoscaling("web-blue").await, Some(true));
        let rollbacks = client
            .call_count("update_application_instances:web-blue")
            .await;

        // A retry that crashes again does not roll back a second time.
        runner.run(&mut ctx).await.unwrap();
        client.set_instances("web-green", &[Crashed]).await;
        ctx.set(variables::STEP_PHASE, &StepPhase::Poll).unwrap();
        ctx.set(variables::ASYNC_STEP_EXECUTION_INDEX, &POLL_NEW_APP)
            .unwrap();
        assert!(runner.run(&mut ctx).await.is_err());
        assert_eq!(
            client
                .call_count("update_application_instances:web-blue")
                .await,
            rollbacks
        );
    }

    #[tokio::test]
    async fn test_without_deployed_app_scales_directly() {
        let client = Arc::new(MockPlatformClient::new());
        let mut ctx = setup(&client).await;
        ctx.remove(variables::DEPLOYED_MTA);
        let runner = StepRunner::new(Arc::new(IncrementalAppInstancesUpdateStep));

        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Poll);
        assert_eq!(client.application("web-green").await.unwrap().instances, 2);
        assert_eq!(
            ctx.require(variables::ASYNC_STEP_EXECUTION_INDEX).unwrap(),
            POLL_NEW_APP
        );

        client.set_instances("web-green", &[Running, Running]).await;
        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Poll);
        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Done);
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Staging applications and following their builds.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use multiapps_platform::BuildState;

use crate::conflict::{ResourceKind, ResourceLock};
use crate::context::{ProcessContext, variables};
use crate::error::Result;
use crate::step::{AsyncExecution, AsyncExecutionState, Step, StepPhase, report_failure};

fn app_name(ctx: &ProcessContext) -> String {
    ctx.get(variables::APP_TO_PROCESS)
        .ok()
        .flatten()
        .map(|a| a.name)
        .unwrap_or_default()
}

/// Stages the package of `APP_TO_PROCESS` and waits for the build.
pub struct StageAppStep;

#[async_trait]
impl Step for StageAppStep {
    fn name(&self) -> &'static str {
        "stageApp"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        let app = ctx.require(variables::APP_TO_PROCESS)?;
        let client = ctx.client().await?;
        ctx.logger()
            .info(format!("Staging application \"{}\"", app.name));
        let build = client.stage_application(&app.name).await?;
        ctx.set(variables::BUILD_GUID, &build.id)?;
        if build.state == BuildState::Staged {
            ctx.logger()
                .info(format!("Application \"{}\" staged", app.name));
            return Ok(StepPhase::Done);
        }
        Ok(StepPhase::Poll)
    }

    fn step_error_message(&self, ctx: &ProcessContext) -> String {
        format!("Error staging application \"{}\"", app_name(ctx))
    }

    fn async_executions(&self) -> Vec<Arc<dyn AsyncExecution>> {
        vec![Arc::new(PollStageAppExecution)]
    }

    fn timeout(&self, ctx: &ProcessContext) -> Option<Duration> {
        ctx.require(variables::STAGE_TIMEOUT_SECS)
            .ok()
            .map(Duration::from_secs)
    }

    fn locked_resources(&self, ctx: &ProcessContext) -> Result<Vec<ResourceLock>> {
        let app = ctx.require(variables::APP_TO_PROCESS)?;
        super::lock_in_space(ctx, ResourceKind::Application, &app.name)
    }
}

/// Polls the build in `BUILD_GUID`.
pub struct PollStageAppExecution;

#[async_trait]
impl AsyncExecution for PollStageAppExecution {
    fn name(&self) -> &'static str {
        "pollStageApp"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<AsyncExecutionState> {
        let build_id = ctx.require(variables::BUILD_GUID)?;
        let client = ctx.client().await?;
        let build = client.get_build(&build_id).await?;
        match build.state {
            BuildState::Staging => {
                ctx.logger().debug(format!(
                    "Application \"{}\" is still staging",
                    build.app_name
                ));
                Ok(AsyncExecutionState::Running)
            }
            BuildState::Staged => {
                ctx.logger()
                    .info(format!("Application \"{}\" staged", build.app_name));
                Ok(AsyncExecutionState::Finished)
            }
            BuildState::Failed => {
                let reason = build.error.as_deref().unwrap_or("no reason given");
                report_failure(
                    ctx,
                    format!("Build \"{}\" failed: {}", build.id, reason),
                )?;
                Ok(AsyncExecutionState::Error)
            }
        }
    }

    fn polling_error_message(&self, ctx: &ProcessContext) -> String {
        format!("Error staging application \"{}\"", app_name(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::AppDescriptor;
    use crate::step::StepRunner;
    use crate::steps::testing;
    use chrono::Utc;
    use multiapps_platform::{Application, MockPlatformClient};

    async fn context(client: &Arc<MockPlatformClient>) -> ProcessContext {
        client
            .insert_application(Application {
                name: "web".into(),
                ..Default::default()
            })
            .await;
        let mut ctx = testing::context(client.clone()).await;
        let app = AppDescriptor {
            name: "web".into(),
            ..Default::default()
        };
        ctx.set(variables::APP_TO_PROCESS, &app).unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_synchronous_staging_is_done() {
        let client = Arc::new(MockPlatformClient::new());
        let mut ctx = context(&client).await;

        assert_eq!(
            testing::run(StageAppStep, &mut ctx).await.unwrap(),
            StepPhase::Done
        );
        assert_eq!(client.call_count("get_build").await, 0);
    }

    #[tokio::test]
    async fn test_staging_is_polled_until_staged() {
        let client = Arc::new(MockPlatformClient::asynchronous());
        let mut ctx = context(&client).await;
        let runner = StepRunner::new(Arc::new(StageAppStep));

        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Poll);
        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Poll);

        let build_id = ctx.require(variables::BUILD_GUID).unwrap();
        client.complete_build(&build_id).await;
        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Done);
        assert_eq!(client.call_count("stage_application").await, 1);
    }

    #[tokio::test]
    async fn test_failed_build_carries_its_reason() {
        let client = Arc::new(MockPlatformClient::asynchronous());
        let mut ctx = context(&client).await;
        let runner = StepRunner::new(Arc::new(StageAppStep));
        runner.run(&mut ctx).await.unwrap();

        let build_id = ctx.require(variables::BUILD_GUID).unwrap();
        client.fail_build(&build_id, "no buildpack detected").await;
        let err = runner.run(&mut ctx).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "Error staging application \"web\": Build \"{}\" failed: no buildpack detected",
                build_id
            )
        );
        assert_eq!(err.kind(), ErrorKind::PlatformError);
    }

    #[tokio::test]
    async fn test_staging_times_out() {
        let client = Arc::new(MockPlatformClient::asynchronous());
        let mut ctx = context(&client).await;
        ctx.set(variables::STAGE_TIMEOUT_SECS, &60).unwrap();
        let runner = StepRunner::new(Arc::new(StageAppStep));

        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Poll);
        ctx.set(
            variables::STEP_START_TIME,
            &(Utc::now() - chrono::Duration::seconds(120)),
        )
        .unwrap();
        let err = runner.run(&mut ctx).await.unwrap_err();
        assert!(err.to_string().contains("has timed out"));
    }

    #[tokio::test]
    async fn test_missing_application_fails_staging() {
        let client = Arc::new(MockPlatformClient::new());
        let mut ctx = testing::context(client.clone()).await;
        let app = AppDescriptor {
            name: "ghost".into(),
            ..Default::default()
        };
        ctx.set(variables::APP_TO_PROCESS, &app).unwrap();

        let err = testing::run(StageAppStep, &mut ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run-to-completion applications.
//!
//! An application with the `execute-app` attribute is a task: once started,
//! its logs are watched for a success or failure marker, and it may be
//! stopped afterwards.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use multiapps_platform::{AppLog, MessageType};
use regex::Regex;

use crate::conflict::{ResourceKind, ResourceLock};
use crate::context::{ProcessContext, variables};
use crate::error::{CoreError, Result};
use crate::model::AppDescriptor;
use crate::step::{AsyncExecution, AsyncExecutionState, Step, StepPhase, report_failure};

/// Application attribute marking the application as a task.
pub const EXECUTE_APP: &str = "execute-app";
/// Marker that signals success, as `STREAM:regex`.
pub const SUCCESS_MARKER: &str = "success-marker";
/// Marker that signals failure, as `STREAM:regex`.
pub const FAILURE_MARKER: &str = "failure-marker";
/// Stop the application once the execution ended.
pub const STOP_APP: &str = "stop-app";

const DEFAULT_SUCCESS_MARKER: &str = "STDOUT:SUCCESS";
const DEFAULT_FAILURE_MARKER: &str = "STDERR:FAILURE";

/// A log line pattern on one output stream.
#[derive(Debug, Clone)]
pub struct Marker {
    message_type: MessageType,
    pattern: Regex,
}

impl Marker {
    /// Parse `STDOUT:regex`, `STDERR:regex` or a bare regex (stdout).
    ///
    /// The regex must match the whole trimmed log message.
    pub fn parse(value: &str) -> Result<Self> {
        let (message_type, text) = match value.split_once(':') {
            Some((stream, text)) => match MessageType::parse(stream) {
                Some(message_type) => (message_type, text),
                None => (MessageType::Stdout, value),
            },
            None => (MessageType::Stdout, value),
        };
        let pattern = Regex::new(&format!("^(?:{})$", text))
            .map_err(|e| CoreError::content(format!("Invalid marker \"{}\": {}", value, e)))?;
        Ok(Self {
            message_type,
            pattern,
        })
    }

    fn matches(&self, log: &AppLog) -> bool {
        log.message_type == self.message_type && self.pattern.is_match(log.message.trim())
    }
}

/// Where a task execution stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// No marker seen yet.
    Executing,
    /// The success marker was logged.
    Succeeded,
    /// The failure marker was logged; carries the log message.
    Failed(String),
}

/// Scan application logs written since `started` for the first marker.
pub fn execution_status(
    logs: &[AppLog],
    started: DateTime<Utc>,
    success: &Marker,
    failure: &Marker,
) -> ExecutionStatus {
    logs.iter()
        .filter(|log| log.source_name.to_ascii_uppercase().starts_with("APP"))
        .filter(|log| log.timestamp >= started)
        .find_map(|log| {
            if success.matches(log) {
                Some(ExecutionStatus::Succeeded)
            } else if failure.matches(log) {
                Some(ExecutionStatus::Failed(log.message.trim().to_string()))
            } else {
                None
            }
        })
        .unwrap_or(ExecutionStatus::Executing)
}

fn is_task(app: &AppDescriptor) -> bool {
    app.attribute_bool(EXECUTE_APP).unwrap_or(false)
}

fn app_name(ctx: &ProcessContext) -> String {
    ctx.get(variables::APP_TO_PROCESS)
        .ok()
        .flatten()
        .map(|a| a.name)
        .unwrap_or_default()
}

/// Watches a task application until it logs a marker.
pub struct ExecuteAppStep;

#[async_trait]
impl Step for ExecuteAppStep {
    fn name(&self) -> &'static str {
        "executeApp"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        let app = ctx.require(variables::APP_TO_PROCESS)?;
        if !is_task(&app) {
            return Ok(StepPhase::Done);
        }
        // Fail on bad markers before anything is polled.
        marker(&app, SUCCESS_MARKER, DEFAULT_SUCCESS_MARKER)?;
        marker(&app, FAILURE_MARKER, DEFAULT_FAILURE_MARKER)?;

        ctx.logger()
            .info(format!("Executing application \"{}\"", app.name));
        ctx.set(variables::EXECUTE_START_TIME, &Utc::now())?;
        ctx.remove(variables::LOGS_OFFSET);
        Ok(StepPhase::Poll)
    }

    fn step_error_message(&self, ctx: &ProcessContext) -> String {
        format!("Error executing application \"{}\"", app_name(ctx))
    }

    fn async_executions(&self) -> Vec<Arc<dyn AsyncExecution>> {
        vec![Arc::new(PollExecuteAppStatusExecution)]
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

fn marker(app: &AppDescriptor, attribute: &str, default: &str) -> Result<Marker> {
    Marker::parse(app.attribute_str(attribute).unwrap_or(default))
}

/// Reads new log lines of the task and looks for a marker.
pub struct PollExecuteAppStatusExecution;

impl PollExecuteAppStatusExecution {
    async fn stop_if_requested(ctx: &mut ProcessContext, app: &AppDescriptor) -> Result<()> {
        if !app.attribute_bool(STOP_APP).unwrap_or(false) {
            return Ok(());
        }
        ctx.logger()
            .info(format!("Stopping application \"{}\"", app.name));
        let client = ctx.client().await?;
        client.stop_application(&app.name).await?;
        Ok(())
    }
}

#[async_trait]
impl AsyncExecution for PollExecuteAppStatusExecution {
    fn name(&self) -> &'static str {
        "pollExecuteAppStatus"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<AsyncExecutionState> {
        let app = ctx.require(variables::APP_TO_PROCESS)?;
        if !is_task(&app) {
            return Ok(AsyncExecutionState::Finished);
        }
        let started = ctx.require(variables::EXECUTE_START_TIME)?;
        let offset = ctx.get(variables::LOGS_OFFSET)?;
        let success = marker(&app, SUCCESS_MARKER, DEFAULT_SUCCESS_MARKER)?;
        let failure = marker(&app, FAILURE_MARKER, DEFAULT_FAILURE_MARKER)?;

        let client = ctx.client().await?;
        let logs = client.get_recent_logs(&app.name, offset).await?;
        if let Some(last) = logs.last() {
            ctx.set(variables::LOGS_OFFSET, &last.timestamp)?;
        }

        match execution_status(&logs, started, &success, &failure) {
            ExecutionStatus::Executing => Ok(AsyncExecutionState::Running),
            ExecutionStatus::Succeeded => {
                ctx.logger()
                    .info(format!("Application \"{}\" executed", app.name));
                Self::stop_if_requested(ctx, &app).await?;
                Ok(AsyncExecutionState::Finished)
            }
            ExecutionStatus::Failed(message) => {
                report_failure(
                    ctx,
                    format!(
                        "Failure reported by application \"{}\": {}",
                        app.name, message
                    ),
                )?;
                Self::stop_if_requested(ctx, &app).await?;
                Ok(AsyncExecutionState::Error)
            }
        }
    }

    fn polling_error_message(&self, ctx: &ProcessContext) -> String {
        format!("Error executing application \"{}\"", app_name(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepRunner;
    use crate::steps::testing;
    use chrono::Duration as ChronoDuration;
    use multiapps_platform::{AppState, MockPlatformClient};
    use serde_json::json;

    fn log(source: &str, message_type: MessageType, message: &str, at: DateTime<Utc>) -> AppLog {
        AppLog {
            source_name: source.into(),
            message_type,
            message: message.into(),
            timestamp: at,
        }
    }

    fn defaults() -> (Marker, Marker) {
        (
            Marker::parse(DEFAULT_SUCCESS_MARKER).unwrap(),
            Marker::parse(DEFAULT_FAILURE_MARKER).unwrap(),
        )
    }

    #[test]
    fn test_first_marker_wins() {
        let start = Utc::now();
        let (success, failure) = defaults();
        let logs = vec![
            log("APP/PROC/WEB/0", MessageType::Stdout, "working", start),
            log("APP/PROC/WEB/0", MessageType::Stderr, " FAILURE ", start),
            log("APP/PROC/WEB/0", MessageType::Stdout, "SUCCESS", start),
        ];
        assert_eq!(
            execution_status(&logs, start, &success, &failure),
            ExecutionStatus::Failed("FAILURE".into())
        );
    }

    #[test]
    fn test_old_and_foreign_logs_are_ignored() {
        let start = Utc::now();
        let (success, failure) = defaults();
        let logs = vec![
            log(
                "APP/PROC/WEB/0",
                MessageType::Stdout,
                "SUCCESS",
                start - ChronoDuration::seconds(5),
            ),
            log("STG/0", MessageType::Stdout, "SUCCESS", start),
            log("APP/PROC/WEB/0", MessageType::Stderr, "SUCCESS", start),
        ];
        assert_eq!(
            execution_status(&logs, start, &success, &failure),
            ExecutionStatus::Executing
        );
    }

    #[test]
    fn test_marker_parsing() {
        let marker = Marker::parse("STDERR:done .*").unwrap();
        let now = Utc::now();
        assert!(marker.matches(&log("APP", MessageType::Stderr, "done in 3s", now)));
        assert!(!marker.matches(&log("APP", MessageType::Stdout, "done in 3s", now)));
        assert!(!marker.matches(&log("APP", MessageType::Stderr, "not done in 3s", now)));

        let bare = Marker::parse("READY").unwrap();
        assert!(bare.matches(&log("APP", MessageType::Stdout, "READY", now)));

        let err = Marker::parse("STDOUT:(unclosed").unwrap_err();
        assert!(matches!(err, CoreError::Content { .. }));
    }

    async fn task(client: &Arc<MockPlatformClient>, stop: bool) -> ProcessContext {
        let mut app = AppDescriptor {
            name: "migrate".into(),
            instances: 1,
            ..Default::default()
        };
        app.attributes.insert(EXECUTE_APP.into(), json!(true));
        app.attributes.insert(STOP_APP.into(), json!(stop));
        let mut application = app.to_application();
        application.state = AppState::Started;
        client.insert_application(application).await;
        let mut ctx = testing::context(client.clone()).await;
        ctx.set(variables::APP_TO_PROCESS, &app).unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_success_stops_the_app() {
        let client = Arc::new(MockPlatformClient::new());
        let mut ctx = task(&client, true).await;
        let runner = StepRunner::new(Arc::new(ExecuteAppStep));

        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Poll);
        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Poll);

        let later = Utc::now() + ChronoDuration::seconds(1);
        client
            .push_log("migrate", log("APP/PROC/WEB/0", MessageType::Stdout, "SUCCESS", later))
            .await;
        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Done);
        assert_eq!(
            client.application("migrate").await.unwrap().state,
            AppState::Stopped
        );
        assert_eq!(ctx.require(variables::LOGS_OFFSET).unwrap(), later);
    }

    #[tokio::test]
    async fn test_failure_marker_fails_the_step() {
        let client = Arc::new(MockPlatformClient::new());
        let mut ctx = task(&client, false).await;
        let runner = StepRunner::new(Arc::new(ExecuteAppStep));
        runner.run(&mut ctx).await.unwrap();

        let later = Utc::now() + ChronoDuration::seconds(1);
        client
            .push_log(
                "migrate",
                log("APP/PROC/WEB/0", MessageType::Stderr, "FAILURE", later),
            )
            .await;
        let err = runner.run(&mut ctx).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error executing application \"migrate\": Failure reported by application \"migrate\": FAILURE"
        );
        assert_eq!(client.call_count("stop_application").await, 0);
        assert!(
            testing::warnings(&mut ctx)
                .iter()
                .any(|w| w.ends_with("\"migrate\": FAILURE"))
        );
    }

    #[tokio::test]
    async fn test_regular_app_is_skipped() {
        let client = Arc::new(MockPlatformClient::new());
        let mut ctx = testing::context(client.clone()).await;
        ctx.set(
            variables::APP_TO_PROCESS,
            &AppDescriptor {
                name: "web".into(),
                ..Default::default()
            },
        )
        .unwrap();
        let phase = testing::run(ExecuteAppStep, &mut ctx).await.unwrap();
        assert_eq!(phase, StepPhase::Done);
    }
}

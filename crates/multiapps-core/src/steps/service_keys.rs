// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service key maintenance.
//!
//! Keys cannot be changed in place. Changed keys are deleted and created
//! again; a key is only created once its predecessor is gone, so creation
//! waits for asynchronous deletes to finish.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use multiapps_platform::{OperationState, OperationType, PlatformClient, ServiceKey};

use crate::actions::Action;
use crate::actions::service_keys::determine_key_changes;
use crate::classifier::{Intent, Tolerance, resolve};
use crate::conflict::{ResourceKind, ResourceLock};
use crate::context::{ProcessContext, variables};
use crate::error::Result;
use crate::step::{AsyncExecution, AsyncExecutionState, Step, StepPhase, report_failure};

use super::service::DEFAULT_FAILURE_DESCRIPTION;

/// Works out which keys of `SERVICE_TO_PROCESS` to delete, create or relabel.
pub struct DetermineServiceKeysStep;

#[async_trait]
impl Step for DetermineServiceKeysStep {
    fn name(&self) -> &'static str {
        "determineServiceKeysToRecreate"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        let service = ctx.require(variables::SERVICE_TO_PROCESS)?;
        let actions = ctx.require(variables::SERVICE_ACTIONS_TO_EXECUTE)?;
        if !actions.contains(&Action::UpdateKeys) {
            ctx.set(variables::SERVICE_KEYS_TO_CREATE, &Vec::new())?;
            ctx.set(variables::SERVICE_KEYS_TO_DELETE, &Vec::new())?;
            ctx.set(variables::SERVICE_KEYS_TO_UPDATE_METADATA, &Vec::new())?;
            return Ok(StepPhase::Done);
        }

        let client = ctx.client().await?;
        let existing = match client.get_service_keys(&service.name).await {
            Ok(keys) => keys,
            Err(err) => {
                let tolerance = Tolerance::for_context(ctx, service.optional)?;
                let what = format!("Retrieving keys of service \"{}\"", service.name);
                resolve(err.into(), Intent::Read, tolerance, &what).apply(ctx.logger())?;
                Vec::new()
            }
        };

        let can_delete = ctx.require(variables::DELETE_SERVICE_KEYS)?;
        let changes = determine_key_changes(&service.name, &service.keys, &existing, can_delete);
        for warning in changes.warnings {
            ctx.logger().warn(warning);
        }
        ctx.logger().debug(format!(
            "Service keys of \"{}\": {} to create, {} to delete, {} to relabel",
            service.name,
            changes.to_create.len(),
            changes.to_delete.len(),
            changes.to_update_metadata.len()
        ));
        ctx.set(variables::SERVICE_KEYS_TO_CREATE, &changes.to_create)?;
        ctx.set(variables::SERVICE_KEYS_TO_DELETE, &changes.to_delete)?;
        ctx.set(
            variables::SERVICE_KEYS_TO_UPDATE_METADATA,
            &changes.to_update_metadata,
        )?;
        Ok(StepPhase::Done)
    }

    fn step_error_message(&self, _ctx: &ProcessContext) -> String {
        "Error while determining service keys to recreate".to_string()
    }
}

/// Applies the key changes computed by [`DetermineServiceKeysStep`].
pub struct UpdateServiceKeysStep;

#[async_trait]
impl Step for UpdateServiceKeysStep {
    fn name(&self) -> &'static str {
        "updateServiceKeys"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        if !ctx
            .require(variables::TRIGGERED_SERVICE_KEY_OPERATIONS)?
            .is_empty()
        {
            return Ok(StepPhase::Poll);
        }
        let client = ctx.client().await?;

        delete_keys(ctx, &client).await?;
        update_metadata(ctx, &client).await?;
        if ctx
            .require(variables::TRIGGERED_SERVICE_KEY_OPERATIONS)?
            .is_empty()
        {
            create_keys(ctx, &client).await?;
        }

        let pending = !ctx
            .require(variables::TRIGGERED_SERVICE_KEY_OPERATIONS)?
            .is_empty();
        Ok(if pending {
            StepPhase::Poll
        } else {
            StepPhase::Done
        })
    }

    fn step_error_message(&self, ctx: &ProcessContext) -> String {
        format!(
            "Error updating service keys of service \"{}\"",
            service_name(ctx)
        )
    }

    fn async_executions(&self) -> Vec<Arc<dyn AsyncExecution>> {
        vec![Arc::new(PollServiceKeyOperationsExecution)]
    }

    fn locked_resources(&self, ctx: &ProcessContext) -> Result<Vec<ResourceLock>> {
        let service = ctx.require(variables::SERVICE_TO_PROCESS)?;
        super::lock_in_space(ctx, ResourceKind::Service, &service.name)
    }
}

fn service_name(ctx: &ProcessContext) -> String {
    ctx.get(variables::SERVICE_TO_PROCESS)
        .ok()
        .flatten()
        .map(|s| s.name)
        .unwrap_or_default()
}

fn record(
    triggered: &mut BTreeMap<String, OperationType>,
    key: &ServiceKey,
    operation: OperationType,
    job: Option<String>,
) {
    if job.is_some() {
        triggered.insert(key.name.clone(), operation);
    }
}

async fn delete_keys(ctx: &mut ProcessContext, client: &Arc<dyn PlatformClient>) -> Result<()> {
    let service = ctx.require(variables::SERVICE_TO_PROCESS)?;
    let tolerance = Tolerance::for_context(ctx, service.optional)?;
    let mut triggered = ctx.require(variables::TRIGGERED_SERVICE_KEY_OPERATIONS)?;
    let mut remaining = ctx.require(variables::SERVICE_KEYS_TO_DELETE)?;

    while let Some(key) = remaining.first().cloned() {
        ctx.logger().info(format!(
            "Deleting service key \"{}\" of service \"{}\"",
            key.name, key.service_name
        ));
        match client.delete_service_key(&key.service_name, &key.name).await {
            Ok(job) => record(&mut triggered, &key, OperationType::Delete, job),
            Err(err) => {
                let what = format!("Deleting service key \"{}\"", key.name);
                resolve(err.into(), Intent::Delete, tolerance, &what).apply(ctx.logger())?;
            }
        }
        remaining.remove(0);
        ctx.set(variables::SERVICE_KEYS_TO_DELETE, &remaining)?;
        ctx.set(variables::TRIGGERED_SERVICE_KEY_OPERATIONS, &triggered)?;
    }
    Ok(())
}

async fn create_keys(ctx: &mut ProcessContext, client: &Arc<dyn PlatformClient>) -> Result<()> {
    let service = ctx.require(variables::SERVICE_TO_PROCESS)?;
    let tolerance = Tolerance::for_context(ctx, service.optional)?;
    let mut triggered = ctx.require(variables::TRIGGERED_SERVICE_KEY_OPERATIONS)?;
    let mut remaining = ctx.require(variables::SERVICE_KEYS_TO_CREATE)?;

    while let Some(key) = remaining.first().cloned() {
        ctx.logger().info(format!(
            "Creating service key \"{}\" of service \"{}\"",
            key.name, key.service_name
        ));
        match client.create_service_key(&key).await {
            Ok(job) => record(&mut triggered, &key, OperationType::Create, job),
            Err(err) => {
                let what = format!("Creating service key \"{}\"", key.name);
                resolve(err.into(), Intent::Create, tolerance, &what).apply(ctx.logger())?;
            }
        }
        remaining.remove(0);
        ctx.set(variables::SERVICE_KEYS_TO_CREATE, &remaining)?;
        ctx.set(variables::TRIGGERED_SERVICE_KEY_OPERATIONS, &triggered)?;
    }
    Ok(())
}

async fn update_metadata(
    ctx: &mut ProcessContext,
    client: &Arc<dyn PlatformClient>,
) -> Result<()> {
    let service = ctx.require(variables::SERVICE_TO_PROCESS)?;
    let tolerance = Tolerance::for_context(ctx, service.optional)?;
    for key in ctx.require(variables::SERVICE_KEYS_TO_UPDATE_METADATA)? {
        ctx.logger()
            .info(format!("Updating metadata of service key \"{}\"", key.name));
        if let Err(err) = client
            .update_service_key_metadata(&key.service_name, &key.name, &key.metadata)
            .await
        {
            let what = format!("Updating metadata of service key \"{}\"", key.name);
            resolve(err.into(), Intent::Update, tolerance, &what).apply(ctx.logger())?;
        }
    }
    ctx.set(variables::SERVICE_KEYS_TO_UPDATE_METADATA, &Vec::new())?;
    Ok(())
}

/// Put a key whose operation failed back into the work lists, so that a
/// retry of [`UpdateServiceKeysStep`] deletes the broken key and, for a
/// failed create, creates it again.
fn requeue(ctx: &mut ProcessContext, key: ServiceKey, operation: OperationType) -> Result<()> {
    let mut to_delete = ctx.require(variables::SERVICE_KEYS_TO_DELETE)?;
    if !to_delete.iter().any(|k| k.name == key.name) {
        to_delete.push(key.clone());
    }
    ctx.set(variables::SERVICE_KEYS_TO_DELETE, &to_delete)?;

    if operation == OperationType::Create {
        let mut to_create = ctx.require(variables::SERVICE_KEYS_TO_CREATE)?;
        if !to_create.iter().any(|k| k.name == key.name) {
            to_create.insert(
                0,
                ServiceKey {
                    guid: None,
                    last_operation: None,
                    ..key
                },
            );
        }
        ctx.set(variables::SERVICE_KEYS_TO_CREATE, &to_create)?;
    }
    Ok(())
}

/// Polls key operations started by [`UpdateServiceKeysStep`], then creates
/// the keys that waited for a delete.
pub struct PollServiceKeyOperationsExecution;

#[async_trait]
impl AsyncExecution for PollServiceKeyOperationsExecution {
    fn name(&self) -> &'static str {
        "pollServiceKeyOperations"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<AsyncExecutionState> {
        let service = ctx.require(variables::SERVICE_TO_PROCESS)?;
        let mut triggered = ctx.require(variables::TRIGGERED_SERVICE_KEY_OPERATIONS)?;
        let client = ctx.client().await?;

        let mut failed = false;
        for (key_name, operation) in triggered.clone() {
            let key = client.get_service_key(&service.name, &key_name).await?;
            let last = match (&key, operation) {
                (None, OperationType::Delete) => None,
                (None, _) => continue,
                (Some(key), _) => key.last_operation.clone(),
            };
            match last.map(|op| (op.state, op)) {
                None | Some((OperationState::Succeeded, _)) => {
                    triggered.remove(&key_name);
                }
                Some((OperationState::Failed, op)) => {
                    let message = format!(
                        "Error during {} of service key \"{}\": {}",
                        op.operation_type.as_str(),
                        key_name,
                        op.description
                            .as_deref()
                            .unwrap_or(DEFAULT_FAILURE_DESCRIPTION)
                    );
                    triggered.remove(&key_name);
                    if service.optional {
                        ctx.logger().warn(message);
                    } else {
                        if let Some(key) = key {
                            requeue(ctx, key, operation)?;
                        }
                        report_failure(ctx, message)?;
                        failed = true;
                    }
                }
                Some(_) => {}
            }
        }
        ctx.set(variables::TRIGGERED_SERVICE_KEY_OPERATIONS, &triggered)?;

        if failed {
            return Ok(AsyncExecutionState::Error);
        }
        if !triggered.is_empty() {
            return Ok(AsyncExecutionState::Running);
        }
        if ctx.require(variables::SERVICE_KEYS_TO_CREATE)?.is_empty() {
            return Ok(AsyncExecutionState::Finished);
        }
        create_keys(ctx, &client).await?;
        if ctx
            .require(variables::TRIGGERED_SERVICE_KEY_OPERATIONS)?
            .is_empty()
        {
            Ok(AsyncExecutionState::Finished)
        } else {
            Ok(AsyncExecutionState::Running)
        }
    }

    fn polling_error_message(&self, ctx: &ProcessContext) -> String {
        format!(
            "Error polling operations on service keys of service \"{}\"",
            service_name(ctx)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ServiceDescriptor, ServiceKeyDescriptor};
    use crate::step::StepRunner;
    use crate::steps::testing;
    use multiapps_platform::{LastOperation, MockPlatformClient, PlatformError, ServiceInstance};
    use serde_json::json;

    fn descriptor(keys: &[&str]) -> ServiceDescriptor {
        ServiceDescriptor {
            name: "db".into(),
            offering: Some("postgresql".into()),
            keys: keys
                .iter()
                .map(|name| ServiceKeyDescriptor {
                    name: name.to_string(),
                    parameters: [("role".to_string(), json!("ro"))].into(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn key(name: &str) -> ServiceKey {
        ServiceKey {
            name: name.into(),
            service_name: "db".into(),
            last_operation: Some(LastOperation::new(
                OperationType::Create,
                OperationState::Succeeded,
            )),
            ..Default::default()
        }
    }

    async fn setup(
        client: Arc<MockPlatformClient>,
        service: &ServiceDescriptor,
        existing: Vec<ServiceKey>,
    ) -> ProcessContext {
        client
            .insert_service(ServiceInstance {
                name: "db".into(),
                offering: Some("postgresql".into()),
                ..Default::default()
            })
            .await;
        for key in existing {
            client.insert_service_key(key).await;
        }
        let mut ctx = testing::context(client).await;
        ctx.set(variables::SERVICE_TO_PROCESS, service).unwrap();
        ctx.set(variables::SERVICE_ACTIONS_TO_EXECUTE, &vec![Action::UpdateKeys])
            .unwrap();
        ctx.set(variables::DELETE_SERVICE_KEYS, &true).unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_changed_key_is_replaced_synchronously() {
        let client = Arc::new(MockPlatformClient::new());
        let mut ctx = setup(
            client.clone(),
            &descriptor(&["reader"]),
            vec![key("reader"), key("old")],
        )
        .await;

        testing::run(DetermineServiceKeysStep, &mut ctx).await.unwrap();
        assert_eq!(ctx.require(variables::SERVICE_KEYS_TO_DELETE).unwrap().len(), 2);

        let phase = testing::run(UpdateServiceKeysStep, &mut ctx).await.unwrap();
        assert_eq!(phase, StepPhase::Done);
        let keys = client.service_keys("db").await;
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].name, "reader");
        assert_eq!(keys[0].parameters.get("role"), Some(&json!("ro")));
    }

    #[tokio::test]
    async fn test_create_waits_for_async_delete() {
        let client = Arc::new(MockPlatformClient::asynchronous());
        let mut ctx = setup(client.clone(), &descriptor(&["reader"]), vec![key("reader")]).await;
        testing::run(DetermineServiceKeysStep, &mut ctx).await.unwrap();

        let runner = StepRunner::new(Arc::new(UpdateServiceKeysStep));
        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Poll);
        assert_eq!(client.call_count("create_service_key").await, 0);

        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Poll);
        assert_eq!(client.call_count("create_service_key").await, 0);

        client.complete_service_key_operation("db", "reader").await;
        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Poll);
        assert_eq!(client.call_count("create_service_key").await, 1);

        client.complete_service_key_operation("db", "reader").await;
        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Done);
        assert!(
            ctx.require(variables::TRIGGERED_SERVICE_KEY_OPERATIONS)
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_retry_after_failed_key_create_creates_it_again() {
        let client = Arc::new(MockPlatformClient::asynchronous());
        let mut ctx = setup(client.clone(), &descriptor(&["reader"]), vec![]).await;
        testing::run(DetermineServiceKeysStep, &mut ctx).await.unwrap();

        let runner = StepRunner::new(Arc::new(UpdateServiceKeysStep));
        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Poll);
        let mut failed = client.service_keys("db").await.remove(0);
        failed.last_operation = Some(
            LastOperation::new(OperationType::Create, OperationState::Failed)
                .with_description("credentials store unavailable"),
        );
        client.insert_service_key(failed).await;

        let err = runner.run(&mut ctx).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error polling operations on service keys of service \"db\": \
             Error during create of service key \"reader\": credentials store unavailable"
        );

        // Retry: the broken key is removed first, then created again.
        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Poll);
        assert_eq!(client.call_count("delete_service_key").await, 1);
        assert_eq!(client.call_count("create_service_key").await, 1);

        client.complete_service_key_operation("db", "reader").await;
        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Poll);
        assert_eq!(client.call_count("create_service_key").await, 2);

        client.complete_service_key_operation("db", "reader").await;
        assert_eq!(runner.run(&mut ctx).await.unwrap(), StepPhase::Done);
        let keys = client.service_keys("db").await;
        assert_eq!(
            keys[0].last_operation.as_ref().map(|op| op.state),
            Some(OperationState::Succeeded)
        );
    }

    #[tokio::test]
    async fn test_optional_service_key_failure_is_tolerated() {
        let client = Arc::new(MockPlatformClient::new());
        client
            .fail_on("get_service_keys", PlatformError::unavailable("down"))
            .await;
        let service = ServiceDescriptor {
            optional: true,
            ..descriptor(&["reader"])
        };
        let mut ctx = setup(client.clone(), &service, vec![]).await;

        testing::run(DetermineServiceKeysStep, &mut ctx).await.unwrap();
        assert!(
            testing::warnings(&mut ctx)
                .iter()
                .any(|w| w.starts_with("Retrieving keys of service \"db\" failed"))
        );
        assert_eq!(ctx.require(variables::SERVICE_KEYS_TO_CREATE).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_nothing_to_do_without_update_keys_action() {
        let client = Arc::new(MockPlatformClient::new());
        let mut ctx = setup(client.clone(), &descriptor(&["reader"]), vec![]).await;
        ctx.set(variables::SERVICE_ACTIONS_TO_EXECUTE, &vec![Action::UpdateTags])
            .unwrap();

        testing::run(DetermineServiceKeysStep, &mut ctx).await.unwrap();
        assert!(ctx.require(variables::SERVICE_KEYS_TO_CREATE).unwrap().is_empty());
        assert_eq!(client.call_count("get_service_keys").await, 0);
    }
}

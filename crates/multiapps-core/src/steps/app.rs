// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Creating and updating applications.

use async_trait::async_trait;
use tracing::debug;

use crate::actions::app::{determine_app_changes, updated_application};
use crate::actions::{Action, UpdateStrategy};
use crate::conflict::{ResourceKind, ResourceLock};
use crate::context::{ProcessContext, variables};
use crate::error::Result;
use crate::model::AppDescriptor;
use crate::step::{Step, StepPhase};

/// Application attribute that merges the descriptor into the existing
/// application instead of replacing it.
pub const KEEP_EXISTING: &str = "keep-existing";

fn strategy(app: &AppDescriptor) -> UpdateStrategy {
    if app.attribute_bool(KEEP_EXISTING).unwrap_or(false) {
        UpdateStrategy::Merge
    } else {
        UpdateStrategy::Replace
    }
}

/// Creates `APP_TO_PROCESS` or updates the facets that changed, and records
/// which services must be unbound and bound afterwards.
pub struct CreateOrUpdateAppStep;

#[async_trait]
impl Step for CreateOrUpdateAppStep {
    fn name(&self) -> &'static str {
        "createOrUpdateApp"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        let app = ctx.require(variables::APP_TO_PROCESS)?;
        let client = ctx.client().await?;
        let existing = client.get_application(&app.name).await?;
        let bindings = match existing {
            Some(_) => client.get_application_bindings(&app.name).await?,
            None => Vec::new(),
        };

        let strategy = strategy(&app);
        let changes = determine_app_changes(&app, existing.as_ref(), &bindings, strategy);
        debug!(app = %app.name, ?strategy, changes = ?changes, "Determined application changes");

        let mut app_actions = Vec::new();
        let mut to_unbind = Vec::new();
        let mut to_bind = Vec::new();
        for change in changes {
            match change.action {
                Action::Unbind => to_unbind.push(change.resource),
                Action::Bind => to_bind.push(change.resource),
                action => app_actions.push(action),
            }
        }

        match &existing {
            None => {
                ctx.logger()
                    .info(format!("Creating application \"{}\"", app.name));
                client.create_application(&app.to_application()).await?;
            }
            Some(_) if app_actions.is_empty() => {
                ctx.logger()
                    .info(format!("Application \"{}\" is up to date", app.name));
            }
            Some(existing) => {
                let facets: Vec<&str> = app_actions.iter().map(Action::as_str).collect();
                ctx.logger().info(format!(
                    "Updating application \"{}\": {}",
                    app.name,
                    facets.join(", ")
                ));
                client
                    .update_application(&updated_application(&app, existing, strategy))
                    .await?;
            }
        }

        ctx.set(variables::APP_ACTIONS_TO_EXECUTE, &app_actions)?;
        ctx.set(variables::SERVICES_TO_UNBIND, &to_unbind)?;
        ctx.set(variables::SERVICES_TO_BIND, &to_bind)?;
        Ok(StepPhase::Done)
    }

    fn step_error_message(&self, ctx: &ProcessContext) -> String {
        let name = ctx
            .get(variables::APP_TO_PROCESS)
            .ok()
            .flatten()
            .map(|a| a.name)
            .unwrap_or_default();
        format!("Error creating or updating application \"{}\"", name)
    }

    fn locked_resources(&self, ctx: &ProcessContext) -> Result<Vec<ResourceLock>> {
        let app = ctx.require(variables::APP_TO_PROCESS)?;
        super::lock_in_space(ctx, ResourceKind::Application, &app.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BindingDescriptor;
    use crate::steps::testing;
    use multiapps_platform::{MockPlatformClient, ServiceBinding};
    use serde_json::json;
    use std::sync::Arc;

    fn web() -> AppDescriptor {
        AppDescriptor {
            name: "web".into(),
            memory_mb: 256,
            instances: 1,
            routes: vec!["web.example.com".into()],
            env: [("MODE".to_string(), "prod".to_string())].into(),
            bindings: vec![BindingDescriptor {
                service: "db".into(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    async fn run(client: &Arc<MockPlatformClient>, app: &AppDescriptor) -> ProcessContext {
        let mut ctx = testing::context(client.clone()).await;
        ctx.set(variables::APP_TO_PROCESS, app).unwrap();
        let phase = testing::run(CreateOrUpdateAppStep, &mut ctx).await.unwrap();
        assert_eq!(phase, StepPhase::Done);
        ctx
    }

    #[tokio::test]
    async fn test_creates_missing_app() {
        let client = Arc::new(MockPlatformClient::new());
        let ctx = run(&client, &web()).await;

        let created = client.application("web").await.unwrap();
        assert_eq!(created.memory_mb, 256);
        assert_eq!(
            ctx.require(variables::SERVICES_TO_BIND).unwrap(),
            vec!["db".to_string()]
        );
        assert_eq!(
            ctx.require(variables::APP_ACTIONS_TO_EXECUTE).unwrap(),
            vec![Action::Create]
        );
    }

    #[tokio::test]
    async fn test_unchanged_app_is_not_updated() {
        let client = Arc::new(MockPlatformClient::new());
        client.insert_application(web().to_application()).await;
        client
            .insert_binding(ServiceBinding {
                app_name: "web".into(),
                service_name: "db".into(),
                ..Default::default()
            })
            .await;

        let ctx = run(&client, &web()).await;
        assert_eq!(client.call_count("update_application").await, 0);
        assert!(ctx.require(variables::SERVICES_TO_BIND).unwrap().is_empty());
        assert!(ctx.require(variables::SERVICES_TO_UNBIND).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replaced_bindings_and_memory() {
        let client = Arc::new(MockPlatformClient::new());
        let mut existing = web().to_application();
        existing.memory_mb = 128;
        client.insert_application(existing).await;
        client
            .insert_binding(ServiceBinding {
                app_name: "web".into(),
                service_name: "cache".into(),
                ..Default::default()
            })
            .await;

        let ctx = run(&client, &web()).await;
        assert_eq!(client.application("web").await.unwrap().memory_mb, 256);
        assert_eq!(
            ctx.require(variables::APP_ACTIONS_TO_EXECUTE).unwrap(),
            vec![Action::UpdateMemory]
        );
        assert_eq!(
            ctx.require(variables::SERVICES_TO_UNBIND).unwrap(),
            vec!["cache".to_string()]
        );
        assert_eq!(
            ctx.require(variables::SERVICES_TO_BIND).unwrap(),
            vec!["db".to_string()]
        );
    }

    #[tokio::test]
    async fn test_keep_existing_merges_env() {
        let client = Arc::new(MockPlatformClient::new());
        let mut existing = web().to_application();
        existing.env.insert("EXTRA".into(), "1".into());
        existing.env.insert("MODE".into(), "dev".into());
        client.insert_application(existing).await;

        let mut app = web();
        app.bindings.clear();
        app.attributes.insert(KEEP_EXISTING.into(), json!(true));
        run(&client, &app).await;

        let updated = client.application("web").await.unwrap();
        assert_eq!(updated.env.get("MODE").map(String::as_str), Some("prod"));
        assert_eq!(updated.env.get("EXTRA").map(String::as_str), Some("1"));
    }
}

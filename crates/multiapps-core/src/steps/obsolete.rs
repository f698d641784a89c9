// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Renaming previously deployed applications and removing obsolete ones.

use async_trait::async_trait;

use crate::actions::Action;
use crate::actions::obsolete::{apply_renames, determine_obsolete_apps, determine_renames};
use crate::classifier::{Intent, Tolerance, resolve};
use crate::conflict::{ResourceKind, ResourceLock};
use crate::context::{ProcessContext, variables};
use crate::error::Result;
use crate::step::{Step, StepPhase};

fn live_name(name: &str) -> String {
    format!("{}-live", name)
}

fn push_unique(names: &mut Vec<String>, name: String) {
    if !names.contains(&name) {
        names.push(name);
    }
}

/// Plans the move of a deployed MTA onto `-live` application names when the
/// process keeps the original names after deploy.
pub struct DetectApplicationsToRenameStep;

#[async_trait]
impl Step for DetectApplicationsToRenameStep {
    fn name(&self) -> &'static str {
        "detectApplicationsToRename"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        if !ctx.require(variables::KEEP_ORIGINAL_APP_NAMES)? {
            return Ok(StepPhase::Done);
        }
        let Some(mut deployed) = ctx.get(variables::DEPLOYED_MTA)? else {
            return Ok(StepPhase::Done);
        };
        let modules = ctx.get(variables::MODULES_FOR_DEPLOYMENT)?;

        let actions = determine_renames(&deployed, modules.as_deref());
        let mut to_rename = Vec::new();
        let mut to_undeploy = ctx.require(variables::APPS_TO_UNDEPLOY)?;
        for action in &actions {
            match action.action {
                Action::Rename => to_rename.push(action.resource.clone()),
                Action::Delete => push_unique(&mut to_undeploy, action.resource.clone()),
                _ => {}
            }
        }
        if !to_rename.is_empty() {
            ctx.logger().info(format!(
                "Applications to rename: {}",
                to_rename.join(", ")
            ));
        }

        apply_renames(&mut deployed, &actions);
        ctx.set(variables::DEPLOYED_MTA, &deployed)?;
        ctx.set(variables::APPS_TO_RENAME, &to_rename)?;
        ctx.set(variables::APPS_TO_UNDEPLOY, &to_undeploy)?;
        Ok(StepPhase::Done)
    }

    fn step_error_message(&self, _ctx: &ProcessContext) -> String {
        "Error detecting applications to rename".to_string()
    }
}

/// Renames every application in `APPS_TO_RENAME` to its `-live` name,
/// deleting a colliding `-live` application first.
pub struct RenameApplicationsStep;

#[async_trait]
impl Step for RenameApplicationsStep {
    fn name(&self) -> &'static str {
        "renameApplications"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        let mut to_rename = ctx.require(variables::APPS_TO_RENAME)?;
        let mut to_undeploy = ctx.require(variables::APPS_TO_UNDEPLOY)?;
        let tolerance = Tolerance::for_context(ctx, false)?;
        let client = ctx.client().await?;

        while let Some(name) = to_rename.first().cloned() {
            let live = live_name(&name);
            if let Some(position) = to_undeploy.iter().position(|n| *n == live) {
                ctx.logger()
                    .info(format!("Deleting application \"{}\"", live));
                if let Err(err) = client.delete_application(&live).await {
                    let what = format!("Deleting application \"{}\"", live);
                    resolve(err.into(), Intent::Delete, tolerance, &what).apply(ctx.logger())?;
                }
                to_undeploy.remove(position);
                ctx.set(variables::APPS_TO_UNDEPLOY, &to_undeploy)?;
            }

            if client.get_application(&name).await?.is_some() {
                ctx.logger().info(format!(
                    "Renaming application \"{}\" to \"{}\"",
                    name, live
                ));
                client.rename_application(&name, &live).await?;
            } else {
                ctx.logger()
                    .debug(format!("Application \"{}\" is already renamed", name));
            }
            to_rename.remove(0);
            ctx.set(variables::APPS_TO_RENAME, &to_rename)?;
        }
        Ok(StepPhase::Done)
    }

    fn step_error_message(&self, _ctx: &ProcessContext) -> String {
        "Error renaming applications".to_string()
    }

    fn locked_resources(&self, ctx: &ProcessContext) -> Result<Vec<ResourceLock>> {
        let space = ctx.require(variables::SPACE)?;
        let mut locks = Vec::new();
        for name in ctx.require(variables::APPS_TO_RENAME)? {
            locks.push(ResourceLock::new(
                space.clone(),
                ResourceKind::Application,
                live_name(&name),
            ));
            locks.push(ResourceLock::new(space.clone(), ResourceKind::Application, name));
        }
        Ok(locks)
    }
}

/// Adds deployed applications that are no longer part of the deployment to
/// `APPS_TO_UNDEPLOY`.
pub struct DetectObsoleteApplicationsStep;

#[async_trait]
impl Step for DetectObsoleteApplicationsStep {
    fn name(&self) -> &'static str {
        "detectObsoleteApplications"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        let Some(deployed) = ctx.get(variables::DEPLOYED_MTA)? else {
            return Ok(StepPhase::Done);
        };
        let desired = ctx.require(variables::APPS_TO_DEPLOY)?;
        let modules = ctx.get(variables::MODULES_FOR_DEPLOYMENT)?;

        let mut to_undeploy = ctx.require(variables::APPS_TO_UNDEPLOY)?;
        for action in determine_obsolete_apps(&deployed, &desired) {
            let selected = match &modules {
                Some(modules) => deployed
                    .apps
                    .iter()
                    .find(|a| a.name == action.resource)
                    .and_then(|a| a.module_name.as_ref())
                    .is_none_or(|module| modules.contains(module)),
                None => true,
            };
            if selected {
                push_unique(&mut to_undeploy, action.resource);
            }
        }
        if !to_undeploy.is_empty() {
            ctx.logger().info(format!(
                "Applications to undeploy: {}",
                to_undeploy.join(", ")
            ));
        }
        ctx.set(variables::APPS_TO_UNDEPLOY, &to_undeploy)?;
        Ok(StepPhase::Done)
    }

    fn step_error_message(&self, _ctx: &ProcessContext) -> String {
        "Error detecting obsolete applications".to_string()
    }
}

/// Deletes every application in `APPS_TO_UNDEPLOY`. Applications that are
/// already gone count as deleted.
pub struct DeleteApplicationsStep;

#[async_trait]
impl Step for DeleteApplicationsStep {
    fn name(&self) -> &'static str {
        "deleteApplications"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        let mut to_undeploy = ctx.require(variables::APPS_TO_UNDEPLOY)?;
        if to_undeploy.is_empty() {
            return Ok(StepPhase::Done);
        }
        let tolerance = Tolerance::for_context(ctx, false)?;
        let client = ctx.client().await?;

        while let Some(name) = to_undeploy.first().cloned() {
            ctx.logger()
                .info(format!("Deleting application \"{}\"", name));
            if let Err(err) = client.delete_application(&name).await {
                let what = format!("Deleting application \"{}\"", name);
                resolve(err.into(), Intent::Delete, tolerance, &what).apply(ctx.logger())?;
            }
            to_undeploy.remove(0);
            ctx.set(variables::APPS_TO_UNDEPLOY, &to_undeploy)?;
        }
        Ok(StepPhase::Done)
    }

    fn step_error_message(&self, _ctx: &ProcessContext) -> String {
        "Error deleting applications".to_string()
    }

    fn locked_resources(&self, ctx: &ProcessContext) -> Result<Vec<ResourceLock>> {
        let space = ctx.require(variables::SPACE)?;
        Ok(ctx
            .require(variables::APPS_TO_UNDEPLOY)?
            .into_iter()
            .map(|name| ResourceLock::new(space.clone(), ResourceKind::Application, name))
            .collect())
    }
}

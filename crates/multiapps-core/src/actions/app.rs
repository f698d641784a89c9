// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Application actions.
//!
//! One action is emitted per changed facet of an existing application.
//! Service bindings are diffed by [`super::bindings`] and appended as
//! unbind/bind pairs.

use multiapps_platform::{Application, ServiceBinding, Staging};

use super::bindings::determine_binding_changes;
use super::{Action, ResourceAction, UpdateStrategy, order_actions};
use crate::model::AppDescriptor;

/// Facet actions needed to bring `existing` in line with `desired`.
///
/// Under [`UpdateStrategy::Merge`] routes and environment entries that exist
/// only on the platform are kept and do not count as a difference.
pub fn determine_app_actions(
    desired: &AppDescriptor,
    existing: &Application,
    strategy: UpdateStrategy,
) -> Vec<Action> {
    let mut actions = Vec::new();

    if staging_changed(&desired.staging, &existing.staging, strategy) {
        actions.push(Action::UpdateStaging);
    }
    if desired.memory_mb != 0 && desired.memory_mb != existing.memory_mb {
        actions.push(Action::UpdateMemory);
    }
    if desired.disk_quota_mb != 0 && desired.disk_quota_mb != existing.disk_quota_mb {
        actions.push(Action::UpdateDiskQuota);
    }
    if routes_changed(&desired.routes, &existing.routes, strategy) {
        actions.push(Action::UpdateRoutes);
    }
    let env_changed = match strategy {
        UpdateStrategy::Replace => desired.env != existing.env,
        UpdateStrategy::Merge => desired
            .env
            .iter()
            .any(|(k, v)| existing.env.get(k) != Some(v)),
    };
    if env_changed {
        actions.push(Action::UpdateEnv);
    }
    if desired.instances != existing.instances {
        actions.push(Action::UpdateInstances);
    }
    if desired.docker.is_some() && desired.docker != existing.docker {
        actions.push(Action::UpdateDocker);
    }
    if desired.metadata != existing.metadata {
        actions.push(Action::UpdateMetadata);
    }

    actions
}

/// All actions for one application: facet updates on the application
/// itself followed by binding changes, removals first.
pub fn determine_app_changes(
    desired: &AppDescriptor,
    existing: Option<&Application>,
    bindings: &[ServiceBinding],
    strategy: UpdateStrategy,
) -> Vec<ResourceAction> {
    let mut actions = match existing {
        None => vec![ResourceAction::new(Action::Create, &desired.name)],
        Some(existing) => determine_app_actions(desired, existing, strategy)
            .into_iter()
            .map(|action| ResourceAction::new(action, &desired.name))
            .collect(),
    };
    actions.extend(determine_binding_changes(desired, bindings));
    order_actions(&mut actions);
    actions
}

/// The application to send to the platform when updating `existing`.
pub fn updated_application(
    desired: &AppDescriptor,
    existing: &Application,
    strategy: UpdateStrategy,
) -> Application {
    let mut app = desired.to_application();
    app.guid = existing.guid.clone();
    app.state = existing.state;
    if desired.memory_mb == 0 {
        app.memory_mb = existing.memory_mb;
    }
    if desired.disk_quota_mb == 0 {
        app.disk_quota_mb = existing.disk_quota_mb;
    }
    if desired.docker.is_none() {
        app.docker = existing.docker.clone();
    }

    if strategy == UpdateStrategy::Merge {
        let mut routes = existing.routes.clone();
        for route in &desired.routes {
            if !routes.contains(route) {
                routes.push(route.clone());
            }
        }
        app.routes = routes;

        let mut env = existing.env.clone();
        env.extend(desired.env.clone());
        app.env = env;

        app.staging = merge_staging(&desired.staging, &existing.staging);
    }
    app
}

fn routes_changed(desired: &[String], existing: &[String], strategy: UpdateStrategy) -> bool {
    let missing = desired.iter().any(|r| !existing.contains(r));
    match strategy {
        UpdateStrategy::Replace => missing || existing.iter().any(|r| !desired.contains(r)),
        UpdateStrategy::Merge => missing,
    }
}

fn staging_changed(desired: &Staging, existing: &Staging, strategy: UpdateStrategy) -> bool {
    match strategy {
        UpdateStrategy::Replace => desired != existing,
        UpdateStrategy::Merge => merge_staging(desired, existing) != *existing,
    }
}

fn merge_staging(desired: &Staging, existing: &Staging) -> Staging {
    Staging {
        buildpacks: if desired.buildpacks.is_empty() {
            existing.buildpacks.clone()
        } else {
            desired.buildpacks.clone()
        },
        stack: desired.stack.clone().or_else(|| existing.stack.clone()),
        command: desired.command.clone().or_else(|| existing.command.clone()),
        health_check_type: desired
            .health_check_type
            .clone()
            .or_else(|| existing.health_check_type.clone()),
        health_check_endpoint: desired
            .health_check_endpoint
            .clone()
            .or_else(|| existing.health_check_endpoint.clone()),
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Renamed and obsolete applications across redeploys.

use super::{Action, ResourceAction, order_actions};
use crate::model::{AppDescriptor, DeployedApp, DeployedMta};

/// Suffixes that blue-green deployments append to application names.
pub const COLOR_SUFFIXES: [&str; 4] = ["-blue", "-green", "-idle", "-live"];

const LIVE_SUFFIX: &str = "-live";
const IDLE_SUFFIX: &str = "-idle";

/// Name without a blue-green suffix.
pub fn strip_color_suffix(name: &str) -> &str {
    COLOR_SUFFIXES
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix))
        .filter(|base| !base.is_empty())
        .unwrap_or(name)
}

fn is_selected(app: &DeployedApp, modules: Option<&[String]>) -> bool {
    match (modules, &app.module_name) {
        (Some(modules), Some(module)) => modules.contains(module),
        _ => true,
    }
}

/// Renames that move a deployed MTA onto `-live` names.
///
/// Every deployed application without a live/idle suffix is renamed to
/// `<name>-live`. When a `<name>-live` application already exists it is
/// deleted first, so the rename never collides with it. Applications of
/// modules outside `modules` are left alone.
pub fn determine_renames(deployed: &DeployedMta, modules: Option<&[String]>) -> Vec<ResourceAction> {
    let mut actions = Vec::new();
    for app in &deployed.apps {
        if app.name.ends_with(LIVE_SUFFIX) || app.name.ends_with(IDLE_SUFFIX) {
            continue;
        }
        if !is_selected(app, modules) {
            continue;
        }
        let live = format!("{}{LIVE_SUFFIX}", app.name);
        if deployed.apps.iter().any(|a| a.name == live) {
            actions.push(ResourceAction::new(Action::Delete, &live));
        }
        actions.push(ResourceAction::rename(&app.name, live));
    }
    order_actions(&mut actions);
    actions
}

/// Apply renames to the recorded deployed MTA, dropping deleted applications.
pub fn apply_renames(deployed: &mut DeployedMta, actions: &[ResourceAction]) {
    for action in actions {
        match action.action {
            Action::Delete => deployed.apps.retain(|a| a.name != action.resource),
            Action::Rename => {
                if let (Some(app), Some(target)) = (
                    deployed.apps.iter_mut().find(|a| a.name == action.resource),
                    &action.target,
                ) {
                    app.name = target.clone();
                }
            }
            _ => {}
        }
    }
}

/// Deployed applications that are no longer part of the deployment.
///
/// An application is kept when a desired application has the same name
/// after dropping blue-green suffixes, or is built from the same module.
pub fn determine_obsolete_apps(
    deployed: &DeployedMta,
    desired: &[AppDescriptor],
) -> Vec<ResourceAction> {
    deployed
        .apps
        .iter()
        .filter(|app| {
            let base = strip_color_suffix(&app.name);
            !desired.iter().any(|d| {
                strip_color_suffix(&d.name) == base
                    || (app.module_name.is_some() && d.module_name == app.module_name)
            })
        })
        .map(|app| ResourceAction::new(Action::Delete, &app.name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployed(names: &[&str]) -> DeployedMta {
        DeployedMta {
            id: "shop".into(),
            version: Some("1.0.0".into()),
            apps: names
                .iter()
                .map(|n| DeployedApp {
                    name: n.to_string(),
                    module_name: Some(format!("{n}_module")),
                    services: Vec::new(),
                })
                .collect(),
            services: Vec::new(),
        }
    }

    fn summary(actions: &[ResourceAction]) -> Vec<(Action, &str, Option<&str>)> {
        actions
            .iter()
            .map(|a| (a.action, a.resource.as_str(), a.target.as_deref()))
            .collect()
    }

    #[test]
    fn test_strip_color_suffix() {
        assert_eq!(strip_color_suffix("web-blue"), "web");
        assert_eq!(strip_color_suffix("web-green"), "web");
        assert_eq!(strip_color_suffix("web-idle"), "web");
        assert_eq!(strip_color_suffix("web-live"), "web");
        assert_eq!(strip_color_suffix("web"), "web");
        assert_eq!(strip_color_suffix("-live"), "-live");
    }

    #[test]
    fn test_plain_names_are_renamed_to_live() {
        let actions = determine_renames(&deployed(&["a", "b"]), None);
        assert_eq!(
            summary(&actions),
            vec![
                (Action::Rename, "a", Some("a-live")),
                (Action::Rename, "b", Some("b-live"))
            ]
        );
    }

    #[test]
    fn test_suffixed_names_are_not_renamed() {
        for names in [["a-live", "b-live"], ["a-idle", "b-idle"], ["a-live", "b-idle"]] {
            assert!(determine_renames(&deployed(&names), None).is_empty());
        }
    }

    #[test]
    fn test_existing_live_app_is_deleted_before_rename() {
        let mut mta = deployed(&["a-live", "a"]);
        let actions = determine_renames(&mta, None);
        assert_eq!(
            summary(&actions),
            vec![
                (Action::Delete, "a-live", None),
                (Action::Rename, "a", Some("a-live"))
            ]
        );

        apply_renames(&mut mta, &actions);
        let names: Vec<_> = mta.apps.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["a-live"]);
    }

    #[test]
    fn test_idle_app_is_kept_when_renaming() {
        let mut mta = deployed(&["a-idle", "a"]);
        let actions = determine_renames(&mta, None);
        assert_eq!(summary(&actions), vec![(Action::Rename, "a", Some("a-live"))]);

        apply_renames(&mut mta, &actions);
        let names: Vec<_> = mta.apps.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["a-idle", "a-live"]);
    }

    #[test]
    fn test_partial_deploy_skips_unselected_modules() {
        let modules = vec!["a_module".to_string(), "c_module".to_string()];
        let actions = determine_renames(&deployed(&["a", "b", "c"]), Some(&modules));
        let renamed: Vec<_> = actions.iter().map(|a| a.resource.as_str()).collect();
        assert_eq!(renamed, vec!["a", "c"]);
    }

    #[test]
    fn test_obsolete_apps_ignore_color_suffix() {
        let desired = vec![AppDescriptor {
            name: "a-green".into(),
            ..Default::default()
        }];
        let actions = determine_obsolete_apps(&deployed(&["a-blue", "b"]), &desired);
        assert_eq!(summary(&actions), vec![(Action::Delete, "b", None)]);
    }

    #[test]
    fn test_same_module_is_not_obsolete() {
        let desired = vec![AppDescriptor {
            name: "renamed".into(),
            module_name: Some("b_module".into()),
            ..Default::default()
        }];
        let actions = determine_obsolete_apps(&deployed(&["b"]), &desired);
        assert!(actions.is_empty());
    }
}

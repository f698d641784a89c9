// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Action determination.
//!
//! Pure functions that compare a desired descriptor with the observed
//! platform state and return the actions needed to reconcile them. Nothing
//! in this module performs I/O. When an action cannot be determined the
//! reason comes back as a [`CoreError`](crate::error::CoreError).

pub mod app;
pub mod bindings;
pub mod obsolete;
pub mod service;
pub mod service_keys;

use serde::{Deserialize, Serialize};

/// A reconciliation decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Create the resource.
    Create,
    /// Delete and create the resource again.
    Recreate,
    /// Change the service plan.
    UpdatePlan,
    /// Replace service tags.
    UpdateTags,
    /// Replace service parameters or credentials.
    UpdateCredentials,
    /// Reconcile the service keys.
    UpdateKeys,
    /// Replace the syslog drain URL of a user-provided service.
    UpdateSyslogUrl,
    /// Replace labels and annotations.
    UpdateMetadata,
    /// Remove labels and annotations.
    DeleteMetadata,
    /// Change staging (buildpacks, stack, command, health check).
    UpdateStaging,
    /// Change memory.
    UpdateMemory,
    /// Change disk quota.
    UpdateDiskQuota,
    /// Change routes.
    UpdateRoutes,
    /// Change the environment.
    UpdateEnv,
    /// Change the instance count.
    UpdateInstances,
    /// Change the docker image or its credentials.
    UpdateDocker,
    /// Bind a service.
    Bind,
    /// Unbind a service.
    Unbind,
    /// Delete the resource.
    Delete,
    /// Rename the resource.
    Rename,
}

impl Action {
    /// Returns the string representation of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Recreate => "RECREATE",
            Self::UpdatePlan => "UPDATE_PLAN",
            Self::UpdateTags => "UPDATE_TAGS",
            Self::UpdateCredentials => "UPDATE_CREDENTIALS",
            Self::UpdateKeys => "UPDATE_KEYS",
            Self::UpdateSyslogUrl => "UPDATE_SYSLOG_URL",
            Self::UpdateMetadata => "UPDATE_METADATA",
            Self::DeleteMetadata => "DELETE_METADATA",
            Self::UpdateStaging => "UPDATE_STAGING",
            Self::UpdateMemory => "UPDATE_MEMORY",
            Self::UpdateDiskQuota => "UPDATE_DISK_QUOTA",
            Self::UpdateRoutes => "UPDATE_ROUTES",
            Self::UpdateEnv => "UPDATE_ENV",
            Self::UpdateInstances => "UPDATE_INSTANCES",
            Self::UpdateDocker => "UPDATE_DOCKER",
            Self::Bind => "BIND",
            Self::Unbind => "UNBIND",
            Self::Delete => "DELETE",
            Self::Rename => "RENAME",
        }
    }

    /// Whether the action removes something from the platform.
    pub fn is_removal(&self) -> bool {
        matches!(self, Self::Delete | Self::Unbind | Self::DeleteMetadata)
    }

    fn order(&self) -> u8 {
        match self {
            a if a.is_removal() => 0,
            Self::Rename => 1,
            _ => 2,
        }
    }
}

/// An action on a named resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAction {
    /// What to do.
    pub action: Action,
    /// Resource the action applies to.
    pub resource: String,
    /// New name, for renames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl ResourceAction {
    /// Create an action on `resource`.
    pub fn new(action: Action, resource: impl Into<String>) -> Self {
        Self {
            action,
            resource: resource.into(),
            target: None,
        }
    }

    /// Rename `resource` to `target`.
    pub fn rename(resource: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            action: Action::Rename,
            resource: resource.into(),
            target: Some(target.into()),
        }
    }
}

/// Put removals before renames and renames before everything else.
///
/// The sort is stable, so actions of the same class keep their relative
/// order. A replacement that reuses a name is thus never created before the
/// resource holding that name is gone.
pub fn order_actions(actions: &mut [ResourceAction]) {
    actions.sort_by_key(|a| a.action.order());
}

/// How collection-valued attributes of an existing resource are reconciled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateStrategy {
    /// The desired value replaces the existing one.
    #[default]
    Replace,
    /// Existing entries absent from the desired value are kept.
    Merge,
}

/// Actions plus non-fatal findings of a determination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Determination<A> {
    /// Actions to execute, in order.
    pub actions: Vec<A>,
    /// Warnings to show to the operator.
    pub warnings: Vec<String>,
}

impl<A> Determination<A> {
    /// A determination without actions or warnings.
    pub fn empty() -> Self {
        Self {
            actions: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub(crate) fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removals_come_first() {
        let mut actions = vec![
            ResourceAction::new(Action::Create, "key-b"),
            ResourceAction::new(Action::Bind, "db"),
            ResourceAction::rename("web", "web-live"),
            ResourceAction::new(Action::Delete, "key-a"),
            ResourceAction::new(Action::Unbind, "cache"),
        ];
        order_actions(&mut actions);

        let order: Vec<(Action, &str)> = actions
            .iter()
            .map(|a| (a.action, a.resource.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                (Action::Delete, "key-a"),
                (Action::Unbind, "cache"),
                (Action::Rename, "web"),
                (Action::Create, "key-b"),
                (Action::Bind, "db"),
            ]
        );
    }

    #[test]
    fn test_action_serializes_in_screaming_case() {
        assert_eq!(
            serde_json::to_string(&Action::UpdateSyslogUrl).unwrap(),
            "\"UPDATE_SYSLOG_URL\""
        );
        let rename = serde_json::to_value(ResourceAction::rename("a", "b")).unwrap();
        assert_eq!(rename["target"], "b");
        let create = serde_json::to_value(ResourceAction::new(Action::Create, "a")).unwrap();
        assert!(create.get("target").is_none());
    }
}

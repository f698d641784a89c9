// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service key actions.
//!
//! Keys are immutable on the platform. A key whose parameters changed, or
//! whose last operation did not succeed, is replaced by deleting and creating
//! it again.

use multiapps_platform::{OperationState, ServiceKey};

use crate::model::ServiceKeyDescriptor;

/// Keys to delete, create and relabel for one service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyChanges {
    /// Keys to create.
    pub to_create: Vec<ServiceKey>,
    /// Keys to delete. Applied before `to_create`.
    pub to_delete: Vec<ServiceKey>,
    /// Keys whose only difference is metadata.
    pub to_update_metadata: Vec<ServiceKey>,
    /// Non-fatal findings.
    pub warnings: Vec<String>,
}

impl KeyChanges {
    /// Whether nothing needs to change.
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_delete.is_empty() && self.to_update_metadata.is_empty()
    }
}

/// Compare the desired keys of `service_name` with the existing ones.
///
/// Without `can_delete`, keys that would have to be deleted are reported as
/// warnings instead.
pub fn determine_key_changes(
    service_name: &str,
    desired: &[ServiceKeyDescriptor],
    existing: &[ServiceKey],
    can_delete: bool,
) -> KeyChanges {
    let mut changes = KeyChanges::default();

    for wanted in desired {
        let key = wanted.to_key(service_name);
        let Some(current) = existing.iter().find(|k| k.name == wanted.name) else {
            changes.to_create.push(key);
            continue;
        };

        if needs_recreation(&key, current) {
            if can_delete {
                changes.to_delete.push(current.clone());
                changes.to_create.push(key);
            } else {
                changes.warnings.push(format!(
                    "Service key \"{}\" of service \"{}\" has changed but cannot be updated because key deletion is not enabled",
                    wanted.name, service_name
                ));
            }
        } else if key.metadata != current.metadata {
            changes.to_update_metadata.push(key);
        }
    }

    for current in existing {
        if desired.iter().any(|k| k.name == current.name) {
            continue;
        }
        if can_delete {
            changes.to_delete.push(current.clone());
        } else {
            changes.warnings.push(format!(
                "Service key \"{}\" of service \"{}\" is no longer part of the deployment but will not be deleted because key deletion is not enabled",
                current.name, service_name
            ));
        }
    }

    changes
}

fn needs_recreation(wanted: &ServiceKey, current: &ServiceKey) -> bool {
    let settled = current
        .last_operation
        .as_ref()
        .is_none_or(|op| op.state == OperationState::Succeeded);
    !settled || wanted.parameters != current.parameters
}

#[cfg(test)]
mod tests {
    use super::*;
    use multiapps_platform::{LastOperation, Metadata, OperationType};
    use serde_json::json;

    fn descriptor(name: &str) -> ServiceKeyDescriptor {
        ServiceKeyDescriptor {
            name: name.into(),
            ..Default::default()
        }
    }

    fn existing(name: &str, state: OperationState) -> ServiceKey {
        ServiceKey {
            guid: Some(format!("{name}-guid")),
            name: name.into(),
            service_name: "db".into(),
            last_operation: Some(LastOperation::new(OperationType::Create, state)),
            ..Default::default()
        }
    }

    fn names(keys: &[ServiceKey]) -> Vec<&str> {
        keys.iter().map(|k| k.name.as_str()).collect()
    }

    #[test]
    fn test_new_key_is_created() {
        let changes = determine_key_changes("db", &[descriptor("reader")], &[], false);
        assert_eq!(names(&changes.to_create), vec!["reader"]);
        assert_eq!(changes.to_create[0].service_name, "db");
        assert!(changes.to_delete.is_empty());
    }

    #[test]
    fn test_changed_parameters_recreate_the_key() {
        let mut wanted = descriptor("reader");
        wanted.parameters.insert("role".into(), json!("ro"));
        let current = existing("reader", OperationState::Succeeded);

        let changes = determine_key_changes("db", &[wanted.clone()], &[current.clone()], true);
        assert_eq!(names(&changes.to_delete), vec!["reader"]);
        assert_eq!(names(&changes.to_create), vec!["reader"]);

        let changes = determine_key_changes("db", &[wanted], &[current], false);
        assert!(changes.is_empty());
        assert_eq!(changes.warnings.len(), 1);
    }

    #[test]
    fn test_unsettled_key_is_recreated() {
        let current = existing("reader", OperationState::InProgress);
        let changes = determine_key_changes("db", &[descriptor("reader")], &[current], true);
        assert_eq!(names(&changes.to_delete), vec!["reader"]);
        assert_eq!(names(&changes.to_create), vec!["reader"]);
    }

    #[test]
    fn test_metadata_only_difference() {
        let mut wanted = descriptor("reader");
        wanted.metadata = Metadata::default().with_annotation("mta_version", "2.0.0");
        let current = existing("reader", OperationState::Succeeded);

        let changes = determine_key_changes("db", &[wanted], &[current], true);
        assert!(changes.to_create.is_empty());
        assert!(changes.to_delete.is_empty());
        assert_eq!(names(&changes.to_update_metadata), vec!["reader"]);
    }

    #[test]
    fn test_obsolete_key_deletion_needs_permission() {
        let obsolete = existing("old", OperationState::Succeeded);

        let changes = determine_key_changes("db", &[], &[obsolete.clone()], true);
        assert_eq!(names(&changes.to_delete), vec!["old"]);

        let changes = determine_key_changes("db", &[], &[obsolete], false);
        assert!(changes.to_delete.is_empty());
        assert!(changes.warnings[0].contains("will not be deleted"));
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service instance actions.

use multiapps_platform::{OperationState, OperationType, ServiceInstance};

use super::{Action, Determination};
use crate::error::{CoreError, Result};
use crate::model::{ServiceDescriptor, service_type};

/// Process flags that widen what the determiner may do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceFlags {
    /// Services may be deleted in order to recreate them.
    pub delete_services: bool,
    /// Service keys absent from the descriptor may be deleted.
    pub delete_service_keys: bool,
}

/// Decide what to do with one service instance.
///
/// `existing` is the instance currently on the platform, if any. A
/// [`Action::Recreate`] is returned alone; the caller deletes and creates the
/// service and nothing else applies.
pub fn determine_service_actions(
    desired: &ServiceDescriptor,
    existing: Option<&ServiceInstance>,
    flags: ServiceFlags,
) -> Result<Determination<Action>> {
    let mut result = Determination::empty();

    if !desired.user_provided
        && (!desired.keys.is_empty() || (existing.is_some() && flags.delete_service_keys))
    {
        result.actions.push(Action::UpdateKeys);
    }

    let Some(existing) = existing else {
        result.actions.push(Action::Create);
        return Ok(result);
    };

    if has_different_type(desired, existing) {
        if flags.delete_services {
            result.actions = vec![Action::Recreate];
            return Ok(result);
        }
        return Err(CoreError::content(format!(
            "Service \"{}\" of resource \"{}\" should be of type \"{}\" but an existing service \"{}\" is of type \"{}\"; \
             enable service deletion to recreate it",
            desired.name,
            desired.resource_name(),
            desired.service_type(),
            existing.name,
            service_type(
                existing.user_provided,
                existing.offering.as_deref(),
                existing.plan.as_deref()
            ),
        )));
    }

    if let Some(operation) = failed_lifecycle_operation(existing) {
        if flags.delete_services {
            result.actions = vec![Action::Recreate];
            return Ok(result);
        }
        result.warn(format!(
            "Service \"{}\" may not be operational: its last {} operation failed",
            existing.name,
            operation.as_str()
        ));
    }

    if !desired.user_provided && desired.plan.is_some() && desired.plan != existing.plan {
        result.actions.push(Action::UpdatePlan);
    }

    if desired.skip_parameters_update {
        result.warn(format!(
            "Parameters of service \"{}\" are not updated as requested",
            desired.name
        ));
    } else if desired.parameters.is_empty() {
        result.warn(format!(
            "No parameters specified for service \"{}\"; existing parameters are kept",
            desired.name
        ));
    } else {
        // Parameters of a managed service cannot be read back, so there is
        // nothing to diff against.
        result.actions.push(Action::UpdateCredentials);
    }

    if desired.tags != existing.tags {
        result.actions.push(Action::UpdateTags);
    }

    if desired.user_provided
        && desired.syslog_drain_url.as_deref().unwrap_or("")
            != existing.syslog_drain_url.as_deref().unwrap_or("")
    {
        result.actions.push(Action::UpdateSyslogUrl);
    }

    if desired.metadata != existing.metadata {
        result.actions.push(Action::UpdateMetadata);
    }

    Ok(result)
}

fn has_different_type(desired: &ServiceDescriptor, existing: &ServiceInstance) -> bool {
    if desired.user_provided != existing.user_provided {
        return true;
    }
    !existing.user_provided && desired.offering != existing.offering
}

fn failed_lifecycle_operation(existing: &ServiceInstance) -> Option<OperationType> {
    let operation = existing.last_operation.as_ref()?;
    let lifecycle = matches!(
        operation.operation_type,
        OperationType::Create | OperationType::Delete
    );
    (lifecycle && operation.state == OperationState::Failed).then_some(operation.operation_type)
}

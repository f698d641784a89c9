// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service binding actions.
//!
//! A binding cannot be updated in place: different binding parameters
//! always result in an unbind followed by a bind.

use multiapps_platform::{Parameters, ServiceBinding};

use super::{Action, ResourceAction, order_actions};
use crate::model::AppDescriptor;

/// Application attribute that keeps bindings the descriptor no longer declares.
pub const KEEP_EXISTING_BINDINGS: &str = "keep-existing-bindings";

/// What to do with the binding between one application and one service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindingDecision {
    /// Remove the existing binding.
    pub unbind: bool,
    /// Create a binding.
    pub bind: bool,
    /// Parameters of the binding to create.
    pub parameters: Parameters,
}

impl BindingDecision {
    fn unbind() -> Self {
        Self {
            unbind: true,
            ..Default::default()
        }
    }
}

fn keeps_all_bindings(app: &AppDescriptor) -> bool {
    app.attribute_bool(KEEP_EXISTING_BINDINGS).unwrap_or(false)
}

/// Decide the binding of `service` to `app`.
///
/// `recreate` forces an unbind and bind of an existing binding even if the
/// parameters are unchanged.
pub fn determine_binding(
    app: &AppDescriptor,
    service: &str,
    existing: Option<&ServiceBinding>,
    recreate: bool,
) -> BindingDecision {
    let keep_all = keeps_all_bindings(app);
    let Some(desired) = app.binding(service) else {
        if existing.is_some() && !keep_all {
            return BindingDecision::unbind();
        }
        return BindingDecision::default();
    };

    let bind = BindingDecision {
        unbind: false,
        bind: true,
        parameters: desired.parameters.clone(),
    };
    let Some(existing) = existing else {
        return bind;
    };
    if desired.keep_existing || keep_all {
        return BindingDecision::default();
    }
    if recreate || desired.parameters != existing.parameters {
        return BindingDecision {
            unbind: true,
            ..bind
        };
    }
    BindingDecision::default()
}

/// Bind and unbind actions that bring the bindings of `app` in line with
/// its descriptor. Unbinds come first.
pub fn determine_binding_changes(
    app: &AppDescriptor,
    existing: &[ServiceBinding],
) -> Vec<ResourceAction> {
    let mut services: Vec<&str> = app.bindings.iter().map(|b| b.service.as_str()).collect();
    for binding in existing {
        if !services.contains(&binding.service_name.as_str()) {
            services.push(&binding.service_name);
        }
    }

    let mut actions = Vec::new();
    for service in services {
        let current = existing.iter().find(|b| b.service_name == service);
        let decision = determine_binding(app, service, current, false);
        if decision.unbind {
            actions.push(ResourceAction::new(Action::Unbind, service));
        }
        if decision.bind {
            actions.push(ResourceAction::new(Action::Bind, service));
        }
    }
    order_actions(&mut actions);
    actions
}

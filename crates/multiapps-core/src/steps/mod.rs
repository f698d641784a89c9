// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Concrete deployment steps.
//!
//! Each step reads its descriptor from the process context, compares it with
//! a fresh snapshot from the platform and issues the remote calls the action
//! determiners ask for. Operations that finish asynchronously are recorded in
//! the context and followed up by the step's async executions.

pub mod app;
pub mod bindings;
pub mod broker;
pub mod check_in_progress;
pub mod configuration;
pub mod execute_app;
pub mod incremental;
pub mod obsolete;
pub mod service;
pub mod service_keys;
pub mod stage;
pub mod start;
pub mod version;

use crate::conflict::{ResourceKind, ResourceLock};
use crate::context::{ProcessContext, variables};
use crate::error::Result;

/// Lock on one named resource in the process's space.
pub(crate) fn lock_in_space(
    ctx: &ProcessContext,
    kind: ResourceKind,
    name: &str,
) -> Result<Vec<ResourceLock>> {
    let space = ctx.require(variables::SPACE)?;
    Ok(vec![ResourceLock::new(space, kind, name)])
}

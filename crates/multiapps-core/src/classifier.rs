// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error classification at remote-call boundaries.
//!
//! Steps never decide on their own whether a failed platform call is fatal.
//! They hand the error to [`resolve`] together with what they were trying to
//! do and how tolerant the resource is, and act on the [`Resolution`].
//!
//! | Kind       | Delete intent | Optional | Fail-safe | Otherwise |
//! |------------|---------------|----------|-----------|-----------|
//! | NotFound   | done          | warn     | fail      | fail      |
//! | Permission | fail          | warn     | warn      | fail      |
//! | Platform   | fail          | warn     | fail      | fail      |
//! | Content    | fail          | fail     | fail      | fail      |
//!
//! Internal errors (persistence, aborts, lock conflicts) always fail.

use crate::context::ProcessContext;
use crate::error::{CoreError, ErrorKind, Result};
use crate::step::StepLogger;

/// What the failed call was meant to achieve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Bring a resource into existence.
    Create,
    /// Change an existing resource.
    Update,
    /// Remove a resource. A missing resource counts as done.
    Delete,
    /// Look a resource up.
    Read,
}

/// Flags that turn a fatal error into a warning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tolerance {
    /// The resource is optional.
    pub optional: bool,
    /// The process tolerates missing permissions.
    pub fail_safe: bool,
}

impl Tolerance {
    /// No tolerance at all.
    pub fn strict() -> Self {
        Self::default()
    }

    /// Tolerance of a resource in the given process.
    pub fn for_context(ctx: &ProcessContext, optional: bool) -> Result<Self> {
        Ok(Self {
            optional,
            fail_safe: ctx.fail_safe()?,
        })
    }
}

/// Outcome of classifying a failed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The resource is already in the state the call wanted.
    AlreadyDone,
    /// The failure is tolerated; the message is shown as a warning.
    Tolerated(String),
    /// The failure is fatal.
    Fail(CoreError),
}

impl Resolution {
    /// Whether the caller should carry on.
    pub fn is_tolerated(&self) -> bool {
        !matches!(self, Self::Fail(_))
    }

    /// Log a tolerated failure, or return the fatal one.
    pub fn apply(self, logger: &mut StepLogger) -> Result<()> {
        match self {
            Self::AlreadyDone => Ok(()),
            Self::Tolerated(message) => {
                logger.warn(message);
                Ok(())
            }
            Self::Fail(err) => Err(err),
        }
    }
}

/// Decide what a failed remote call means.
///
/// `what` describes the attempted operation (for example
/// `Creating service "db"`) and prefixes the warning of a tolerated failure.
pub fn resolve(err: CoreError, intent: Intent, tolerance: Tolerance, what: &str) -> Resolution {
    let tolerated = |err: &CoreError| Resolution::Tolerated(format!("{} failed: {}", what, err));
    match err.kind() {
        ErrorKind::NotFound if intent == Intent::Delete => Resolution::AlreadyDone,
        ErrorKind::ContentError | ErrorKind::InternalError => Resolution::Fail(err),
        ErrorKind::PermissionError if tolerance.optional || tolerance.fail_safe => tolerated(&err),
        ErrorKind::NotFound | ErrorKind::PlatformError if tolerance.optional => tolerated(&err),
        _ => Resolution::Fail(err),
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Multiapps Platform - Remote Resource Boundary
//!
//! This crate describes everything the deployment process core needs from the
//! cloud platform, and nothing more:
//!
//! - Observed-state models for applications, service instances, keys,
//!   bindings, brokers, instances, logs and jobs
//! - [`PlatformClient`], the async trait steps call at every remote boundary
//! - [`ClientFactory`], which authenticates a client per (user, org, space)
//! - [`PlatformError`], carrying the HTTP status the error classifier keys on
//! - [`MockPlatformClient`], an in-memory implementation for tests
//!
//! # Operation model
//!
//! ```text
//!   step ──create/update/delete──▶ platform ──▶ Option<JobId>
//!     │                                │
//!     │                                ▼
//!     └──poll get_* / get_job ◀── LastOperation { type, state, description }
//! ```
//!
//! | State          | Meaning                                   |
//! |----------------|-------------------------------------------|
//! | `initial`      | Accepted, not started                     |
//! | `in progress`  | Running                                   |
//! | `succeeded`    | Finished successfully                     |
//! | `failed`       | Finished with an error, see `description` |

#![deny(missing_docs)]

/// Platform client traits and the target triple.
pub mod client;
/// Platform error type.
pub mod error;
/// In-memory mock platform.
pub mod mock;
/// Observed-state resource models.
pub mod model;

pub use client::{ClientFactory, CloudTarget, PlatformClient};
pub use error::{PlatformError, Result};
pub use mock::{MockClientFactory, MockPlatformClient};
pub use model::*;

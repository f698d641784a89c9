// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Multiapps Core - Deployment Process Core
//!
//! This crate drives the deployment of multi-target applications (MTAs) onto
//! a cloud platform. A deployment is a sequence of resumable steps. Each step
//! compares a desired descriptor with a fresh snapshot of the platform,
//! issues the minimal set of remote calls and, when those calls finish
//! asynchronously, polls them on later invocations until they are terminal.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Workflow scheduler                                │
//! │            (invokes one step at a time, retries on error)                │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌───────────────────────┐   ┌───────────────────────┐   ┌────────────────┐
//! │      StepRunner       │──▶│   Step / Async exec   │──▶│ Action         │
//! │ phases, locks, abort  │   │   (steps::*)          │   │ determination  │
//! └───────────────────────┘   └───────────────────────┘   │ (actions::*)   │
//!           │                             │               └────────────────┘
//!           ▼                             ▼
//! ┌───────────────────────┐   ┌───────────────────────┐
//! │  Persistence (sqlx)   │   │   PlatformClient      │
//! │  SQLite / PostgreSQL  │   │  (multiapps-platform) │
//! └───────────────────────┘   └───────────────────────┘
//! ```
//!
//! # Step phases
//!
//! | Phase | Meaning |
//! |-------|---------|
//! | `EXECUTE` | Run [`step::Step::execute`] |
//! | `POLL` | Drive the step's async executions, one per invocation |
//! | `RETRY` | The last invocation failed; the next one executes again |
//! | `DONE` | The step finished |
//!
//! Everything a step needs on its next invocation is stored in the
//! [`context::ProcessContext`] and flushed to [`persistence::Persistence`]
//! after every invocation, so a process survives a restart of its worker.
//!
//! # Error classification
//!
//! | Kind | Retried | Notes |
//! |------|---------|-------|
//! | `CONTENT_ERROR` | No | Bad descriptor, version rule violation |
//! | `PLATFORM_ERROR` | Yes | Transient remote failure |
//! | `PERMISSION_ERROR` | No | Downgraded to a warning in fail-safe mode |
//! | `NOT_FOUND` | No | Success for deletions, tolerated for optional resources |
//!
//! # Configuration
//!
//! The `multiapps-core` binary reads its configuration from environment
//! variables, see [`config::Config::from_env`].
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `MULTIAPPS_DATABASE_URL` | Yes | - | `sqlite:` or `postgres://` URL |
//! | `MULTIAPPS_MAX_PARALLEL_OPERATIONS` | No | `8` | Bounded pool size |
//! | `MULTIAPPS_LOCK_TIMEOUT_SECS` | No | `3600` | Stale lock age |
//! | `MULTIAPPS_LOCK_SWEEP_INTERVAL_SECS` | No | `60` | Sweeper period |
//! | `MULTIAPPS_BROKER_POLL_TIMEOUT_SECS` | No | `1800` | Broker job timeout |
//! | `MULTIAPPS_FAIL_SAFE` | No | `false` | Tolerate missing permissions |

#![deny(missing_docs)]

/// Pure action determination: desired vs. observed state.
pub mod actions;

/// Failure classification and tolerance.
pub mod classifier;

/// Configuration loaded from environment variables.
pub mod config;

/// Cross-process locks on platform resources.
pub mod conflict;

/// Process context and variable catalog.
pub mod context;

/// Error types and their kinds.
pub mod error;

/// Historic events and abort detection.
pub mod guard;

/// Embedded database migrations.
pub mod migrations;

/// Desired-state descriptors and deployed MTA records.
pub mod model;

/// SQLite and PostgreSQL persistence.
pub mod persistence;

/// Bounded pool for parallel sub-operations.
pub mod pool;

/// Worker configuration applied to contexts and steps.
pub mod process;

/// Step model and runner.
pub mod step;

/// Concrete deployment steps.
pub mod steps;

pub use classifier::{Intent, Resolution, Tolerance, resolve};
pub use config::{Config, ConfigError};
pub use context::ProcessContext;
pub use error::{CoreError, ErrorKind, Result};
pub use persistence::{Persistence, PostgresPersistence, SqlitePersistence};
pub use pool::{BoundedPool, Submission};
pub use process::ProcessFactory;
pub use step::{AsyncExecution, AsyncExecutionState, Step, StepPhase, StepRunner};

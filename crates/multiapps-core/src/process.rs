// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wiring of worker configuration into process contexts and steps.
//!
//! A worker builds one [`ProcessFactory`] from its [`Config`]. Every context
//! it opens inherits the configured fail-safe default, and every step it
//! builds shares one bounded pool and the configured broker timeout.

use std::sync::Arc;
use std::time::Duration;

use multiapps_platform::ClientFactory;
use tracing::debug;

use crate::config::Config;
use crate::context::ProcessContext;
use crate::error::Result;
use crate::persistence::Persistence;
use crate::pool::BoundedPool;
use crate::steps::broker::{CreateOrUpdateServiceBrokerStep, DeleteServiceBrokersStep};
use crate::steps::check_in_progress::CheckServiceOperationsInProgressStep;
use crate::steps::service::{CreateOrUpdateServiceStep, DeleteServicesStep};

/// Opens process contexts and builds steps from the worker configuration.
pub struct ProcessFactory {
    persistence: Arc<dyn Persistence>,
    clients: Arc<dyn ClientFactory>,
    pool: BoundedPool,
    fail_safe: bool,
    broker_poll_timeout: Duration,
}

impl ProcessFactory {
    /// Create a factory over `persistence` and `clients`.
    pub fn new(
        config: &Config,
        persistence: Arc<dyn Persistence>,
        clients: Arc<dyn ClientFactory>,
    ) -> Self {
        Self {
            persistence,
            clients,
            pool: BoundedPool::new(config.max_parallel_operations),
            fail_safe: config.fail_safe,
            broker_poll_timeout: config.broker_poll_timeout,
        }
    }

    /// Pool shared by all steps of this worker.
    pub fn pool(&self) -> &BoundedPool {
        &self.pool
    }

    /// Empty context for a new process.
    pub fn start(&self, process_id: &str) -> ProcessContext {
        ProcessContext::new(process_id, self.persistence.clone(), self.clients.clone())
            .with_fail_safe_default(self.fail_safe)
    }

    /// Context of a suspended process.
    pub async fn resume(&self, process_id: &str) -> Result<ProcessContext> {
        debug!(process_id = %process_id, "Resuming process");
        Ok(
            ProcessContext::load(process_id, self.persistence.clone(), self.clients.clone())
                .await?
                .with_fail_safe_default(self.fail_safe),
        )
    }

    /// Step creating or updating `SERVICE_TO_PROCESS`.
    pub fn create_or_update_service(&self) -> CreateOrUpdateServiceStep {
        CreateOrUpdateServiceStep::new(self.pool.clone())
    }

    /// Step waiting for foreign operations on `SERVICE_TO_PROCESS`.
    pub fn check_service_operations_in_progress(&self) -> CheckServiceOperationsInProgressStep {
        CheckServiceOperationsInProgressStep::new(self.pool.clone())
    }

    /// Step deleting `SERVICES_TO_DELETE`.
    pub fn delete_services(&self) -> DeleteServicesStep {
        DeleteServicesStep::new(self.pool.clone())
    }

    /// Step registering the broker of `APP_TO_PROCESS`.
    pub fn create_or_update_service_broker(&self) -> CreateOrUpdateServiceBrokerStep {
        CreateOrUpdateServiceBrokerStep::new(self.broker_poll_timeout)
    }

    /// Step deleting `SERVICE_BROKERS_TO_DELETE`.
    pub fn delete_service_brokers(&self) -> DeleteServiceBrokersStep {
        DeleteServiceBrokersStep::new(self.broker_poll_timeout)
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for multiapps-core integration tests.
//!
//! Provides a [`Harness`] with a file-backed SQLite database and a mock
//! platform, so that a process can be suspended and loaded again the way a
//! different worker would pick it up.

#![allow(dead_code)]

use std::sync::Arc;

use tempfile::TempDir;

use multiapps_core::context::{ProcessContext, variables};
use multiapps_core::persistence::{Persistence, SqlitePersistence};
use multiapps_core::step::{Step, StepPhase, StepRunner};
use multiapps_core::Result;
use multiapps_platform::{MockClientFactory, MockPlatformClient};

/// Database, mock platform and client factory shared by the processes of a test.
pub struct Harness {
    pub persistence: Arc<dyn Persistence>,
    pub client: Arc<MockPlatformClient>,
    pub factory: Arc<MockClientFactory>,
    _dir: TempDir,
}

impl Harness {
    /// Create a harness over a fresh database file.
    pub async fn new(client: MockPlatformClient) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let persistence = SqlitePersistence::from_path(dir.path().join("multiapps.db"))
            .await
            .expect("Failed to open SQLite database");
        let client = Arc::new(client);
        Self {
            persistence: Arc::new(persistence),
            factory: Arc::new(MockClientFactory::new(client.clone())),
            client,
            _dir: dir,
        }
    }

    /// A new process targeting `deployer` in `org/space`.
    pub fn start(&self, process_id: &str) -> ProcessContext {
        let mut ctx = ProcessContext::new(process_id, self.persistence.clone(), self.factory.clone());
        ctx.set(variables::USER, &"deployer".to_string()).unwrap();
        ctx.set(variables::ORG, &"org".to_string()).unwrap();
        ctx.set(variables::SPACE, &"space".to_string()).unwrap();
        ctx.set(variables::SPACE_GUID, &"space-guid".to_string())
            .unwrap();
        ctx
    }

    /// Load a suspended process, as another worker would.
    pub async fn resume(&self, process_id: &str) -> ProcessContext {
        ProcessContext::load(process_id, self.persistence.clone(), self.factory.clone())
            .await
            .expect("Failed to load process context")
    }

    /// Run one invocation of `step` on a freshly loaded context.
    pub async fn invoke(&self, step: Arc<dyn Step>, process_id: &str) -> Result<StepPhase> {
        let mut ctx = self.resume(process_id).await;
        StepRunner::new(step).run(&mut ctx).await
    }
}

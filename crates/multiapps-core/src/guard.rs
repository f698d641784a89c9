// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Historic event guard.
//!
//! Records the lifecycle events of a process and lets steps detect that an
//! operator aborted the process, so that no further remote mutation happens
//! after the next invocation boundary.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{CoreError, Result};
use crate::persistence::{HistoricEventType, Persistence};

/// Reads and writes the historic event log of processes.
pub struct HistoricEventGuard<P: Persistence + ?Sized> {
    persistence: Arc<P>,
}

impl<P: Persistence + ?Sized> HistoricEventGuard<P> {
    /// Create a guard over the given persistence.
    pub fn new(persistence: Arc<P>) -> Self {
        Self { persistence }
    }

    /// Record an event for a process.
    pub async fn record(&self, process_id: &str, event: HistoricEventType) -> Result<()> {
        self.persistence
            .insert_historic_event(process_id, event)
            .await
    }

    /// Whether the abort of the process has been executed.
    pub async fn is_aborted(&self, process_id: &str) -> Result<bool> {
        let events = self.persistence.list_historic_events(process_id).await?;
        Ok(events
            .iter()
            .any(|e| e.event_type == HistoricEventType::AbortExecuted.as_str()))
    }

    /// Fail with [`CoreError::Aborted`] if the process was aborted.
    pub async fn ensure_not_aborted(&self, process_id: &str) -> Result<()> {
        if self.is_aborted(process_id).await? {
            warn!(process_id, "Process was aborted, stopping");
            return Err(CoreError::Aborted {
                process_id: process_id.to_string(),
            });
        }
        Ok(())
    }

    /// Mark a process as aborted. Later invocations fail fast.
    pub async fn abort(&self, process_id: &str) -> Result<()> {
        info!(process_id, "Aborting process");
        self.record(process_id, HistoricEventType::Aborted).await?;
        self.record(process_id, HistoricEventType::AbortExecuted)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn guard() -> HistoricEventGuard<SqlitePersistence> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        SqlitePersistence::migrate(&pool)
            .await
            .expect("Failed to run migrations");
        HistoricEventGuard::new(Arc::new(SqlitePersistence::new(pool)))
    }

    #[tokio::test]
    async fn test_running_process_is_not_aborted() {
        let guard = guard().await;
        guard
            .record("p-1", HistoricEventType::Started)
            .await
            .unwrap();
        guard
            .record("p-1", HistoricEventType::Aborted)
            .await
            .unwrap();

        // An abort request alone does not stop the process.
        assert!(!guard.is_aborted("p-1").await.unwrap());
        guard.ensure_not_aborted("p-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_executed_fails_fast() {
        let guard = guard().await;
        guard.abort("p-1").await.unwrap();

        let err = guard.ensure_not_aborted("p-1").await.unwrap_err();
        assert_eq!(err.error_code(), "PROCESS_ABORTED");
        assert!(!guard.is_aborted("p-2").await.unwrap());
    }
}

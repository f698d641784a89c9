// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cross-process mutual exclusion on named platform resources.
//!
//! Before a step mutates an application, service or broker it registers a
//! lock on `space/kind/name`. A lock held by another process is a
//! [`CoreError::Conflict`]. Locks are released when the step completes, when
//! the process ends, or by the stale lock sweeper.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::persistence::{LockAcquisition, Persistence};

/// Kind of a lockable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    /// An application.
    Application,
    /// A service instance.
    Service,
    /// A service broker.
    Broker,
    /// A whole MTA.
    Mta,
}

impl ResourceKind {
    /// Returns the string representation used in lock keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Application => "app",
            Self::Service => "service",
            Self::Broker => "broker",
            Self::Mta => "mta",
        }
    }
}

/// A named resource in a space.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceLock {
    /// Space the resource lives in.
    pub space: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Resource name.
    pub name: String,
}

impl ResourceLock {
    /// Create a lock descriptor.
    pub fn new(space: impl Into<String>, kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            space: space.into(),
            kind,
            name: name.into(),
        }
    }

    /// Persisted lock key.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.space, self.kind.as_str(), self.name)
    }
}

impl fmt::Display for ResourceLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Registers and releases resource locks on behalf of processes.
#[derive(Clone)]
pub struct ConflictPreventer {
    persistence: Arc<dyn Persistence>,
}

impl ConflictPreventer {
    /// Create a preventer over the given persistence.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Lock every resource for `process_id`, or none of them.
    ///
    /// Keys are taken in sorted order so that two processes contending for
    /// overlapping sets cannot both end up failing.
    pub async fn acquire(&self, process_id: &str, resources: &[ResourceLock]) -> Result<()> {
        let mut keys: Vec<String> = resources.iter().map(ResourceLock::key).collect();
        keys.sort();
        keys.dedup();

        let mut acquired = Vec::with_capacity(keys.len());
        for key in keys {
            match self.persistence.try_acquire_lock(&key, process_id).await? {
                LockAcquisition::Acquired => acquired.push(key),
                LockAcquisition::HeldBy(holder) => {
                    warn!(process_id, resource = %key, holder = %holder, "Conflicting process");
                    for key in &acquired {
                        self.persistence.release_lock(key, process_id).await?;
                    }
                    return Err(CoreError::Conflict {
                        resource: key,
                        holder,
                    });
                }
            }
        }
        debug!(process_id, count = acquired.len(), "Resource locks acquired");
        Ok(())
    }

    /// Release the given locks held by `process_id`.
    pub async fn release(&self, process_id: &str, resources: &[ResourceLock]) -> Result<()> {
        for resource in resources {
            self.persistence
                .release_lock(&resource.key(), process_id)
                .await?;
        }
        Ok(())
    }

    /// Release every lock held by `process_id`.
    pub async fn release_all(&self, process_id: &str) -> Result<u64> {
        let released = self.persistence.release_locks_for_process(process_id).await?;
        if released > 0 {
            info!(process_id, released, "Released resource locks");
        }
        Ok(released)
    }

    /// Release locks older than `timeout`, left behind by crashed processes.
    pub async fn release_stale(&self, timeout: Duration) -> Result<u64> {
        let timeout = chrono::Duration::from_std(timeout).map_err(|e| CoreError::Validation {
            field: "lock_timeout".to_string(),
            message: e.to_string(),
        })?;
        let released = self
            .persistence
            .release_stale_locks(Utc::now() - timeout)
            .await?;
        if released > 0 {
            info!(released, "Released stale resource locks");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn preventer() -> (ConflictPreventer, Arc<dyn Persistence>) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        SqlitePersistence::migrate(&pool)
            .await
            .expect("Failed to run migrations");
        let persistence: Arc<dyn Persistence> = Arc::new(SqlitePersistence::new(pool));
        (ConflictPreventer::new(persistence.clone()), persistence)
    }

    fn app(name: &str) -> ResourceLock {
        ResourceLock::new("dev", ResourceKind::Application, name)
    }

    #[test]
    fn test_lock_key() {
        let lock = ResourceLock::new("space-guid", ResourceKind::Service, "db");
        assert_eq!(lock.key(), "space-guid/service/db");
        assert_eq!(lock.to_string(), lock.key());
    }

    #[tokio::test]
    async fn test_acquire_is_reentrant_for_the_same_process() {
        let (preventer, _) = preventer().await;
        preventer.acquire("p-1", &[app("web")]).await.unwrap();
        preventer.acquire("p-1", &[app("web")]).await.unwrap();
    }

    #[tokio::test]
    async fn test_conflict_releases_partial_acquisition() {
        let (preventer, persistence) = preventer().await;
        preventer.acquire("p-1", &[app("b")]).await.unwrap();

        let err = preventer
            .acquire("p-2", &[app("a"), app("b")])
            .await
            .unwrap_err();
        match err {
            CoreError::Conflict { resource, holder } => {
                assert_eq!(resource, "dev/app/b");
                assert_eq!(holder, "p-1");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // "a" was taken before the conflict and must have been given back.
        let held = persistence.list_locks(Some("p-2")).await.unwrap();
        assert!(held.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_overlapping_acquisitions_have_one_winner() {
        let (preventer, _) = preventer().await;
        let first = [app("a"), app("b"), app("c")];
        let second = [app("c"), app("b")];

        let (r1, r2) = futures::join!(
            preventer.acquire("p-1", &first),
            preventer.acquire("p-2", &second)
        );
        assert!(r1.is_ok() != r2.is_ok());
    }

    #[tokio::test]
    async fn test_release_all() {
        let (preventer, _) = preventer().await;
        preventer
            .acquire("p-1", &[app("a"), app("b")])
            .await
            .unwrap();
        assert_eq!(preventer.release_all("p-1").await.unwrap(), 2);

        preventer.acquire("p-2", &[app("a")]).await.unwrap();
        preventer.release("p-2", &[app("a")]).await.unwrap();
        assert_eq!(preventer.release_all("p-2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_release_stale_keeps_fresh_locks() {
        let (preventer, _) = preventer().await;
        preventer.acquire("p-1", &[app("a")]).await.unwrap();

        let released = preventer
            .release_stale(Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(released, 0);

        let err = preventer.acquire("p-2", &[app("a")]).await.unwrap_err();
        assert_eq!(err.error_code(), "CONFLICTING_PROCESS");
    }
}

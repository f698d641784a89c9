// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for multiapps-core.
//!
//! This module defines the persistence abstraction and backend implementations.
//! It stands in for the workflow engine's variable and history storage and for
//! the configuration data access layer.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use semver::{Version, VersionReq};
use sha2::{Digest, Sha256};

use crate::error::CoreError;

// ============================================================================
// Process variables
// ============================================================================

/// A persisted context variable.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VariableRecord {
    /// Owning process instance.
    pub process_id: String,
    /// Variable name.
    pub name: String,
    /// JSON-encoded value.
    pub value: String,
    /// When the variable was last written.
    pub updated_at: DateTime<Utc>,
}

/// A pending change to a context variable: `Some` upserts, `None` deletes.
pub type VariableChange = (String, Option<String>);

// ============================================================================
// Historic events
// ============================================================================

/// Type of a historic operation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoricEventType {
    /// The process started.
    Started,
    /// The process finished successfully.
    Finished,
    /// A step failed with a content error.
    FailedByContentError,
    /// A step failed with a platform or internal error.
    FailedByInfrastructureError,
    /// A failed step was retried.
    Retried,
    /// An operator requested an abort.
    Aborted,
    /// The abort was carried out.
    AbortExecuted,
}

impl HistoricEventType {
    /// Returns the string representation of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Finished => "FINISHED",
            Self::FailedByContentError => "FAILED_BY_CONTENT_ERROR",
            Self::FailedByInfrastructureError => "FAILED_BY_INFRASTRUCTURE_ERROR",
            Self::Retried => "RETRIED",
            Self::Aborted => "ABORTED",
            Self::AbortExecuted => "ABORT_EXECUTED",
        }
    }

    /// Parse an event type from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STARTED" => Some(Self::Started),
            "FINISHED" => Some(Self::Finished),
            "FAILED_BY_CONTENT_ERROR" => Some(Self::FailedByContentError),
            "FAILED_BY_INFRASTRUCTURE_ERROR" => Some(Self::FailedByInfrastructureError),
            "RETRIED" => Some(Self::Retried),
            "ABORTED" => Some(Self::Aborted),
            "ABORT_EXECUTED" => Some(Self::AbortExecuted),
            _ => None,
        }
    }
}

/// Historic event record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HistoricEventRecord {
    /// Database primary key.
    pub id: i64,
    /// Process the event belongs to.
    pub process_id: String,
    /// Event type (see [`HistoricEventType`]).
    pub event_type: String,
    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Operation locks
// ============================================================================

/// Lock held by a process on a named resource.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OperationLockRecord {
    /// Key of the locked resource.
    pub resource_key: String,
    /// Process holding the lock.
    pub process_id: String,
    /// When the lock was taken.
    pub acquired_at: DateTime<Utc>,
}

/// Outcome of a lock attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquisition {
    /// The caller now holds the lock (or already did).
    Acquired,
    /// Another process holds the lock.
    HeldBy(String),
}

// ============================================================================
// Configuration entries and subscriptions
// ============================================================================

/// Published configuration entry.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ConfigurationEntryRecord {
    /// Database primary key.
    pub id: i64,
    /// Provider namespace id (for example `mta`).
    pub provider_nid: String,
    /// Provider id (for example `mta-id:module`).
    pub provider_id: String,
    /// Provider version.
    pub provider_version: String,
    /// Target organization.
    pub target_org: String,
    /// Target space.
    pub target_space: String,
    /// JSON content.
    pub content: Option<String>,
    /// Space the provider was deployed from.
    #[sqlx(default)]
    pub provider_space_id: Option<String>,
}

/// Configuration entry to insert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewConfigurationEntry {
    /// Provider namespace id.
    pub provider_nid: String,
    /// Provider id.
    pub provider_id: String,
    /// Provider version.
    pub provider_version: String,
    /// Target organization.
    pub target_org: String,
    /// Target space.
    pub target_space: String,
    /// JSON content.
    pub content: Option<String>,
    /// Space the provider was deployed from.
    pub provider_space_id: Option<String>,
}

/// Filter options for configuration entry queries.
#[derive(Debug, Clone, Default)]
pub struct ConfigurationEntryFilter {
    /// Filter by provider namespace id.
    pub provider_nid: Option<String>,
    /// Filter by provider id.
    pub provider_id: Option<String>,
    /// Exact version, or a requirement such as `>=1.0.0`.
    pub version: Option<String>,
    /// Filter by target organization.
    pub target_org: Option<String>,
    /// Filter by target space.
    pub target_space: Option<String>,
    /// Filter by the space the provider was deployed from.
    pub provider_space_id: Option<String>,
}

/// Configuration subscription record.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SubscriptionRecord {
    /// Database primary key.
    pub id: i64,
    /// Subscribing MTA.
    pub mta_id: String,
    /// Space of the subscribing MTA.
    pub space_id: String,
    /// Subscribing application.
    pub app_name: String,
    /// JSON filter selecting the configuration entries.
    pub filter: String,
    /// JSON snapshot of the subscribing module.
    pub module: String,
    /// Resource that declared the dependency.
    pub resource_name: String,
    /// JSON properties of that resource.
    pub resource_properties: String,
}

/// Configuration subscription to insert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewSubscription {
    /// Subscribing MTA.
    pub mta_id: String,
    /// Space of the subscribing MTA.
    pub space_id: String,
    /// Subscribing application.
    pub app_name: String,
    /// JSON filter selecting the configuration entries.
    pub filter: String,
    /// JSON snapshot of the subscribing module.
    pub module: String,
    /// Resource that declared the dependency.
    pub resource_name: String,
    /// JSON properties of that resource.
    pub resource_properties: String,
}

/// Filter options for subscription queries.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    /// Filter by MTA.
    pub mta_id: Option<String>,
    /// Filter by space.
    pub space_id: Option<String>,
    /// Filter by application.
    pub app_name: Option<String>,
}

// ============================================================================
// Descriptor backups
// ============================================================================

/// Backup of a deployment descriptor.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DescriptorBackupRecord {
    /// Database primary key.
    pub id: i64,
    /// MTA id.
    pub mta_id: String,
    /// MTA version.
    pub mta_version: String,
    /// Space the MTA is deployed to.
    pub space_id: String,
    /// Optional namespace.
    pub namespace: Option<String>,
    /// SHA-256 hex digest of `descriptor`.
    pub checksum: String,
    /// Serialized descriptor.
    pub descriptor: Vec<u8>,
    /// When the backup was taken.
    pub created_at: DateTime<Utc>,
}

/// Key identifying a descriptor backup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorBackupKey {
    /// MTA id.
    pub mta_id: String,
    /// Space the MTA is deployed to.
    pub space_id: String,
    /// Optional namespace.
    pub namespace: Option<String>,
    /// MTA version.
    pub mta_version: String,
}

/// SHA-256 hex digest used as descriptor checksum.
pub fn descriptor_checksum(descriptor: &[u8]) -> String {
    let digest = Sha256::digest(descriptor);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Whether `version` satisfies `requirement`.
///
/// A requirement starting with a comparison operator is parsed as a semver
/// requirement; anything else must match exactly.
pub fn version_matches(requirement: &str, version: &str) -> bool {
    let requirement = requirement.trim();
    if requirement.starts_with(['>', '<', '=', '^', '~']) {
        match (VersionReq::parse(requirement), Version::parse(version)) {
            (Ok(req), Ok(version)) => req.matches(&version),
            _ => false,
        }
    } else {
        requirement == version
    }
}

/// Persistence interface used by the process core.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // Process variables
    async fn load_variables(&self, process_id: &str) -> Result<Vec<VariableRecord>, CoreError>;

    /// Apply upserts and deletes atomically.
    async fn save_variables(
        &self,
        process_id: &str,
        changes: &[VariableChange],
    ) -> Result<(), CoreError>;

    async fn delete_variables(&self, process_id: &str) -> Result<u64, CoreError>;

    // Historic events
    async fn insert_historic_event(
        &self,
        process_id: &str,
        event_type: HistoricEventType,
    ) -> Result<(), CoreError>;

    /// Events of a process, oldest first.
    async fn list_historic_events(
        &self,
        process_id: &str,
    ) -> Result<Vec<HistoricEventRecord>, CoreError>;

    // Operation locks
    async fn try_acquire_lock(
        &self,
        resource_key: &str,
        process_id: &str,
    ) -> Result<LockAcquisition, CoreError>;

    /// Release a lock held by `process_id`. Returns false if it was not held.
    async fn release_lock(&self, resource_key: &str, process_id: &str) -> Result<bool, CoreError>;

    async fn release_locks_for_process(&self, process_id: &str) -> Result<u64, CoreError>;

    async fn list_locks(
        &self,
        process_id: Option<&str>,
    ) -> Result<Vec<OperationLockRecord>, CoreError>;

    /// Release every lock acquired before `before`.
    async fn release_stale_locks(&self, before: DateTime<Utc>) -> Result<u64, CoreError>;

    // Configuration entries
    async fn add_configuration_entry(&self, entry: &NewConfigurationEntry)
    -> Result<i64, CoreError>;

    async fn update_configuration_entry_content(
        &self,
        id: i64,
        content: Option<&str>,
    ) -> Result<(), CoreError>;

    async fn delete_configuration_entry(&self, id: i64) -> Result<(), CoreError>;

    async fn find_configuration_entries(
        &self,
        filter: &ConfigurationEntryFilter,
    ) -> Result<Vec<ConfigurationEntryRecord>, CoreError>;

    // Configuration subscriptions
    async fn add_subscription(&self, subscription: &NewSubscription) -> Result<i64, CoreError>;

    async fn update_subscription(
        &self,
        id: i64,
        subscription: &NewSubscription,
    ) -> Result<(), CoreError>;

    async fn find_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<SubscriptionRecord>, CoreError>;

    async fn delete_subscription(&self, id: i64) -> Result<(), CoreError>;

    async fn delete_subscriptions_for_mta(
        &self,
        mta_id: &str,
        space_id: &str,
    ) -> Result<u64, CoreError>;

    // Descriptor backups
    async fn add_descriptor_backup(
        &self,
        key: &DescriptorBackupKey,
        descriptor: &[u8],
    ) -> Result<i64, CoreError>;

    async fn find_descriptor_backup(
        &self,
        key: &DescriptorBackupKey,
        checksum: Option<&str>,
    ) -> Result<Option<DescriptorBackupRecord>, CoreError>;

    async fn delete_descriptor_backups(
        &self,
        mta_id: &str,
        space_id: &str,
    ) -> Result<u64, CoreError>;

    async fn health_check_db(&self) -> Result<bool, CoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_historic_event_type_roundtrip() {
        let all = [
            HistoricEventType::Started,
            HistoricEventType::Finished,
            HistoricEventType::FailedByContentError,
            HistoricEventType::FailedByInfrastructureError,
            HistoricEventType::Retried,
            HistoricEventType::Aborted,
            HistoricEventType::AbortExecuted,
        ];
        for event in all {
            assert_eq!(HistoricEventType::parse(event.as_str()), Some(event));
        }
        assert_eq!(HistoricEventType::parse("UNKNOWN"), None);
    }

    #[test]
    fn test_version_matches_exact() {
        assert!(version_matches("1.0.0", "1.0.0"));
        assert!(!version_matches("1.0.0", "1.0.1"));
    }

    #[test]
    fn test_version_matches_requirement() {
        assert!(version_matches(">=1.0.0", "1.2.3"));
        assert!(!version_matches(">=2.0.0", "1.2.3"));
        assert!(version_matches("^1.1", "1.9.0"));
        assert!(!version_matches(">=1.0.0", "not-a-version"));
    }

    #[test]
    fn test_descriptor_checksum_is_sha256_hex() {
        let checksum = descriptor_checksum(b"");
        assert_eq!(
            checksum,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(checksum.len(), 64);
    }
}

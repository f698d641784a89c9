// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::CoreError;

use super::{
    ConfigurationEntryFilter, ConfigurationEntryRecord, DescriptorBackupKey,
    DescriptorBackupRecord, HistoricEventRecord, HistoricEventType, LockAcquisition,
    NewConfigurationEntry, NewSubscription, OperationLockRecord, Persistence, SubscriptionFilter,
    SubscriptionRecord, VariableChange, VariableRecord, descriptor_checksum, version_matches,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file when missing, then
    /// runs all migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/multiapps.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::Database {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        Self::migrate(&pool).await?;

        Ok(Self { pool })
    }

    /// Run the embedded SQLite migrations against `pool`.
    pub async fn migrate(pool: &SqlitePool) -> Result<(), CoreError> {
        MIGRATOR.run(pool).await.map_err(|e| CoreError::Database {
            operation: "migrate".to_string(),
            details: format!("Failed to run migrations: {}", e),
        })
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn load_variables(&self, process_id: &str) -> Result<Vec<VariableRecord>, CoreError> {
        let records = sqlx::query_as::<_, VariableRecord>(
            r#"
            SELECT process_id, name, value, updated_at
            FROM process_variables
            WHERE process_id = ?
            ORDER BY name
            "#,
        )
        .bind(process_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn save_variables(
        &self,
        process_id: &str,
        changes: &[VariableChange],
    ) -> Result<(), CoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        for (name, value) in changes {
            match value {
                Some(value) => {
                    sqlx::query(
                        r#"
                        INSERT INTO process_variables (process_id, name, value, updated_at)
                        VALUES (?1, ?2, ?3, ?4)
                        ON CONFLICT (process_id, name)
                        DO UPDATE SET value = ?3, updated_at = ?4
                        "#,
                    )
                    .bind(process_id)
                    .bind(name)
                    .bind(value)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query("DELETE FROM process_variables WHERE process_id = ? AND name = ?")
                        .bind(process_id)
                        .bind(name)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_variables(&self, process_id: &str) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM process_variables WHERE process_id = ?")
            .bind(process_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn insert_historic_event(
        &self,
        process_id: &str,
        event_type: HistoricEventType,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO historic_events (process_id, event_type, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(process_id)
        .bind(event_type.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_historic_events(
        &self,
        process_id: &str,
    ) -> Result<Vec<HistoricEventRecord>, CoreError> {
        let records = sqlx::query_as::<_, HistoricEventRecord>(
            r#"
            SELECT id, process_id, event_type, created_at
            FROM historic_events
            WHERE process_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(process_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn try_acquire_lock(
        &self,
        resource_key: &str,
        process_id: &str,
    ) -> Result<LockAcquisition, CoreError> {
        sqlx::query(
            r#"
            INSERT INTO operation_locks (resource_key, process_id, acquired_at)
            VALUES (?, ?, ?)
            ON CONFLICT (resource_key) DO NOTHING
            "#,
        )
        .bind(resource_key)
        .bind(process_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let holder: Option<(String,)> =
            sqlx::query_as("SELECT process_id FROM operation_locks WHERE resource_key = ?")
                .bind(resource_key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(match holder {
            Some((holder,)) if holder != process_id => LockAcquisition::HeldBy(holder),
            _ => LockAcquisition::Acquired,
        })
    }

    async fn release_lock(&self, resource_key: &str, process_id: &str) -> Result<bool, CoreError> {
        let result =
            sqlx::query("DELETE FROM operation_locks WHERE resource_key = ? AND process_id = ?")
                .bind(resource_key)
                .bind(process_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_locks_for_process(&self, process_id: &str) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM operation_locks WHERE process_id = ?")
            .bind(process_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn list_locks(
        &self,
        process_id: Option<&str>,
    ) -> Result<Vec<OperationLockRecord>, CoreError> {
        let records = sqlx::query_as::<_, OperationLockRecord>(
            r#"
            SELECT resource_key, process_id, acquired_at
            FROM operation_locks
            WHERE (?1 IS NULL OR process_id = ?1)
            ORDER BY resource_key
            "#,
        )
        .bind(process_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn release_stale_locks(&self, before: DateTime<Utc>) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM operation_locks WHERE acquired_at < ?")
            .bind(before)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn add_configuration_entry(
        &self,
        entry: &NewConfigurationEntry,
    ) -> Result<i64, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO configuration_entries
                (provider_nid, provider_id, provider_version, target_org, target_space,
                 content, provider_space_id)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.provider_nid)
        .bind(&entry.provider_id)
        .bind(&entry.provider_version)
        .bind(&entry.target_org)
        .bind(&entry.target_space)
        .bind(&entry.content)
        .bind(&entry.provider_space_id)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn update_configuration_entry_content(
        &self,
        id: i64,
        content: Option<&str>,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE configuration_entries SET content = ? WHERE id = ?")
            .bind(content)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn delete_configuration_entry(&self, id: i64) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM configuration_entries WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn find_configuration_entries(
        &self,
        filter: &ConfigurationEntryFilter,
    ) -> Result<Vec<ConfigurationEntryRecord>, CoreError> {
        let records = sqlx::query_as::<_, ConfigurationEntryRecord>(
            r#"
            SELECT id, provider_nid, provider_id, provider_version, target_org, target_space,
                   content, provider_space_id
            FROM configuration_entries
            WHERE (?1 IS NULL OR provider_nid = ?1)
              AND (?2 IS NULL OR provider_id = ?2)
              AND (?3 IS NULL OR target_org = ?3)
              AND (?4 IS NULL OR target_space = ?4)
              AND (?5 IS NULL OR provider_space_id = ?5)
            ORDER BY id
            "#,
        )
        .bind(&filter.provider_nid)
        .bind(&filter.provider_id)
        .bind(&filter.target_org)
        .bind(&filter.target_space)
        .bind(&filter.provider_space_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(match &filter.version {
            Some(requirement) => records
                .into_iter()
                .filter(|r| version_matches(requirement, &r.provider_version))
                .collect(),
            None => records,
        })
    }

    async fn add_subscription(&self, subscription: &NewSubscription) -> Result<i64, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO configuration_subscriptions
                (mta_id, space_id, app_name, filter, module, resource_name, resource_properties)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&subscription.mta_id)
        .bind(&subscription.space_id)
        .bind(&subscription.app_name)
        .bind(&subscription.filter)
        .bind(&subscription.module)
        .bind(&subscription.resource_name)
        .bind(&subscription.resource_properties)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn update_subscription(
        &self,
        id: i64,
        subscription: &NewSubscription,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE configuration_subscriptions
            SET filter = ?, module = ?, resource_properties = ?
            WHERE id = ?
            "#,
        )
        .bind(&subscription.filter)
        .bind(&subscription.module)
        .bind(&subscription.resource_properties)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<SubscriptionRecord>, CoreError> {
        let records = sqlx::query_as::<_, SubscriptionRecord>(
            r#"
            SELECT id, mta_id, space_id, app_name, filter, module, resource_name,
                   resource_properties
            FROM configuration_subscriptions
            WHERE (?1 IS NULL OR mta_id = ?1)
              AND (?2 IS NULL OR space_id = ?2)
              AND (?3 IS NULL OR app_name = ?3)
            ORDER BY id
            "#,
        )
        .bind(&filter.mta_id)
        .bind(&filter.space_id)
        .bind(&filter.app_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn delete_subscription(&self, id: i64) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM configuration_subscriptions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn delete_subscriptions_for_mta(
        &self,
        mta_id: &str,
        space_id: &str,
    ) -> Result<u64, CoreError> {
        let result =
            sqlx::query("DELETE FROM configuration_subscriptions WHERE mta_id = ? AND space_id = ?")
                .bind(mta_id)
                .bind(space_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }

    async fn add_descriptor_backup(
        &self,
        key: &DescriptorBackupKey,
        descriptor: &[u8],
    ) -> Result<i64, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO descriptor_backups
                (mta_id, mta_version, space_id, namespace, checksum, descriptor, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&key.mta_id)
        .bind(&key.mta_version)
        .bind(&key.space_id)
        .bind(&key.namespace)
        .bind(descriptor_checksum(descriptor))
        .bind(descriptor)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn find_descriptor_backup(
        &self,
        key: &DescriptorBackupKey,
        checksum: Option<&str>,
    ) -> Result<Option<DescriptorBackupRecord>, CoreError> {
        let record = sqlx::query_as::<_, DescriptorBackupRecord>(
            r#"
            SELECT id, mta_id, mta_version, space_id, namespace, checksum, descriptor, created_at
            FROM descriptor_backups
            WHERE mta_id = ?1
              AND space_id = ?2
              AND mta_version = ?3
              AND ((?4 IS NULL AND namespace IS NULL) OR namespace = ?4)
              AND (?5 IS NULL OR checksum = ?5)
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(&key.mta_id)
        .bind(&key.space_id)
        .bind(&key.mta_version)
        .bind(&key.namespace)
        .bind(checksum)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn delete_descriptor_backups(
        &self,
        mta_id: &str,
        space_id: &str,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM descriptor_backups WHERE mta_id = ? AND space_id = ?")
            .bind(mta_id)
            .bind(space_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let result: Result<(i32,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}

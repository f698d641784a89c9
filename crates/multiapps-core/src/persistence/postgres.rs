// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence operations for multiapps-core.
//!
//! Provides durable storage access for process variables, historic events,
//! operation locks, configuration entries, subscriptions and descriptor backups.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::CoreError;

use super::{
    ConfigurationEntryFilter, ConfigurationEntryRecord, DescriptorBackupKey,
    DescriptorBackupRecord, HistoricEventRecord, HistoricEventType, LockAcquisition,
    NewConfigurationEntry, NewSubscription, OperationLockRecord, Persistence, SubscriptionFilter,
    SubscriptionRecord, VariableChange, VariableRecord, descriptor_checksum, version_matches,
};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Variable Operations
// ============================================================================

/// Load all variables of a process.
pub async fn load_variables(
    pool: &PgPool,
    process_id: &str,
) -> Result<Vec<VariableRecord>, CoreError> {
    let records = sqlx::query_as::<_, VariableRecord>(
        r#"
        SELECT process_id, name, value, updated_at
        FROM process_variables
        WHERE process_id = $1
        ORDER BY name
        "#,
    )
    .bind(process_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Apply variable upserts and deletes in one transaction.
pub async fn save_variables(
    pool: &PgPool,
    process_id: &str,
    changes: &[VariableChange],
) -> Result<(), CoreError> {
    let mut tx = pool.begin().await?;

    for (name, value) in changes {
        match value {
            Some(value) => {
                sqlx::query(
                    r#"
                    INSERT INTO process_variables (process_id, name, value, updated_at)
                    VALUES ($1, $2, $3, NOW())
                    ON CONFLICT (process_id, name)
                    DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
                    "#,
                )
                .bind(process_id)
                .bind(name)
                .bind(value)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM process_variables WHERE process_id = $1 AND name = $2")
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

/// Delete every variable of a process.
pub async fn delete_variables(pool: &PgPool, process_id: &str) -> Result<u64, CoreError> {
    let result = sqlx::query("DELETE FROM process_variables WHERE process_id = $1")
        .bind(process_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

// ============================================================================
// Historic Event Operations
// ============================================================================

/// Record a historic event.
pub async fn insert_historic_event(
    pool: &PgPool,
    process_id: &str,
    event_type: HistoricEventType,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO historic_events (process_id, event_type, created_at)
        VALUES ($1, $2, NOW())
        "#,
    )
    .bind(process_id)
    .bind(event_type.as_str())
    .execute(pool)
    .await?;

    Ok(())
}

/// List the historic events of a process, oldest first.
pub async fn list_historic_events(
    pool: &PgPool,
    process_id: &str,
) -> Result<Vec<HistoricEventRecord>, CoreError> {
    let records = sqlx::query_as::<_, HistoricEventRecord>(
        r#"
        SELECT id, process_id, event_type, created_at
        FROM historic_events
        WHERE process_id = $1
        ORDER BY id ASC
        "#,
    )
    .bind(process_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

// ============================================================================
// Lock Operations
// ============================================================================

/// Try to take the lock on `resource_key` for `process_id`.
pub async fn try_acquire_lock(
    pool: &PgPool,
    resource_key: &str,
    process_id: &str,
) -> Result<LockAcquisition, CoreError> {
    sqlx::query(
        r#"
        INSERT INTO operation_locks (resource_key, process_id, acquired_at)
        VALUES ($1, $2, NOW())
        ON CONFLICT (resource_key) DO NOTHING
        "#,
    )
    .bind(resource_key)
    .bind(process_id)
    .execute(pool)
    .await?;

    let holder: Option<(String,)> =
        sqlx::query_as("SELECT process_id FROM operation_locks WHERE resource_key = $1")
            .bind(resource_key)
            .fetch_optional(pool)
            .await?;

    Ok(match holder {
        Some((holder,)) if holder != process_id => LockAcquisition::HeldBy(holder),
        _ => LockAcquisition::Acquired,
    })
}

/// Release a lock if `process_id` holds it.
pub async fn release_lock(
    pool: &PgPool,
    resource_key: &str,
    process_id: &str,
) -> Result<bool, CoreError> {
    let result =
        sqlx::query("DELETE FROM operation_locks WHERE resource_key = $1 AND process_id = $2")
            .bind(resource_key)
            .bind(process_id)
            .execute(pool)
            .await?;

    Ok(result.rows_affected() > 0)
}

/// Release all locks held by a process.
pub async fn release_locks_for_process(pool: &PgPool, process_id: &str) -> Result<u64, CoreError> {
    let result = sqlx::query("DELETE FROM operation_locks WHERE process_id = $1")
        .bind(process_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// List locks, optionally restricted to one process.
pub async fn list_locks(
    pool: &PgPool,
    process_id: Option<&str>,
) -> Result<Vec<OperationLockRecord>, CoreError> {
    let records = sqlx::query_as::<_, OperationLockRecord>(
        r#"
        SELECT resource_key, process_id, acquired_at
        FROM operation_locks
        WHERE ($1::text IS NULL OR process_id = $1)
        ORDER BY resource_key
        "#,
    )
    .bind(process_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Release every lock acquired before `before`.
pub async fn release_stale_locks(pool: &PgPool, before: DateTime<Utc>) -> Result<u64, CoreError> {
    let result = sqlx::query("DELETE FROM operation_locks WHERE acquired_at < $1")
        .bind(before)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

// ============================================================================
// Configuration Entry Operations
// ============================================================================

/// Insert a configuration entry and return its id.
pub async fn add_configuration_entry(
    pool: &PgPool,
    entry: &NewConfigurationEntry,
) -> Result<i64, CoreError> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO configuration_entries
            (provider_nid, provider_id, provider_version, target_org, target_space,
             content, provider_space_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id
        "#,
    )
    .bind(&entry.provider_nid)
    .bind(&entry.provider_id)
    .bind(&entry.provider_version)
    .bind(&entry.target_org)
    .bind(&entry.target_space)
    .bind(&entry.content)
    .bind(&entry.provider_space_id)
    .fetch_one(pool)
    .await?;

    Ok(id)
}

/// Replace the content of a configuration entry.
pub async fn update_configuration_entry_content(
    pool: &PgPool,
    id: i64,
    content: Option<&str>,
) -> Result<(), CoreError> {
    sqlx::query("UPDATE configuration_entries SET content = $1 WHERE id = $2")
        .bind(content)
        .bind(id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Delete a configuration entry.
pub async fn delete_configuration_entry(pool: &PgPool, id: i64) -> Result<(), CoreError> {
    sqlx::query("DELETE FROM configuration_entries WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Find configuration entries matching `filter`.
pub async fn find_configuration_entries(
    pool: &PgPool,
    filter: &ConfigurationEntryFilter,
) -> Result<Vec<ConfigurationEntryRecord>, CoreError> {
    let records = sqlx::query_as::<_, ConfigurationEntryRecord>(
        r#"
        SELECT id, provider_nid, provider_id, provider_version, target_org, target_space,
               content, provider_space_id
        FROM configuration_entries
        WHERE ($1::text IS NULL OR provider_nid = $1)
          AND ($2::text IS NULL OR provider_id = $2)
          AND ($3::text IS NULL OR target_org = $3)
          AND ($4::text IS NULL OR target_space = $4)
          AND ($5::text IS NULL OR provider_space_id = $5)
        ORDER BY id
        "#,
    )
    .bind(&filter.provider_nid)
    .bind(&filter.provider_id)
    .bind(&filter.target_org)
    .bind(&filter.target_space)
    .bind(&filter.provider_space_id)
    .fetch_all(pool)
    .await?;

    Ok(match &filter.version {
        Some(requirement) => records
            .into_iter()
            .filter(|r| version_matches(requirement, &r.provider_version))
            .collect(),
        None => records,
    })
}

// ============================================================================
// Subscription Operations
// ============================================================================

/// Insert a configuration subscription and return its id.
pub async fn add_subscription(
    pool: &PgPool,
    subscription: &NewSubscription,
) -> Result<i64, CoreError> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO configuration_subscriptions
            (mta_id, space_id, app_name, filter, module, resource_name, resource_properties)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id
        "#,
    )
    .bind(&subscription.mta_id)
    .bind(&subscription.space_id)
    .bind(&subscription.app_name)
    .bind(&subscription.filter)
    .bind(&subscription.module)
    .bind(&subscription.resource_name)
    .bind(&subscription.resource_properties)
    .fetch_one(pool)
    .await?;

    Ok(id)
}

/// Replace the mutable parts of a subscription.
pub async fn update_subscription(
    pool: &PgPool,
    id: i64,
    subscription: &NewSubscription,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        UPDATE configuration_subscriptions
        SET filter = $1, module = $2, resource_properties = $3
        WHERE id = $4
        "#,
    )
    .bind(&subscription.filter)
    .bind(&subscription.module)
    .bind(&subscription.resource_properties)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Find subscriptions matching `filter`.
pub async fn find_subscriptions(
    pool: &PgPool,
    filter: &SubscriptionFilter,
) -> Result<Vec<SubscriptionRecord>, CoreError> {
    let records = sqlx::query_as::<_, SubscriptionRecord>(
        r#"
        SELECT id, mta_id, space_id, app_name, filter, module, resource_name,
               resource_properties
        FROM configuration_subscriptions
        WHERE ($1::text IS NULL OR mta_id = $1)
          AND ($2::text IS NULL OR space_id = $2)
          AND ($3::text IS NULL OR app_name = $3)
        ORDER BY id
        "#,
    )
    .bind(&filter.mta_id)
    .bind(&filter.space_id)
    .bind(&filter.app_name)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Delete one subscription.
pub async fn delete_subscription(pool: &PgPool, id: i64) -> Result<(), CoreError> {
    sqlx::query("DELETE FROM configuration_subscriptions WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Delete all subscriptions of an MTA in a space.
pub async fn delete_subscriptions_for_mta(
    pool: &PgPool,
    mta_id: &str,
    space_id: &str,
) -> Result<u64, CoreError> {
    let result =
        sqlx::query("DELETE FROM configuration_subscriptions WHERE mta_id = $1 AND space_id = $2")
            .bind(mta_id)
            .bind(space_id)
            .execute(pool)
            .await?;

    Ok(result.rows_affected())
}

// ============================================================================
// Descriptor Backup Operations
// ============================================================================

/// Store a descriptor backup with its checksum.
pub async fn add_descriptor_backup(
    pool: &PgPool,
    key: &DescriptorBackupKey,
    descriptor: &[u8],
) -> Result<i64, CoreError> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO descriptor_backups
            (mta_id, mta_version, space_id, namespace, checksum, descriptor, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, NOW())
        RETURNING id
        "#,
    )
    .bind(&key.mta_id)
    .bind(&key.mta_version)
    .bind(&key.space_id)
    .bind(&key.namespace)
    .bind(descriptor_checksum(descriptor))
    .bind(descriptor)
    .fetch_one(pool)
    .await?;

    Ok(id)
}

/// Find the newest backup for `key`, optionally with a given checksum.
pub async fn find_descriptor_backup(
    pool: &PgPool,
    key: &DescriptorBackupKey,
    checksum: Option<&str>,
) -> Result<Option<DescriptorBackupRecord>, CoreError> {
    let record = sqlx::query_as::<_, DescriptorBackupRecord>(
        r#"
        SELECT id, mta_id, mta_version, space_id, namespace, checksum, descriptor, created_at
        FROM descriptor_backups
        WHERE mta_id = $1
          AND space_id = $2
          AND mta_version = $3
          AND namespace IS NOT DISTINCT FROM $4
          AND ($5::text IS NULL OR checksum = $5)
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .bind(&key.mta_id)
    .bind(&key.space_id)
    .bind(&key.mta_version)
    .bind(&key.namespace)
    .bind(checksum)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Delete all backups of an MTA in a space.
pub async fn delete_descriptor_backups(
    pool: &PgPool,
    mta_id: &str,
    space_id: &str,
) -> Result<u64, CoreError> {
    let result = sqlx::query("DELETE FROM descriptor_backups WHERE mta_id = $1 AND space_id = $2")
        .bind(mta_id)
        .bind(space_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Check database health.
pub async fn health_check_db(pool: &PgPool) -> Result<bool, CoreError> {
    let result: Result<(i32,), _> = sqlx::query_as("SELECT 1").fetch_one(pool).await;
    Ok(result.is_ok())
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn load_variables(&self, process_id: &str) -> Result<Vec<VariableRecord>, CoreError> {
        load_variables(&self.pool, process_id).await
    }

    async fn save_variables(
        &self,
        process_id: &str,
        changes: &[VariableChange],
    ) -> Result<(), CoreError> {
        save_variables(&self.pool, process_id, changes).await
    }

    async fn delete_variables(&self, process_id: &str) -> Result<u64, CoreError> {
        delete_variables(&self.pool, process_id).await
    }

    async fn insert_historic_event(
        &self,
        process_id: &str,
        event_type: HistoricEventType,
    ) -> Result<(), CoreError> {
        insert_historic_event(&self.pool, process_id, event_type).await
    }

    async fn list_historic_events(
        &self,
        process_id: &str,
    ) -> Result<Vec<HistoricEventRecord>, CoreError> {
        list_historic_events(&self.pool, process_id).await
    }

    async fn try_acquire_lock(
        &self,
        resource_key: &str,
        process_id: &str,
    ) -> Result<LockAcquisition, CoreError> {
        try_acquire_lock(&self.pool, resource_key, process_id).await
    }

    async fn release_lock(&self, resource_key: &str, process_id: &str) -> Result<bool, CoreError> {
        release_lock(&self.pool, resource_key, process_id).await
    }

    async fn release_locks_for_process(&self, process_id: &str) -> Result<u64, CoreError> {
        release_locks_for_process(&self.pool, process_id).await
    }

    async fn list_locks(
        &self,
        process_id: Option<&str>,
    ) -> Result<Vec<OperationLockRecord>, CoreError> {
        list_locks(&self.pool, process_id).await
    }

    async fn release_stale_locks(&self, before: DateTime<Utc>) -> Result<u64, CoreError> {
        release_stale_locks(&self.pool, before).await
    }

    async fn add_configuration_entry(
        &self,
        entry: &NewConfigurationEntry,
    ) -> Result<i64, CoreError> {
        add_configuration_entry(&self.pool, entry).await
    }

    async fn update_configuration_entry_content(
        &self,
        id: i64,
        content: Option<&str>,
    ) -> Result<(), CoreError> {
        update_configuration_entry_content(&self.pool, id, content).await
    }

    async fn delete_configuration_entry(&self, id: i64) -> Result<(), CoreError> {
        delete_configuration_entry(&self.pool, id).await
    }

    async fn find_configuration_entries(
        &self,
        filter: &ConfigurationEntryFilter,
    ) -> Result<Vec<ConfigurationEntryRecord>, CoreError> {
        find_configuration_entries(&self.pool, filter).await
    }

    async fn add_subscription(&self, subscription: &NewSubscription) -> Result<i64, CoreError> {
        add_subscription(&self.pool, subscription).await
    }

    async fn update_subscription(
        &self,
        id: i64,
        subscription: &NewSubscription,
    ) -> Result<(), CoreError> {
        update_subscription(&self.pool, id, subscription).await
    }

    async fn find_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<SubscriptionRecord>, CoreError> {
        find_subscriptions(&self.pool, filter).await
    }

    async fn delete_subscription(&self, id: i64) -> Result<(), CoreError> {
        delete_subscription(&self.pool, id).await
    }

    async fn delete_subscriptions_for_mta(
        &self,
        mta_id: &str,
        space_id: &str,
    ) -> Result<u64, CoreError> {
        delete_subscriptions_for_mta(&self.pool, mta_id, space_id).await
    }

    async fn add_descriptor_backup(
        &self,
        key: &DescriptorBackupKey,
        descriptor: &[u8],
    ) -> Result<i64, CoreError> {
        add_descriptor_backup(&self.pool, key, descriptor).await
    }

    async fn find_descriptor_backup(
        &self,
        key: &DescriptorBackupKey,
        checksum: Option<&str>,
    ) -> Result<Option<DescriptorBackupRecord>, CoreError> {
        find_descriptor_backup(&self.pool, key, checksum).await
    }

    async fn delete_descriptor_backups(
        &self,
        mta_id: &str,
        space_id: &str,
    ) -> Result<u64, CoreError> {
        delete_descriptor_backups(&self.pool, mta_id, space_id).await
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        health_check_db(&self.pool).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

    // Helper to get a test database pool
    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        MIGRATOR.run(&pool).await.ok()?;
        Some(pool)
    }

    #[tokio::test]
    async fn test_variables_roundtrip() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };

        let process_id = Uuid::new_v4().to_string();
        save_variables(
            &pool,
            &process_id,
            &[
                ("space".into(), Some("\"dev\"".into())),
                ("org".into(), Some("\"acme\"".into())),
            ],
        )
        .await
        .unwrap();
        save_variables(&pool, &process_id, &[("org".into(), None)])
            .await
            .unwrap();

        let vars = load_variables(&pool, &process_id).await.unwrap();
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].name, "space");

        delete_variables(&pool, &process_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_contention() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };

        let key = format!("dev/app/{}", Uuid::new_v4());
        let p1 = Uuid::new_v4().to_string();
        let p2 = Uuid::new_v4().to_string();

        assert_eq!(
            try_acquire_lock(&pool, &key, &p1).await.unwrap(),
            LockAcquisition::Acquired
        );
        assert_eq!(
            try_acquire_lock(&pool, &key, &p2).await.unwrap(),
            LockAcquisition::HeldBy(p1.clone())
        );

        assert_eq!(release_locks_for_process(&pool, &p1).await.unwrap(), 1);
        assert_eq!(
            try_acquire_lock(&pool, &key, &p2).await.unwrap(),
            LockAcquisition::Acquired
        );
        release_lock(&pool, &key, &p2).await.unwrap();
    }

    #[tokio::test]
    async fn test_historic_events() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };

        let process_id = Uuid::new_v4().to_string();
        insert_historic_event(&pool, &process_id, HistoricEventType::Started)
            .await
            .unwrap();
        insert_historic_event(&pool, &process_id, HistoricEventType::Finished)
            .await
            .unwrap();

        let events = list_historic_events(&pool, &process_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, "FINISHED");
    }

    #[tokio::test]
    async fn test_configuration_entry_version_filter() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };

        let provider_id = format!("{}:srv", Uuid::new_v4());
        for version in ["1.0.0", "1.5.0"] {
            add_configuration_entry(
                &pool,
                &NewConfigurationEntry {
                    provider_nid: "mta".into(),
                    provider_id: provider_id.clone(),
                    provider_version: version.into(),
                    target_org: "org".into(),
                    target_space: "dev".into(),
                    content: None,
                    provider_space_id: None,
                },
            )
            .await
            .unwrap();
        }

        let mut filter = ConfigurationEntryFilter {
            provider_id: Some(provider_id),
            version: Some(">=1.1.0".into()),
            ..Default::default()
        };
        let found = find_configuration_entries(&pool, &filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].provider_version, "1.5.0");

        filter.version = None;
        for entry in find_configuration_entries(&pool, &filter).await.unwrap() {
            delete_configuration_entry(&pool, entry.id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_health_check() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };

        assert!(health_check_db(&pool).await.unwrap());
    }
}

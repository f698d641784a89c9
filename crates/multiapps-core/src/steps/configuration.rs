// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration entries, subscriptions and descriptor backups.
//!
//! These steps only talk to [`Persistence`](crate::persistence::Persistence);
//! nothing here calls the platform.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::context::{ProcessContext, variables};
use crate::error::Result;
use crate::model::RequiredDependency;
use crate::persistence::{
    ConfigurationEntryFilter, DescriptorBackupKey, NewConfigurationEntry, NewSubscription,
    SubscriptionFilter, descriptor_checksum,
};
use crate::step::{Step, StepPhase};

/// Namespace id of entries published by deployed MTAs.
pub const MTA_PROVIDER_NID: &str = "mta";

/// Publishes `PROVIDED_DEPENDENCIES` as configuration entries in the target
/// space. An entry with the same provider id and version is updated in place.
pub struct PublishConfigurationEntriesStep;

#[async_trait]
impl Step for PublishConfigurationEntriesStep {
    fn name(&self) -> &'static str {
        "publishConfigurationEntries"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        let provided = ctx.require(variables::PROVIDED_DEPENDENCIES)?;
        let org = ctx.require(variables::ORG)?;
        let space = ctx.require(variables::SPACE)?;
        let space_guid = ctx.get(variables::SPACE_GUID)?;
        let persistence = ctx.persistence().clone();

        let mut published = Vec::with_capacity(provided.len());
        for dependency in &provided {
            let filter = ConfigurationEntryFilter {
                provider_nid: Some(MTA_PROVIDER_NID.to_string()),
                provider_id: Some(dependency.provider_id.clone()),
                version: Some(dependency.version.clone()),
                target_org: Some(org.clone()),
                target_space: Some(space.clone()),
                ..Default::default()
            };
            let existing = persistence.find_configuration_entries(&filter).await?;
            let id = match existing.first() {
                Some(entry) => {
                    persistence
                        .update_configuration_entry_content(entry.id, dependency.content.as_deref())
                        .await?;
                    entry.id
                }
                None => {
                    let entry = NewConfigurationEntry {
                        provider_nid: MTA_PROVIDER_NID.to_string(),
                        provider_id: dependency.provider_id.clone(),
                        provider_version: dependency.version.clone(),
                        target_org: org.clone(),
                        target_space: space.clone(),
                        content: dependency.content.clone(),
                        provider_space_id: space_guid.clone(),
                    };
                    persistence.add_configuration_entry(&entry).await?
                }
            };
            ctx.logger().info(format!(
                "Published configuration entry \"{}\" version {}",
                dependency.provider_id, dependency.version
            ));
            published.push(id);
        }

        ctx.set(variables::PUBLISHED_ENTRIES, &published)?;
        Ok(StepPhase::Done)
    }

    fn step_error_message(&self, _ctx: &ProcessContext) -> String {
        "Error publishing configuration entries".to_string()
    }
}

/// Deletes entries of this MTA in the target space that the current
/// deployment did not publish.
pub struct DeleteDiscontinuedEntriesStep;

#[async_trait]
impl Step for DeleteDiscontinuedEntriesStep {
    fn name(&self) -> &'static str {
        "deleteDiscontinuedConfigurationEntries"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        let mta_id = ctx.require(variables::MTA_ID)?;
        let published = ctx.require(variables::PUBLISHED_ENTRIES)?;
        let filter = ConfigurationEntryFilter {
            provider_nid: Some(MTA_PROVIDER_NID.to_string()),
            target_org: Some(ctx.require(variables::ORG)?),
            target_space: Some(ctx.require(variables::SPACE)?),
            ..Default::default()
        };
        let persistence = ctx.persistence().clone();
        let prefix = format!("{}:", mta_id);

        let mut deleted = ctx.require(variables::DELETED_ENTRIES)?;
        for entry in persistence.find_configuration_entries(&filter).await? {
            if !entry.provider_id.starts_with(&prefix) || published.contains(&entry.id) {
                continue;
            }
            persistence.delete_configuration_entry(entry.id).await?;
            ctx.logger().info(format!(
                "Deleted discontinued configuration entry \"{}\" version {}",
                entry.provider_id, entry.provider_version
            ));
            deleted.push(entry.id);
            ctx.set(variables::DELETED_ENTRIES, &deleted)?;
        }
        Ok(StepPhase::Done)
    }

    fn step_error_message(&self, _ctx: &ProcessContext) -> String {
        "Error deleting discontinued configuration entries".to_string()
    }
}

fn subscription(mta_id: &str, space_id: &str, dependency: &RequiredDependency) -> NewSubscription {
    let filter = json!({
        "providerNid": dependency.provider_nid,
        "providerId": dependency.provider_id,
        "version": dependency.version,
        "targetSpace": dependency.target_space,
    });
    NewSubscription {
        mta_id: mta_id.to_string(),
        space_id: space_id.to_string(),
        app_name: dependency.app_name.clone(),
        filter: filter.to_string(),
        module: json!({ "name": dependency.app_name }).to_string(),
        resource_name: dependency.resource_name.clone(),
        resource_properties: dependency
            .properties
            .clone()
            .unwrap_or_else(|| "{}".to_string()),
    }
}

/// Makes the stored subscriptions of this MTA match `REQUIRED_DEPENDENCIES`.
///
/// Subscriptions are keyed by application and resource name. Matching ones
/// are updated, new ones added and the rest deleted.
pub struct UpdateSubscriptionsStep;

#[async_trait]
impl Step for UpdateSubscriptionsStep {
    fn name(&self) -> &'static str {
        "updateSubscriptions"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        let mta_id = ctx.require(variables::MTA_ID)?;
        let space_id = ctx.require(variables::SPACE_GUID)?;
        let required = ctx.require(variables::REQUIRED_DEPENDENCIES)?;
        let persistence = ctx.persistence().clone();

        let mut existing = persistence
            .find_subscriptions(&SubscriptionFilter {
                mta_id: Some(mta_id.clone()),
                space_id: Some(space_id.clone()),
                app_name: None,
            })
            .await?;

        let (mut added, mut updated) = (0, 0);
        for dependency in &required {
            let desired = subscription(&mta_id, &space_id, dependency);
            let position = existing.iter().position(|s| {
                s.app_name == desired.app_name && s.resource_name == desired.resource_name
            });
            match position {
                Some(position) => {
                    let current = existing.swap_remove(position);
                    persistence.update_subscription(current.id, &desired).await?;
                    updated += 1;
                }
                None => {
                    persistence.add_subscription(&desired).await?;
                    added += 1;
                }
            }
        }
        for stale in &existing {
            debug!(app = %stale.app_name, resource = %stale.resource_name, "Deleting subscription");
            persistence.delete_subscription(stale.id).await?;
        }

        ctx.logger().info(format!(
            "Subscriptions: {} added, {} updated, {} deleted",
            added,
            updated,
            existing.len()
        ));
        Ok(StepPhase::Done)
    }

    fn step_error_message(&self, _ctx: &ProcessContext) -> String {
        "Error updating configuration subscriptions".to_string()
    }
}

/// Stores `DEPLOYMENT_DESCRIPTOR` once per MTA version and checksum.
pub struct BackupDescriptorStep;

#[async_trait]
impl Step for BackupDescriptorStep {
    fn name(&self) -> &'static str {
        "backupDescriptor"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> Result<StepPhase> {
        let Some(descriptor) = ctx.get(variables::DEPLOYMENT_DESCRIPTOR)? else {
            return Ok(StepPhase::Done);
        };
        let key = DescriptorBackupKey {
            mta_id: ctx.require(variables::MTA_ID)?,
            space_id: ctx.require(variables::SPACE_GUID)?,
            namespace: ctx.get(variables::MTA_NAMESPACE)?,
            mta_version: ctx.require(variables::MTA_VERSION)?,
        };
        let persistence = ctx.persistence().clone();
        let checksum = descriptor_checksum(descriptor.as_bytes());

        if persistence
            .find_descriptor_backup(&key, Some(&checksum))
            .await?
            .is_some()
        {
            ctx.logger().debug(format!(
                "Descriptor of \"{}\" version {} is already backed up",
                key.mta_id, key.mta_version
            ));
        } else {
            persistence
                .add_descriptor_backup(&key, descriptor.as_bytes())
                .await?;
            ctx.logger().info(format!(
                "Backed up descriptor of \"{}\" version {}",
                key.mta_id, key.mta_version
            ));
        }
        Ok(StepPhase::Done)
    }

    fn step_error_message(&self, _ctx: &ProcessContext) -> String {
        "Error backing up deployment descriptor".to_string()
    }
}

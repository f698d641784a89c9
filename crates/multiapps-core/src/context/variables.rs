// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Catalog of process variables.
//!
//! Names are the keys under which values are persisted, so they must stay
//! stable across releases.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use multiapps_platform::{OperationType, Parameters, ServiceBroker, ServiceKey};

use super::Variable;
use crate::actions::Action;
use crate::error::ErrorKind;
use crate::model::{
    AppDescriptor, DeployedMta, ProvidedDependency, RequiredDependency, ServiceDescriptor,
};
use crate::step::StepPhase;
use crate::steps::incremental::IncrementalUpdateState;
use crate::steps::version::VersionRule;

// ============================================================================
// Target and process
// ============================================================================

pub const USER: Variable<String> = Variable::new("user");
pub const ORG: Variable<String> = Variable::new("org");
pub const SPACE: Variable<String> = Variable::new("space");
pub const SPACE_GUID: Variable<String> = Variable::new("spaceGuid");
pub const MTA_ID: Variable<String> = Variable::new("mtaId");
pub const MTA_VERSION: Variable<String> = Variable::new("mtaVersion");
pub const MTA_NAMESPACE: Variable<String> = Variable::new("mtaNamespace");
pub const DEPLOYED_MTA: Variable<DeployedMta> = Variable::new("deployedMta");

/// Tolerate 403 responses instead of failing. Falls back to the process default.
pub const NO_FAIL_ON_MISSING_PERMISSIONS: Variable<bool> =
    Variable::new("noFailOnMissingPermissions");

// ============================================================================
// Step bookkeeping
// ============================================================================

pub const STEP_PHASE: Variable<StepPhase> =
    Variable::with_default("stepPhase", || StepPhase::Execute);
pub const ASYNC_STEP_EXECUTION_INDEX: Variable<usize> =
    Variable::with_default("asyncStepExecutionIndex", || 0);
pub const STEP_START_TIME: Variable<DateTime<Utc>> = Variable::new("stepStartTime");
pub const ERROR_TYPE: Variable<ErrorKind> = Variable::new("errorType");
pub const STEP_WARNINGS: Variable<Vec<String>> =
    Variable::with_default("stepWarnings", Vec::new);
/// Remote reason of the async operation that failed during the current poll.
pub const ASYNC_FAILURE_DETAILS: Variable<String> = Variable::new("asyncFailureDetails");
/// Async execution hooks that already ran for the current step.
pub const COMPLETED_HOOKS: Variable<Vec<String>> =
    Variable::with_default("completedHooks", Vec::new);

// ============================================================================
// Services
// ============================================================================

pub const SERVICE_TO_PROCESS: Variable<ServiceDescriptor> = Variable::new("serviceToProcess");
pub const SERVICES_TO_PROCESS: Variable<Vec<ServiceDescriptor>> =
    Variable::with_default("servicesToProcess", Vec::new);
pub const SERVICE_ACTIONS_TO_EXECUTE: Variable<Vec<Action>> =
    Variable::with_default("serviceActionsToExecute", Vec::new);
/// Allow deleting services that must be recreated or are in a failed state.
pub const DELETE_SERVICES: Variable<bool> = Variable::with_default("deleteServices", || false);
pub const DELETE_SERVICE_KEYS: Variable<bool> =
    Variable::with_default("deleteServiceKeys", || false);
/// Operations started per service name, consumed by the service poller.
pub const TRIGGERED_SERVICE_OPERATIONS: Variable<BTreeMap<String, OperationType>> =
    Variable::with_default("triggeredServiceOperations", BTreeMap::new);
pub const SERVICES_TO_POLL: Variable<Vec<ServiceDescriptor>> =
    Variable::with_default("servicesToPoll", Vec::new);
pub const IS_SERVICE_UPDATED: Variable<bool> =
    Variable::with_default("isServiceUpdated", || false);
/// Services deleted asynchronously that must be created again once gone.
pub const SERVICES_TO_RECREATE: Variable<Vec<String>> =
    Variable::with_default("servicesToRecreate", Vec::new);
/// Services of the previous deployment that are no longer declared.
pub const SERVICES_TO_DELETE: Variable<Vec<ServiceDescriptor>> =
    Variable::with_default("servicesToDelete", Vec::new);

// ============================================================================
// Service keys
// ============================================================================

pub const SERVICE_KEYS_TO_CREATE: Variable<Vec<ServiceKey>> =
    Variable::with_default("serviceKeysToCreate", Vec::new);
pub const SERVICE_KEYS_TO_DELETE: Variable<Vec<ServiceKey>> =
    Variable::with_default("serviceKeysToDelete", Vec::new);
pub const SERVICE_KEYS_TO_UPDATE_METADATA: Variable<Vec<ServiceKey>> =
    Variable::with_default("serviceKeysToUpdateMetadata", Vec::new);
/// Key operations started per key name, consumed by the key poller.
pub const TRIGGERED_SERVICE_KEY_OPERATIONS: Variable<BTreeMap<String, OperationType>> =
    Variable::with_default("triggeredServiceKeyOperations", BTreeMap::new);

// ============================================================================
// Applications and bindings
// ============================================================================

pub const APP_TO_PROCESS: Variable<AppDescriptor> = Variable::new("appToProcess");
pub const APPS_TO_DEPLOY: Variable<Vec<AppDescriptor>> =
    Variable::with_default("appsToDeploy", Vec::new);
pub const APP_ACTIONS_TO_EXECUTE: Variable<Vec<Action>> =
    Variable::with_default("appActionsToExecute", Vec::new);
pub const SERVICE_TO_UNBIND_BIND: Variable<String> = Variable::new("serviceToUnbindBind");
pub const SHOULD_UNBIND_SERVICE: Variable<bool> =
    Variable::with_default("shouldUnbindServiceFromApp", || false);
pub const SHOULD_BIND_SERVICE: Variable<bool> =
    Variable::with_default("shouldBindServiceToApp", || false);
pub const SHOULD_RECREATE_SERVICE_BINDING: Variable<bool> =
    Variable::with_default("shouldRecreateServiceBinding", || false);
pub const SERVICE_BINDING_PARAMETERS: Variable<Parameters> =
    Variable::with_default("serviceBindingParameters", BTreeMap::new);
/// Binding operations started per `app/service` pair.
pub const TRIGGERED_BINDING_OPERATIONS: Variable<BTreeMap<String, OperationType>> =
    Variable::with_default("triggeredBindingOperations", BTreeMap::new);
/// Services whose bindings must be removed or created for the current app.
pub const SERVICES_TO_UNBIND: Variable<Vec<String>> =
    Variable::with_default("servicesToUnbind", Vec::new);
pub const SERVICES_TO_BIND: Variable<Vec<String>> =
    Variable::with_default("servicesToBind", Vec::new);
pub const KEEP_ORIGINAL_APP_NAMES: Variable<bool> =
    Variable::with_default("keepOriginalAppNamesAfterDeploy", || false);
/// Modules selected for a partial deployment; unset means all modules.
pub const MODULES_FOR_DEPLOYMENT: Variable<Vec<String>> = Variable::new("modulesForDeployment");
pub const APPS_TO_RENAME: Variable<Vec<String>> = Variable::with_default("appsToRename", Vec::new);
pub const APPS_TO_UNDEPLOY: Variable<Vec<String>> =
    Variable::with_default("appsToUndeploy", Vec::new);

// ============================================================================
// Start, execution and scaling
// ============================================================================

/// Build started by the staging step, followed by its poller.
pub const BUILD_GUID: Variable<String> = Variable::new("buildGuid");
pub const STAGE_TIMEOUT_SECS: Variable<u64> = Variable::with_default("stageTimeout", || 3600);
pub const FAIL_ON_CRASH: Variable<bool> = Variable::with_default("failOnCrash", || true);
pub const START_TIMEOUT_SECS: Variable<u64> = Variable::with_default("startTimeout", || 3600);
pub const EXECUTE_START_TIME: Variable<DateTime<Utc>> = Variable::new("executeStartTime");
pub const LOGS_OFFSET: Variable<DateTime<Utc>> = Variable::new("logsOffsetForAppExecution");
pub const INCREMENTAL_UPDATE_STATE: Variable<IncrementalUpdateState> =
    Variable::new("incrementalAppInstanceUpdateConfiguration");
pub const ROLLBACK_PERFORMED: Variable<bool> =
    Variable::with_default("rollbackPerformed", || false);

// ============================================================================
// Service brokers
// ============================================================================

pub const SERVICE_BROKER_ASYNC_JOB_ID: Variable<String> = Variable::new("serviceBrokerAsyncJobId");
pub const CREATED_OR_UPDATED_SERVICE_BROKER: Variable<ServiceBroker> =
    Variable::new("createdOrUpdatedServiceBroker");
/// Brokers registered by applications that are being undeployed.
pub const SERVICE_BROKERS_TO_DELETE: Variable<Vec<String>> =
    Variable::with_default("serviceBrokersToDelete", Vec::new);
/// Deletion jobs per broker name, consumed by the broker deletion poller.
pub const SERVICE_BROKER_DELETION_JOBS: Variable<BTreeMap<String, String>> =
    Variable::with_default("serviceBrokerDeletionJobs", BTreeMap::new);

// ============================================================================
// Versions and configuration
// ============================================================================

pub const VERSION_RULE: Variable<VersionRule> =
    Variable::with_default("versionRule", VersionRule::default);
pub const PROVIDED_DEPENDENCIES: Variable<Vec<ProvidedDependency>> =
    Variable::with_default("providedDependencies", Vec::new);
pub const REQUIRED_DEPENDENCIES: Variable<Vec<RequiredDependency>> =
    Variable::with_default("requiredDependencies", Vec::new);
pub const PUBLISHED_ENTRIES: Variable<Vec<i64>> =
    Variable::with_default("publishedEntries", Vec::new);
pub const DELETED_ENTRIES: Variable<Vec<i64>> = Variable::with_default("deletedEntries", Vec::new);
/// Serialized deployment descriptor, kept as a backup per MTA version.
pub const DEPLOYMENT_DESCRIPTOR: Variable<String> = Variable::new("deploymentDescriptor");

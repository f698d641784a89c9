// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-level tests: suspension and resumption across workers, resource
//! locks between processes, and aborts.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::Harness;
use multiapps_core::context::variables;
use multiapps_core::model::{AppDescriptor, DeployedApp, DeployedMta, ServiceDescriptor};
use multiapps_core::step::{ProcessOutcome, Step, StepPhase, StepRunner, end_process};
use multiapps_core::steps::app::CreateOrUpdateAppStep;
use multiapps_core::steps::obsolete::{DeleteApplicationsStep, DetectObsoleteApplicationsStep};
use multiapps_core::steps::broker::{
    CREATE_SERVICE_BROKER, SERVICE_BROKER_PASSWORD, SERVICE_BROKER_URL, SERVICE_BROKER_USERNAME,
};
use multiapps_core::steps::service::CreateOrUpdateServiceStep;
use multiapps_core::{BoundedPool, Config, CoreError, ErrorKind, Persistence, ProcessFactory};
use multiapps_platform::{Application, MockPlatformClient, PlatformError};
use serde_json::json;

fn db() -> ServiceDescriptor {
    ServiceDescriptor {
        name: "db".into(),
        offering: Some("postgresql".into()),
        plan: Some("small".into()),
        ..Default::default()
    }
}

fn service_step() -> Arc<dyn Step> {
    Arc::new(CreateOrUpdateServiceStep::new(BoundedPool::new(4)))
}

async fn start_service_process(harness: &Harness, process_id: &str) {
    let mut ctx = harness.start(process_id);
    ctx.set(variables::SERVICE_TO_PROCESS, &db()).unwrap();
    ctx.flush().await.unwrap();
}

#[tokio::test]
async fn test_service_creation_survives_worker_change() {
    let harness = Harness::new(MockPlatformClient::asynchronous()).await;
    start_service_process(&harness, "p-1").await;
    let step = service_step();

    assert_eq!(
        harness.invoke(step.clone(), "p-1").await.unwrap(),
        StepPhase::Poll
    );
    assert_eq!(
        harness.invoke(step.clone(), "p-1").await.unwrap(),
        StepPhase::Poll
    );

    harness.client.complete_service_operation("db").await;
    assert_eq!(
        harness.invoke(step.clone(), "p-1").await.unwrap(),
        StepPhase::Done
    );
    assert_eq!(
        harness.client.call_count("create_service_instance").await,
        1
    );

    let ctx = harness.resume("p-1").await;
    assert_eq!(ctx.require(variables::STEP_PHASE).unwrap(), StepPhase::Done);
    assert!(harness.persistence.list_locks(Some("p-1")).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_second_process_cannot_touch_locked_service() {
    let harness = Harness::new(MockPlatformClient::asynchronous()).await;
    start_service_process(&harness, "p-1").await;
    start_service_process(&harness, "p-2").await;
    let step = service_step();

    assert_eq!(
        harness.invoke(step.clone(), "p-1").await.unwrap(),
        StepPhase::Poll
    );

    let err = harness.invoke(step.clone(), "p-2").await.unwrap_err();
    assert!(matches!(err, CoreError::Conflict { ref holder, .. } if holder == "p-1"));
    assert_eq!(err.kind(), ErrorKind::InternalError);
    let ctx = harness.resume("p-2").await;
    assert_eq!(ctx.require(variables::STEP_PHASE).unwrap(), StepPhase::Retry);

    harness.client.complete_service_operation("db").await;
    assert_eq!(
        harness.invoke(step.clone(), "p-1").await.unwrap(),
        StepPhase::Done
    );
    assert!(harness.invoke(step.clone(), "p-2").await.is_ok());
    assert_eq!(
        harness.client.call_count("create_service_instance").await,
        1
    );
}

#[tokio::test]
async fn test_aborted_process_stops_and_releases_locks() {
    let harness = Harness::new(MockPlatformClient::asynchronous()).await;
    start_service_process(&harness, "p-1").await;
    let step = service_step();

    assert_eq!(
        harness.invoke(step.clone(), "p-1").await.unwrap(),
        StepPhase::Poll
    );
    assert_eq!(
        harness.persistence.list_locks(Some("p-1")).await.unwrap().len(),
        1
    );

    let mut ctx = harness.resume("p-1").await;
    end_process(&mut ctx, ProcessOutcome::Aborted).await.unwrap();
    assert!(harness.persistence.list_locks(Some("p-1")).await.unwrap().is_empty());

    let err = harness.invoke(step.clone(), "p-1").await.unwrap_err();
    assert!(matches!(err, CoreError::Aborted { .. }));
    assert_eq!(harness.client.call_count("get_service_instance").await, 1);
}

#[tokio::test]
async fn test_finished_process_is_recorded() {
    let harness = Harness::new(MockPlatformClient::new()).await;
    start_service_process(&harness, "p-1").await;

    let step = service_step();
    let mut phase = harness.invoke(step.clone(), "p-1").await.unwrap();
    for _ in 0..3 {
        if phase == StepPhase::Done {
            break;
        }
        phase = harness.invoke(step.clone(), "p-1").await.unwrap();
    }
    assert_eq!(phase, StepPhase::Done);
    let mut ctx = harness.resume("p-1").await;
    end_process(&mut ctx, ProcessOutcome::Finished).await.unwrap();

    let events = harness.persistence.list_historic_events("p-1").await.unwrap();
    assert_eq!(
        events.last().map(|e| e.event_type.as_str()),
        Some("FINISHED")
    );
}

#[tokio::test]
async fn test_app_rollout_removes_obsolete_apps() {
    let harness = Harness::new(MockPlatformClient::new()).await;
    harness
        .client
        .insert_application(Application {
            name: "legacy".into(),
            ..Default::default()
        })
        .await;

    let web = AppDescriptor {
        name: "web".into(),
        module_name: Some("web".into()),
        memory_mb: 256,
        instances: 1,
        ..Default::default()
    };
    let deployed = DeployedMta {
        id: "shop".into(),
        version: Some("1.0.0".into()),
        apps: vec![DeployedApp {
            name: "legacy".into(),
            module_name: Some("legacy".into()),
            services: Vec::new(),
        }],
        services: Vec::new(),
    };
    let mut ctx = harness.start("p-1");
    ctx.set(variables::APP_TO_PROCESS, &web).unwrap();
    ctx.set(variables::APPS_TO_DEPLOY, &vec![web.clone()]).unwrap();
    ctx.set(variables::DEPLOYED_MTA, &deployed).unwrap();
    ctx.flush().await.unwrap();

    let steps: Vec<Arc<dyn Step>> = vec![
        Arc::new(CreateOrUpdateAppStep),
        Arc::new(DetectObsoleteApplicationsStep),
        Arc::new(DeleteApplicationsStep),
    ];
    for step in steps {
        assert_eq!(harness.invoke(step, "p-1").await.unwrap(), StepPhase::Done);
    }

    assert!(harness.client.application("web").await.is_some());
    assert!(harness.client.application("legacy").await.is_none());
    let ctx = harness.resume("p-1").await;
    assert!(ctx.require(variables::APPS_TO_UNDEPLOY).unwrap().is_empty());
}

fn config(fail_safe: bool) -> Config {
    Config {
        database_url: "sqlite::memory:".into(),
        max_parallel_operations: 3,
        lock_timeout: Duration::from_secs(3600),
        lock_sweep_interval: Duration::from_secs(60),
        broker_poll_timeout: Duration::from_secs(90),
        fail_safe,
    }
}

fn processes(harness: &Harness, fail_safe: bool) -> ProcessFactory {
    ProcessFactory::new(
        &config(fail_safe),
        harness.persistence.clone(),
        harness.factory.clone(),
    )
}

#[tokio::test]
async fn test_factory_carries_worker_settings() {
    let harness = Harness::new(MockPlatformClient::new()).await;
    let processes = processes(&harness, false);

    assert_eq!(processes.pool().capacity(), 3);
    let ctx = processes.start("p-1");
    assert!(!ctx.fail_safe().unwrap());
    assert_eq!(
        processes.create_or_update_service_broker().timeout(&ctx),
        Some(Duration::from_secs(90))
    );
    assert_eq!(
        processes.delete_service_brokers().timeout(&ctx),
        Some(Duration::from_secs(90))
    );
}

#[tokio::test]
async fn test_fail_safe_default_survives_resume() {
    let harness = Harness::new(MockPlatformClient::new()).await;
    harness
        .client
        .fail_on("create_service_broker", PlatformError::forbidden("nope"))
        .await;
    let processes = processes(&harness, true);

    let mut broker_app = AppDescriptor {
        name: "broker-app".into(),
        ..Default::default()
    };
    for (key, value) in [
        (CREATE_SERVICE_BROKER, json!(true)),
        (SERVICE_BROKER_USERNAME, json!("admin")),
        (SERVICE_BROKER_PASSWORD, json!("secret")),
        (SERVICE_BROKER_URL, json!("https://broker.example.com")),
    ] {
        broker_app.attributes.insert(key.to_string(), value);
    }
    let mut ctx = processes.start("p-1");
    for (variable, value) in [
        (variables::USER, "deployer"),
        (variables::ORG, "org"),
        (variables::SPACE, "space"),
        (variables::SPACE_GUID, "space-guid"),
    ] {
        ctx.set(variable, &value.to_string()).unwrap();
    }
    ctx.set(variables::APP_TO_PROCESS, &broker_app).unwrap();
    ctx.flush().await.unwrap();

    let mut ctx = processes.resume("p-1").await.unwrap();
    assert!(ctx.fail_safe().unwrap());
    let step = Arc::new(processes.create_or_update_service_broker());
    assert_eq!(StepRunner::new(step).run(&mut ctx).await.unwrap(), StepPhase::Done);
    assert!(
        ctx.require(variables::STEP_WARNINGS)
            .unwrap()
            .iter()
            .any(|w| w.starts_with("Creating service broker \"broker-app\" failed"))
    );

    let strict = self::processes(&harness, false).resume("p-1").await.unwrap();
    assert!(!strict.fail_safe().unwrap());
}

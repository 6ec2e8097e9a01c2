// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for health_monitor module - assessment, bounded recovery, supervision loop.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use serde_json::json;

use common::{TestContext, fast_budget};
use hangar_control::gateway::{ClusterGateway, MockGateway, MockOperation, WorkloadPhase};
use hangar_control::gateway::mock::simple_spec;
use hangar_control::error::Error;
use hangar_control::health_monitor::{
    HealthMonitor, HealthMonitorConfig, HealthStatus, HealthStore, MAX_RECOVERY_ATTEMPTS,
};

/// Wait until any recovery spawned for `machine_id` has released its lock.
async fn settle(health: &HealthMonitor, machine_id: &str) {
    drop(health.lock_machine(machine_id).await);
}

#[tokio::test]
async fn test_recovery_is_bounded() {
    let ctx = TestContext::new();
    ctx.gateway
        .set_create_state(WorkloadPhase::Pending, false, Some("CrashLoopBackOff"))
        .await;
    ctx.create_machine(json!({"id": "m1", "image": "demo:1"})).await;

    for attempt in 1..=MAX_RECOVERY_ATTEMPTS {
        let record = ctx.health.assess_machine("m1").await.unwrap();
        assert_eq!(record.status, HealthStatus::Recovering);
        assert_eq!(record.recovery_attempts, attempt);
        assert!(record.message.contains("CrashLoopBackOff"));
        settle(&ctx.health, "m1").await;
    }
    assert_eq!(ctx.gateway.created_specs().await.len(), 1 + MAX_RECOVERY_ATTEMPTS as usize);

    let record = ctx.health.assess_machine("m1").await.unwrap();
    assert_eq!(record.status, HealthStatus::Unhealthy);
    assert_eq!(record.recovery_attempts, MAX_RECOVERY_ATTEMPTS);
    assert!(record.message.contains("max recovery attempts reached"));

    let mutations = ctx.gateway.mutation_count().await;
    let record = ctx.health.assess_machine("m1").await.unwrap();
    assert_eq!(record.status, HealthStatus::Unhealthy);
    settle(&ctx.health, "m1").await;
    assert_eq!(ctx.gateway.mutation_count().await, mutations);
}

#[tokio::test]
async fn test_recovery_recreates_identical_spec() {
    let ctx = TestContext::new();
    ctx.gateway
        .set_create_state(WorkloadPhase::Failed, false, None)
        .await;
    ctx.create_machine(json!({"id": "m1", "template": "browser"}))
        .await;

    ctx.health.assess_machine("m1").await.unwrap();
    settle(&ctx.health, "m1").await;

    let specs = ctx.gateway.created_specs().await;
    assert_eq!(specs.len(), 2);
    assert_eq!(specs[0], specs[1]);

    let record = ctx.health.status("m1").await.unwrap();
    assert_eq!(record.status, HealthStatus::Recovering);
    assert!(record.message.contains("recreated the workload"));
}

#[tokio::test]
async fn test_healthy_check_resets_attempts() {
    let ctx = TestContext::new();
    ctx.gateway
        .set_create_state(WorkloadPhase::Pending, false, Some("ImagePullBackOff"))
        .await;
    ctx.create_machine(json!({"id": "m1", "image": "demo:1"})).await;

    for _ in 0..2 {
        ctx.health.assess_machine("m1").await.unwrap();
        settle(&ctx.health, "m1").await;
    }

    ctx.gateway
        .set_state("m1", WorkloadPhase::Running, true, None)
        .await;
    let record = ctx.health.assess_machine("m1").await.unwrap();
    assert_eq!(record.status, HealthStatus::Healthy);
    assert_eq!(record.recovery_attempts, 0);

    ctx.gateway
        .set_state("m1", WorkloadPhase::Failed, false, None)
        .await;
    let record = ctx.health.assess_machine("m1").await.unwrap();
    assert_eq!(record.recovery_attempts, 1);
    settle(&ctx.health, "m1").await;
}

#[tokio::test]
async fn test_failed_recovery_marks_unhealthy() {
    let ctx = TestContext::new();
    ctx.create_machine(json!({"id": "m1", "image": "demo:1"})).await;
    ctx.gateway
        .set_state("m1", WorkloadPhase::Failed, false, Some("Error"))
        .await;
    ctx.gateway.fail(MockOperation::Create).await;

    ctx.health.assess_machine("m1").await.unwrap();
    settle(&ctx.health, "m1").await;

    let (status, record) = ctx.get("/machines/m1/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["status"], "unhealthy");
    assert_eq!(record["recoveryAttempts"], 1);
    assert!(record["message"].as_str().unwrap().contains("failed"));
}

#[tokio::test]
async fn test_reconcile_assesses_every_machine() {
    let ctx = TestContext::new();
    ctx.create_machine(json!({"id": "m1", "image": "demo:1"})).await;
    ctx.create_machine(json!({"id": "m2", "image": "demo:1"})).await;
    ctx.gateway
        .set_state("m2", WorkloadPhase::Failed, false, None)
        .await;

    let (_, records) = ctx.get("/health").await;
    assert_eq!(records[0]["status"], "unknown");

    for handle in ctx.health.reconcile().await.unwrap() {
        handle.await.unwrap();
    }
    settle(&ctx.health, "m2").await;

    let (status, records) = ctx.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    let records = records.as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["id"], "m1");
    assert_eq!(records[0]["status"], "healthy");
    assert_eq!(records[1]["id"], "m2");
    assert_eq!(records[1]["status"], "recovering");
}

#[tokio::test]
async fn test_reconcile_reports_list_failure() {
    let ctx = TestContext::new();
    ctx.gateway.fail(MockOperation::ListAll).await;
    assert!(ctx.health.reconcile().await.is_err());
}

#[tokio::test]
async fn test_deleted_machine_is_forgotten() {
    let ctx = TestContext::new();
    ctx.create_machine(json!({"id": "m1", "image": "demo:1"})).await;
    let (status, record) = ctx.get("/machines/m1/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["status"], "healthy");

    ctx.delete("/machines/m1").await;

    let (status, _) = ctx.get("/machines/m1/health").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (_, records) = ctx.get("/health").await;
    assert!(records.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_deleted_machine_is_not_recovered() {
    let ctx = TestContext::new();
    ctx.create_machine(json!({"id": "m1", "image": "demo:1"})).await;
    ctx.gateway
        .set_state("m1", WorkloadPhase::Failed, false, None)
        .await;
    ctx.gateway.set_delete_lag(3).await;

    let (status, _) = ctx.delete("/machines/m1").await;
    assert_eq!(status, StatusCode::OK);

    let err = ctx.health.assess_machine("m1").await.unwrap_err();
    assert!(matches!(err, Error::MachineNotFound(_)));
    for handle in ctx.health.reconcile().await.unwrap() {
        handle.await.unwrap();
    }
    assert!(ctx.health.assess_machine("m1").await.is_err());
    settle(&ctx.health, "m1").await;

    assert!(ctx.gateway.workload("m1").await.is_none());
    assert_eq!(ctx.gateway.created_specs().await.len(), 1);
    let (_, records) = ctx.get("/health").await;
    assert!(records.as_array().unwrap().is_empty());

    // the same id can be created again once the old workload is gone
    while ctx.gateway.find("m1").await.unwrap().is_some() {}
    ctx.create_machine(json!({"id": "m1", "image": "demo:1"})).await;
    assert!(!ctx.health.is_deleted("m1"));
    let record = ctx.health.assess_machine("m1").await.unwrap();
    assert_eq!(record.status, HealthStatus::Healthy);
}

#[tokio::test]
async fn test_terminating_workload_is_skipped() {
    let ctx = TestContext::new();
    ctx.create_machine(json!({"id": "m1", "image": "demo:1"})).await;
    ctx.gateway.set_delete_lag(2).await;
    ctx.gateway.delete("m1").await.unwrap();
    let mutations = ctx.gateway.mutation_count().await;

    let err = ctx.health.assess_machine("m1").await.unwrap_err();
    assert!(matches!(err, Error::MachineNotFound(_)));
    settle(&ctx.health, "m1").await;
    assert_eq!(ctx.gateway.mutation_count().await, mutations);
}

#[tokio::test]
async fn test_unknown_ids_leave_no_lock_entries() {
    let ctx = TestContext::new();
    for i in 0..1000 {
        assert!(ctx.health.status(&format!("ghost-{}", i)).await.is_err());
    }
    assert_eq!(ctx.health.lock_entries(), 0);

    ctx.create_machine(json!({"id": "m1", "image": "demo:1"})).await;
    ctx.health.assess_machine("m1").await.unwrap();
    assert_eq!(ctx.health.lock_entries(), 1);

    ctx.gateway.delete("m1").await.unwrap();
    assert!(ctx.health.assess_machine("m1").await.is_err());
    assert_eq!(ctx.health.lock_entries(), 0);
}

/// Workload creations and deletions in call order.
async fn lifecycle_calls(gateway: &MockGateway) -> Vec<MockOperation> {
    gateway
        .calls()
        .await
        .into_iter()
        .filter(|op| matches!(op, MockOperation::Create | MockOperation::Delete))
        .collect()
}

#[tokio::test]
async fn test_concurrent_assessments_are_serialized() {
    let ctx = TestContext::new();
    ctx.gateway
        .set_create_state(WorkloadPhase::Pending, false, Some("CrashLoopBackOff"))
        .await;
    ctx.create_machine(json!({"id": "m1", "image": "demo:1"})).await;

    let (first, second, third) = tokio::join!(
        ctx.health.assess_machine("m1"),
        ctx.health.assess_machine("m1"),
        ctx.health.assess_machine("m1"),
    );
    let mut attempts: Vec<u32> = [first, second, third]
        .into_iter()
        .map(|record| record.unwrap().recovery_attempts)
        .collect();
    attempts.sort_unstable();
    assert_eq!(attempts, vec![1, 2, 3]);
    settle(&ctx.health, "m1").await;

    assert_eq!(ctx.gateway.created_specs().await.len(), 4);
    use MockOperation::{Create, Delete};
    assert_eq!(
        lifecycle_calls(&ctx.gateway).await,
        vec![Create, Delete, Create, Delete, Create, Delete, Create]
    );

    let record = ctx.health.status("m1").await.unwrap();
    assert_eq!(record.recovery_attempts, MAX_RECOVERY_ATTEMPTS);
    assert!(!record.message.contains("failed"), "{}", record.message);
}

#[tokio::test]
async fn test_restore_and_assessment_do_not_overlap() {
    let ctx = TestContext::new();
    ctx.create_machine(json!({"id": "m1", "template": "desktop"}))
        .await;
    let (_, snapshot) = ctx.post("/machines/m1/snapshots", json!({})).await;
    let snapshot_id = snapshot["id"].as_str().unwrap().to_string();
    ctx.gateway
        .set_state("m1", WorkloadPhase::Failed, false, None)
        .await;

    let (restored, assessed) = tokio::join!(
        ctx.state.snapshots.restore("m1", &snapshot_id),
        ctx.health.assess_machine("m1"),
    );
    restored.unwrap();
    assessed.unwrap();
    settle(&ctx.health, "m1").await;

    let lifecycle = lifecycle_calls(&ctx.gateway).await;
    assert_eq!(lifecycle.first(), Some(&MockOperation::Create));
    assert_eq!(lifecycle.last(), Some(&MockOperation::Create));
    assert!(lifecycle.windows(2).all(|pair| pair[0] != pair[1]));

    let specs = ctx.gateway.created_specs().await;
    assert!(specs.windows(2).all(|pair| pair[0] == pair[1]));
    assert!(ctx.gateway.workload("m1").await.is_some());
    let record = ctx.health.status("m1").await.unwrap();
    assert_ne!(record.status, HealthStatus::Unhealthy);
}

#[tokio::test(start_paused = true)]
async fn test_run_ticks_until_shutdown() {
    let gateway = MockGateway::new();
    gateway.create(&simple_spec("m1", "demo:1")).await.unwrap();

    let monitor = HealthMonitor::new(
        Arc::new(gateway.clone()),
        HealthStore::new(),
        HealthMonitorConfig {
            poll_interval: Duration::from_secs(30),
            recovery_budget: fast_budget(),
        },
    );
    let shutdown = monitor.shutdown_handle();
    let runner = monitor.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(monitor.all().await.is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    let mut records = monitor.all().await;
    for _ in 0..50 {
        if records.first().is_some_and(|r| r.status != HealthStatus::Unknown) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        records = monitor.all().await;
    }
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, HealthStatus::Healthy);

    shutdown.notify_one();
    handle.await.unwrap();
}

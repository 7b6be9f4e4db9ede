//! Lock manager and deadlock scenarios through the public API.
#![cfg_attr(
    test,
    allow(
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::missing_panics_doc,
        clippy::tests_outside_test_module,
        clippy::assertions_on_result_states,
        reason = "Test allows"
    )
)]

mod common;

use common::{init_tracing, memory_config, node};
use core::time::Duration;
use forge_core::{ExecutionError, ExecutionPlan, ExecutionStatus, LockMode, TimelineEventKind};
use forge_executor::{ExecutionManager, ResourceLockManager};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::time::{Instant, sleep};

fn claims(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_owned()).collect()
}

#[tokio::test]
async fn test_queued_acquire_times_out_without_touching_holder() {
    init_tracing();
    let locks = ResourceLockManager::new();
    assert!(locks.try_acquire(&claims(&["file.ts"]), LockMode::Write, "holder"));

    let started = Instant::now();
    let outcome = locks
        .acquire_lock(
            &claims(&["file.ts"]),
            LockMode::Write,
            "competitor",
            Duration::from_millis(1000),
        )
        .await;
    assert!(started.elapsed() >= Duration::from_millis(1000));

    match outcome {
        Err(ExecutionError::LockTimeout {
            node_id,
            resources,
            timeout_ms,
        }) => {
            assert_eq!(node_id, "competitor");
            assert_eq!(resources, vec!["file.ts"]);
            assert_eq!(timeout_ms, 1000);
        }
        other => panic!("expected a lock timeout, got {other:?}"),
    }

    assert_eq!(locks.owners("file.ts"), vec!["holder"]);
    assert_eq!(locks.pending_requests(), 0);
}

#[tokio::test]
async fn test_queued_acquire_granted_on_release() {
    init_tracing();
    let locks = Arc::new(ResourceLockManager::new());
    assert!(locks.try_acquire(&claims(&["a.ts", "b.ts"]), LockMode::Write, "holder"));

    let waiter = {
        let locks = Arc::clone(&locks);
        tokio::spawn(async move {
            locks
                .acquire_lock(
                    &claims(&["b.ts", "a.ts"]),
                    LockMode::Write,
                    "waiter",
                    Duration::from_secs(5),
                )
                .await
        })
    };

    while locks.pending_requests() == 0 {
        sleep(Duration::from_millis(5)).await;
    }
    locks.release(&claims(&["a.ts"]), "holder");
    sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());
    assert!(!locks.is_locked("a.ts"));

    locks.release_all("holder");
    waiter.await.unwrap().unwrap();
    assert_eq!(locks.owners("a.ts"), vec!["waiter"]);
    assert_eq!(locks.owners("b.ts"), vec!["waiter"]);
}

#[tokio::test]
async fn test_external_fence_deadlocks_execution() {
    init_tracing();
    let repo = TempDir::new().unwrap();
    let manager = ExecutionManager::new(memory_config());
    let plan = ExecutionPlan::new(vec![
        node("a", LockMode::Write, &["file.ts"]),
        node("b", LockMode::Read, &["src/**"]),
    ]);
    let execution_id = manager.plan(repo.path(), plan).await.unwrap();

    let locks = manager.lock_manager(&execution_id).await.unwrap();
    assert!(locks.try_acquire(
        &claims(&["file.ts", "src/lib.ts"]),
        LockMode::Write,
        "external"
    ));
    manager.start(&execution_id).await.unwrap();

    assert!(manager.request_next(&execution_id).await.unwrap().is_none());
    let snapshot = manager.poll(&execution_id).await.unwrap();
    assert_eq!(snapshot.status, ExecutionStatus::Paused);

    let deadlock = snapshot
        .timeline
        .iter()
        .find(|event| event.event == TimelineEventKind::ExecutionDeadlock)
        .expect("deadlock event");
    let detail = deadlock.detail.as_ref().expect("deadlock detail");
    assert_eq!(detail["blockedNodes"], json!(["a", "b"]));
    assert_eq!(
        detail["lockDependencies"][0]["heldBy"],
        json!(["external"])
    );
    assert_eq!(
        detail["locks"]["file.ts"]["owners"],
        json!(["external"])
    );

    locks.release_all("external");
    assert_eq!(
        manager.resume(&execution_id).await.unwrap(),
        ExecutionStatus::Running
    );
    let next = manager.request_next(&execution_id).await.unwrap();
    assert_eq!(next.map(|schedule| schedule.node_id).as_deref(), Some("a"));
}

#[tokio::test]
async fn test_stall_with_running_node_is_not_deadlock() {
    init_tracing();
    let repo = TempDir::new().unwrap();
    let manager = ExecutionManager::new(memory_config());
    let plan = ExecutionPlan::new(vec![
        node("a", LockMode::Write, &["file.ts"]),
        node("b", LockMode::Write, &["file.ts"]),
    ]);
    let execution_id = manager.plan(repo.path(), plan).await.unwrap();
    manager.start(&execution_id).await.unwrap();

    assert!(manager.request_next(&execution_id).await.unwrap().is_some());
    assert!(manager.request_next(&execution_id).await.unwrap().is_none());

    let snapshot = manager.poll(&execution_id).await.unwrap();
    assert_eq!(snapshot.status, ExecutionStatus::Running);
    assert!(
        snapshot
            .timeline
            .iter()
            .all(|event| event.event != TimelineEventKind::ExecutionDeadlock)
    );
}

#[tokio::test]
async fn test_abort_rejects_queued_requests() {
    init_tracing();
    let repo = TempDir::new().unwrap();
    let manager = ExecutionManager::new(memory_config());
    let plan = ExecutionPlan::new(vec![node("a", LockMode::Write, &["file.ts"])]);
    let execution_id = manager.plan(repo.path(), plan).await.unwrap();
    manager.start(&execution_id).await.unwrap();
    assert!(manager.request_next(&execution_id).await.unwrap().is_some());

    let locks = manager.lock_manager(&execution_id).await.unwrap();
    let waiter = {
        let locks = Arc::clone(&locks);
        tokio::spawn(async move {
            locks
                .acquire_lock(
                    &claims(&["file.ts"]),
                    LockMode::Read,
                    "external",
                    Duration::from_secs(5),
                )
                .await
        })
    };
    while locks.pending_requests() == 0 {
        sleep(Duration::from_millis(5)).await;
    }

    manager.abort(&execution_id).await.unwrap();
    let outcome = waiter.await.unwrap();
    assert!(matches!(outcome, Err(ExecutionError::LockCancelled { .. })));
    assert_eq!(locks.locked_resource_count(), 0);
}
